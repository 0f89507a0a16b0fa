//! 预签名对象 URL 的 HMAC-SHA256 签名。
//!
//! 签名串绑定 HTTP 方法、对象键、过期时间（unix 秒），
//! 上传时还包括内容类型的本质部分。

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const GENERATED_KEY_LEN: usize = 32;

#[derive(Debug, PartialEq, Eq)]
pub enum SignatureError {
    Expired,
    Invalid,
}

pub struct UrlSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: secret.to_vec(),
        }
    }

    /// 使用随机密钥的签名器；进程退出后其 URL 不再有效。
    pub fn random() -> Self {
        let mut key = vec![0u8; GENERATED_KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    fn mac(&self, method: &str, key: &str, expires: i64, content_type: Option<&str>) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        let content_type = content_type.map(content_type_essence).unwrap_or_default();
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.update(b"\n");
        mac.update(content_type.as_bytes());
        mac
    }

    /// 为给定请求生成十六进制签名。
    pub fn sign(&self, method: &str, key: &str, expires: i64, content_type: Option<&str>) -> String {
        hex::encode(self.mac(method, key, expires, content_type).finalize().into_bytes())
    }

    /// 以常量时间校验 `signature`，并拒绝超过 `expires` 的 URL。
    pub fn verify(
        &self,
        method: &str,
        key: &str,
        expires: i64,
        content_type: Option<&str>,
        signature: &str,
        now: i64,
    ) -> Result<(), SignatureError> {
        let provided = hex::decode(signature).map_err(|_| SignatureError::Invalid)?;
        self.mac(method, key, expires, content_type)
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Invalid)?;
        if now > expires {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }
}

/// 去掉参数并转为小写的媒体类型，例如 `text/plain; charset=utf-8` -> `text/plain`。
pub fn content_type_essence(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_until_expiry() {
        let signer = UrlSigner::new(b"secret");
        let sig = signer.sign("PUT", "abc/report.pdf", 1_000, Some("application/pdf"));
        assert_eq!(
            signer.verify("PUT", "abc/report.pdf", 1_000, Some("application/pdf"), &sig, 999),
            Ok(())
        );
        assert_eq!(
            signer.verify("PUT", "abc/report.pdf", 1_000, Some("application/pdf"), &sig, 1_001),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn tampering_any_field_invalidates() {
        let signer = UrlSigner::new(b"secret");
        let sig = signer.sign("PUT", "abc/report.pdf", 1_000, Some("application/pdf"));
        let cases = [
            ("GET", "abc/report.pdf", 1_000, Some("application/pdf")),
            ("PUT", "abc/other.pdf", 1_000, Some("application/pdf")),
            ("PUT", "abc/report.pdf", 9_999, Some("application/pdf")),
            ("PUT", "abc/report.pdf", 1_000, Some("text/html")),
        ];
        for (method, key, expires, ct) in cases {
            assert_eq!(
                signer.verify(method, key, expires, ct, &sig, 0),
                Err(SignatureError::Invalid)
            );
        }
        assert_eq!(
            signer.verify("PUT", "abc/report.pdf", 1_000, Some("application/pdf"), "zz", 0),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let signer = UrlSigner::new(b"secret");
        let sig = signer.sign("PUT", "k/a.txt", 10, Some("text/plain"));
        assert_eq!(
            signer.verify("PUT", "k/a.txt", 10, Some("Text/Plain; charset=UTF-8"), &sig, 0),
            Ok(())
        );
    }

    #[test]
    fn different_keys_disagree() {
        let a = UrlSigner::random();
        let b = UrlSigner::random();
        let sig = a.sign("GET", "k/a.txt", 10, None);
        assert_eq!(
            b.verify("GET", "k/a.txt", 10, None, &sig, 0),
            Err(SignatureError::Invalid)
        );
    }
}
