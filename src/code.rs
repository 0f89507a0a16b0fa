//! 取件码格式：生成与规范化解析。

use rand::Rng;
use std::fmt;

/// 规范（大写）形式的取件码。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PickupCode(String);

impl PickupCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 包装已知为规范形式的值，例如从存储读回的取件码。
    pub(crate) fn from_canonical(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PickupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 取件码的字母表与长度。
#[derive(Clone, Debug)]
pub struct CodeFormat {
    alphabet: Vec<u8>,
    length: usize,
}

impl CodeFormat {
    /// `alphabet` 须已通过校验（大写 ASCII 字母数字，无重复）。
    pub fn new(alphabet: &str, length: usize) -> Self {
        Self {
            alphabet: alphabet.as_bytes().to_vec(),
            length,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// 该格式可生成的不同取件码数量。
    pub fn capacity(&self) -> u128 {
        (self.alphabet.len() as u128).saturating_pow(self.length as u32)
    }

    /// 均匀随机抽取一个取件码。
    pub fn generate<R: Rng>(&self, rng: &mut R) -> PickupCode {
        let code = (0..self.length)
            .map(|_| self.alphabet[rng.random_range(0..self.alphabet.len())] as char)
            .collect();
        PickupCode(code)
    }

    /// 将用户输入规范化；输入不可能是该格式的取件码时
    /// 返回 `None`。
    pub fn parse(&self, raw: &str) -> Option<PickupCode> {
        let candidate = raw.trim().to_ascii_uppercase();
        if candidate.len() != self.length {
            return None;
        }
        if !candidate.bytes().all(|b| self.alphabet.contains(&b)) {
            return None;
        }
        Some(PickupCode(candidate))
    }
}
