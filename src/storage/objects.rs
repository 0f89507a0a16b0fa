//! `PUT/GET /objects/{key}`：本地预签名 URL 的目标路由。
//!
//! 这些路由充当对象存储，不访问会话存储；
//! 查询串中的签名是唯一凭据。

use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Extension, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use httpdate::{fmt_http_date, parse_http_date};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::LocalObjectStore;
use super::etag::{etag_from_metadata, is_not_modified};
use super::local::PresignedQuery;
use super::signer::{SignatureError, content_type_essence};
use crate::config::OBJECT_ROUTE_PREFIX;
use crate::error::ApiError;

/// 对象路由，需要 `Extension<Arc<LocalObjectStore>>` 层。
pub fn routes() -> Router {
    Router::new().route(
        &format!("{OBJECT_ROUTE_PREFIX}/{{*key}}"),
        get(get_object)
            .put(put_object)
            .layer(DefaultBodyLimit::disable()),
    )
}

fn authorize(
    store: &LocalObjectStore,
    method: &str,
    key: &str,
    query: Result<Query<PresignedQuery>, QueryRejection>,
) -> Result<PresignedQuery, ApiError> {
    let Query(query) =
        query.map_err(|_| ApiError::Forbidden("missing or malformed signature".into()))?;
    match store.authorize(method, key, &query) {
        Ok(()) => Ok(query),
        Err(SignatureError::Expired) => {
            debug!(key, method, "presigned url expired");
            Err(ApiError::Forbidden("url expired".into()))
        }
        Err(SignatureError::Invalid) => {
            warn!(key, method, "presigned url signature mismatch");
            Err(ApiError::Forbidden("signature mismatch".into()))
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}

/// 接收预签名 PUT URL 允许的唯一一次上传。
pub async fn put_object(
    Path(key): Path<String>,
    query: Result<Query<PresignedQuery>, QueryRejection>,
    headers: HeaderMap,
    Extension(store): Extension<Arc<LocalObjectStore>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let query = authorize(&store, "PUT", &key, query)?;
    let signed_type = query
        .content_type
        .as_deref()
        .ok_or_else(|| ApiError::Forbidden("url does not allow uploads".into()))?;
    let sent_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type_essence(sent_type) != content_type_essence(signed_type) {
        return Err(ApiError::Forbidden(format!(
            "content type must be {signed_type}"
        )));
    }

    let max_size = store.max_object_size();
    if max_size > 0
        && let Some(declared) = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
        && declared > max_size
    {
        return Err(ApiError::PayloadTooLarge(max_size));
    }

    let size = store.write_object(&key, signed_type, body).await?;
    debug!(key, size, "upload accepted");
    Ok(StatusCode::CREATED.into_response())
}

/// 流式返回对象，支持 `Range`、`If-None-Match` 与 `If-Range`。
pub async fn get_object(
    Path(key): Path<String>,
    query: Result<Query<PresignedQuery>, QueryRejection>,
    request_headers: HeaderMap,
    Extension(store): Extension<Arc<LocalObjectStore>>,
) -> Result<Response, ApiError> {
    authorize(&store, "GET", &key, query)?;
    let object = store.open_object(&key).await?;
    let file_size = object.metadata.len();
    let modified = object.metadata.modified().ok();
    let etag = etag_from_metadata(&object.metadata);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    if is_not_modified(&request_headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(header::CONTENT_TYPE, header_value(&object.content_type)?);
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&object.filename))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };
    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = object.file;
    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(key, start, end, length, "range download");
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{file_size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        let stream = ReaderStream::new(file.take(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string())?);
    info!(key, size = file_size, "object download");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// `attachment` 形式的 Content-Disposition，带 ASCII 回退名与 RFC 5987 UTF-8 文件名。
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

/// 解析单个 `bytes=` 范围，超出对象末尾的结束位置会被截断。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range
        .split_once('-')
        .ok_or_else(|| ApiError::BadRequest("invalid Range header".into()))?;
    let last = file_size - 1;

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), last)
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            last
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end.min(last))
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageGateway;
    use crate::storage::signer::UrlSigner;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const BASE: &str = "http://files.test";

    async fn make_app(max_object_size: u64) -> (TempDir, Arc<LocalObjectStore>, Router) {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(LocalObjectStore::new(
            temp.path().join("objects"),
            BASE,
            UrlSigner::new(b"route-secret"),
            max_object_size,
        ));
        store.ensure_root().await.expect("ensure root");
        let app = routes().layer(Extension(store.clone()));
        (temp, store, app)
    }

    fn local_path(url: &str) -> String {
        url.strip_prefix(BASE).expect("local url").to_string()
    }

    async fn put(app: &Router, url: &str, content_type: &str, body: &'static str) -> Response {
        app.clone()
            .oneshot(
                Request::put(local_path(url))
                    .header(header::CONTENT_TYPE, content_type)
                    .body(AxumBody::from(body))
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    async fn get_with(app: &Router, url: &str, headers: &[(header::HeaderName, &str)]) -> Response {
        let mut request = Request::get(local_path(url));
        for (name, value) in headers {
            request = request.header(name, *value);
        }
        app.clone()
            .oneshot(request.body(AxumBody::empty()).expect("request"))
            .await
            .expect("response")
    }

    async fn body_text(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn presigned_put_then_get_round_trips() {
        let (_temp, store, app) = make_app(0).await;
        let key = "0f0f/年度 report.txt";
        let upload = store
            .issue_upload_url(key, "text/plain", Duration::from_secs(60))
            .await
            .expect("upload url");
        let response = put(&app, &upload, "text/plain; charset=utf-8", "hello shuttle").await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let download = store
            .issue_download_url(key, Duration::from_secs(60))
            .await
            .expect("download url");
        let response = get_with(&app, &download, &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .expect("ascii")
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"__ report.txt\""));
        assert!(disposition.contains("filename*=UTF-8''%E5%B9%B4%E5%BA%A6%20report.txt"));
        assert_eq!(body_text(response).await, "hello shuttle");
    }

    #[tokio::test]
    async fn second_put_with_same_url_conflicts() {
        let (_temp, store, app) = make_app(0).await;
        let upload = store
            .issue_upload_url("k1/a.txt", "text/plain", Duration::from_secs(60))
            .await
            .expect("upload url");
        assert_eq!(put(&app, &upload, "text/plain", "one").await.status(), StatusCode::CREATED);
        assert_eq!(put(&app, &upload, "text/plain", "two").await.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn put_rejects_wrong_content_type_and_download_url() {
        let (_temp, store, app) = make_app(0).await;
        let upload = store
            .issue_upload_url("k2/a.txt", "text/plain", Duration::from_secs(60))
            .await
            .expect("upload url");
        assert_eq!(put(&app, &upload, "text/html", "x").await.status(), StatusCode::FORBIDDEN);

        let download = store
            .issue_download_url("k2/a.txt", Duration::from_secs(60))
            .await
            .expect("download url");
        assert_eq!(put(&app, &download, "text/plain", "x").await.status(), StatusCode::FORBIDDEN);
        assert!(!store.exists("k2/a.txt").await.expect("exists"));
    }

    #[tokio::test]
    async fn tampered_and_expired_urls_are_forbidden() {
        let (_temp, store, app) = make_app(0).await;
        let upload = store
            .issue_upload_url("k3/a.txt", "text/plain", Duration::from_secs(60))
            .await
            .expect("upload url");
        let tampered = upload.replace("k3/a.txt", "k3/b.txt");
        assert_eq!(put(&app, &tampered, "text/plain", "x").await.status(), StatusCode::FORBIDDEN);

        let signer = UrlSigner::new(b"route-secret");
        let expires = chrono::Utc::now().timestamp() - 10;
        let signature = signer.sign("GET", "k3/a.txt", expires, None);
        let expired = format!("{BASE}/objects/k3/a.txt?expires={expires}&signature={signature}");
        assert_eq!(get_with(&app, &expired, &[]).await.status(), StatusCode::FORBIDDEN);

        let unsigned = format!("{BASE}/objects/k3/a.txt");
        assert_eq!(get_with(&app, &unsigned, &[]).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (_temp, store, app) = make_app(4).await;
        let upload = store
            .issue_upload_url("k4/big.bin", "application/octet-stream", Duration::from_secs(60))
            .await
            .expect("upload url");
        let response = put(&app, &upload, "application/octet-stream", "123456").await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!store.exists("k4/big.bin").await.expect("exists"));
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let (_temp, store, app) = make_app(0).await;
        let download = store
            .issue_download_url("k5/none.txt", Duration::from_secs(60))
            .await
            .expect("download url");
        assert_eq!(get_with(&app, &download, &[]).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn range_and_conditional_get() {
        let (_temp, store, app) = make_app(0).await;
        let upload = store
            .issue_upload_url("k6/digits.txt", "text/plain", Duration::from_secs(60))
            .await
            .expect("upload url");
        put(&app, &upload, "text/plain", "0123456789").await;
        let download = store
            .issue_download_url("k6/digits.txt", Duration::from_secs(60))
            .await
            .expect("download url");

        let response = get_with(&app, &download, &[(header::RANGE, "bytes=2-4")]).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-4/10");
        let etag = response.headers()[header::ETAG]
            .to_str()
            .expect("etag")
            .to_string();
        assert_eq!(body_text(response).await, "234");

        let response = get_with(&app, &download, &[(header::RANGE, "bytes=7-99")]).await;
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 7-9/10");
        assert_eq!(body_text(response).await, "789");

        let response = get_with(&app, &download, &[(header::RANGE, "bytes=10-")]).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

        let response = get_with(&app, &download, &[(header::IF_NONE_MATCH, etag.as_str())]).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn suffix_range_covers_tail() {
        let value = HeaderValue::from_static("bytes=-3");
        assert_eq!(parse_range(Some(&value), 10).ok().flatten(), Some((7, 9)));
        let value = HeaderValue::from_static("bytes=-30");
        assert_eq!(parse_range(Some(&value), 10).ok().flatten(), Some((0, 9)));
    }
}
