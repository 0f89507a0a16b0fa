//! `/api` 下的 JSON 接口。

use axum::Router;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Extension, Json, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiError;
use crate::transfer::TransferService;
use crate::version;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    filename: String,
    content_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    code: String,
    upload_url: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    download_url: String,
    filename: String,
    content_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    session_store: &'static str,
}

/// API 路由，需要 `Extension<Arc<TransferService>>` 层。
pub fn routes() -> Router {
    Router::new()
        .route("/api/init-upload", post(init_upload))
        .route("/api/get-download", get(get_download))
        .route("/api/health", get(health))
        .route("/api/version", get(version::get_version_info))
}

/// 开始上传：返回取件码与预签名 PUT URL。
pub async fn init_upload(
    Extension(service): Extension<Arc<TransferService>>,
    payload: Result<Json<InitUploadRequest>, JsonRejection>,
) -> Result<JsonResponse<InitUploadResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let ticket = service
        .init_upload(&request.filename, &request.content_type)
        .await?;
    Ok(JsonResponse(InitUploadResponse {
        code: ticket.code.to_string(),
        upload_url: ticket.upload_url,
        expires_at: ticket.expires_at,
    }))
}

/// 用取件码兑换预签名 GET URL。
pub async fn get_download(
    Extension(service): Extension<Arc<TransferService>>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<JsonResponse<DownloadResponse>, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let code = query
        .code
        .ok_or_else(|| ApiError::BadRequest("code is required".into()))?;
    let ticket = service.get_download(&code).await?;
    Ok(JsonResponse(DownloadResponse {
        download_url: ticket.download_url,
        filename: ticket.filename,
        content_type: ticket.content_type,
    }))
}

pub async fn health(Extension(service): Extension<Arc<TransferService>>) -> Response {
    match service.store().ping().await {
        Ok(()) => JsonResponse(HealthResponse {
            status: "ok",
            session_store: "ok",
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, backend = service.store().backend_name(), "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                JsonResponse(HealthResponse {
                    status: "degraded",
                    session_store: "unavailable",
                }),
            )
                .into_response()
        }
    }
}
