//! file-shuttle 服务入口。
//!
//! 上传者申请短取件码与预签名上传 URL，直接把文件传到对象存储，
//! 再把取件码交给接收者兑换预签名下载 URL。会话在 TTL 后过期，
//! 由后台清理任务回收对象。

mod allocator;
mod api;
mod background;
mod clock;
mod code;
mod config;
mod error;
mod http;
mod logging;
mod reaper;
mod session;
mod storage;
mod transfer;
mod version;

use anyhow::Context;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::middleware;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::allocator::CodeAllocator;
use crate::background::spawn_reaper;
use crate::clock::{Clock, SystemClock};
use crate::code::CodeFormat;
use crate::config::{Args, StorageBackend};
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::reaper::Reaper;
use crate::session::{MemorySessionStore, SessionStore, SqliteSessionStore};
use crate::storage::signer::UrlSigner;
use crate::storage::{LocalObjectStore, RetryPolicy, RetryingGateway, StorageGateway, objects};
use crate::transfer::{TransferPolicy, TransferService};

shadow!(build);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(args.log_format);
    args.validate().context("invalid configuration")?;

    let store = build_session_store(&args).await?;
    let (gateway, local_objects) = build_gateway(&args).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let reaper = Arc::new(Reaper::new(
        store.clone(),
        gateway.clone(),
        clock.clone(),
        args.reap_batch_size,
    ));

    if args.sweep_once {
        let report = reaper.sweep().await.context("expiry sweep failed")?;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    let allocator = CodeAllocator::new(
        CodeFormat::new(&args.code_alphabet, args.code_length),
        args.max_allocation_attempts,
    );
    let policy = TransferPolicy {
        session_ttl: args.session_ttl(),
        upload_url_ttl: args.upload_url_ttl(),
        download_url_ttl: args.download_url_ttl(),
        single_use: args.single_use,
        confirm_uploads: !args.optimistic_uploads,
    };
    let service = Arc::new(TransferService::new(
        store.clone(),
        gateway.clone(),
        allocator,
        clock,
        policy,
    ));

    let mut app = api::routes();
    if let Some(local_objects) = local_objects {
        app = app
            .merge(objects::routes())
            .layer(Extension(local_objects));
    }
    let mut app = app
        .layer(Extension(service))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("invalid bind address {}", args.host))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        %addr,
        public_url = %args.public_base_url(),
        session_store = store.backend_name(),
        storage = gateway.backend_name(),
        single_use = args.single_use,
        confirm_uploads = policy.confirm_uploads,
        "starting file-shuttle"
    );

    let sweeper = spawn_reaper(reaper, Duration::from_secs(args.reap_interval_secs));
    tokio::spawn(shutdown_signal(handle.clone()));
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("server stopped");
    Ok(())
}

async fn build_session_store(args: &Args) -> anyhow::Result<Arc<dyn SessionStore>> {
    match args.database_url.as_deref() {
        Some(url) => {
            let store = SqliteSessionStore::connect(url)
                .await
                .with_context(|| format!("failed to open session store {url}"))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database url configured, sessions live in memory and are lost on restart");
            Ok(Arc::new(MemorySessionStore::new()))
        }
    }
}

async fn build_gateway(
    args: &Args,
) -> anyhow::Result<(Arc<dyn StorageGateway>, Option<Arc<LocalObjectStore>>)> {
    let retry = RetryPolicy::new(
        args.storage_retry_attempts,
        Duration::from_millis(args.storage_retry_base_ms),
    );
    match args.storage_backend {
        StorageBackend::Local => {
            let signer = match args.signing_secret.as_deref() {
                Some(secret) => UrlSigner::new(secret.as_bytes()),
                None => {
                    warn!("no signing secret configured, presigned urls die with this process");
                    UrlSigner::random()
                }
            };
            let local = Arc::new(LocalObjectStore::new(
                PathBuf::from(&args.storage_dir),
                &args.public_base_url(),
                signer,
                args.max_object_size,
            ));
            local
                .ensure_root()
                .await
                .with_context(|| format!("failed to prepare {}", args.storage_dir))?;
            info!(root = %local.root_path().display(), "local object store ready");
            let gateway: Arc<dyn StorageGateway> =
                Arc::new(RetryingGateway::new(local.clone(), retry));
            Ok((gateway, Some(local)))
        }
        StorageBackend::S3 => Ok((build_s3_gateway(args, retry)?, None)),
    }
}

#[cfg(feature = "s3")]
fn build_s3_gateway(args: &Args, retry: RetryPolicy) -> anyhow::Result<Arc<dyn StorageGateway>> {
    let bucket = args
        .s3_bucket
        .as_deref()
        .context("s3 backend requires --s3-bucket")?;
    let gateway =
        storage::s3::S3Gateway::new(bucket, &args.s3_region, args.s3_endpoint.as_deref())?;
    Ok(Arc::new(RetryingGateway::new(gateway, retry)))
}

#[cfg(not(feature = "s3"))]
fn build_s3_gateway(_args: &Args, _retry: RetryPolicy) -> anyhow::Result<Arc<dyn StorageGateway>> {
    anyhow::bail!("s3 backend not compiled in, rebuild with `--features s3`")
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("termination signal received, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
