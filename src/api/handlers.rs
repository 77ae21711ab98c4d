use axum::{
    body::Body,
    extract::{
        ws::WebSocket,
        Path, Query, State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::download::{ByteStream, DownloadInfo, Downloader, LocalDownloader, SftpDownloader};
use crate::fs::{FsService, LocalFs, SftpFs};
use crate::heartbeat::HeartbeatService;
use crate::session::SessionServer;
use crate::shell::{LocalShellBackend, ShellService, SshShellBackend};
use crate::ssh::SshTarget;
use crate::transport::{Outbox, WsSink, WsSource};
use crate::upload::{LocalUploadBackend, SftpUploadBackend, UploadService};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ── Local sessions ─────────────────────────────────────────────────

pub(super) async fn local_shell(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_local_session(socket, state))
}

async fn handle_local_session(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let outbox = Outbox::new(Box::new(WsSink(sink)), CancellationToken::new());

    let mut server = SessionServer::new(outbox.clone(), state.settings.idle_timeout);
    let claims = server.binary_claims();

    server.register(Arc::new(ShellService::new(
        outbox.clone(),
        Box::new(LocalShellBackend::new(state.settings.pty_cwd.clone())),
    )));
    server.register(Arc::new(FsService::new(
        outbox.clone(),
        Arc::new(LocalFs::new(state.settings.fs_root.clone())),
    )));
    server.register(Arc::new(UploadService::new(
        outbox.clone(),
        Arc::new(LocalUploadBackend),
        claims,
    )));
    server.register_passive(Arc::new(HeartbeatService::new(outbox.clone())));

    server.serve(Box::new(WsSource(stream))).await;
}

// ── SSH login and sessions ─────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct SshLoginRequest {
    host: String,
    username: String,
    password: String,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Serialize)]
pub(super) struct SshLoginResponse {
    id: String,
}

pub(super) async fn ssh_login(
    State(state): State<AppState>,
    Json(req): Json<SshLoginRequest>,
) -> Result<Json<SshLoginResponse>, ApiError> {
    if req.password.is_empty() {
        return Err(ApiError::InvalidRequest(
            "no authentication method provided".to_string(),
        ));
    }

    let target = SshTarget::new(
        req.host,
        req.port.unwrap_or(22),
        req.username,
        req.password,
    );

    // Validate credentials once up front; attachments dial their own
    // sessions later from the stored target.
    let target = tokio::task::spawn_blocking(move || target.connect().map(|_| target))
        .await
        .map_err(|_| ApiError::InternalError("ssh worker failed".to_string()))?
        .map_err(|e| ApiError::SshConnectFailed(e.to_string()))?;

    let id = state.ssh.insert(target);
    tracing::info!(%id, "ssh client registered");
    Ok(Json(SshLoginResponse { id }))
}

pub(super) async fn ssh_shell(
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let Some(target) = state.ssh.get(&id) else {
        return Err(ApiError::UnknownSshClient(id));
    };

    // The downloader lives as long as the SSH client entry; created here so
    // the pull route works for the whole session lifetime.
    let downloader = SftpDownloader::connect(target.clone())
        .await
        .map_err(|e| ApiError::SshConnectFailed(e.to_string()))?;
    state
        .downloaders
        .write()
        .insert(id.clone(), Arc::new(downloader));

    Ok(ws.on_upgrade(move |socket| handle_ssh_session(socket, state, target)))
}

async fn handle_ssh_session(socket: WebSocket, state: AppState, target: Arc<SshTarget>) {
    let (sink, stream) = socket.split();
    let outbox = Outbox::new(Box::new(WsSink(sink)), CancellationToken::new());

    let fs = match SftpFs::connect(target.clone()).await {
        Ok(fs) => fs,
        Err(e) => {
            tracing::error!("failed to attach sftp filesystem: {e}");
            return;
        }
    };
    let upload_backend = match SftpUploadBackend::connect(target.clone()).await {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!("failed to attach sftp upload backend: {e}");
            return;
        }
    };

    let mut server = SessionServer::new(outbox.clone(), state.settings.idle_timeout);
    let claims = server.binary_claims();

    server.register(Arc::new(ShellService::new(
        outbox.clone(),
        Box::new(SshShellBackend::new(target)),
    )));
    server.register(Arc::new(FsService::new(outbox.clone(), Arc::new(fs))));
    server.register(Arc::new(UploadService::new(
        outbox.clone(),
        Arc::new(upload_backend),
        claims,
    )));
    server.register_passive(Arc::new(HeartbeatService::new(outbox.clone())));

    server.serve(Box::new(WsSource(stream))).await;
}

// ── Pull-style downloads ───────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct DownloadQuery {
    path: String,
}

pub(super) async fn ssh_download(
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let downloader = state.downloaders.read().get(&id).cloned();
    let Some(downloader) = downloader else {
        return Err(ApiError::UnknownSshClient(id));
    };
    serve_download(downloader.as_ref(), &query.path).await
}

pub(super) async fn local_download(
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    serve_download(&LocalDownloader, &query.path).await
}

async fn serve_download(downloader: &dyn Downloader, path: &str) -> Result<Response, ApiError> {
    if path.is_empty() {
        return Err(ApiError::InvalidRequest("path is required".to_string()));
    }

    let info = downloader
        .stat(path)
        .await
        .map_err(|e| ApiError::DownloadFailed(e.to_string()))?;

    let (info, stream) = if info.is_dir {
        downloader
            .download_dir(path)
            .await
            .map_err(|e| ApiError::DownloadFailed(e.to_string()))?
    } else {
        downloader
            .download(path)
            .await
            .map_err(|e| ApiError::DownloadFailed(e.to_string()))?
    };

    Ok(download_response(&info, stream))
}

fn download_response(info: &DownloadInfo, stream: ByteStream) -> Response {
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream");

    if info.is_dir {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}.zip", info.name),
        );
    } else {
        builder = builder
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", info.name),
            )
            .header(header::CONTENT_LENGTH, info.size);
    }

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
