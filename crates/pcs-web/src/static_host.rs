use crate::relay::RelayState;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Where the UI shell lives on disk.
#[derive(Clone, Debug)]
pub struct StaticSite {
    pub root: PathBuf,
    pub index: PathBuf,
}

impl StaticSite {
    pub fn new(root: impl Into<PathBuf>, index: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: index.into(),
        }
    }

    /// Maps a request path onto a file under `root`, refusing anything that
    /// would escape it.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = Path::new(request_path.trim_start_matches('/'));
        if relative
            .components()
            .any(|part| !matches!(part, Component::Normal(_)))
        {
            return None;
        }
        let root = self.root.canonicalize().ok()?;
        let candidate = root.join(relative).canonicalize().ok()?;
        if !candidate.starts_with(&root) || !candidate.is_file() {
            return None;
        }
        Some(candidate)
    }
}

pub async fn serve_index(site: &StaticSite) -> Response {
    serve_file(&site.index).await
}

pub async fn asset_handler(State(state): State<Arc<RelayState>>, uri: Uri) -> Response {
    match state.site.resolve(uri.path()) {
        Some(path) => serve_file(&path).await,
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn serve_file(path: &Path) -> Response {
    match tokio::fs::read(path).await {
        Ok(content) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for_path(path))],
            content,
        )
            .into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Err(err) => {
            warn!(event = "asset_error", path = %path.display(), error = %err);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to read file").into_response()
        }
    }
}

fn content_type_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
