use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

use crate::error::{AppError, Result};

/// Serves the bundled UI over HTTPS.
#[derive(Parser, Debug, Clone)]
#[clap(name = "static_server")]
pub struct ServerOpt {
    #[clap(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Directory holding the bundle and the HTML shell.
    #[clap(long, default_value = ".")]
    pub root: PathBuf,

    #[clap(long, default_value = "cert.pem")]
    pub cert: PathBuf,

    #[clap(long, default_value = "key.pem")]
    pub key: PathBuf,

    /// HTML shell, relative to `root`.
    #[clap(long, default_value = "index.html")]
    pub index: PathBuf,
}

struct Site {
    root: PathBuf,
    index: PathBuf,
}

/// Paths with an extension, and the bundle itself, are files on disk.
/// Everything else is a client-side route.
pub fn looks_like_file(path: &str) -> bool {
    path.contains('.') || path.starts_with("/bundle.js")
}

pub fn router(root: impl Into<PathBuf>, index: impl AsRef<Path>) -> Router {
    let root = root.into();
    let site = Site {
        index: root.join(index),
        root,
    };
    Router::new().fallback(serve).with_state(Arc::new(site))
}

async fn serve(State(site): State<Arc<Site>>, req: Request) -> Response {
    if looks_like_file(req.uri().path()) {
        match ServeDir::new(&site.root).oneshot(req).await {
            Ok(res) => res.into_response(),
            Err(never) => match never {},
        }
    } else {
        match ServeFile::new(&site.index).oneshot(req).await {
            Ok(res) => res.into_response(),
            Err(never) => match never {},
        }
    }
}

/// Reads and checks the PEM pair before handing it to rustls.
pub async fn load_tls(cert: &Path, key: &Path) -> Result<RustlsConfig> {
    let cert_pem = tokio::fs::read(cert)
        .await
        .map_err(|e| AppError::Tls(format!("cannot read certificate {}: {}", cert.display(), e)))?;
    let key_pem = tokio::fs::read(key)
        .await
        .map_err(|e| AppError::Tls(format!("cannot read key {}: {}", key.display(), e)))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AppError::Tls(format!("invalid certificate {}: {}", cert.display(), e)))?;
    if certs.is_empty() {
        return Err(AppError::Tls(format!("no certificate found in {}", cert.display())));
    }
    match rustls_pemfile::private_key(&mut key_pem.as_slice()) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(AppError::Tls(format!("no private key found in {}", key.display()))),
        Err(e) => return Err(AppError::Tls(format!("invalid key {}: {}", key.display(), e))),
    }

    RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(|e| AppError::Tls(e.to_string()))
}

pub async fn start(opt: ServerOpt) -> Result<()> {
    let tls = load_tls(&opt.cert, &opt.key).await?;
    let app = router(&opt.root, &opt.index);
    let addr = SocketAddr::from(([0, 0, 0, 0], opt.port));
    tracing::info!("serving {} on https://{}", opt.root.display(), addr);
    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
