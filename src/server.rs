//! Listener wiring: TCP accept -> ClientHello peek -> TLS -> HTTP
//!
//! The accept loop owns the ordering guarantee of the data plane: the JA3
//! digest is published to the side-table before the replayable stream is
//! handed to rustls, and claimed again (exactly once) when the handshake
//! completes, so every request dispatched on the connection sees its
//! fingerprint. Each connection runs on its own task; the accept loop never
//! waits on per-connection work.
//!
//! Also hosts the port-80 server: ACME HTTP-01 responses first, permanent
//! redirect to HTTPS for everything else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Host, Path, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info, warn};

use crate::acme::{AcmeService, TlsMaterial};
use crate::listener::{peek_client_hello, GuardConnection, GuardedStream, Ja3Table};

/// Budget for the record peek plus the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the HTTPS data plane until shutdown.
pub async fn run_https_listener(
    addr: SocketAddr,
    tls: Arc<TlsMaterial>,
    app: Router,
    table: Arc<Ja3Table>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("🌐 HTTPS reverse proxy listening on {}", addr);

    let make_service = app.into_make_service_with_connect_info::<GuardConnection>();

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            }
        };

        // TLS config is re-read per connection so certificate renewals apply
        let acceptor = TlsAcceptor::from(tls.current());
        let table = table.clone();
        let make_service = make_service.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, remote_addr, acceptor, table, make_service, shutdown)
                    .await
            {
                debug!("connection from {} closed: {}", remote_addr, e);
            }
        });
    }

    info!("HTTPS listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    table: Arc<Ja3Table>,
    mut make_service: axum::extract::connect_info::IntoMakeServiceWithConnectInfo<
        Router,
        GuardConnection,
    >,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);

    let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let (peeked, digest) = peek_client_hello(stream).await?;
        if let Some(digest) = digest {
            // Must be visible before rustls dispatches anything on this
            // connection
            table.insert(remote_addr, digest);
        }
        acceptor
            .accept(peeked)
            .await
            .map_err(anyhow::Error::from)
    })
    .await
    .map_err(|_| anyhow::anyhow!("handshake timeout"))??;

    // Move the digest from the side-table into the connection context;
    // non-TLS openings and parse failures carry an empty digest
    let ja3_hash = table.take(&remote_addr).unwrap_or_default();
    let conn_info = GuardConnection {
        remote_addr,
        ja3_hash,
    };
    let stream = GuardedStream::new(tls_stream, conn_info);

    let service = make_service.call(&stream).await?;
    let service = TowerToHyperService::new(service);

    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);

    tokio::select! {
        result = connection => result.map_err(|e| anyhow::anyhow!("{e}"))?,
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}

/// Serve a generic axum router (the admin API) until shutdown.
pub async fn run_admin_server(
    addr: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("admin API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Port-80 router: HTTP-01 challenge responses, HTTPS redirect otherwise.
pub fn http01_router(acme: Option<Arc<AcmeService>>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/:token", get(challenge_handler))
        .fallback(redirect_handler)
        .with_state(acme)
}

/// Run the HTTP-01/redirect server on the given port (normally 80).
pub async fn run_http_redirect_server(
    port: u16,
    acme: Option<Arc<AcmeService>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP-01 + redirect server listening on {}", addr);
    axum::serve(listener, http01_router(acme))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn challenge_handler(
    State(acme): State<Option<Arc<AcmeService>>>,
    Path(token): Path<String>,
) -> Response {
    match acme.as_ref().and_then(|a| a.challenge_response(&token)) {
        Some(key_auth) => key_auth.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn redirect_handler(Host(host): Host, uri: Uri) -> Redirect {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Redirect::permanent(&format!("https://{host}{path_and_query}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    #[tokio::test]
    async fn redirects_to_https_preserving_path_and_query() {
        let app = http01_router(None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sub/feed?token=abc")
                    .header(header::HOST, "sub.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://sub.example.com/sub/feed?token=abc"
        );
    }

    #[tokio::test]
    async fn unknown_challenge_is_not_found() {
        let app = http01_router(None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/some-token")
                    .header(header::HOST, "sub.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
