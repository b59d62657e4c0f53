//! The shutdown-manager sidecar.
//!
//! Runs next to the data plane and gates its termination on connection
//! draining: the process supervisor calls `/shutdown` before stopping the
//! data plane, and the call returns only once the data plane has been
//! marked failing for upstream health checks and its active downstream
//! connections have drained to the configured floor (or the maximum drain
//! time has elapsed).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod drain;
mod metrics;

use anyhow::Result;
use clap::Parser;
use hyper::{Body, Request, Response, StatusCode};
use std::{future, net::SocketAddr, sync::Arc};
use tracing::info;

#[derive(Clone, Debug, Parser)]
pub struct Settings {
    /// Port the shutdown-manager serves on.
    #[clap(long, default_value = "8090")]
    serve_port: u16,

    /// Data-plane admin interface port.
    #[clap(long, default_value = "9001")]
    admin_port: u16,

    /// Seconds between polls of the data plane for open connections.
    #[clap(long, default_value = "5")]
    check_interval: u64,

    /// Seconds to wait before the first open-connection poll.
    #[clap(long, default_value = "60")]
    check_delay: u64,

    /// Seconds to wait before starting to drain connections.
    #[clap(long, default_value = "0")]
    drain_delay: u64,

    /// Open-connection count at or below which shutdown may proceed.
    #[clap(long, default_value = "0")]
    min_open_connections: usize,

    /// Seconds to wait for connections to drain before proceeding anyway.
    #[clap(long, default_value = "200")]
    max_drain_time: u64,
}

/// Serves the shutdown-manager endpoints until the process is stopped.
pub async fn run(settings: Settings) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.serve_port));
    let settings = Arc::new(settings);

    let server = hyper::server::Server::try_bind(&addr)?.serve(hyper::service::make_service_fn(
        move |_conn| {
            let settings = settings.clone();
            future::ready(Ok::<_, hyper::Error>(hyper::service::service_fn(
                move |req| handle(settings.clone(), req),
            )))
        },
    ));

    info!(%addr, "shutdown-manager listening");
    server.await.map_err(Into::into)
}

async fn handle(
    settings: Arc<Settings>,
    req: Request<Body>,
) -> Result<Response<Body>, hyper::Error> {
    match req.uri().path() {
        // Liveness of the sidecar itself.
        "/healthz" => Ok(text(StatusCode::OK, "OK\n")),

        // The termination handshake: blocks until the data plane has
        // drained. Dropping the request cancels the drain wait; the drain
        // sequence restarts if the supervisor calls again.
        "/shutdown" => {
            drain::shutdown_ready(&settings).await;
            Ok(text(StatusCode::OK, "OK\n"))
        }

        _ => Ok(text(StatusCode::NOT_FOUND, "not found\n")),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .unwrap()
}
