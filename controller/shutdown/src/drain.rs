//! The drain sequence gating data-plane termination.

use crate::{metrics, Settings};
use anyhow::{bail, Context, Result};
use hyper::{client::HttpConnector, Body, Client, Method, Request, StatusCode, Uri};
use rand::Rng;
use std::{future::Future, time::Duration};
use tokio::time::{self, Instant};
use tracing::{info, warn};

const HEALTHCHECK_FAIL_ATTEMPTS: u32 = 4;
const HEALTHCHECK_FAIL_BASE_DELAY: Duration = Duration::from_millis(200);
const HEALTHCHECK_FAIL_BACKOFF_FACTOR: u32 = 5;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DrainOutcome {
    /// The open-connection count reached the configured floor.
    Drained(usize),

    /// The maximum drain time elapsed first. Still a success for the
    /// termination handshake: draining must never block shutdown forever.
    TimedOut,
}

pub(crate) async fn shutdown_ready(settings: &Settings) {
    info!(
        delay_secs = settings.drain_delay,
        "waiting before draining connections"
    );
    time::sleep(Duration::from_secs(settings.drain_delay)).await;

    info!("failing data-plane health checks");
    if let Err(error) = fail_health_checks(settings.admin_port).await {
        // Failure to mark the data plane unhealthy must not block
        // termination indefinitely.
        warn!(%error, "could not fail data-plane health checks; draining anyway");
    }

    info!(
        delay_secs = settings.check_delay,
        "waiting before polling for open connections"
    );
    time::sleep(Duration::from_secs(settings.check_delay)).await;

    let client = Client::new();
    let admin_port = settings.admin_port;
    let outcome = wait_until_drained(
        || open_connections(&client, admin_port),
        Duration::from_secs(settings.check_interval),
        Duration::from_secs(settings.max_drain_time),
        settings.min_open_connections,
    )
    .await;

    match outcome {
        DrainOutcome::Drained(open) => info!(
            open_connections = open,
            min_connections = settings.min_open_connections,
            "connections drained; proceeding with shutdown"
        ),
        DrainOutcome::TimedOut => {
            info!("maximum drain time reached; proceeding with shutdown")
        }
    }
}

/// Polls the open-connection count until it reaches `min_open` or
/// `max_drain_time` elapses, whichever comes first.
///
/// Poll errors keep the loop waiting: missing data is never permission to
/// terminate early.
async fn wait_until_drained<F, Fut>(
    mut poll: F,
    check_interval: Duration,
    max_drain_time: Duration,
    min_open: usize,
) -> DrainOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    let deadline = Instant::now() + max_drain_time;
    loop {
        match poll().await {
            Ok(open) if open <= min_open => return DrainOutcome::Drained(open),
            Ok(open) => info!(
                open_connections = open,
                min_connections = min_open,
                "waiting for connections to drain"
            ),
            Err(error) => warn!(%error, "failed to poll open connections"),
        }

        tokio::select! {
            _ = time::sleep(check_interval) => {}
            _ = time::sleep_until(deadline) => return DrainOutcome::TimedOut,
        }
    }
}

/// Tells the data plane to start failing its upstream health checks so that
/// load balancers stop routing new traffic here.
///
/// Retried with exponential backoff and jitter; any error is retriable.
async fn fail_health_checks(admin_port: u16) -> Result<()> {
    let client = Client::new();
    let mut delay = HEALTHCHECK_FAIL_BASE_DELAY;
    let mut attempt = 1;

    loop {
        match fail_health_check(&client, admin_port).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt == HEALTHCHECK_FAIL_ATTEMPTS => return Err(error),
            Err(error) => {
                warn!(%error, attempt, "health-check fail request failed; retrying")
            }
        }

        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
        time::sleep(delay + jitter).await;
        delay *= HEALTHCHECK_FAIL_BACKOFF_FACTOR;
        attempt += 1;
    }
}

async fn fail_health_check(client: &Client<HttpConnector>, admin_port: u16) -> Result<()> {
    let uri = format!("http://localhost:{admin_port}/healthcheck/fail");
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri.as_str())
        .body(Body::empty())?;
    let response = client
        .request(request)
        .await
        .with_context(|| format!("sending POST {uri}"))?;
    if response.status() != StatusCode::OK {
        bail!("POST {uri} returned {}", response.status());
    }
    Ok(())
}

/// Fetches the data plane's stats exposition and sums the active
/// downstream connections across the ingress listeners.
async fn open_connections(client: &Client<HttpConnector>, admin_port: u16) -> Result<usize> {
    let uri: Uri = format!("http://localhost:{admin_port}/stats/prometheus").parse()?;
    let response = client
        .get(uri.clone())
        .await
        .with_context(|| format!("sending GET {uri}"))?;
    if response.status() != StatusCode::OK {
        bail!("GET {uri} returned {}", response.status());
    }

    let body = hyper::body::to_bytes(response.into_body())
        .await
        .context("reading stats payload")?;
    let payload = std::str::from_utf8(&body).context("stats payload is not UTF-8")?;
    Ok(metrics::parse_open_connections(payload)?)
}
