//! Reads the data plane's Prometheus text exposition to count open
//! downstream connections.
//!
//! Only the subset of the format the admin endpoint actually emits is
//! understood: `# TYPE`/`# HELP` comments and `name{labels} value
//! [timestamp]` sample lines.

use parapet_controller_xds::listener::{HTTP_LISTENER, HTTPS_LISTENER};
use thiserror::Error;

/// The gauge family counting active downstream connections.
const ACTIVE_CONNECTIONS_GAUGE: &str = "envoy_http_downstream_cx_active";

/// Label values whose samples count toward the total: the ingress
/// listeners only. Admin and health-check connections never hold up a
/// drain.
const LISTENER_ALLOW_LIST: &[&str] = &[HTTP_LISTENER, HTTPS_LISTENER];

#[derive(Debug, Error)]
pub(crate) enum MetricsError {
    /// The expected gauge family is absent. The caller treats this as a
    /// failed poll attempt, not as zero connections.
    #[error("gauge {0:?} not found in the metrics payload")]
    MissingGauge(&'static str),

    #[error("malformed sample line {0:?}")]
    MalformedSample(String),
}

/// Sums the active-connection gauge across the ingress listeners.
pub(crate) fn parse_open_connections(payload: &str) -> Result<usize, MetricsError> {
    let mut found = false;
    let mut total = 0.0f64;

    for line in payload.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            // A `# TYPE` declaration counts as the family being present
            // even when no sample carries an allow-listed label.
            let mut words = comment.split_whitespace();
            if words.next() == Some("TYPE") && words.next() == Some(ACTIVE_CONNECTIONS_GAUGE) {
                found = true;
            }
            continue;
        }

        let Some(rest) = line.strip_prefix(ACTIVE_CONNECTIONS_GAUGE) else {
            continue;
        };
        let (labels, value_part) = if let Some(rest) = rest.strip_prefix('{') {
            let end = rest
                .find('}')
                .ok_or_else(|| MetricsError::MalformedSample(line.to_string()))?;
            (&rest[..end], &rest[end + 1..])
        } else if rest.starts_with(char::is_whitespace) {
            ("", rest)
        } else {
            // A longer family name sharing this one as a prefix.
            continue;
        };

        found = true;
        let value: f64 = value_part
            .split_whitespace()
            .next()
            .ok_or_else(|| MetricsError::MalformedSample(line.to_string()))?
            .parse()
            .map_err(|_| MetricsError::MalformedSample(line.to_string()))?;

        if has_allow_listed_label(labels) {
            total += value;
        }
    }

    if !found {
        return Err(MetricsError::MissingGauge(ACTIVE_CONNECTIONS_GAUGE));
    }
    Ok(total as usize)
}

fn has_allow_listed_label(labels: &str) -> bool {
    labels
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .any(|(_, value)| LISTENER_ALLOW_LIST.contains(&value.trim_matches('"')))
}
