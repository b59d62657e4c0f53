//! Synthesizes the data-plane listener resource set from the desired-state
//! graph.

use crate::SnapshotCache;
use ahash::AHashMap as HashMap;
use parapet_controller_core::{
    AccessLog, DownstreamTlsContext, Filter, FilterChain, Listener, ListenerFilter,
    SecureVirtualHost, TlsVersion, Vertex, LISTENER_TYPE_URL,
};
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Duration};

/// Name of the shared plaintext HTTP listener.
pub const HTTP_LISTENER: &str = "ingress_http";

/// Name of the TLS listener carrying one SNI-scoped chain per secure host.
pub const HTTPS_LISTENER: &str = "ingress_https";

/// Name of the always-present administrative stats listener.
pub const STATS_LISTENER: &str = "stats";

pub const DEFAULT_HTTP_LISTENER_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_HTTP_LISTENER_PORT: u16 = 8080;
pub const DEFAULT_HTTPS_LISTENER_ADDRESS: &str = DEFAULT_HTTP_LISTENER_ADDRESS;
pub const DEFAULT_HTTPS_LISTENER_PORT: u16 = 8443;
pub const DEFAULT_ACCESS_LOG_PATH: &str = "/dev/stdout";

/// Configured minimums at or below this baseline resolve to the baseline.
const BASELINE_TLS_VERSION: TlsVersion = TlsVersion::V1_2;

/// Protocols offered on HTTP chains, preferred first.
const ALPN_HTTP: &[&str] = &["h2", "http/1.1"];

/// Fields rendered by structured access logs when no list is configured.
pub const DEFAULT_STRUCTURED_FIELDS: &[&str] = &[
    "@timestamp",
    "authority",
    "bytes_received",
    "bytes_sent",
    "downstream_local_address",
    "downstream_remote_address",
    "duration",
    "method",
    "path",
    "protocol",
    "request_id",
    "requested_server_name",
    "response_code",
    "response_flags",
    "upstream_cluster",
    "upstream_host",
    "upstream_local_address",
    "upstream_service_time",
    "user_agent",
    "x_forwarded_for",
];

/// The snapshot cache instance serving listener resources.
pub type ListenerCache = SnapshotCache<Listener>;

/// Builds the listener cache with its fixed static contents: the stats
/// listener, which exists regardless of what the graph holds.
pub fn cache(stats_address: &str, stats_port: u16) -> ListenerCache {
    SnapshotCache::new(LISTENER_TYPE_URL, [stats_listener(stats_address, stats_port)])
}

/// Raw, possibly-partial listener settings as loaded from flags or a config
/// file. Every field has a defined fallback; [`ListenerPolicy::new`] applies
/// them exactly once.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerSettings {
    pub http_address: Option<String>,
    pub http_port: Option<u16>,
    pub http_access_log: Option<String>,
    pub https_address: Option<String>,
    pub https_port: Option<u16>,
    pub https_access_log: Option<String>,

    /// Expect a PROXY v1/v2 preamble on all listeners.
    pub use_proxy_protocol: bool,

    pub access_log_format: Option<AccessLogFormat>,
    pub access_log_fields: Option<Vec<String>>,

    pub minimum_tls_version: Option<TlsVersion>,

    /// Seconds. Negative disables the timeout; the data plane rejects
    /// negative durations, so they are never propagated.
    pub request_timeout: Option<i64>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLogFormat {
    #[default]
    Plain,
    Structured,
}

/// Fully-resolved synthesis policy.
///
/// Constructed once per process start; immutable thereafter. Every fallback
/// is applied at construction so reads are plain field accesses.
#[derive(Clone, Debug)]
pub struct ListenerPolicy {
    pub http_address: String,
    pub http_port: u16,
    pub http_access_log: String,
    pub https_address: String,
    pub https_port: u16,
    pub https_access_log: String,
    pub use_proxy_protocol: bool,
    pub access_log_format: AccessLogFormat,
    pub access_log_fields: Vec<String>,
    pub min_tls_version: TlsVersion,
    pub request_timeout: Duration,
}

// === impl ListenerPolicy ===

impl ListenerPolicy {
    pub fn new(settings: ListenerSettings) -> Self {
        let ListenerSettings {
            http_address,
            http_port,
            http_access_log,
            https_address,
            https_port,
            https_access_log,
            use_proxy_protocol,
            access_log_format,
            access_log_fields,
            minimum_tls_version,
            request_timeout,
        } = settings;

        Self {
            http_address: http_address.unwrap_or_else(|| DEFAULT_HTTP_LISTENER_ADDRESS.to_string()),
            http_port: http_port.unwrap_or(DEFAULT_HTTP_LISTENER_PORT),
            http_access_log: http_access_log.unwrap_or_else(|| DEFAULT_ACCESS_LOG_PATH.to_string()),
            https_address: https_address
                .unwrap_or_else(|| DEFAULT_HTTPS_LISTENER_ADDRESS.to_string()),
            https_port: https_port.unwrap_or(DEFAULT_HTTPS_LISTENER_PORT),
            https_access_log: https_access_log
                .unwrap_or_else(|| DEFAULT_ACCESS_LOG_PATH.to_string()),
            use_proxy_protocol,
            access_log_format: access_log_format.unwrap_or_default(),
            access_log_fields: access_log_fields.unwrap_or_else(|| {
                DEFAULT_STRUCTURED_FIELDS.iter().map(|f| f.to_string()).collect()
            }),
            min_tls_version: minimum_tls_version
                .map_or(BASELINE_TLS_VERSION, |v| v.max(BASELINE_TLS_VERSION)),
            request_timeout: match request_timeout {
                Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
                // Unset or negative: disabled, rendered as zero.
                Some(_) | None => Duration::ZERO,
            },
        }
    }

    fn http_access_log(&self) -> AccessLog {
        self.access_log(&self.http_access_log)
    }

    fn https_access_log(&self) -> AccessLog {
        self.access_log(&self.https_access_log)
    }

    fn access_log(&self, path: &str) -> AccessLog {
        match self.access_log_format {
            AccessLogFormat::Plain => AccessLog::Plain {
                path: path.to_string(),
            },
            AccessLogFormat::Structured => AccessLog::Structured {
                path: path.to_string(),
                fields: self.access_log_fields.clone(),
            },
        }
    }
}

impl Default for ListenerPolicy {
    fn default() -> Self {
        Self::new(ListenerSettings::default())
    }
}

// === impl AccessLogFormat ===

impl FromStr for AccessLogFormat {
    type Err = InvalidAccessLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "structured" => Ok(Self::Structured),
            _ => Err(InvalidAccessLogFormat(s.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InvalidAccessLogFormat(String);

impl fmt::Display for InvalidAccessLogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid access log format {:?}; expected plain or structured",
            self.0
        )
    }
}

impl std::error::Error for InvalidAccessLogFormat {}

/// Walks the graph once and produces the listener resource set.
///
/// Synthesis is a pure function of the graph and the policy: no I/O, no
/// failure modes, and deterministic output regardless of traversal order.
pub fn synthesize(root: &Vertex, policy: &ListenerPolicy) -> HashMap<String, Listener> {
    let mut visitor = ListenerVisitor {
        policy,
        secure_chains: Vec::new(),
        saw_plaintext_host: false,
    };
    visitor.visit(root);
    visitor.finish()
}

struct ListenerVisitor<'a> {
    policy: &'a ListenerPolicy,

    /// One chain per TLS host, in traversal order; sorted at finalization.
    secure_chains: Vec<FilterChain>,

    /// At least one plaintext virtual host was encountered.
    saw_plaintext_host: bool,
}

impl ListenerVisitor<'_> {
    fn visit(&mut self, vertex: &Vertex) {
        match vertex {
            Vertex::VirtualHost(_) => {
                // All plaintext hosts share the single HTTP listener
                // pipeline; routing among them is a downstream concern.
                self.saw_plaintext_host = true;
            }
            Vertex::SecureVirtualHost(host) => {
                let chain = self.secure_chain(host);
                self.secure_chains.push(chain);
            }
            Vertex::Group(_) => vertex.visit(&mut |child| self.visit(child)),
        }
    }

    fn secure_chain(&self, host: &SecureVirtualHost) -> FilterChain {
        let (filter, alpn_protocols) = match &host.tcp_proxy {
            // No ALPN on a passthrough chain: offering protocols here would
            // force a negotiation the backend never sees.
            Some(proxy) => (
                Filter::TcpProxy {
                    cluster: proxy.cluster.clone(),
                    access_log: Some(self.policy.https_access_log()),
                },
                Vec::new(),
            ),
            None => (
                Filter::HttpConnectionManager {
                    route_config: HTTPS_LISTENER.to_string(),
                    access_log: Some(self.policy.https_access_log()),
                    request_timeout: self.policy.request_timeout,
                },
                ALPN_HTTP.iter().map(|p| p.to_string()).collect(),
            ),
        };

        FilterChain {
            sni: Some(host.host.name.clone()),
            tls: Some(DownstreamTlsContext {
                secret: host.secret.clone(),
                // The greater of the operator floor and the host's request:
                // a host may raise its own floor but never weaken it.
                min_tls_version: self.policy.min_tls_version.max(host.min_tls_version),
                alpn_protocols,
                downstream_validation: host.downstream_validation.clone(),
            }),
            filter,
        }
    }

    fn finish(self) -> HashMap<String, Listener> {
        let Self {
            policy,
            mut secure_chains,
            saw_plaintext_host,
        } = self;

        let mut listeners = HashMap::new();

        if saw_plaintext_host {
            listeners.insert(HTTP_LISTENER.to_string(), http_listener(policy));
        }

        // A TLS listener with no chains would bind a port that can never
        // accept a handshake; it is suppressed rather than published.
        if !secure_chains.is_empty() {
            // Stable sort on the SNI key: identical graphs must serialize
            // identically or the data plane rebuilds listener state for a
            // no-op change.
            secure_chains.sort_by(|a, b| a.sni.cmp(&b.sni));

            let mut https = Listener::new(
                HTTPS_LISTENER,
                &policy.https_address,
                policy.https_port,
                secure_listener_filters(policy.use_proxy_protocol),
            );
            https.filter_chains = secure_chains;
            listeners.insert(HTTPS_LISTENER.to_string(), https);
        }

        listeners
    }
}

fn http_listener(policy: &ListenerPolicy) -> Listener {
    let mut listener = Listener::new(
        HTTP_LISTENER,
        &policy.http_address,
        policy.http_port,
        plain_listener_filters(policy.use_proxy_protocol),
    );
    listener.filter_chains.push(FilterChain {
        sni: None,
        tls: None,
        filter: Filter::HttpConnectionManager {
            route_config: HTTP_LISTENER.to_string(),
            access_log: Some(policy.http_access_log()),
            request_timeout: policy.request_timeout,
        },
    });
    listener
}

fn stats_listener(address: &str, port: u16) -> Listener {
    let mut listener = Listener::new(STATS_LISTENER, address, port, Vec::new());
    listener.filter_chains.push(FilterChain {
        sni: None,
        tls: None,
        filter: Filter::HttpConnectionManager {
            route_config: STATS_LISTENER.to_string(),
            access_log: None,
            request_timeout: Duration::ZERO,
        },
    });
    listener
}

fn plain_listener_filters(use_proxy_protocol: bool) -> Vec<ListenerFilter> {
    if use_proxy_protocol {
        vec![ListenerFilter::ProxyProtocol]
    } else {
        Vec::new()
    }
}

fn secure_listener_filters(use_proxy_protocol: bool) -> Vec<ListenerFilter> {
    let mut filters = plain_listener_filters(use_proxy_protocol);
    // SNI must be readable before any chain match can apply.
    filters.push(ListenerFilter::TlsInspector);
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use parapet_controller_core::{ClientValidation, TcpProxy, VirtualHost};

    fn http_host(name: &str) -> Vertex {
        Vertex::VirtualHost(VirtualHost {
            name: name.to_string(),
        })
    }

    fn tls_host(name: &str) -> SecureVirtualHost {
        SecureVirtualHost {
            host: VirtualHost {
                name: name.to_string(),
            },
            secret: format!("{name}-cert"),
            min_tls_version: TlsVersion::V1_2,
            tcp_proxy: None,
            downstream_validation: None,
        }
    }

    fn graph(vertices: impl IntoIterator<Item = Vertex>) -> Vertex {
        Vertex::Group(vertices.into_iter().collect())
    }

    fn chains(listener: &Listener) -> Vec<&FilterChain> {
        listener.filter_chains.iter().collect()
    }

    fn tls_context<'l>(listener: &'l Listener, sni: &str) -> &'l DownstreamTlsContext {
        listener
            .filter_chains
            .iter()
            .find(|c| c.sni.as_deref() == Some(sni))
            .and_then(|c| c.tls.as_ref())
            .unwrap_or_else(|| panic!("no TLS chain for {sni}"))
    }

    #[test]
    fn empty_graph_synthesizes_no_listeners() {
        let out = synthesize(&graph([]), &ListenerPolicy::default());
        assert!(out.is_empty(), "{out:?}");
    }

    #[test]
    fn plaintext_hosts_share_one_http_listener() {
        let out = synthesize(
            &graph([http_host("a.example.com"), http_host("b.example.com")]),
            &ListenerPolicy::default(),
        );

        assert!(!out.contains_key(HTTPS_LISTENER));
        let http = &out[HTTP_LISTENER];
        assert_eq!(http.address, DEFAULT_HTTP_LISTENER_ADDRESS);
        assert_eq!(http.port, DEFAULT_HTTP_LISTENER_PORT);
        // One pipeline no matter how many plaintext hosts were seen.
        assert_eq!(chains(http).len(), 1);
        assert!(matches!(
            http.filter_chains[0].filter,
            Filter::HttpConnectionManager { .. }
        ));
    }

    #[test]
    fn tls_only_graph_synthesizes_no_http_listener() {
        let out = synthesize(
            &graph([tls_host("a.example.com").into()]),
            &ListenerPolicy::default(),
        );

        assert!(!out.contains_key(HTTP_LISTENER));
        let https = &out[HTTPS_LISTENER];
        assert_eq!(https.port, DEFAULT_HTTPS_LISTENER_PORT);
        assert_eq!(chains(https).len(), 1);
        assert_eq!(
            https.filter_chains[0].sni.as_deref(),
            Some("a.example.com")
        );
    }

    #[test]
    fn chains_sort_by_sni_independent_of_traversal_order() {
        let policy = ListenerPolicy::default();
        let forward = synthesize(
            &graph([
                tls_host("c.example.com").into(),
                tls_host("a.example.com").into(),
                tls_host("b.example.com").into(),
            ]),
            &policy,
        );
        let reversed = synthesize(
            &graph([
                tls_host("b.example.com").into(),
                tls_host("c.example.com").into(),
                tls_host("a.example.com").into(),
            ]),
            &policy,
        );

        let snis: Vec<_> = forward[HTTPS_LISTENER]
            .filter_chains
            .iter()
            .map(|c| c.sni.as_deref())
            .collect();
        assert_eq!(
            snis,
            vec![
                Some("a.example.com"),
                Some("b.example.com"),
                Some("c.example.com")
            ]
        );
        assert_eq!(forward, reversed);
    }

    #[test]
    fn alpn_is_offered_only_on_http_chains() {
        let mut passthrough = tls_host("tcp.example.com");
        passthrough.tcp_proxy = Some(TcpProxy {
            cluster: "backend/tcp/443".to_string(),
        });

        let out = synthesize(
            &graph([tls_host("web.example.com").into(), passthrough.into()]),
            &ListenerPolicy::default(),
        );
        let https = &out[HTTPS_LISTENER];

        assert_eq!(
            tls_context(https, "web.example.com").alpn_protocols,
            vec!["h2", "http/1.1"]
        );
        assert!(tls_context(https, "tcp.example.com").alpn_protocols.is_empty());

        let tcp_chain = https
            .filter_chains
            .iter()
            .find(|c| c.sni.as_deref() == Some("tcp.example.com"))
            .unwrap();
        assert!(matches!(
            &tcp_chain.filter,
            Filter::TcpProxy { cluster, .. } if cluster == "backend/tcp/443"
        ));
    }

    #[test]
    fn host_may_raise_but_never_weaken_the_tls_floor() {
        let mut weaker = tls_host("weak.example.com");
        weaker.min_tls_version = TlsVersion::V1_1;
        let mut stronger = tls_host("strong.example.com");
        stronger.min_tls_version = TlsVersion::V1_3;

        let out = synthesize(
            &graph([weaker.into(), stronger.into()]),
            &ListenerPolicy::default(),
        );
        let https = &out[HTTPS_LISTENER];

        assert_eq!(
            tls_context(https, "weak.example.com").min_tls_version,
            TlsVersion::V1_2
        );
        assert_eq!(
            tls_context(https, "strong.example.com").min_tls_version,
            TlsVersion::V1_3
        );
    }

    #[test]
    fn downstream_validation_passes_through_unchanged() {
        let mut host = tls_host("mtls.example.com");
        host.downstream_validation = Some(ClientValidation {
            ca_secret: "client-ca".to_string(),
        });

        let out = synthesize(&graph([host.into()]), &ListenerPolicy::default());
        assert_eq!(
            tls_context(&out[HTTPS_LISTENER], "mtls.example.com").downstream_validation,
            Some(ClientValidation {
                ca_secret: "client-ca".to_string()
            })
        );
    }

    #[test]
    fn proxy_protocol_filter_precedes_sni_inspection() {
        let policy = ListenerPolicy::new(ListenerSettings {
            use_proxy_protocol: true,
            ..Default::default()
        });
        let out = synthesize(
            &graph([http_host("a.example.com"), tls_host("b.example.com").into()]),
            &policy,
        );

        assert_eq!(
            out[HTTPS_LISTENER].listener_filters,
            vec![ListenerFilter::ProxyProtocol, ListenerFilter::TlsInspector]
        );
        assert_eq!(
            out[HTTP_LISTENER].listener_filters,
            vec![ListenerFilter::ProxyProtocol]
        );

        let plain = synthesize(
            &graph([http_host("a.example.com"), tls_host("b.example.com").into()]),
            &ListenerPolicy::default(),
        );
        assert_eq!(
            plain[HTTPS_LISTENER].listener_filters,
            vec![ListenerFilter::TlsInspector]
        );
        assert!(plain[HTTP_LISTENER].listener_filters.is_empty());
    }

    #[test]
    fn structured_access_logs_default_their_field_list() {
        let policy = ListenerPolicy::new(ListenerSettings {
            access_log_format: Some(AccessLogFormat::Structured),
            ..Default::default()
        });
        let out = synthesize(&graph([http_host("a.example.com")]), &policy);

        match &out[HTTP_LISTENER].filter_chains[0].filter {
            Filter::HttpConnectionManager {
                access_log: Some(AccessLog::Structured { path, fields }),
                ..
            } => {
                assert_eq!(path, DEFAULT_ACCESS_LOG_PATH);
                assert_eq!(fields.len(), DEFAULT_STRUCTURED_FIELDS.len());
                assert!(fields.iter().any(|f| f == "response_code"));
            }
            other => panic!("expected structured access log, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_vertices_are_structurally_transparent() {
        let nested = graph([graph([graph([tls_host("deep.example.com").into()])])]);
        let out = synthesize(&nested, &ListenerPolicy::default());
        assert_eq!(
            out[HTTPS_LISTENER].filter_chains[0].sni.as_deref(),
            Some("deep.example.com")
        );
    }

    #[test]
    fn policy_resolves_every_default_once() {
        let policy = ListenerPolicy::default();
        assert_eq!(policy.http_address, "0.0.0.0");
        assert_eq!(policy.http_port, 8080);
        assert_eq!(policy.https_port, 8443);
        assert_eq!(policy.http_access_log, "/dev/stdout");
        assert_eq!(policy.https_access_log, "/dev/stdout");
        assert_eq!(policy.access_log_format, AccessLogFormat::Plain);
        assert_eq!(policy.min_tls_version, TlsVersion::V1_2);
        assert_eq!(policy.request_timeout, Duration::ZERO);
        assert!(!policy.use_proxy_protocol);
    }

    #[test]
    fn configured_tls_minimum_is_floored_at_the_baseline() {
        let weak = ListenerPolicy::new(ListenerSettings {
            minimum_tls_version: Some(TlsVersion::V1_1),
            ..Default::default()
        });
        assert_eq!(weak.min_tls_version, TlsVersion::V1_2);

        let strong = ListenerPolicy::new(ListenerSettings {
            minimum_tls_version: Some(TlsVersion::V1_3),
            ..Default::default()
        });
        assert_eq!(strong.min_tls_version, TlsVersion::V1_3);
    }

    #[test]
    fn negative_request_timeout_is_rendered_as_disabled() {
        let disabled = ListenerPolicy::new(ListenerSettings {
            request_timeout: Some(-7),
            ..Default::default()
        });
        assert_eq!(disabled.request_timeout, Duration::ZERO);

        let set = ListenerPolicy::new(ListenerSettings {
            request_timeout: Some(30),
            ..Default::default()
        });
        assert_eq!(set.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn cache_always_serves_the_static_stats_listener() {
        let cache = cache("0.0.0.0", 8002);
        assert_eq!(cache.type_url(), LISTENER_TYPE_URL);

        let contents = cache.contents();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].name, STATS_LISTENER);
        assert_eq!(contents[0].port, 8002);
    }
}
