#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dag;
pub mod listener;

pub use self::dag::{SecureVirtualHost, TcpProxy, Vertex, VirtualHost};
pub use self::listener::{
    AccessLog, ClientValidation, DownstreamTlsContext, Filter, FilterChain, Listener,
    ListenerFilter, TlsVersion,
};

/// Identifies the listener resource category on the streaming config
/// protocol. Fixed per cache instance; the protocol layer uses it to route
/// subscription requests to the right cache.
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

/// A named, serializable piece of data-plane configuration. The name is the
/// process-unique key under which a snapshot cache holds the resource.
pub trait Resource {
    fn name(&self) -> &str;
}
