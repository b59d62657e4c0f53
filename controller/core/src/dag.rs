//! The desired-state graph consumed by resource synthesis.
//!
//! The graph is produced upstream of this crate (from whatever declarative
//! sources the deployment watches) and handed to the synthesizers as an
//! immutable revision. The vertex set is closed: adding a variant forces a
//! deliberate decision at every match site in the synthesizers.

use crate::listener::{ClientValidation, TlsVersion};

/// A node in the desired-state graph.
///
/// The graph is acyclic and finite; traversal always terminates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vertex {
    /// A virtual host served over plaintext HTTP.
    VirtualHost(VirtualHost),

    /// A TLS-terminated virtual host.
    SecureVirtualHost(SecureVirtualHost),

    /// Any other node kind. Structurally transparent to listener synthesis:
    /// it only contributes its children.
    Group(Vec<Vertex>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    /// The host's routing name, e.g. `example.com`.
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecureVirtualHost {
    pub host: VirtualHost,

    /// Reference to the secret holding this host's certificate material.
    pub secret: String,

    /// The minimum TLS protocol version this host requests. A host may raise
    /// the operator's floor but never weaken it.
    pub min_tls_version: TlsVersion,

    /// When set, connections matching this host's SNI are proxied as raw TCP
    /// to the named upstream cluster instead of being handled as HTTP.
    pub tcp_proxy: Option<TcpProxy>,

    /// Downstream client-certificate validation policy, if configured.
    pub downstream_validation: Option<ClientValidation>,
}

/// A raw TCP passthrough target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpProxy {
    /// The upstream cluster receiving the proxied bytes.
    pub cluster: String,
}

// === impl Vertex ===

impl Vertex {
    /// Invokes `f` on each structural child of this vertex.
    ///
    /// Host vertices have no children relevant to synthesis; visitors that do
    /// not consume a vertex recurse through here.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Vertex)) {
        match self {
            Vertex::Group(children) => {
                for child in children {
                    f(child);
                }
            }
            Vertex::VirtualHost(_) | Vertex::SecureVirtualHost(_) => {}
        }
    }
}

impl From<VirtualHost> for Vertex {
    fn from(vh: VirtualHost) -> Self {
        Vertex::VirtualHost(vh)
    }
}

impl From<SecureVirtualHost> for Vertex {
    fn from(vh: SecureVirtualHost) -> Self {
        Vertex::SecureVirtualHost(vh)
    }
}
