//! Context data — the serializable key/value state of one logical call chain.

use serde_json::{Map, Value};

/// Per-chain context payload. Carried in every mesh request; the shared
/// subset is carried back in every response frame. Values are arbitrary JSON
/// (string, number, boolean, null, nested arrays/objects).
pub type ContextData = Map<String, Value>;

/// Well-known context keys.
pub mod keys {
    /// Domain of the service the chain originated on.
    pub const DOMAIN: &str = "domain";
    /// Domain originally requested at the gateway edge.
    pub const ORIGIN_DOMAIN: &str = "originDomain";
    /// Authenticated identity; always shared back to the caller once set.
    pub const IDENTITY: &str = "identity";
    /// Preferred languages of the external connection.
    pub const LANGS: &str = "langs";
    /// Gateway connection id the chain entered through.
    pub const CONNECTION_ID: &str = "connectionId";
}
