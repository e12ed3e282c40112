//! Secret Service wire vocabulary.
//!
//! Names, interfaces, the `Secret` struct and the error names clients
//! branch on. Everything that crosses the bus in either direction is spelled
//! here once.

pub mod error;
pub mod types;

pub use error::SecretServiceError;
pub use types::Secret;

/// Well-known bus name of the Secret Service.
pub const BUS_NAME: &str = "org.freedesktop.secrets";

/// `org.freedesktop.Secret.Service`
pub const SERVICE_INTERFACE: &str = "org.freedesktop.Secret.Service";
/// `org.freedesktop.Secret.Collection`
pub const COLLECTION_INTERFACE: &str = "org.freedesktop.Secret.Collection";
/// `org.freedesktop.Secret.Item`
pub const ITEM_INTERFACE: &str = "org.freedesktop.Secret.Item";
/// `org.freedesktop.Secret.Session`
pub const SESSION_INTERFACE: &str = "org.freedesktop.Secret.Session";
/// `org.freedesktop.Secret.Prompt`
pub const PROMPT_INTERFACE: &str = "org.freedesktop.Secret.Prompt";
/// Prefix shared by every Secret Service interface.
pub const SECRET_INTERFACE_PREFIX: &str = "org.freedesktop.Secret.";

/// `org.freedesktop.DBus.Properties`
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
/// `org.freedesktop.DBus.Introspectable`
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
/// `org.freedesktop.DBus.Peer`
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// The only transfer algorithm the proxy accepts.
pub const PLAIN_ALGORITHM: &str = "plain";

/// Object path meaning "no object" (no prompt needed, no item created).
pub const NO_OBJECT: &str = "/";

/// Item label property, as passed to `CreateItem`.
pub const ITEM_LABEL_PROPERTY: &str = "org.freedesktop.Secret.Item.Label";
/// Item attributes property, as passed to `CreateItem`.
pub const ITEM_ATTRIBUTES_PROPERTY: &str = "org.freedesktop.Secret.Item.Attributes";
/// Collection label property, as passed to `CreateCollection`.
pub const COLLECTION_LABEL_PROPERTY: &str = "org.freedesktop.Secret.Collection.Label";
