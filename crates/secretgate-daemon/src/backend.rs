//! The secret store behind the proxy.
//!
//! Handlers never talk to the store directly; they go through
//! [`SecretBackend`]. [`DbusBackend`] forwards each operation to a real
//! Secret Service over a zbus connection, and
//! [`MemoryBackend`](crate::memory::MemoryBackend) keeps everything in process
//! for tests and demos.
//!
//! ```text
//! handlers ──► SecretBackend ──┬──► DbusBackend ──► org.freedesktop.secrets
//!                              └──► MemoryBackend
//! ```
//!
//! Paths and values cross this seam unchanged. Session remapping happens
//! above it.

use std::collections::HashMap;

use async_trait::async_trait;
use secretgate_core::approval::ItemInfo;
use secretgate_core::path::{is_item, SERVICE_ROOT};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use zbus::Connection;
use zvariant::{DynamicDeserialize, DynamicType, ObjectPath, OwnedObjectPath, OwnedValue};

use crate::secret::{
    Secret, BUS_NAME, COLLECTION_INTERFACE, ITEM_INTERFACE, PROMPT_INTERFACE,
    PROPERTIES_INTERFACE, SERVICE_INTERFACE, SESSION_INTERFACE,
};

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// A failure reported by, or while talking to, the backend store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The store replied with a named error.
    #[error("{name}: {message}")]
    Remote {
        /// Error name.
        name: String,
        /// Error message.
        message: String,
    },

    /// The object does not exist in the store.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The object is locked.
    #[error("object is locked: {0}")]
    Locked(String),

    /// The request itself is malformed for this store.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The connection to the store failed.
    #[error("backend transport error: {0}")]
    Transport(String),

    /// The store replied with an unexpected body.
    #[error("malformed backend reply: {0}")]
    Reply(String),
}

impl From<zbus::Error> for BackendError {
    fn from(error: zbus::Error) -> Self {
        match error {
            zbus::Error::MethodError(name, message, _) => Self::Remote {
                name: name.to_string(),
                message: message.unwrap_or_default(),
            },
            zbus::Error::Variant(e) => Self::Reply(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Operations the proxy forwards to a secret store.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// `Service.OpenSession`.
    async fn open_session(
        &self,
        algorithm: &str,
        input: OwnedValue,
    ) -> BackendResult<(OwnedValue, OwnedObjectPath)>;

    /// `Session.Close`.
    async fn close_session(&self, session: &ObjectPath<'_>) -> BackendResult<()>;

    /// `Service.SearchItems`, returning `(unlocked, locked)`.
    async fn search_items(
        &self,
        attributes: &HashMap<String, String>,
    ) -> BackendResult<(Vec<OwnedObjectPath>, Vec<OwnedObjectPath>)>;

    /// `Collection.SearchItems`.
    async fn search_collection(
        &self,
        collection: &ObjectPath<'_>,
        attributes: &HashMap<String, String>,
    ) -> BackendResult<Vec<OwnedObjectPath>>;

    /// `Service.GetSecrets`.
    async fn get_secrets(
        &self,
        items: &[OwnedObjectPath],
        session: &ObjectPath<'_>,
    ) -> BackendResult<HashMap<OwnedObjectPath, Secret>>;

    /// `Item.GetSecret`.
    async fn get_secret(
        &self,
        item: &ObjectPath<'_>,
        session: &ObjectPath<'_>,
    ) -> BackendResult<Secret>;

    /// `Item.SetSecret`.
    async fn set_secret(&self, item: &ObjectPath<'_>, secret: Secret) -> BackendResult<()>;

    /// `Collection.CreateItem`, returning `(item, prompt)`.
    async fn create_item(
        &self,
        collection: &ObjectPath<'_>,
        properties: HashMap<String, OwnedValue>,
        secret: Secret,
        replace: bool,
    ) -> BackendResult<(OwnedObjectPath, OwnedObjectPath)>;

    /// `Service.CreateCollection`, returning `(collection, prompt)`.
    async fn create_collection(
        &self,
        properties: HashMap<String, OwnedValue>,
        alias: &str,
    ) -> BackendResult<(OwnedObjectPath, OwnedObjectPath)>;

    /// `Collection.Delete` or `Item.Delete`, returning the prompt.
    async fn delete(&self, object: &ObjectPath<'_>) -> BackendResult<OwnedObjectPath>;

    /// `Service.Lock`, returning `(locked, prompt)`.
    async fn lock(
        &self,
        objects: &[OwnedObjectPath],
    ) -> BackendResult<(Vec<OwnedObjectPath>, OwnedObjectPath)>;

    /// `Service.Unlock`, returning `(unlocked, prompt)`.
    async fn unlock(
        &self,
        objects: &[OwnedObjectPath],
    ) -> BackendResult<(Vec<OwnedObjectPath>, OwnedObjectPath)>;

    /// `Service.ReadAlias`.
    async fn read_alias(&self, name: &str) -> BackendResult<OwnedObjectPath>;

    /// `Service.SetAlias`.
    async fn set_alias(&self, name: &str, collection: &ObjectPath<'_>) -> BackendResult<()>;

    /// `Prompt.Prompt`.
    async fn prompt(&self, prompt: &ObjectPath<'_>, window_id: &str) -> BackendResult<()>;

    /// `Prompt.Dismiss`.
    async fn dismiss(&self, prompt: &ObjectPath<'_>) -> BackendResult<()>;

    /// `Properties.Get`.
    async fn get_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
    ) -> BackendResult<OwnedValue>;

    /// `Properties.Set`.
    async fn set_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
        value: OwnedValue,
    ) -> BackendResult<()>;

    /// `Properties.GetAll`.
    async fn get_all_properties(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
    ) -> BackendResult<HashMap<String, OwnedValue>>;

    /// Label and attributes of an item, for display to an approver.
    ///
    /// Never fails: unreadable metadata degrades to a path-only entry.
    async fn item_info(&self, item: &ObjectPath<'_>) -> ItemInfo {
        match self.get_all_properties(item, ITEM_INTERFACE).await {
            Ok(properties) => item_info_from_properties(item.as_str(), properties),
            Err(e) => {
                debug!(item = %item, error = %e, "item metadata unavailable");
                ItemInfo::unlabelled(item.as_str())
            },
        }
    }
}

/// Builds [`ItemInfo`] from an `Item` property map.
#[must_use]
pub fn item_info_from_properties(
    path: &str,
    mut properties: HashMap<String, OwnedValue>,
) -> ItemInfo {
    let label = properties
        .remove("Label")
        .and_then(|v| String::try_from(v).ok())
        .unwrap_or_default();
    let attributes = properties
        .remove("Attributes")
        .and_then(|v| HashMap::<String, String>::try_from(v).ok())
        .unwrap_or_default()
        .into_iter()
        .collect();
    ItemInfo {
        path: path.to_string(),
        label,
        attributes,
    }
}

/// [`SecretBackend`] over a D-Bus connection to a real Secret Service.
#[derive(Debug, Clone)]
pub struct DbusBackend {
    connection: Connection,
}

impl DbusBackend {
    /// Wraps an established connection.
    #[must_use]
    pub const fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Connects to `address`, or to the session bus when `None`.
    pub async fn connect(address: Option<&str>) -> BackendResult<Self> {
        let connection = match address {
            Some(address) => {
                zbus::connection::Builder::address(address)?
                    .build()
                    .await?
            },
            None => Connection::session().await?,
        };
        Ok(Self::new(connection))
    }

    /// The underlying connection, used for signal subscription.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn call<B, R>(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: &B,
    ) -> BackendResult<R>
    where
        B: Serialize + DynamicType,
        R: for<'d> DynamicDeserialize<'d>,
    {
        let reply = self
            .connection
            .call_method(Some(BUS_NAME), path, Some(interface), member, body)
            .await?;
        reply
            .body()
            .deserialize::<R>()
            .map_err(|e| BackendError::Reply(format!("{interface}.{member}: {e}")))
    }

    async fn call_void<B>(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: &B,
    ) -> BackendResult<()>
    where
        B: Serialize + DynamicType,
    {
        self.connection
            .call_method(Some(BUS_NAME), path, Some(interface), member, body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SecretBackend for DbusBackend {
    async fn open_session(
        &self,
        algorithm: &str,
        input: OwnedValue,
    ) -> BackendResult<(OwnedValue, OwnedObjectPath)> {
        self.call(SERVICE_ROOT, SERVICE_INTERFACE, "OpenSession", &(algorithm, &input))
            .await
    }

    async fn close_session(&self, session: &ObjectPath<'_>) -> BackendResult<()> {
        self.call_void(session.as_str(), SESSION_INTERFACE, "Close", &())
            .await
    }

    async fn search_items(
        &self,
        attributes: &HashMap<String, String>,
    ) -> BackendResult<(Vec<OwnedObjectPath>, Vec<OwnedObjectPath>)> {
        self.call(SERVICE_ROOT, SERVICE_INTERFACE, "SearchItems", &(attributes,))
            .await
    }

    async fn search_collection(
        &self,
        collection: &ObjectPath<'_>,
        attributes: &HashMap<String, String>,
    ) -> BackendResult<Vec<OwnedObjectPath>> {
        self.call(
            collection.as_str(),
            COLLECTION_INTERFACE,
            "SearchItems",
            &(attributes,),
        )
        .await
    }

    async fn get_secrets(
        &self,
        items: &[OwnedObjectPath],
        session: &ObjectPath<'_>,
    ) -> BackendResult<HashMap<OwnedObjectPath, Secret>> {
        self.call(SERVICE_ROOT, SERVICE_INTERFACE, "GetSecrets", &(items, session))
            .await
    }

    async fn get_secret(
        &self,
        item: &ObjectPath<'_>,
        session: &ObjectPath<'_>,
    ) -> BackendResult<Secret> {
        let (secret,): (Secret,) = self
            .call(item.as_str(), ITEM_INTERFACE, "GetSecret", &(session,))
            .await?;
        Ok(secret)
    }

    async fn set_secret(&self, item: &ObjectPath<'_>, secret: Secret) -> BackendResult<()> {
        self.call_void(item.as_str(), ITEM_INTERFACE, "SetSecret", &(secret,))
            .await
    }

    async fn create_item(
        &self,
        collection: &ObjectPath<'_>,
        properties: HashMap<String, OwnedValue>,
        secret: Secret,
        replace: bool,
    ) -> BackendResult<(OwnedObjectPath, OwnedObjectPath)> {
        self.call(
            collection.as_str(),
            COLLECTION_INTERFACE,
            "CreateItem",
            &(properties, secret, replace),
        )
        .await
    }

    async fn create_collection(
        &self,
        properties: HashMap<String, OwnedValue>,
        alias: &str,
    ) -> BackendResult<(OwnedObjectPath, OwnedObjectPath)> {
        self.call(
            SERVICE_ROOT,
            SERVICE_INTERFACE,
            "CreateCollection",
            &(properties, alias),
        )
        .await
    }

    async fn delete(&self, object: &ObjectPath<'_>) -> BackendResult<OwnedObjectPath> {
        let interface = if is_item(object.as_str()) {
            ITEM_INTERFACE
        } else {
            COLLECTION_INTERFACE
        };
        let (prompt,): (OwnedObjectPath,) =
            self.call(object.as_str(), interface, "Delete", &()).await?;
        Ok(prompt)
    }

    async fn lock(
        &self,
        objects: &[OwnedObjectPath],
    ) -> BackendResult<(Vec<OwnedObjectPath>, OwnedObjectPath)> {
        self.call(SERVICE_ROOT, SERVICE_INTERFACE, "Lock", &(objects,))
            .await
    }

    async fn unlock(
        &self,
        objects: &[OwnedObjectPath],
    ) -> BackendResult<(Vec<OwnedObjectPath>, OwnedObjectPath)> {
        self.call(SERVICE_ROOT, SERVICE_INTERFACE, "Unlock", &(objects,))
            .await
    }

    async fn read_alias(&self, name: &str) -> BackendResult<OwnedObjectPath> {
        let (collection,): (OwnedObjectPath,) = self
            .call(SERVICE_ROOT, SERVICE_INTERFACE, "ReadAlias", &(name,))
            .await?;
        Ok(collection)
    }

    async fn set_alias(&self, name: &str, collection: &ObjectPath<'_>) -> BackendResult<()> {
        self.call_void(SERVICE_ROOT, SERVICE_INTERFACE, "SetAlias", &(name, collection))
            .await
    }

    async fn prompt(&self, prompt: &ObjectPath<'_>, window_id: &str) -> BackendResult<()> {
        self.call_void(prompt.as_str(), PROMPT_INTERFACE, "Prompt", &(window_id,))
            .await
    }

    async fn dismiss(&self, prompt: &ObjectPath<'_>) -> BackendResult<()> {
        self.call_void(prompt.as_str(), PROMPT_INTERFACE, "Dismiss", &())
            .await
    }

    async fn get_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
    ) -> BackendResult<OwnedValue> {
        let (value,): (OwnedValue,) = self
            .call(object.as_str(), PROPERTIES_INTERFACE, "Get", &(interface, name))
            .await?;
        Ok(value)
    }

    async fn set_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
        value: OwnedValue,
    ) -> BackendResult<()> {
        self.call_void(
            object.as_str(),
            PROPERTIES_INTERFACE,
            "Set",
            &(interface, name, &value),
        )
        .await
    }

    async fn get_all_properties(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
    ) -> BackendResult<HashMap<String, OwnedValue>> {
        let (properties,): (HashMap<String, OwnedValue>,) = self
            .call(object.as_str(), PROPERTIES_INTERFACE, "GetAll", &(interface,))
            .await?;
        Ok(properties)
    }
}
