//! Method-call routing.
//!
//! Every inbound call is classified by object path into a [`Route`], then
//! `(route, interface, member)` selects one [`Operation`] through a closed
//! match. The call body is decoded into the operation's argument types, the
//! typed handler runs, and the reply (or a named error) is sent back.
//!
//! ```text
//!  MethodCall ─► operation(path, iface, member) ─► Route::classify(path)
//!                                                │
//!                       decode body ◄────────────┘
//!                            │
//!                 Handlers::<op>(...) ─► reply | reply_error
//! ```
//!
//! Calls without an interface field are matched on member name alone.
//! A Secret Service member sent to an object of the wrong kind, and any call
//! outside the object tree, gets NoSuchObject. Members no served interface
//! defines get UnknownMethod. Undecodable bodies get InvalidArgs.

use std::collections::HashMap;

use secretgate_core::path::{self, PathKind, SERVICE_ROOT};
use serde::Serialize;
use tracing::{debug, warn};
use zbus::{Connection, Message};
use zvariant::{DynamicDeserialize, DynamicType, ObjectPath, OwnedObjectPath, OwnedValue};

use super::handlers::{HandlerResult, Handlers};
use super::introspection;
use crate::secret::{
    Secret, SecretServiceError, COLLECTION_INTERFACE, INTROSPECTABLE_INTERFACE, ITEM_INTERFACE,
    PEER_INTERFACE, PROMPT_INTERFACE, PROPERTIES_INTERFACE, SERVICE_INTERFACE, SESSION_INTERFACE,
};

/// Kind of object a call is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `/org/freedesktop/secrets`.
    Service,
    /// A collection, by id or alias.
    Collection,
    /// An item.
    Item,
    /// A session.
    Session,
    /// A prompt.
    Prompt,
    /// Anything else.
    Unknown,
}

impl Route {
    /// Classifies an object path.
    #[must_use]
    pub fn classify(object: &str) -> Self {
        if object == SERVICE_ROOT {
            return Self::Service;
        }
        match path::classify(object) {
            PathKind::Collection => Self::Collection,
            PathKind::Item => Self::Item,
            PathKind::Neither if path::is_session(object) => Self::Session,
            PathKind::Neither if path::is_prompt(object) => Self::Prompt,
            PathKind::Neither => Self::Unknown,
        }
    }

    /// Returns `true` for objects that expose Secret Service properties.
    #[must_use]
    pub const fn has_properties(self) -> bool {
        matches!(self, Self::Service | Self::Collection | Self::Item)
    }
}

/// Everything the proxy answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    OpenSession,
    CreateCollection,
    SearchItems,
    Unlock,
    Lock,
    GetSecrets,
    ReadAlias,
    SetAlias,
    CollectionSearchItems,
    CreateItem,
    Delete,
    GetSecret,
    SetSecret,
    CloseSession,
    Prompt,
    Dismiss,
    PropertyGet,
    PropertySet,
    PropertyGetAll,
    Introspect,
    Ping,
    GetMachineId,
}

fn on(interface: Option<&str>, expected: &str) -> bool {
    interface.map_or(true, |i| i == expected)
}

/// Members of the interfaces the proxy serves, by interface.
const MEMBERS: &[(&str, &[&str])] = &[
    (
        SERVICE_INTERFACE,
        &[
            "OpenSession",
            "CreateCollection",
            "SearchItems",
            "Unlock",
            "Lock",
            "GetSecrets",
            "ReadAlias",
            "SetAlias",
        ],
    ),
    (COLLECTION_INTERFACE, &["SearchItems", "CreateItem", "Delete"]),
    (ITEM_INTERFACE, &["GetSecret", "SetSecret", "Delete"]),
    (SESSION_INTERFACE, &["Close"]),
    (PROMPT_INTERFACE, &["Prompt", "Dismiss"]),
    (PROPERTIES_INTERFACE, &["Get", "Set", "GetAll"]),
];

/// Returns `true` if some served interface matching `interface` defines
/// `member`.
fn is_known_member(interface: Option<&str>, member: &str) -> bool {
    MEMBERS
        .iter()
        .any(|(iface, members)| on(interface, iface) && members.contains(&member))
}

/// Selects the operation for a call on `object`.
///
/// # Errors
///
/// - [`SecretServiceError::NoSuchObject`] for any call on a path outside the
///   Secret Service object tree, and for a known member called on an object
///   of the wrong kind.
/// - [`SecretServiceError::UnknownMethod`] for members no served interface
///   defines.
pub fn operation(
    object: &str,
    interface: Option<&str>,
    member: &str,
) -> Result<Operation, SecretServiceError> {
    use Operation as Op;
    use Route as R;

    let route = Route::classify(object);
    let service = on(interface, SERVICE_INTERFACE);
    let collection = on(interface, COLLECTION_INTERFACE);
    let item = on(interface, ITEM_INTERFACE);
    let properties = on(interface, PROPERTIES_INTERFACE) && route.has_properties();

    let op = match (route, member) {
        (_, "Introspect") if on(interface, INTROSPECTABLE_INTERFACE) => Op::Introspect,
        (_, "Ping") if on(interface, PEER_INTERFACE) => Op::Ping,
        (_, "GetMachineId") if on(interface, PEER_INTERFACE) => Op::GetMachineId,

        (_, "Get") if properties => Op::PropertyGet,
        (_, "Set") if properties => Op::PropertySet,
        (_, "GetAll") if properties => Op::PropertyGetAll,

        (R::Service, "OpenSession") if service => Op::OpenSession,
        (R::Service, "CreateCollection") if service => Op::CreateCollection,
        (R::Service, "SearchItems") if service => Op::SearchItems,
        (R::Service, "Unlock") if service => Op::Unlock,
        (R::Service, "Lock") if service => Op::Lock,
        (R::Service, "GetSecrets") if service => Op::GetSecrets,
        (R::Service, "ReadAlias") if service => Op::ReadAlias,
        (R::Service, "SetAlias") if service => Op::SetAlias,

        (R::Collection, "SearchItems") if collection => Op::CollectionSearchItems,
        (R::Collection, "CreateItem") if collection => Op::CreateItem,
        (R::Collection, "Delete") if collection => Op::Delete,

        (R::Item, "GetSecret") if item => Op::GetSecret,
        (R::Item, "SetSecret") if item => Op::SetSecret,
        (R::Item, "Delete") if item => Op::Delete,

        (R::Session, "Close") if on(interface, SESSION_INTERFACE) => Op::CloseSession,

        (R::Prompt, "Prompt") if on(interface, PROMPT_INTERFACE) => Op::Prompt,
        (R::Prompt, "Dismiss") if on(interface, PROMPT_INTERFACE) => Op::Dismiss,

        (R::Unknown, _) => return Err(SecretServiceError::no_such_object(object)),
        _ if is_known_member(interface, member) => {
            return Err(SecretServiceError::no_such_object(object));
        },
        _ => {
            return Err(SecretServiceError::UnknownMethod(format!(
                "{}.{member} is not available on this object",
                interface.unwrap_or("<any>")
            )));
        },
    };
    Ok(op)
}

/// Handles one method call end to end, replying on `connection`.
pub async fn dispatch(handlers: &Handlers, connection: &Connection, message: &Message) {
    let header = message.header();
    let Some(object) = header.path() else {
        return;
    };
    let route = Route::classify(object.as_str());
    let interface = header.interface().map(|i| i.as_str());
    let member = header.member().map_or("", |m| m.as_str());
    let sender = header.sender().map_or("", |s| s.as_str());

    debug!(
        client = %handlers.client_name(),
        sender = %sender,
        path = %object,
        member = %member,
        "method call"
    );

    let result = match operation(object.as_str(), interface, member) {
        Ok(op) => {
            let call = Call {
                handlers,
                connection,
                message,
                object,
                sender,
            };
            call.invoke(op, route).await
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        debug!(member = %member, error = %e, "replying with error");
        if let Err(send_error) = connection
            .reply_error(message, e.dbus_name(), &e.message())
            .await
        {
            warn!(member = %member, error = %send_error, "failed to send error reply");
        }
    }
}

struct Call<'a> {
    handlers: &'a Handlers,
    connection: &'a Connection,
    message: &'a Message,
    object: &'a ObjectPath<'a>,
    sender: &'a str,
}

impl Call<'_> {
    fn args<T>(&self) -> HandlerResult<T>
    where
        T: for<'d> DynamicDeserialize<'d>,
    {
        self.message
            .body()
            .deserialize()
            .map_err(|e| SecretServiceError::InvalidArgs(e.to_string()))
    }

    async fn reply<B>(&self, body: &B) -> HandlerResult<()>
    where
        B: Serialize + DynamicType + Sync,
    {
        self.connection
            .reply(self.message, body)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(error = %e, "failed to send reply");
                SecretServiceError::Failed(e.to_string())
            })
    }

    async fn invoke(&self, op: Operation, route: Route) -> HandlerResult<()> {
        let h = self.handlers;
        let obj = self.object;
        let sender = self.sender;

        match op {
            Operation::OpenSession => {
                let (algorithm, input): (String, OwnedValue) = self.args()?;
                let reply = h.open_session(obj, &algorithm, input).await?;
                self.reply(&reply).await
            },
            Operation::CreateCollection => {
                let (properties, alias): (HashMap<String, OwnedValue>, String) = self.args()?;
                let reply = h.create_collection(obj, properties, &alias).await?;
                self.reply(&reply).await
            },
            Operation::SearchItems => {
                let (attributes,): (HashMap<String, String>,) = self.args()?;
                let reply = h.search_items(obj, sender, attributes).await?;
                self.reply(&reply).await
            },
            Operation::Unlock => {
                let (objects,): (Vec<OwnedObjectPath>,) = self.args()?;
                let reply = h.unlock(obj, objects).await?;
                self.reply(&reply).await
            },
            Operation::Lock => {
                let (objects,): (Vec<OwnedObjectPath>,) = self.args()?;
                let reply = h.lock(obj, objects).await?;
                self.reply(&reply).await
            },
            Operation::GetSecrets => {
                let (items, session): (Vec<OwnedObjectPath>, OwnedObjectPath) = self.args()?;
                let secrets = h.get_secrets(obj, sender, items, &session).await?;
                self.reply(&(secrets,)).await
            },
            Operation::ReadAlias => {
                let (name,): (String,) = self.args()?;
                let collection = h.read_alias(obj, &name).await?;
                self.reply(&(collection,)).await
            },
            Operation::SetAlias => {
                let (name, collection): (String, OwnedObjectPath) = self.args()?;
                h.set_alias(obj, &name, &collection).await?;
                self.reply(&()).await
            },
            Operation::CollectionSearchItems => {
                let (attributes,): (HashMap<String, String>,) = self.args()?;
                let results = h.search_collection(obj, sender, attributes).await?;
                self.reply(&(results,)).await
            },
            Operation::CreateItem => {
                let (properties, secret, replace): (HashMap<String, OwnedValue>, Secret, bool) =
                    self.args()?;
                let reply = h.create_item(obj, sender, properties, secret, replace).await?;
                self.reply(&reply).await
            },
            Operation::Delete => {
                let prompt = h.delete(obj).await?;
                self.reply(&(prompt,)).await
            },
            Operation::GetSecret => {
                let (session,): (OwnedObjectPath,) = self.args()?;
                let secret = h.get_secret(obj, sender, &session).await?;
                self.reply(&(secret,)).await
            },
            Operation::SetSecret => {
                let (secret,): (Secret,) = self.args()?;
                h.set_secret(obj, sender, secret).await?;
                self.reply(&()).await
            },
            Operation::CloseSession => {
                h.close_session(obj).await?;
                self.reply(&()).await
            },
            Operation::Prompt => {
                let (window_id,): (String,) = self.args()?;
                h.prompt(obj, &window_id).await?;
                self.reply(&()).await
            },
            Operation::Dismiss => {
                h.dismiss(obj).await?;
                self.reply(&()).await
            },
            Operation::PropertyGet => {
                let (interface, name): (String, String) = self.args()?;
                let value = h.get_property(obj, &interface, &name).await?;
                self.reply(&(value,)).await
            },
            Operation::PropertySet => {
                let (interface, name, value): (String, String, OwnedValue) = self.args()?;
                h.set_property(obj, &interface, &name, value).await?;
                self.reply(&()).await
            },
            Operation::PropertyGetAll => {
                let (interface,): (String,) = self.args()?;
                let values = h.get_all_properties(obj, &interface).await?;
                self.reply(&(values,)).await
            },
            Operation::Introspect => {
                let xml = introspection::document(route, obj.as_str());
                self.reply(&(xml,)).await
            },
            Operation::Ping => self.reply(&()).await,
            Operation::GetMachineId => {
                let id = introspection::machine_id().map_err(|e| {
                    SecretServiceError::Failed(format!("machine id unavailable: {e}"))
                })?;
                self.reply(&(id,)).await
            },
        }
    }
}
