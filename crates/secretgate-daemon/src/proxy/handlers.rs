//! Typed Secret Service handlers.
//!
//! The router decodes a call and invokes one method here; the method returns
//! a typed reply or a [`SecretServiceError`]. Handlers fall into three
//! policies:
//!
//! | Policy            | Calls                                                   |
//! |-------------------|---------------------------------------------------------|
//! | gated             | `GetSecrets`, `GetSecret`, `SearchItems` (both)         |
//! | write-with-remap  | `CreateItem`, `SetSecret` (gated if `gate_writes`)      |
//! | pass-through      | properties, lock/unlock, aliases, delete, prompts, ...  |
//!
//! # Gating
//!
//! ```text
//! fetch ItemInfo ─► resolve requester ─► tracker context ─► require_approval
//!                                                               │
//!                              release context (always) ◄───────┘
//! ```
//!
//! Every approval failure reaches the client as the same AccessDenied error.
//!
//! # Invariants
//!
//! - Clients only ever see their own session paths; backend session paths
//!   never cross into a reply.
//! - Each handler checks the shape of the object path it is given and
//!   returns NoSuchObject for anything else.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use secretgate_core::approval::{ItemInfo, RequestType};
use secretgate_core::identity::SenderInfo;
use secretgate_core::path::{is_collection, is_item, is_prompt, is_session, SERVICE_ROOT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};

use crate::backend::SecretBackend;
use crate::gateway::{ApprovalGateway, ApprovalInput};
use crate::identity::SenderResolver;
use crate::secret::{Secret, SecretServiceError, ITEM_ATTRIBUTES_PROPERTY, ITEM_LABEL_PROPERTY};
use crate::session::SessionRemapper;
use crate::tracker::ClientTracker;

/// Result of a handler.
pub type HandlerResult<T> = Result<T, SecretServiceError>;

/// Handler set of one proxy instance.
pub struct Handlers {
    client_name: String,
    backend: Arc<dyn SecretBackend>,
    sessions: SessionRemapper,
    tracker: Arc<ClientTracker>,
    resolver: SenderResolver,
    gateway: Arc<ApprovalGateway>,
    gate_writes: bool,
    cancel: CancellationToken,
}

impl Handlers {
    /// Creates handlers for `client_name` over `backend`.
    ///
    /// Gated waits derive their cancellation from `cancel`.
    #[must_use]
    pub fn new(
        client_name: impl Into<String>,
        backend: Arc<dyn SecretBackend>,
        gateway: Arc<ApprovalGateway>,
        resolver: SenderResolver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            sessions: SessionRemapper::new(Arc::clone(&backend)),
            backend,
            tracker: Arc::new(ClientTracker::new()),
            resolver,
            gateway,
            gate_writes: false,
            cancel,
        }
    }

    /// Uses `tracker` for per-sender contexts.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<ClientTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Also gates `CreateItem` and `SetSecret`.
    #[must_use]
    pub fn with_gate_writes(mut self, gate_writes: bool) -> Self {
        self.gate_writes = gate_writes;
        self
    }

    /// Client endpoint name.
    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Session table of this proxy.
    #[must_use]
    pub const fn sessions(&self) -> &SessionRemapper {
        &self.sessions
    }

    /// Per-sender context tracker.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<ClientTracker> {
        &self.tracker
    }

    // ---------------------------------------------------------------------
    // Service
    // ---------------------------------------------------------------------

    /// `Service.OpenSession`.
    pub async fn open_session(
        &self,
        path: &ObjectPath<'_>,
        algorithm: &str,
        input: OwnedValue,
    ) -> HandlerResult<(OwnedValue, OwnedObjectPath)> {
        require(is_service(path), path)?;
        self.sessions.create_session(algorithm, input).await
    }

    /// `Service.SearchItems`, gated when anything matches.
    pub async fn search_items(
        &self,
        path: &ObjectPath<'_>,
        sender: &str,
        attributes: HashMap<String, String>,
    ) -> HandlerResult<(Vec<OwnedObjectPath>, Vec<OwnedObjectPath>)> {
        require(is_service(path), path)?;
        let (unlocked, locked) = self.backend.search_items(&attributes).await?;
        if unlocked.is_empty() && locked.is_empty() {
            return Ok((unlocked, locked));
        }

        let items = self.item_infos(unlocked.iter().chain(&locked)).await;
        let input = ApprovalInput::new(
            &self.client_name,
            RequestType::Search,
            SenderInfo::unresolved(sender),
        )
        .with_items(items)
        .with_extra_context(search_context(&attributes));
        self.gate(sender, input).await?;
        Ok((unlocked, locked))
    }

    /// `Service.GetSecrets`.
    pub async fn get_secrets(
        &self,
        path: &ObjectPath<'_>,
        sender: &str,
        items: Vec<OwnedObjectPath>,
        session: &ObjectPath<'_>,
    ) -> HandlerResult<HashMap<OwnedObjectPath, Secret>> {
        require(is_service(path), path)?;
        if let Some(other) = items.iter().find(|item| !is_item(item)) {
            return Err(SecretServiceError::no_such_object(other.as_str()));
        }
        let local = self.local_session(session)?;
        if items.is_empty() {
            return Ok(HashMap::new());
        }

        let infos = self.item_infos(items.iter()).await;
        let input = ApprovalInput::new(
            &self.client_name,
            RequestType::GetSecret,
            SenderInfo::unresolved(sender),
        )
        .with_items(infos)
        .with_session(session.as_str());
        self.gate(sender, input).await?;

        let secrets = self.backend.get_secrets(&items, &local).await?;
        Ok(secrets
            .into_iter()
            .map(|(item, secret)| (item, self.to_client(secret, session)))
            .collect())
    }

    /// `Service.CreateCollection`.
    pub async fn create_collection(
        &self,
        path: &ObjectPath<'_>,
        properties: HashMap<String, OwnedValue>,
        alias: &str,
    ) -> HandlerResult<(OwnedObjectPath, OwnedObjectPath)> {
        require(is_service(path), path)?;
        Ok(self.backend.create_collection(properties, alias).await?)
    }

    /// `Service.Lock`.
    pub async fn lock(
        &self,
        path: &ObjectPath<'_>,
        objects: Vec<OwnedObjectPath>,
    ) -> HandlerResult<(Vec<OwnedObjectPath>, OwnedObjectPath)> {
        require(is_service(path), path)?;
        Ok(self.backend.lock(&objects).await?)
    }

    /// `Service.Unlock`.
    pub async fn unlock(
        &self,
        path: &ObjectPath<'_>,
        objects: Vec<OwnedObjectPath>,
    ) -> HandlerResult<(Vec<OwnedObjectPath>, OwnedObjectPath)> {
        require(is_service(path), path)?;
        Ok(self.backend.unlock(&objects).await?)
    }

    /// `Service.ReadAlias`.
    pub async fn read_alias(
        &self,
        path: &ObjectPath<'_>,
        name: &str,
    ) -> HandlerResult<OwnedObjectPath> {
        require(is_service(path), path)?;
        Ok(self.backend.read_alias(name).await?)
    }

    /// `Service.SetAlias`.
    pub async fn set_alias(
        &self,
        path: &ObjectPath<'_>,
        name: &str,
        collection: &ObjectPath<'_>,
    ) -> HandlerResult<()> {
        require(is_service(path), path)?;
        Ok(self.backend.set_alias(name, collection).await?)
    }

    // ---------------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------------

    /// `Collection.SearchItems`, gated when anything matches.
    pub async fn search_collection(
        &self,
        collection: &ObjectPath<'_>,
        sender: &str,
        attributes: HashMap<String, String>,
    ) -> HandlerResult<Vec<OwnedObjectPath>> {
        require(is_collection(collection), collection)?;
        let results = self.backend.search_collection(collection, &attributes).await?;
        if results.is_empty() {
            return Ok(results);
        }

        let mut context = search_context(&attributes);
        context.insert("collection".to_string(), collection.to_string());
        let input = ApprovalInput::new(
            &self.client_name,
            RequestType::Search,
            SenderInfo::unresolved(sender),
        )
        .with_items(self.item_infos(results.iter()).await)
        .with_extra_context(context);
        self.gate(sender, input).await?;
        Ok(results)
    }

    /// `Collection.CreateItem`.
    pub async fn create_item(
        &self,
        collection: &ObjectPath<'_>,
        sender: &str,
        properties: HashMap<String, OwnedValue>,
        secret: Secret,
        replace: bool,
    ) -> HandlerResult<(OwnedObjectPath, OwnedObjectPath)> {
        require(is_collection(collection), collection)?;
        let remote = secret.session.clone();
        let backend_secret = self.to_backend(secret)?;

        if self.gate_writes {
            let item = ItemInfo {
                path: collection.to_string(),
                label: string_property(&properties, ITEM_LABEL_PROPERTY).unwrap_or_default(),
                attributes: attributes_property(&properties),
            };
            let mut context = BTreeMap::new();
            context.insert("operation".to_string(), "create_item".to_string());
            context.insert("replace".to_string(), replace.to_string());
            let input = ApprovalInput::new(
                &self.client_name,
                RequestType::Write,
                SenderInfo::unresolved(sender),
            )
            .with_items(vec![item])
            .with_session(remote.as_str())
            .with_extra_context(context);
            self.gate(sender, input).await?;
        }

        Ok(self
            .backend
            .create_item(collection, properties, backend_secret, replace)
            .await?)
    }

    // ---------------------------------------------------------------------
    // Item
    // ---------------------------------------------------------------------

    /// `Item.GetSecret`.
    pub async fn get_secret(
        &self,
        item: &ObjectPath<'_>,
        sender: &str,
        session: &ObjectPath<'_>,
    ) -> HandlerResult<Secret> {
        require(is_item(item), item)?;
        let local = self.local_session(session)?;

        let info = self.backend.item_info(item).await;
        let input = ApprovalInput::new(
            &self.client_name,
            RequestType::GetSecret,
            SenderInfo::unresolved(sender),
        )
        .with_items(vec![info])
        .with_session(session.as_str());
        self.gate(sender, input).await?;

        let secret = self.backend.get_secret(item, &local).await?;
        Ok(self.to_client(secret, session))
    }

    /// `Item.SetSecret`.
    pub async fn set_secret(
        &self,
        item: &ObjectPath<'_>,
        sender: &str,
        secret: Secret,
    ) -> HandlerResult<()> {
        require(is_item(item), item)?;
        let remote = secret.session.clone();
        let backend_secret = self.to_backend(secret)?;

        if self.gate_writes {
            let mut context = BTreeMap::new();
            context.insert("operation".to_string(), "set_secret".to_string());
            let input = ApprovalInput::new(
                &self.client_name,
                RequestType::Write,
                SenderInfo::unresolved(sender),
            )
            .with_items(vec![self.backend.item_info(item).await])
            .with_session(remote.as_str())
            .with_extra_context(context);
            self.gate(sender, input).await?;
        }

        Ok(self.backend.set_secret(item, backend_secret).await?)
    }

    /// `Collection.Delete` and `Item.Delete`.
    pub async fn delete(&self, object: &ObjectPath<'_>) -> HandlerResult<OwnedObjectPath> {
        require(is_collection(object) || is_item(object), object)?;
        Ok(self.backend.delete(object).await?)
    }

    // ---------------------------------------------------------------------
    // Session and Prompt
    // ---------------------------------------------------------------------

    /// `Session.Close`.
    pub async fn close_session(&self, session: &ObjectPath<'_>) -> HandlerResult<()> {
        require(is_session(session), session)?;
        if self.sessions.close_session(session).await {
            Ok(())
        } else {
            Err(SecretServiceError::no_such_object(session.as_str()))
        }
    }

    /// `Prompt.Prompt`.
    pub async fn prompt(&self, prompt: &ObjectPath<'_>, window_id: &str) -> HandlerResult<()> {
        require(is_prompt(prompt), prompt)?;
        Ok(self.backend.prompt(prompt, window_id).await?)
    }

    /// `Prompt.Dismiss`.
    pub async fn dismiss(&self, prompt: &ObjectPath<'_>) -> HandlerResult<()> {
        require(is_prompt(prompt), prompt)?;
        Ok(self.backend.dismiss(prompt).await?)
    }

    // ---------------------------------------------------------------------
    // Properties
    // ---------------------------------------------------------------------

    /// `Properties.Get`.
    pub async fn get_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
    ) -> HandlerResult<OwnedValue> {
        require(has_properties(object), object)?;
        Ok(self.backend.get_property(object, interface, name).await?)
    }

    /// `Properties.Set`.
    pub async fn set_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
        value: OwnedValue,
    ) -> HandlerResult<()> {
        require(has_properties(object), object)?;
        Ok(self.backend.set_property(object, interface, name, value).await?)
    }

    /// `Properties.GetAll`.
    pub async fn get_all_properties(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
    ) -> HandlerResult<HashMap<String, OwnedValue>> {
        require(has_properties(object), object)?;
        Ok(self.backend.get_all_properties(object, interface).await?)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn local_session(&self, remote: &ObjectPath<'_>) -> HandlerResult<OwnedObjectPath> {
        self.sessions
            .local_session(remote)
            .ok_or_else(|| SecretServiceError::NoSession(remote.to_string()))
    }

    fn to_backend(&self, secret: Secret) -> HandlerResult<Secret> {
        let local = self.local_session(&secret.session)?;
        Ok(secret.with_session(local))
    }

    fn to_client(&self, secret: Secret, requested: &ObjectPath<'_>) -> Secret {
        let remote = self
            .sessions
            .to_remote(&secret.session)
            .unwrap_or_else(|| requested.to_owned().into());
        secret.with_session(remote)
    }

    async fn item_infos<'a>(
        &self,
        items: impl Iterator<Item = &'a OwnedObjectPath>,
    ) -> Vec<ItemInfo> {
        let mut infos = Vec::new();
        for item in items {
            infos.push(self.backend.item_info(item).await);
        }
        infos
    }

    /// Blocks until `input` is approved. Identity is resolved only when the
    /// gateway is enabled.
    async fn gate(&self, sender: &str, mut input: ApprovalInput) -> HandlerResult<()> {
        let request_type = input.request_type;
        if !self.gateway.is_enabled() {
            return Ok(());
        }

        input.requester = self.resolver.resolve(sender).await;
        let context = self.tracker.context_for_sender(&self.cancel, sender);
        let result = self.gateway.require_approval(context.token(), input).await;
        self.tracker.release(&context);

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                info!(
                    client = %self.client_name,
                    sender = %sender,
                    request_type = %request_type,
                    reason = %e,
                    "request rejected"
                );
                Err(e.into())
            },
        }
    }
}

fn require(ok: bool, path: &ObjectPath<'_>) -> HandlerResult<()> {
    if ok {
        Ok(())
    } else {
        debug!(path = %path, "call on object of the wrong kind");
        Err(SecretServiceError::no_such_object(path.as_str()))
    }
}

fn is_service(path: &ObjectPath<'_>) -> bool {
    path.as_str() == SERVICE_ROOT
}

fn has_properties(path: &ObjectPath<'_>) -> bool {
    is_service(path) || is_collection(path) || is_item(path)
}

fn search_context(attributes: &HashMap<String, String>) -> BTreeMap<String, String> {
    attributes
        .iter()
        .map(|(k, v)| (format!("attribute.{k}"), v.clone()))
        .collect()
}

fn string_property(properties: &HashMap<String, OwnedValue>, name: &str) -> Option<String> {
    properties
        .get(name)
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| String::try_from(v).ok())
}

fn attributes_property(properties: &HashMap<String, OwnedValue>) -> BTreeMap<String, String> {
    properties
        .get(ITEM_ATTRIBUTES_PROPERTY)
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| HashMap::<String, String>::try_from(v).ok())
        .map(|map| map.into_iter().collect())
        .unwrap_or_default()
}
