//! In-process secret store.
//!
//! [`MemoryBackend`] implements [`SecretBackend`] over plain maps. It speaks
//! only the `plain` algorithm, never prompts, and starts with one unlocked
//! collection named `login` aliased as `default`. Integration tests drive the
//! full handler stack against it without a bus daemon.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use secretgate_core::approval::ItemInfo;
use secretgate_core::escape;
use secretgate_core::path::{ALIAS_ROOT, COLLECTION_ROOT, SESSION_ROOT};
use zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use crate::backend::{BackendError, BackendResult, SecretBackend};
use crate::secret::{
    Secret, COLLECTION_INTERFACE, COLLECTION_LABEL_PROPERTY, ITEM_ATTRIBUTES_PROPERTY,
    ITEM_INTERFACE, ITEM_LABEL_PROPERTY, NO_OBJECT, PLAIN_ALGORITHM,
};

/// Name of the collection every new store starts with.
pub const DEFAULT_COLLECTION: &str = "login";

#[derive(Debug, Default)]
struct MemoryItem {
    label: String,
    attributes: HashMap<String, String>,
    value: Vec<u8>,
    content_type: String,
}

#[derive(Debug, Default)]
struct MemoryCollection {
    label: String,
    locked: bool,
    items: BTreeMap<u64, MemoryItem>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: BTreeMap<String, MemoryCollection>,
    aliases: HashMap<String, String>,
    sessions: HashSet<String>,
    next_session: u64,
    next_item: u64,
}

impl MemoryState {
    fn collection_name(&self, path: &str) -> Option<String> {
        if let Some(name) = strip(path, COLLECTION_ROOT) {
            return self.collections.contains_key(name).then(|| name.to_string());
        }
        strip(path, ALIAS_ROOT).and_then(|alias| self.aliases.get(alias).cloned())
    }

    fn collection(&self, path: &str) -> BackendResult<&MemoryCollection> {
        self.collection_name(path)
            .and_then(|name| self.collections.get(&name))
            .ok_or_else(|| BackendError::NoSuchObject(path.to_string()))
    }

    fn collection_mut(&mut self, path: &str) -> BackendResult<&mut MemoryCollection> {
        let name = self
            .collection_name(path)
            .ok_or_else(|| BackendError::NoSuchObject(path.to_string()))?;
        self.collections
            .get_mut(&name)
            .ok_or_else(|| BackendError::NoSuchObject(path.to_string()))
    }

    fn item_key(path: &str) -> Option<(&str, u64)> {
        let rest = strip(path, COLLECTION_ROOT)?;
        let (collection, id) = rest.split_once('/')?;
        Some((collection, id.parse().ok()?))
    }

    fn item(&self, path: &str) -> BackendResult<(&MemoryCollection, &MemoryItem)> {
        let missing = || BackendError::NoSuchObject(path.to_string());
        let (collection, id) = Self::item_key(path).ok_or_else(missing)?;
        let collection = self.collections.get(collection).ok_or_else(missing)?;
        let item = collection.items.get(&id).ok_or_else(missing)?;
        Ok((collection, item))
    }

    fn item_mut(&mut self, path: &str) -> BackendResult<&mut MemoryItem> {
        let missing = || BackendError::NoSuchObject(path.to_string());
        let (collection, id) = Self::item_key(path).ok_or_else(missing)?;
        let collection = self.collections.get_mut(collection).ok_or_else(missing)?;
        if collection.locked {
            return Err(BackendError::Locked(path.to_string()));
        }
        collection.items.get_mut(&id).ok_or_else(missing)
    }

    fn check_session(&self, session: &str) -> BackendResult<()> {
        if self.sessions.contains(session) {
            Ok(())
        } else {
            Err(BackendError::Remote {
                name: "org.freedesktop.Secret.Error.NoSession".to_string(),
                message: format!("no such session: {session}"),
            })
        }
    }

    fn matching_items(&self, attributes: &HashMap<String, String>) -> Vec<(String, bool)> {
        let mut matches = Vec::new();
        for (name, collection) in &self.collections {
            for (id, item) in &collection.items {
                if matches_attributes(item, attributes) {
                    matches.push((item_path(name, *id), collection.locked));
                }
            }
        }
        matches
    }
}

/// In-memory [`SecretBackend`].
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Creates a store with an empty, unlocked `login` collection aliased as
    /// `default`.
    #[must_use]
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        state.collections.insert(
            DEFAULT_COLLECTION.to_string(),
            MemoryCollection {
                label: "Login".to_string(),
                ..MemoryCollection::default()
            },
        );
        state
            .aliases
            .insert("default".to_string(), DEFAULT_COLLECTION.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a text secret in `collection`, returning the item path.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoSuchObject`] if the collection does not
    /// exist.
    pub fn insert_item(
        &self,
        collection: &str,
        label: &str,
        attributes: &[(&str, &str)],
        value: &[u8],
    ) -> BackendResult<OwnedObjectPath> {
        let mut state = self.lock_state();
        state.next_item += 1;
        let id = state.next_item;
        let target = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| BackendError::NoSuchObject(collection.to_string()))?;
        target.items.insert(
            id,
            MemoryItem {
                label: label.to_string(),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                value: value.to_vec(),
                content_type: "text/plain".to_string(),
            },
        );
        object_path(item_path(collection, id))
    }

    /// Locks or unlocks a collection by name.
    pub fn set_locked(&self, collection: &str, locked: bool) {
        if let Some(target) = self.lock_state().collections.get_mut(collection) {
            target.locked = locked;
        }
    }

    /// Number of open backend sessions.
    #[must_use]
    pub fn open_session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    /// Returns the stored value of an item, bypassing sessions.
    #[must_use]
    pub fn stored_value(&self, item: &str) -> Option<Vec<u8>> {
        let state = self.lock_state();
        state.item(item).ok().map(|(_, item)| item.value.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn open_session(
        &self,
        algorithm: &str,
        _input: OwnedValue,
    ) -> BackendResult<(OwnedValue, OwnedObjectPath)> {
        if algorithm != PLAIN_ALGORITHM {
            return Err(BackendError::Invalid(format!(
                "algorithm {algorithm:?} not supported"
            )));
        }
        let mut state = self.lock_state();
        state.next_session += 1;
        let path = format!("{SESSION_ROOT}/{}", state.next_session);
        state.sessions.insert(path.clone());
        Ok((owned(Value::from(""))?, object_path(path)?))
    }

    async fn close_session(&self, session: &ObjectPath<'_>) -> BackendResult<()> {
        if self.lock_state().sessions.remove(session.as_str()) {
            Ok(())
        } else {
            Err(BackendError::NoSuchObject(session.to_string()))
        }
    }

    async fn search_items(
        &self,
        attributes: &HashMap<String, String>,
    ) -> BackendResult<(Vec<OwnedObjectPath>, Vec<OwnedObjectPath>)> {
        let matches = self.lock_state().matching_items(attributes);
        let mut unlocked = Vec::new();
        let mut locked = Vec::new();
        for (path, is_locked) in matches {
            if is_locked {
                locked.push(object_path(path)?);
            } else {
                unlocked.push(object_path(path)?);
            }
        }
        Ok((unlocked, locked))
    }

    async fn search_collection(
        &self,
        collection: &ObjectPath<'_>,
        attributes: &HashMap<String, String>,
    ) -> BackendResult<Vec<OwnedObjectPath>> {
        let state = self.lock_state();
        let name = state
            .collection_name(collection.as_str())
            .ok_or_else(|| BackendError::NoSuchObject(collection.to_string()))?;
        let target = state.collection(collection.as_str())?;
        target
            .items
            .iter()
            .filter(|(_, item)| matches_attributes(item, attributes))
            .map(|(id, _)| object_path(item_path(&name, *id)))
            .collect()
    }

    async fn get_secrets(
        &self,
        items: &[OwnedObjectPath],
        session: &ObjectPath<'_>,
    ) -> BackendResult<HashMap<OwnedObjectPath, Secret>> {
        let state = self.lock_state();
        state.check_session(session.as_str())?;
        let mut secrets = HashMap::new();
        for path in items {
            // Locked and unknown items are omitted.
            if let Ok((collection, item)) = state.item(path.as_str()) {
                if !collection.locked {
                    secrets.insert(path.clone(), secret_for(session, item));
                }
            }
        }
        Ok(secrets)
    }

    async fn get_secret(
        &self,
        item: &ObjectPath<'_>,
        session: &ObjectPath<'_>,
    ) -> BackendResult<Secret> {
        let state = self.lock_state();
        state.check_session(session.as_str())?;
        let (collection, stored) = state.item(item.as_str())?;
        if collection.locked {
            return Err(BackendError::Locked(item.to_string()));
        }
        Ok(secret_for(session, stored))
    }

    async fn set_secret(&self, item: &ObjectPath<'_>, secret: Secret) -> BackendResult<()> {
        let mut state = self.lock_state();
        state.check_session(secret.session.as_str())?;
        let stored = state.item_mut(item.as_str())?;
        stored.value = secret.value;
        stored.content_type = secret.content_type;
        Ok(())
    }

    async fn create_item(
        &self,
        collection: &ObjectPath<'_>,
        mut properties: HashMap<String, OwnedValue>,
        secret: Secret,
        replace: bool,
    ) -> BackendResult<(OwnedObjectPath, OwnedObjectPath)> {
        let label = properties
            .remove(ITEM_LABEL_PROPERTY)
            .and_then(|v| String::try_from(v).ok())
            .unwrap_or_default();
        let attributes = properties
            .remove(ITEM_ATTRIBUTES_PROPERTY)
            .and_then(|v| HashMap::<String, String>::try_from(v).ok())
            .unwrap_or_default();

        let mut state = self.lock_state();
        state.check_session(secret.session.as_str())?;
        let name = state
            .collection_name(collection.as_str())
            .ok_or_else(|| BackendError::NoSuchObject(collection.to_string()))?;
        state.next_item += 1;
        let fresh_id = state.next_item;
        let target = state.collection_mut(collection.as_str())?;
        if target.locked {
            return Err(BackendError::Locked(collection.to_string()));
        }

        let existing = replace
            .then(|| {
                target
                    .items
                    .iter()
                    .find(|(_, item)| item.attributes == attributes)
                    .map(|(id, _)| *id)
            })
            .flatten();
        let id = existing.unwrap_or(fresh_id);
        target.items.insert(
            id,
            MemoryItem {
                label,
                attributes,
                value: secret.value,
                content_type: secret.content_type,
            },
        );
        Ok((object_path(item_path(&name, id))?, object_path(NO_OBJECT.to_string())?))
    }

    async fn create_collection(
        &self,
        mut properties: HashMap<String, OwnedValue>,
        alias: &str,
    ) -> BackendResult<(OwnedObjectPath, OwnedObjectPath)> {
        let label = properties
            .remove(COLLECTION_LABEL_PROPERTY)
            .and_then(|v| String::try_from(v).ok())
            .unwrap_or_default();
        let mut state = self.lock_state();
        if let Some(existing) = state.aliases.get(alias).filter(|_| !alias.is_empty()) {
            let path = format!("{COLLECTION_ROOT}/{existing}");
            return Ok((object_path(path)?, object_path(NO_OBJECT.to_string())?));
        }

        let mut name = escape::encode(label.to_lowercase().as_bytes());
        if name.is_empty() || state.collections.contains_key(&name) {
            name = format!("collection{}", state.collections.len() + 1);
        }
        state.collections.insert(
            name.clone(),
            MemoryCollection {
                label,
                ..MemoryCollection::default()
            },
        );
        if !alias.is_empty() {
            state.aliases.insert(alias.to_string(), name.clone());
        }
        Ok((
            object_path(format!("{COLLECTION_ROOT}/{name}"))?,
            object_path(NO_OBJECT.to_string())?,
        ))
    }

    async fn delete(&self, object: &ObjectPath<'_>) -> BackendResult<OwnedObjectPath> {
        let mut state = self.lock_state();
        let path = object.as_str();
        if let Some((collection, id)) = MemoryState::item_key(path) {
            let collection = collection.to_string();
            let removed = state
                .collections
                .get_mut(&collection)
                .and_then(|c| c.items.remove(&id));
            if removed.is_none() {
                return Err(BackendError::NoSuchObject(path.to_string()));
            }
        } else {
            let name = state
                .collection_name(path)
                .ok_or_else(|| BackendError::NoSuchObject(path.to_string()))?;
            state.collections.remove(&name);
            state.aliases.retain(|_, target| *target != name);
        }
        object_path(NO_OBJECT.to_string())
    }

    async fn lock(
        &self,
        objects: &[OwnedObjectPath],
    ) -> BackendResult<(Vec<OwnedObjectPath>, OwnedObjectPath)> {
        self.set_lock_state(objects, true)
    }

    async fn unlock(
        &self,
        objects: &[OwnedObjectPath],
    ) -> BackendResult<(Vec<OwnedObjectPath>, OwnedObjectPath)> {
        self.set_lock_state(objects, false)
    }

    async fn read_alias(&self, name: &str) -> BackendResult<OwnedObjectPath> {
        let state = self.lock_state();
        let path = state.aliases.get(name).map_or_else(
            || NO_OBJECT.to_string(),
            |collection| format!("{COLLECTION_ROOT}/{collection}"),
        );
        object_path(path)
    }

    async fn set_alias(&self, name: &str, collection: &ObjectPath<'_>) -> BackendResult<()> {
        let mut state = self.lock_state();
        if collection.as_str() == NO_OBJECT {
            state.aliases.remove(name);
            return Ok(());
        }
        let target = state
            .collection_name(collection.as_str())
            .ok_or_else(|| BackendError::NoSuchObject(collection.to_string()))?;
        state.aliases.insert(name.to_string(), target);
        Ok(())
    }

    async fn prompt(&self, prompt: &ObjectPath<'_>, _window_id: &str) -> BackendResult<()> {
        Err(BackendError::NoSuchObject(prompt.to_string()))
    }

    async fn dismiss(&self, prompt: &ObjectPath<'_>) -> BackendResult<()> {
        Err(BackendError::NoSuchObject(prompt.to_string()))
    }

    async fn get_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
    ) -> BackendResult<OwnedValue> {
        self.get_all_properties(object, interface)
            .await?
            .remove(name)
            .ok_or_else(|| BackendError::Invalid(format!("unknown property {interface}.{name}")))
    }

    async fn set_property(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
        name: &str,
        value: OwnedValue,
    ) -> BackendResult<()> {
        let mut state = self.lock_state();
        let path = object.as_str();
        match (interface, name) {
            (ITEM_INTERFACE, "Label") => {
                state.item_mut(path)?.label = into_string(value)?;
            },
            (ITEM_INTERFACE, "Attributes") => {
                state.item_mut(path)?.attributes = HashMap::<String, String>::try_from(value)
                    .map_err(|e| BackendError::Invalid(e.to_string()))?;
            },
            (COLLECTION_INTERFACE, "Label") => {
                state.collection_mut(path)?.label = into_string(value)?;
            },
            _ => {
                return Err(BackendError::Invalid(format!(
                    "property {interface}.{name} is read-only"
                )));
            },
        }
        Ok(())
    }

    async fn get_all_properties(
        &self,
        object: &ObjectPath<'_>,
        interface: &str,
    ) -> BackendResult<HashMap<String, OwnedValue>> {
        let state = self.lock_state();
        let path = object.as_str();
        let mut properties = HashMap::new();
        match interface {
            ITEM_INTERFACE => {
                let (collection, item) = state.item(path)?;
                properties.insert("Label".to_string(), owned(Value::from(item.label.as_str()))?);
                properties.insert(
                    "Attributes".to_string(),
                    owned(Value::from(item.attributes.clone()))?,
                );
                properties.insert("Locked".to_string(), owned(Value::from(collection.locked))?);
            },
            COLLECTION_INTERFACE => {
                let name = state
                    .collection_name(path)
                    .ok_or_else(|| BackendError::NoSuchObject(path.to_string()))?;
                let collection = state.collection(path)?;
                let items = collection
                    .items
                    .keys()
                    .map(|id| ObjectPath::try_from(item_path(&name, *id)))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| BackendError::Reply(e.to_string()))?;
                properties.insert(
                    "Label".to_string(),
                    owned(Value::from(collection.label.as_str()))?,
                );
                properties.insert("Locked".to_string(), owned(Value::from(collection.locked))?);
                properties.insert("Items".to_string(), owned(Value::from(items))?);
            },
            other => {
                return Err(BackendError::Invalid(format!(
                    "no properties for interface {other}"
                )));
            },
        }
        Ok(properties)
    }

    async fn item_info(&self, item: &ObjectPath<'_>) -> ItemInfo {
        let state = self.lock_state();
        state.item(item.as_str()).map_or_else(
            |_| ItemInfo::unlabelled(item.as_str()),
            |(_, stored)| ItemInfo {
                path: item.to_string(),
                label: stored.label.clone(),
                attributes: stored.attributes.clone().into_iter().collect(),
            },
        )
    }
}

impl MemoryBackend {
    fn set_lock_state(
        &self,
        objects: &[OwnedObjectPath],
        locked: bool,
    ) -> BackendResult<(Vec<OwnedObjectPath>, OwnedObjectPath)> {
        let mut state = self.lock_state();
        let mut changed = Vec::new();
        for object in objects {
            let path = object.as_str();
            let collection_path = match MemoryState::item_key(path) {
                Some((collection, _)) => format!("{COLLECTION_ROOT}/{collection}"),
                None => path.to_string(),
            };
            if let Ok(collection) = state.collection_mut(&collection_path) {
                collection.locked = locked;
                changed.push(object.clone());
            }
        }
        Ok((changed, object_path(NO_OBJECT.to_string())?))
    }
}

fn strip<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    (!rest.is_empty()).then_some(rest)
}

fn item_path(collection: &str, id: u64) -> String {
    format!("{COLLECTION_ROOT}/{collection}/{id}")
}

fn matches_attributes(item: &MemoryItem, wanted: &HashMap<String, String>) -> bool {
    wanted
        .iter()
        .all(|(k, v)| item.attributes.get(k).is_some_and(|have| have == v))
}

fn secret_for(session: &ObjectPath<'_>, item: &MemoryItem) -> Secret {
    Secret::plain(
        session.to_owned().into(),
        item.value.clone(),
        item.content_type.clone(),
    )
}

fn object_path(path: String) -> BackendResult<OwnedObjectPath> {
    OwnedObjectPath::try_from(path).map_err(|e| BackendError::Reply(e.to_string()))
}

fn owned(value: Value<'_>) -> BackendResult<OwnedValue> {
    value
        .try_to_owned()
        .map_err(|e| BackendError::Reply(e.to_string()))
}

fn into_string(value: OwnedValue) -> BackendResult<String> {
    String::try_from(value).map_err(|e| BackendError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ObjectPath<'_> {
        ObjectPath::try_from(s).unwrap()
    }

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    async fn session(backend: &MemoryBackend) -> OwnedObjectPath {
        let input = Value::from("").try_to_owned().unwrap();
        backend.open_session("plain", input).await.unwrap().1
    }

    #[tokio::test]
    async fn test_search_and_get() {
        let backend = MemoryBackend::new();
        let item = backend
            .insert_item("login", "token", &[("service", "github")], b"ghp_123")
            .unwrap();
        backend
            .insert_item("login", "other", &[("service", "gitlab")], b"glpat")
            .unwrap();
        let session = session(&backend).await;

        let (unlocked, locked) = backend
            .search_items(&attrs(&[("service", "github")]))
            .await
            .unwrap();
        assert_eq!(unlocked, vec![item.clone()]);
        assert!(locked.is_empty());

        let secret = backend.get_secret(&item, &session).await.unwrap();
        assert_eq!(secret.value, b"ghp_123");
        assert_eq!(secret.session, session);
    }

    #[tokio::test]
    async fn test_alias_resolves_to_login() {
        let backend = MemoryBackend::new();
        let item = backend.insert_item("login", "x", &[("a", "b")], b"v").unwrap();
        let found = backend
            .search_collection(
                &path("/org/freedesktop/secrets/aliases/default"),
                &attrs(&[("a", "b")]),
            )
            .await
            .unwrap();
        assert_eq!(found, vec![item]);

        let alias = backend.read_alias("default").await.unwrap();
        assert_eq!(alias.as_str(), "/org/freedesktop/secrets/collection/login");
    }

    #[tokio::test]
    async fn test_locked_collection_hides_secrets() {
        let backend = MemoryBackend::new();
        let item = backend.insert_item("login", "x", &[("a", "b")], b"v").unwrap();
        let session = session(&backend).await;
        backend.set_locked("login", true);

        let (unlocked, locked) = backend.search_items(&attrs(&[("a", "b")])).await.unwrap();
        assert!(unlocked.is_empty());
        assert_eq!(locked.len(), 1);
        assert!(backend.get_secrets(&[item.clone()], &session).await.unwrap().is_empty());
        assert!(matches!(
            backend.get_secret(&item, &session).await,
            Err(BackendError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let backend = MemoryBackend::new();
        let item = backend.insert_item("login", "x", &[], b"v").unwrap();
        let err = backend
            .get_secret(&item, &path("/org/freedesktop/secrets/session/99"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Remote { name, .. } if name.ends_with("NoSession")));
    }

    #[tokio::test]
    async fn test_create_item_replace() {
        let backend = MemoryBackend::new();
        let session = session(&backend).await;
        let collection = path("/org/freedesktop/secrets/collection/login");
        let properties = || {
            let mut props = HashMap::new();
            props.insert(
                ITEM_ATTRIBUTES_PROPERTY.to_string(),
                Value::from(attrs(&[("k", "v")])).try_to_owned().unwrap(),
            );
            props
        };

        let (first, _) = backend
            .create_item(
                &collection,
                properties(),
                Secret::plain(session.clone(), b"1".to_vec(), "text/plain"),
                false,
            )
            .await
            .unwrap();
        let (second, _) = backend
            .create_item(
                &collection,
                properties(),
                Secret::plain(session.clone(), b"2".to_vec(), "text/plain"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.stored_value(first.as_str()), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_item_info_and_properties() {
        let backend = MemoryBackend::new();
        let item = backend
            .insert_item("login", "GitHub token", &[("service", "github")], b"v")
            .unwrap();
        let info = backend.item_info(&item).await;
        assert_eq!(info.label, "GitHub token");
        assert_eq!(info.attributes.get("service").map(String::as_str), Some("github"));

        let label = backend.get_property(&item, ITEM_INTERFACE, "Label").await.unwrap();
        assert_eq!(String::try_from(label).unwrap(), "GitHub token");
    }

    #[tokio::test]
    async fn test_close_session() {
        let backend = MemoryBackend::new();
        let session = session(&backend).await;
        assert_eq!(backend.open_session_count(), 1);
        backend.close_session(&session).await.unwrap();
        assert_eq!(backend.open_session_count(), 0);
        assert!(backend.close_session(&session).await.is_err());
    }
}
