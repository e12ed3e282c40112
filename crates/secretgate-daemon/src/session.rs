//! Session remapping.
//!
//! Clients never see backend session paths. Each proxy hands out its own
//! session paths (`/org/freedesktop/secrets/session/s<N>`) and keeps a table
//! from those to the backend's:
//!
//! ```text
//!  client                 proxy                        backend
//!  ------                 -----                        -------
//!  OpenSession("plain") ─► create_session ─ OpenSession ─► /session/7
//!                          s1 -> /session/7
//!  GetSecret(s1) ───────► local_session(s1) = /session/7 ─► GetSecret(/session/7)
//!  Secret{session=s1} ◄── to_remote(/session/7) = s1 ◄────── Secret{session=/session/7}
//! ```
//!
//! # Invariants
//!
//! - Only the `plain` algorithm is ever mapped. Anything else is
//!   rejected before the backend is contacted.
//! - Remote ids come from a monotonic counter and are never
//!   reused within one remapper.
//! - `close_all` always leaves the table empty, whatever the
//!   backend does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use secretgate_core::path::SESSION_ROOT;
use tracing::{debug, warn};
use zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};

use crate::backend::SecretBackend;
use crate::secret::{SecretServiceError, PLAIN_ALGORITHM};

/// Maps client-visible session paths to backend session paths.
pub struct SessionRemapper {
    backend: Arc<dyn SecretBackend>,
    sessions: RwLock<HashMap<String, OwnedObjectPath>>,
    next_id: AtomicU64,
}

impl SessionRemapper {
    /// Creates an empty remapper over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a backend session and returns `(output, remote_id)`.
    ///
    /// # Errors
    ///
    /// - [`SecretServiceError::NotSupported`] for any algorithm but `plain`.
    /// - [`SecretServiceError::Failed`] if the backend refuses.
    pub async fn create_session(
        &self,
        algorithm: &str,
        input: OwnedValue,
    ) -> Result<(OwnedValue, OwnedObjectPath), SecretServiceError> {
        if algorithm != PLAIN_ALGORITHM {
            return Err(SecretServiceError::NotSupported(format!(
                "algorithm {algorithm:?} is not supported, use \"plain\""
            )));
        }

        let (output, backend_id) = self.backend.open_session(algorithm, input).await?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let remote_id = OwnedObjectPath::try_from(format!("{SESSION_ROOT}/s{n}"))
            .map_err(|e| SecretServiceError::Failed(e.to_string()))?;

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote_id.to_string(), backend_id.clone());
        debug!(remote = %remote_id.as_str(), backend = %backend_id.as_str(), "session opened");
        Ok((output, remote_id))
    }

    /// Returns the backend session for a client-visible session.
    #[must_use]
    pub fn local_session(&self, remote_id: &ObjectPath<'_>) -> Option<OwnedObjectPath> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote_id.as_str())
            .cloned()
    }

    /// Returns the client-visible session for a backend session.
    #[must_use]
    pub fn to_remote(&self, backend_id: &ObjectPath<'_>) -> Option<OwnedObjectPath> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, local)| local.as_str() == backend_id.as_str())
            .and_then(|(remote, _)| OwnedObjectPath::try_from(remote.clone()).ok())
    }

    /// Removes one mapping and closes the backend session.
    ///
    /// Returns `false` if `remote_id` was not mapped. Backend failures are
    /// logged and otherwise ignored.
    pub async fn close_session(&self, remote_id: &ObjectPath<'_>) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(remote_id.as_str());
        let Some(backend_id) = removed else {
            return false;
        };
        if let Err(e) = self.backend.close_session(&backend_id).await {
            warn!(session = %backend_id.as_str(), error = %e, "failed to close backend session");
        }
        true
    }

    /// Clears the table and closes every backend session.
    pub async fn close_all(&self) {
        let drained: Vec<OwnedObjectPath> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            sessions.drain().map(|(_, backend_id)| backend_id).collect()
        };
        for backend_id in drained {
            if let Err(e) = self.backend.close_session(&backend_id).await {
                warn!(
                    session = %backend_id.as_str(),
                    error = %e,
                    "failed to close backend session"
                );
            }
        }
    }

    /// Number of mapped sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no sessions are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use zvariant::Value;

    use super::*;
    use crate::memory::MemoryBackend;

    fn empty_input() -> OwnedValue {
        Value::from("").try_to_owned().unwrap()
    }

    fn remapper() -> (Arc<MemoryBackend>, SessionRemapper) {
        let backend = Arc::new(MemoryBackend::new());
        let remapper = SessionRemapper::new(backend.clone());
        (backend, remapper)
    }

    #[tokio::test]
    async fn test_plain_sessions_get_fresh_ids() {
        let (_, remapper) = remapper();
        let (_, first) = remapper.create_session("plain", empty_input()).await.unwrap();
        let (_, second) = remapper.create_session("plain", empty_input()).await.unwrap();

        assert_eq!(first.as_str(), "/org/freedesktop/secrets/session/s1");
        assert_eq!(second.as_str(), "/org/freedesktop/secrets/session/s2");
        assert!(remapper.local_session(&first).is_some());

        assert!(remapper.close_session(&first).await);
        let (_, third) = remapper.create_session("plain", empty_input()).await.unwrap();
        assert_eq!(third.as_str(), "/org/freedesktop/secrets/session/s3");
    }

    #[tokio::test]
    async fn test_other_algorithms_rejected_without_mapping() {
        let (backend, remapper) = remapper();
        let err = remapper
            .create_session("dh-ietf1024-sha256-aes128-cbc-pkcs7", empty_input())
            .await
            .unwrap_err();

        assert!(matches!(err, SecretServiceError::NotSupported(_)));
        assert!(remapper.is_empty());
        assert_eq!(backend.open_session_count(), 0);
    }

    #[tokio::test]
    async fn test_reverse_lookup() {
        let (_, remapper) = remapper();
        let (_, remote) = remapper.create_session("plain", empty_input()).await.unwrap();
        let local = remapper.local_session(&remote).unwrap();

        assert_ne!(local, remote);
        assert_eq!(remapper.to_remote(&local), Some(remote));
        assert_eq!(
            remapper.to_remote(
                &ObjectPath::try_from("/org/freedesktop/secrets/session/404").unwrap()
            ),
            None
        );
    }

    #[tokio::test]
    async fn test_close_all_clears_table_and_backend() {
        let (backend, remapper) = remapper();
        for _ in 0..3 {
            remapper.create_session("plain", empty_input()).await.unwrap();
        }
        assert_eq!(backend.open_session_count(), 3);

        remapper.close_all().await;
        assert!(remapper.is_empty());
        assert_eq!(backend.open_session_count(), 0);

        // Backend failures do not stop the sweep.
        remapper.close_all().await;
        assert!(remapper.is_empty());
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let (_, remapper) = remapper();
        let unknown = ObjectPath::try_from("/org/freedesktop/secrets/session/s9").unwrap();
        assert!(!remapper.close_session(&unknown).await);
    }
}
