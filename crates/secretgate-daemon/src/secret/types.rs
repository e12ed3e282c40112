//! Wire types.

use std::fmt;

use serde::{Deserialize, Serialize};
use zvariant::{OwnedObjectPath, Type};

/// A secret value in transit, `(oayays)` on the wire.
///
/// `session` names the session the value is encoded for. With the `plain`
/// algorithm `parameters` is empty and `value` is the cleartext.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct Secret {
    /// Session the secret is encoded for.
    pub session: OwnedObjectPath,
    /// Algorithm-dependent parameters.
    pub parameters: Vec<u8>,
    /// Encoded secret value.
    pub value: Vec<u8>,
    /// MIME type of the value.
    pub content_type: String,
}

impl Secret {
    /// Creates a `plain` secret.
    #[must_use]
    pub fn plain(
        session: OwnedObjectPath,
        value: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            session,
            parameters: Vec::new(),
            value: value.into(),
            content_type: content_type.into(),
        }
    }

    /// Returns the same secret bound to another session.
    #[must_use]
    pub fn with_session(mut self, session: OwnedObjectPath) -> Self {
        self.session = session;
        self
    }
}

// Values never reach logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("session", &self.session.as_str())
            .field("parameters_len", &self.parameters.len())
            .field("value", &"<redacted>")
            .field("content_type", &self.content_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use zvariant::ObjectPath;

    use super::*;

    fn session() -> OwnedObjectPath {
        ObjectPath::try_from("/org/freedesktop/secrets/session/s1")
            .unwrap()
            .into()
    }

    #[test]
    fn test_wire_signature() {
        assert_eq!(Secret::signature().as_str(), "(oayays)");
    }

    #[test]
    fn test_debug_redacts_value() {
        let secret = Secret::plain(session(), b"hunter2".to_vec(), "text/plain");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
        assert!(rendered.contains("/org/freedesktop/secrets/session/s1"));
    }
}
