//! Errors returned to Secret Service clients.
//!
//! Every failure a handler can produce is mapped onto one of the error names
//! below before it crosses the bus. Clients branch on the name; the message
//! is informational.
//!
//! # Security Considerations
//!
//! Approval outcomes (denied, timed out, cancelled) all become
//! [`SecretServiceError::AccessDenied`] with a fixed message, so a client
//! cannot tell a human refusal from a timeout or read the deny reason.

use thiserror::Error;

use crate::backend::BackendError;
use crate::gateway::ApprovalError;

/// Message sent with every approval rejection.
pub const ACCESS_DENIED_MESSAGE: &str = "access denied";

/// An error reply on the Secret Service interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretServiceError {
    /// The object is locked.
    #[error("object is locked: {0}")]
    IsLocked(String),

    /// The session does not exist.
    #[error("no such session: {0}")]
    NoSession(String),

    /// The object does not exist.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The object already exists.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// The requested algorithm or operation is not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The call body has the wrong signature.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The call arguments are invalid.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The member is not implemented on this object.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Generic failure, typically a backend error.
    #[error("{0}")]
    Failed(String),

    /// The request was not approved.
    #[error("{0}")]
    AccessDenied(String),
}

impl SecretServiceError {
    /// Returns the D-Bus error name.
    #[must_use]
    pub const fn dbus_name(&self) -> &'static str {
        match self {
            Self::IsLocked(_) => "org.freedesktop.Secret.Error.IsLocked",
            Self::NoSession(_) => "org.freedesktop.Secret.Error.NoSession",
            Self::NoSuchObject(_) => "org.freedesktop.Secret.Error.NoSuchObject",
            Self::AlreadyExists(_) => "org.freedesktop.Secret.Error.AlreadyExists",
            Self::NotSupported(_) => "org.freedesktop.DBus.Error.NotSupported",
            Self::InvalidSignature(_) => "org.freedesktop.DBus.Error.InvalidSignature",
            Self::InvalidArgs(_) => "org.freedesktop.DBus.Error.InvalidArgs",
            Self::UnknownMethod(_) => "org.freedesktop.DBus.Error.UnknownMethod",
            Self::Failed(_) => "org.freedesktop.DBus.Error.Failed",
            Self::AccessDenied(_) => "org.freedesktop.DBus.Error.AccessDenied",
        }
    }

    /// Returns the human-readable message sent with the error.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// The single rejection error used for every approval outcome.
    #[must_use]
    pub fn access_denied() -> Self {
        Self::AccessDenied(ACCESS_DENIED_MESSAGE.to_string())
    }

    /// `NoSuchObject` for `path`.
    #[must_use]
    pub fn no_such_object(path: impl Into<String>) -> Self {
        Self::NoSuchObject(path.into())
    }
}

impl From<BackendError> for SecretServiceError {
    fn from(error: BackendError) -> Self {
        Self::Failed(error.to_string())
    }
}

impl From<ApprovalError> for SecretServiceError {
    fn from(_: ApprovalError) -> Self {
        Self::access_denied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        let cases = [
            (
                SecretServiceError::NoSession("x".into()),
                "org.freedesktop.Secret.Error.NoSession",
            ),
            (
                SecretServiceError::NotSupported("x".into()),
                "org.freedesktop.DBus.Error.NotSupported",
            ),
            (
                SecretServiceError::access_denied(),
                "org.freedesktop.DBus.Error.AccessDenied",
            ),
        ];
        for (error, name) in cases {
            assert_eq!(error.dbus_name(), name);
        }
    }

    #[test]
    fn test_backend_error_text_is_preserved() {
        let error: SecretServiceError = BackendError::Remote {
            name: "org.freedesktop.Secret.Error.IsLocked".to_string(),
            message: "collection is locked".to_string(),
        }
        .into();
        assert_eq!(error.dbus_name(), "org.freedesktop.DBus.Error.Failed");
        assert!(error.message().contains("collection is locked"));
    }

    #[test]
    fn test_approval_reason_is_not_leaked() {
        let error: SecretServiceError = ApprovalError::Denied {
            reason: Some("suspicious process".to_string()),
        }
        .into();
        assert_eq!(error, SecretServiceError::access_denied());
        assert!(!error.message().contains("suspicious"));

        assert_eq!(
            SecretServiceError::from(ApprovalError::TimedOut),
            SecretServiceError::from(ApprovalError::Cancelled)
        );
    }
}
