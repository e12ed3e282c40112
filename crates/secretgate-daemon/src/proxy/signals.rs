//! Backend signal forwarding.
//!
//! Secret Service and property-change signals raised by the backend under
//! `/org/freedesktop/secrets` are re-emitted on the front connection with
//! path, interface, member and body unchanged. Bus plumbing is dropped.

use futures::StreamExt;
use secretgate_core::path::SERVICE_ROOT;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use zbus::message::Type as MessageType;
use zbus::names::BusName;
use zbus::{Connection, MatchRule, Message, MessageStream};
use zvariant::Structure;

use crate::secret::{PROPERTIES_INTERFACE, SECRET_INTERFACE_PREFIX};

/// Returns `true` if signals on `interface` are relayed to clients.
#[must_use]
pub fn should_forward(interface: &str) -> bool {
    interface.starts_with(SECRET_INTERFACE_PREFIX) || interface == PROPERTIES_INTERFACE
}

/// Relays backend signals until `cancel` fires or the backend stream ends.
///
/// # Errors
///
/// Fails if the match rule cannot be installed on the backend connection.
pub async fn forward_signals(
    backend: Connection,
    front: Connection,
    cancel: CancellationToken,
) -> zbus::Result<()> {
    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .path_namespace(SERVICE_ROOT)?
        .build();
    let mut stream = MessageStream::for_match_rule(rule, &backend, None).await?;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = stream.next() => {
                match next {
                    None => {
                        debug!("backend signal stream ended");
                        return Ok(());
                    },
                    Some(Err(e)) => warn!(error = %e, "malformed backend signal"),
                    Some(Ok(message)) => relay(&front, &message).await,
                }
            }
        }
    }
}

async fn relay(front: &Connection, message: &Message) {
    let header = message.header();
    let (Some(path), Some(interface), Some(member)) =
        (header.path(), header.interface(), header.member())
    else {
        return;
    };
    if !should_forward(interface.as_str()) {
        trace!(interface = %interface, member = %member, "dropping signal");
        return;
    }

    let empty = header.signature().map_or(true, |s| s.as_str().is_empty());
    let result = if empty {
        front
            .emit_signal(
                None::<BusName<'_>>,
                path.as_str(),
                interface.as_str(),
                member.as_str(),
                &(),
            )
            .await
    } else {
        let body = message.body();
        let structure: Structure<'_> = match body.deserialize() {
            Ok(structure) => structure,
            Err(e) => {
                warn!(member = %member, error = %e, "undecodable signal body");
                return;
            },
        };
        front
            .emit_signal(
                None::<BusName<'_>>,
                path.as_str(),
                interface.as_str(),
                member.as_str(),
                &structure,
            )
            .await
    };

    match result {
        Ok(()) => trace!(path = %path, member = %member, "signal forwarded"),
        Err(e) => warn!(path = %path, member = %member, error = %e, "failed to forward signal"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use zvariant::{ObjectPath, OwnedObjectPath};

    use super::*;
    use crate::proxy::test_support::p2p_pair;

    const LOGIN: &str = "/org/freedesktop/secrets/collection/login";
    const ITEM: &str = "/org/freedesktop/secrets/collection/login/7";

    async fn next_signal(stream: &mut MessageStream) -> Message {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = stream.next().await.unwrap().unwrap();
                if message.message_type() == MessageType::Signal {
                    return message;
                }
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_forwarding_filter() {
        assert!(should_forward("org.freedesktop.Secret.Collection"));
        assert!(should_forward("org.freedesktop.Secret.Prompt"));
        assert!(should_forward("org.freedesktop.DBus.Properties"));
        assert!(!should_forward("org.freedesktop.DBus"));
        assert!(!should_forward("org.freedesktop.DBus.Introspectable"));
        assert!(!should_forward("org.freedesktop.SecretX"));
        assert!(!should_forward("org.gnome.keyring.InternalUnsupportedGuiltRiddenInterface"));
    }

    #[tokio::test]
    async fn test_relay_reemits_secret_signals_on_front() {
        let (front, client) = p2p_pair().await;
        let mut received = MessageStream::from(&client);

        let noise = Message::signal("/org/freedesktop/DBus", "org.freedesktop.DBus", "NameLost")
            .unwrap()
            .build(&(":1.9",))
            .unwrap();
        relay(&front, &noise).await;

        let item = ObjectPath::try_from(ITEM).unwrap();
        let created = Message::signal(LOGIN, "org.freedesktop.Secret.Collection", "ItemCreated")
            .unwrap()
            .build(&(item,))
            .unwrap();
        relay(&front, &created).await;

        let reset = Message::signal(SERVICE_ROOT, "org.freedesktop.Secret.Service", "Reset")
            .unwrap()
            .build(&())
            .unwrap();
        relay(&front, &reset).await;

        let first = next_signal(&mut received).await;
        let header = first.header();
        assert_eq!(header.path().unwrap().as_str(), LOGIN);
        assert_eq!(
            header.interface().unwrap().as_str(),
            "org.freedesktop.Secret.Collection"
        );
        assert_eq!(header.member().unwrap().as_str(), "ItemCreated");
        let path: OwnedObjectPath = first.body().deserialize().unwrap();
        assert_eq!(path.as_str(), ITEM);

        let second = next_signal(&mut received).await;
        assert_eq!(second.header().member().unwrap().as_str(), "Reset");
        assert!(second
            .body()
            .signature()
            .map_or(true, |s| s.as_str().is_empty()));
    }
}
