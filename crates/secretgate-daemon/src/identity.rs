//! Requester identity resolution.
//!
//! Turns a bus unique name (or a local socket peer) into a [`SenderInfo`]
//! an approver can recognise:
//!
//! ```text
//!  ":1.42" ──► GetConnectionUnixProcessID ──► pid 4711
//!          ──► GetConnectionUnixUser      ──► uid 1000
//!  pid 4711 ─► /proc chain [bash, claude, ...] ─► BusSenderStrategy ─► claude
//!           └► (empty chain) GetUnitByPID ─► ".../unit/ssh_2eservice" ─► ssh.service
//! ```
//!
//! Resolution never fails. Every lookup that errors is logged at debug and
//! leaves its field zero or empty.

use std::sync::Arc;

use async_trait::async_trait;
use secretgate_core::escape::decode_unit_path;
use secretgate_core::process::{read_process_chain, BusSenderStrategy};
use secretgate_core::{InvokerStrategy, ProcessSource, SenderInfo};
use tracing::debug;
use zbus::names::BusName;
use zbus::Connection;
use zvariant::OwnedObjectPath;

use crate::protocol::credentials::PeerCredentials;

const SYSTEMD_BUS_NAME: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";

/// Bus-side lookups needed to identify a sender.
#[async_trait]
pub trait BusIntrospector: Send + Sync {
    /// PID owning the connection `sender`.
    async fn connection_pid(&self, sender: &str) -> zbus::Result<u32>;

    /// UID owning the connection `sender`.
    async fn connection_uid(&self, sender: &str) -> zbus::Result<u32>;

    /// systemd unit object path for `pid`.
    async fn unit_by_pid(&self, pid: u32) -> zbus::Result<String>;
}

/// [`BusIntrospector`] over a live bus connection.
///
/// Sender lookups go to the bus daemon of `connection`; unit lookups go to
/// systemd on the same bus.
#[derive(Debug, Clone)]
pub struct DbusIntrospector {
    connection: Connection,
}

impl DbusIntrospector {
    /// Creates an introspector over `connection`.
    #[must_use]
    pub const fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl BusIntrospector for DbusIntrospector {
    async fn connection_pid(&self, sender: &str) -> zbus::Result<u32> {
        let dbus = zbus::fdo::DBusProxy::new(&self.connection).await?;
        let name = BusName::try_from(sender)?;
        Ok(dbus.get_connection_unix_process_id(name).await?)
    }

    async fn connection_uid(&self, sender: &str) -> zbus::Result<u32> {
        let dbus = zbus::fdo::DBusProxy::new(&self.connection).await?;
        let name = BusName::try_from(sender)?;
        Ok(dbus.get_connection_unix_user(name).await?)
    }

    async fn unit_by_pid(&self, pid: u32) -> zbus::Result<String> {
        let reply = self
            .connection
            .call_method(
                Some(SYSTEMD_BUS_NAME),
                SYSTEMD_PATH,
                Some(SYSTEMD_MANAGER_INTERFACE),
                "GetUnitByPID",
                &(pid,),
            )
            .await?;
        let (unit,): (OwnedObjectPath,) = reply.body().deserialize()?;
        Ok(unit.as_str().to_string())
    }
}

/// Resolves bus senders to [`SenderInfo`].
pub struct SenderResolver {
    introspector: Arc<dyn BusIntrospector>,
    source: Arc<dyn ProcessSource>,
}

impl SenderResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(introspector: Arc<dyn BusIntrospector>, source: Arc<dyn ProcessSource>) -> Self {
        Self {
            introspector,
            source,
        }
    }

    /// Resolves `sender` on a best-effort basis.
    pub async fn resolve(&self, sender: &str) -> SenderInfo {
        let mut info = SenderInfo::unresolved(sender);

        match self.introspector.connection_pid(sender).await {
            Ok(pid) => info.pid = pid,
            Err(e) => debug!(sender = %sender, error = %e, "sender pid unavailable"),
        }
        match self.introspector.connection_uid(sender).await {
            Ok(uid) => info.uid = uid,
            Err(e) => debug!(sender = %sender, error = %e, "sender uid unavailable"),
        }
        if info.pid == 0 {
            return info;
        }

        let chain = read_process_chain(self.source.as_ref(), info.pid, true);
        if let Some(invoker) = BusSenderStrategy.resolve_invoker(&chain) {
            info.pid = invoker.pid;
            info.process_name = invoker.name;
            info.process_chain = chain;
            return info;
        }

        match self.introspector.unit_by_pid(info.pid).await {
            Ok(unit_path) => info.unit_name = decode_unit_path(&unit_path),
            Err(e) => debug!(sender = %sender, pid = info.pid, error = %e, "unit lookup failed"),
        }
        info
    }
}

/// Resolves the peer of a local socket connection.
///
/// The chain is walked untrimmed from the peer PID and the invoker is picked
/// by `strategy`. The sender id is `local:<pid>`.
#[must_use]
pub fn resolve_local_peer(
    credentials: &PeerCredentials,
    source: &dyn ProcessSource,
    strategy: &dyn InvokerStrategy,
) -> SenderInfo {
    let pid = credentials.pid.unwrap_or(0);
    let mut info = SenderInfo::unresolved(format!("local:{pid}"));
    info.pid = pid;
    info.uid = credentials.uid;
    if pid == 0 {
        return info;
    }

    let chain = read_process_chain(source, pid, false);
    if let Some(invoker) = strategy.resolve_invoker(&chain) {
        debug!(strategy = strategy.name(), invoker = %invoker.name, "local peer resolved");
        info.pid = invoker.pid;
        info.process_name = invoker.name;
    }
    info.process_chain = chain;
    info
}


#[cfg(test)]
mod tests {
    use secretgate_core::LocalPeerStrategy;

    use super::test_support::{FakeIntrospector, FakeProcesses};
    use super::*;

    fn resolver(introspector: FakeIntrospector, processes: FakeProcesses) -> SenderResolver {
        SenderResolver::new(Arc::new(introspector), Arc::new(processes))
    }

    #[tokio::test]
    async fn test_resolve_reports_invoker_over_shells() {
        // zsh (session leader) -> bash -> claude, sender is claude's child shell.
        let processes = FakeProcesses::default()
            .with(100, "zsh", 1, 100)
            .with(200, "claude", 100, 100)
            .with(300, "bash", 200, 100);
        let introspector = FakeIntrospector::default().sender(":1.42", 300, 1000);

        let info = resolver(introspector, processes).resolve(":1.42").await;
        assert_eq!(info.sender_id, ":1.42");
        assert_eq!(info.uid, 1000);
        assert_eq!(info.process_name, "claude");
        assert_eq!(info.pid, 200);
        assert_eq!(info.process_chain.len(), 3);
        assert!(info.unit_name.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_unit() {
        let introspector = FakeIntrospector::default()
            .sender(":1.7", 555, 0)
            .unit(555, "/org/freedesktop/systemd1/unit/ssh_2eservice");

        let info = resolver(introspector, FakeProcesses::default())
            .resolve(":1.7")
            .await;
        assert_eq!(info.pid, 555);
        assert_eq!(info.unit_name, "ssh.service");
        assert!(info.process_name.is_empty());
        assert_eq!(info.display_name(), "ssh.service");
    }

    #[tokio::test]
    async fn test_resolve_unknown_sender_degrades() {
        let info = resolver(FakeIntrospector::default(), FakeProcesses::default())
            .resolve(":1.99")
            .await;
        assert_eq!(info, SenderInfo::unresolved(":1.99"));
    }

    #[test]
    fn test_local_peer_skips_client_and_wrapped_program() {
        // terminal -> zsh -> claude -> git -> signing helper (peer).
        let processes = FakeProcesses::default()
            .with(10, "terminal", 1, 10)
            .with(20, "zsh", 10, 20)
            .with(30, "claude", 20, 20)
            .with(40, "git", 30, 20)
            .with(50, "gpg-shim", 40, 20);
        let creds = PeerCredentials {
            uid: 1000,
            gid: 1000,
            pid: Some(50),
        };

        let info = resolve_local_peer(&creds, &processes, &LocalPeerStrategy::default());
        assert_eq!(info.sender_id, "local:50");
        assert_eq!(info.process_name, "claude");
        assert_eq!(info.pid, 30);
        assert_eq!(info.uid, 1000);
        assert_eq!(info.process_chain.len(), 5);
    }

    #[test]
    fn test_local_peer_without_pid() {
        let creds = PeerCredentials {
            uid: 1000,
            gid: 1000,
            pid: None,
        };
        let info = resolve_local_peer(
            &creds,
            &FakeProcesses::default(),
            &LocalPeerStrategy::default(),
        );
        assert_eq!(info.sender_id, "local:0");
        assert!(info.process_chain.is_empty());
    }
}
