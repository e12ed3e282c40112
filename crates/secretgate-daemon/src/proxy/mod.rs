//! One proxy instance per client endpoint.
//!
//! A proxy owns two connections: the *front* connection to the client's
//! endpoint bus, where it claims `org.freedesktop.secrets`, and the
//! *backend* connection to the real store.
//!
//! ```text
//!   client bus (<name>.sock)            backend bus
//!   ────────────────────────            ───────────
//!   MethodCall ─► front ─► router ─► handlers ─► SecretBackend
//!   signal     ◄─ front ◄─ signal forwarder ◄─── backend signals
//!   NameOwnerChanged ─► tracker (per-sender cancel)
//! ```
//!
//! # Lifecycle
//!
//! The proxy runs until its token is cancelled, the front connection's
//! message stream ends, or the signal forwarder stops. On the way out it
//! cancels every in-flight call, waits for the call tasks and closes every
//! backend session it opened.

pub mod handlers;
pub mod introspection;
pub mod router;
pub mod signals;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secretgate_core::process::ProcfsSource;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::message::Type as MessageType;
use zbus::names::WellKnownName;
use zbus::{Connection, MessageStream};

pub use handlers::{HandlerResult, Handlers};
pub use router::{Operation, Route};

use crate::backend::{BackendError, DbusBackend};
use crate::discovery::{ProxyFactory, ProxyRunner};
use crate::gateway::ApprovalGateway;
use crate::identity::{DbusIntrospector, SenderResolver};
use crate::secret::BUS_NAME;
use crate::tracker::{watch_disconnects, ClientTracker};

/// Failure to bring up or keep running one proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Connecting to the backend store failed.
    #[error("backend connection failed: {0}")]
    Backend(#[from] BackendError),

    /// Connecting to the client endpoint failed.
    #[error("endpoint connection to {endpoint} failed: {source}")]
    Front {
        /// Endpoint path.
        endpoint: String,
        /// Underlying error.
        #[source]
        source: zbus::Error,
    },

    /// Another connection already owns the service name on the endpoint.
    #[error("{name} is already owned on {endpoint}")]
    NameTaken {
        /// Bus name requested.
        name: String,
        /// Endpoint path.
        endpoint: String,
    },

    /// A bus operation failed after the connections were established.
    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),
}

/// A connected proxy ready to serve.
///
/// The front message stream is opened when the instance is built, so calls
/// that arrive between claiming the service name and [`ProxyInstance::serve`]
/// are queued rather than dropped.
pub struct ProxyInstance {
    front: Connection,
    stream: MessageStream,
    signal_source: Option<Connection>,
    handlers: Arc<Handlers>,
    cancel: CancellationToken,
}

impl ProxyInstance {
    /// Assembles a proxy from an established front connection.
    ///
    /// Backend signals are relayed from `signal_source` when one is given.
    #[must_use]
    pub fn new(
        front: Connection,
        signal_source: Option<Connection>,
        handlers: Handlers,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream: MessageStream::from(&front),
            front,
            signal_source,
            handlers: Arc::new(handlers),
            cancel,
        }
    }

    /// Handlers of this proxy.
    #[must_use]
    pub const fn handlers(&self) -> &Arc<Handlers> {
        &self.handlers
    }

    /// Serves until cancelled or a connection goes away.
    pub async fn serve(mut self) {
        let name = self.handlers.client_name().to_string();
        let tasks = TaskTracker::new();

        {
            let tracker = Arc::clone(self.handlers.tracker());
            let front = self.front.clone();
            let cancel = self.cancel.clone();
            let client = name.clone();
            tasks.spawn(async move {
                if let Err(e) = watch_disconnects(tracker, front, cancel).await {
                    warn!(client = %client, error = %e, "disconnect watcher failed");
                }
            });
        }

        let mut forwarder = self.signal_source.clone().map(|backend| {
            tokio::spawn(signals::forward_signals(
                backend,
                self.front.clone(),
                self.cancel.clone(),
            ))
        });

        info!(client = %name, "proxy serving");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(client = %name, "proxy cancelled");
                    break;
                }
                result = async {
                    match forwarder.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                } => {
                    match result {
                        Ok(Ok(())) => info!(client = %name, "backend signal stream ended"),
                        Ok(Err(e)) => warn!(client = %name, error = %e, "signal forwarder failed"),
                        Err(e) => warn!(client = %name, error = %e, "signal forwarder panicked"),
                    }
                    break;
                }
                next = self.stream.next() => {
                    match next {
                        None => {
                            info!(client = %name, "endpoint connection closed");
                            break;
                        },
                        Some(Err(e)) => warn!(client = %name, error = %e, "malformed message"),
                        Some(Ok(message)) => {
                            if message.message_type() != MessageType::MethodCall {
                                continue;
                            }
                            let handlers = Arc::clone(&self.handlers);
                            let front = self.front.clone();
                            tasks.spawn(async move {
                                router::dispatch(&handlers, &front, &message).await;
                            });
                        },
                    }
                }
            }
        }

        self.cancel.cancel();
        if let Some(handle) = forwarder {
            handle.abort();
        }
        tasks.close();
        tasks.wait().await;
        self.handlers.sessions().close_all().await;
        info!(client = %name, "proxy stopped");
    }
}

#[async_trait]
impl ProxyRunner for ProxyInstance {
    async fn run(self: Box<Self>) {
        (*self).serve().await;
    }
}

/// Claims `name` on `connection` without queueing.
///
/// # Errors
///
/// [`ProxyError::NameTaken`] if another connection owns the name.
pub async fn claim_name(
    connection: &Connection,
    name: &str,
    endpoint: &str,
) -> Result<(), ProxyError> {
    let dbus = DBusProxy::new(connection).await?;
    let well_known = WellKnownName::try_from(name).map_err(zbus::Error::from)?;
    match dbus
        .request_name(well_known, RequestNameFlags::DoNotQueue.into())
        .await
        .map_err(zbus::Error::from)?
    {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => Ok(()),
        RequestNameReply::Exists | RequestNameReply::InQueue => Err(ProxyError::NameTaken {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        }),
    }
}

/// Builds proxies that talk D-Bus on both sides.
pub struct DbusProxyFactory {
    upstream: Option<String>,
    gateway: Arc<ApprovalGateway>,
    gate_writes: bool,
    departed_retention: Duration,
}

impl DbusProxyFactory {
    /// Creates a factory connecting to `upstream` (the session bus when
    /// `None`).
    #[must_use]
    pub const fn new(upstream: Option<String>, gateway: Arc<ApprovalGateway>) -> Self {
        Self {
            upstream,
            gateway,
            gate_writes: false,
            departed_retention: crate::tracker::DEFAULT_DEPARTED_RETENTION,
        }
    }

    /// Also gates writes.
    #[must_use]
    pub fn with_gate_writes(mut self, gate_writes: bool) -> Self {
        self.gate_writes = gate_writes;
        self
    }

    /// Departed-sender retention of each proxy's tracker.
    #[must_use]
    pub fn with_departed_retention(mut self, retention: Duration) -> Self {
        self.departed_retention = retention;
        self
    }
}

#[async_trait]
impl ProxyFactory for DbusProxyFactory {
    async fn connect(
        &self,
        name: &str,
        endpoint: &Path,
        cancel: CancellationToken,
    ) -> Result<Box<dyn ProxyRunner>, ProxyError> {
        let endpoint_str = endpoint.display().to_string();

        let backend = DbusBackend::connect(self.upstream.as_deref()).await?;
        let front = zbus::connection::Builder::address(format!("unix:path={endpoint_str}").as_str())
            .map_err(|source| ProxyError::Front {
                endpoint: endpoint_str.clone(),
                source,
            })?
            .build()
            .await
            .map_err(|source| ProxyError::Front {
                endpoint: endpoint_str.clone(),
                source,
            })?;

        let resolver = SenderResolver::new(
            Arc::new(DbusIntrospector::new(front.clone())),
            Arc::new(ProcfsSource::new()),
        );
        let signal_source = backend.connection().clone();
        let handlers = Handlers::new(
            name,
            Arc::new(backend),
            Arc::clone(&self.gateway),
            resolver,
            cancel.clone(),
        )
        .with_tracker(Arc::new(ClientTracker::with_retention(self.departed_retention)))
        .with_gate_writes(self.gate_writes);

        let proxy = ProxyInstance::new(front, Some(signal_source), handlers, cancel);
        claim_name(&proxy.front, BUS_NAME, &endpoint_str).await?;
        debug!(client = %name, endpoint = %endpoint_str, "claimed service name");
        Ok(Box::new(proxy))
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secretgate_core::path::SERVICE_ROOT;
    use secretgate_core::process::test_support::FakeProcesses;
    use tokio::sync::broadcast;
    use zbus::names::BusName;
    use zbus::Message;
    use zvariant::{OwnedObjectPath, OwnedValue, Value};

    use super::test_support::p2p_pair;
    use super::*;
    use crate::gateway::GatewayEvent;
    use crate::identity::test_support::FakeIntrospector;
    use crate::memory::MemoryBackend;
    use crate::secret::{Secret, ITEM_INTERFACE, SERVICE_INTERFACE};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        client: Connection,
        backend: Arc<MemoryBackend>,
        gateway: Arc<ApprovalGateway>,
        cancel: CancellationToken,
        proxy: ProxyInstance,
    }

    async fn fixture() -> Fixture {
        let (front, client) = p2p_pair().await;
        let backend = Arc::new(MemoryBackend::new());
        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let cancel = CancellationToken::new();
        let resolver = SenderResolver::new(
            Arc::new(FakeIntrospector::default()),
            Arc::new(FakeProcesses::default()),
        );
        let handlers = Handlers::new(
            "agent",
            backend.clone(),
            gateway.clone(),
            resolver,
            cancel.clone(),
        );
        Fixture {
            client,
            backend,
            gateway,
            proxy: ProxyInstance::new(front, None, handlers, cancel.clone()),
            cancel,
        }
    }

    async fn call<B>(
        client: &Connection,
        path: &str,
        interface: &str,
        member: &str,
        body: &B,
    ) -> zbus::Result<Message>
    where
        B: serde::Serialize + zvariant::DynamicType,
    {
        client
            .call_method(None::<BusName<'_>>, path, Some(interface), member, body)
            .await
    }

    async fn open_session(client: &Connection) -> OwnedObjectPath {
        let reply = call(
            client,
            SERVICE_ROOT,
            SERVICE_INTERFACE,
            "OpenSession",
            &("plain", Value::from("")),
        )
        .await
        .unwrap();
        let (_, session): (OwnedValue, OwnedObjectPath) = reply.body().deserialize().unwrap();
        session
    }

    async fn approve_next(
        gateway: &ApprovalGateway,
        events: &mut broadcast::Receiver<GatewayEvent>,
    ) {
        let id = tokio::time::timeout(WAIT, async {
            loop {
                if let GatewayEvent::Requested(request) = events.recv().await.unwrap() {
                    return request.id;
                }
            }
        })
        .await
        .unwrap();
        assert!(gateway.approve(id));
    }

    #[tokio::test]
    async fn test_get_secrets_reply_over_the_wire() {
        let f = fixture().await;
        let item = f
            .backend
            .insert_item("login", "token", &[("service", "github")], b"ghp_secret")
            .unwrap();
        let mut events = f.gateway.subscribe();
        let serve = tokio::spawn(f.proxy.serve());

        let session = open_session(&f.client).await;
        assert_eq!(f.backend.open_session_count(), 1);

        let read = {
            let client = f.client.clone();
            let body = (vec![item.clone()], session.clone());
            tokio::spawn(async move {
                call(&client, SERVICE_ROOT, SERVICE_INTERFACE, "GetSecrets", &body).await
            })
        };
        approve_next(&f.gateway, &mut events).await;

        let reply = tokio::time::timeout(WAIT, read).await.unwrap().unwrap().unwrap();
        let signature = reply.body().signature().unwrap().to_string();
        assert_eq!(signature, "a{o(oayays)}");
        let secrets: HashMap<OwnedObjectPath, Secret> = reply.body().deserialize().unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[&item].value, b"ghp_secret");
        assert_eq!(secrets[&item].session, session);

        f.cancel.cancel();
        tokio::time::timeout(WAIT, serve).await.unwrap().unwrap();
        assert_eq!(f.backend.open_session_count(), 0);
    }

    #[tokio::test]
    async fn test_item_member_on_collection_path_is_no_such_object() {
        let f = fixture().await;
        let serve = tokio::spawn(f.proxy.serve());
        let session = open_session(&f.client).await;

        let err = call(
            &f.client,
            "/org/freedesktop/secrets/collection/login",
            ITEM_INTERFACE,
            "GetSecret",
            &(session,),
        )
        .await
        .unwrap_err();
        match err {
            zbus::Error::MethodError(name, _, _) => {
                assert_eq!(name.as_str(), "org.freedesktop.Secret.Error.NoSuchObject");
            },
            other => panic!("expected a method error, got {other:?}"),
        }
        assert_eq!(f.gateway.pending_count(), 0);

        f.cancel.cancel();
        tokio::time::timeout(WAIT, serve).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_call_sent_before_serving_is_answered() {
        let f = fixture().await;
        let opened = {
            let client = f.client.clone();
            tokio::spawn(async move { open_session(&client).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!opened.is_finished());

        let serve = tokio::spawn(f.proxy.serve());
        let session = tokio::time::timeout(WAIT, opened).await.unwrap().unwrap();
        assert!(session.as_str().starts_with("/org/freedesktop/secrets/session/"));

        f.cancel.cancel();
        tokio::time::timeout(WAIT, serve).await.unwrap().unwrap();
    }
}
