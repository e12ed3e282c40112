//! Control-socket connection handling.
//!
//! Each accepted connection is served on its own task. The socket it
//! arrived on decides which requests it may send:
//!
//! | Socket   | Requests                                              |
//! |----------|-------------------------------------------------------|
//! | operator | `list_pending`, `decide`, `list_clients`, `watch`     |
//! | session  | `request_signature`                                   |
//!
//! # Signature requests
//!
//! ```text
//! request_signature ─► resolve peer (SO_PEERCRED + process chain)
//!                   ─► require_approval(Sign) ─┬─► approved / denied
//!                                              └─ peer hangs up ─► cancel
//! ```
//!
//! # Security Considerations
//!
//! - Peer credentials were checked at accept time; nothing here trusts
//!   identity claims made inside a message.
//! - A denial on the session socket never carries the approver's reason.
//! - Malformed frames get an error reply; the connection stays usable.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use secretgate_core::approval::RequestType;
use secretgate_core::process::{LocalPeerStrategy, ProcessSource};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::error::ProtocolError;
use super::messages::{OperatorRequest, OperatorResponse, SessionRequest, SessionResponse};
use super::socket_manager::{SocketManager, SocketType};
use crate::discovery::ClientRegistry;
use crate::gateway::{ApprovalGateway, ApprovalInput};
use crate::identity::resolve_local_peer;

/// Client name attached to signature requests from the session socket.
pub const LOCAL_CLIENT_NAME: &str = "local";

/// Shared state for control connections.
pub struct ControlContext {
    gateway: Arc<ApprovalGateway>,
    clients: Arc<ClientRegistry>,
    processes: Arc<dyn ProcessSource>,
    local_peer: LocalPeerStrategy,
    cancel: CancellationToken,
}

impl ControlContext {
    /// Creates a context; connections end when `cancel` fires.
    #[must_use]
    pub fn new(
        gateway: Arc<ApprovalGateway>,
        clients: Arc<ClientRegistry>,
        processes: Arc<dyn ProcessSource>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            clients,
            processes,
            local_peer: LocalPeerStrategy::default(),
            cancel,
        }
    }

    /// Overrides the local-peer invoker strategy.
    #[must_use]
    pub fn with_local_peer(mut self, strategy: LocalPeerStrategy) -> Self {
        self.local_peer = strategy;
        self
    }
}

/// Accepts control connections until `ctx`'s token is cancelled.
pub async fn serve(manager: Arc<SocketManager>, ctx: Arc<ControlContext>) {
    let tasks = TaskTracker::new();

    loop {
        let accepted = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            accepted = manager.accept() => accepted,
        };
        match accepted {
            Ok((connection, permit, socket_type)) => {
                let ctx = Arc::clone(&ctx);
                tasks.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_connection(connection, socket_type, &ctx).await {
                        warn!(socket_type = %socket_type, error = %e, "control connection failed");
                    }
                });
            },
            Err(ProtocolError::Unauthorized { uid, gid, socket }) => {
                warn!(uid, gid, socket = %socket, "rejected unauthorized control connection");
            },
            Err(e) => warn!(error = %e, "failed to accept control connection"),
        }
    }

    tasks.close();
    tasks.wait().await;
    debug!("control connections drained");
}

/// Serves one control connection until the peer closes it.
///
/// # Errors
///
/// Transport failures on the connection.
pub async fn handle_connection(
    mut connection: Connection,
    socket_type: SocketType,
    ctx: &ControlContext,
) -> Result<()> {
    match socket_type {
        SocketType::Operator => serve_operator(&mut connection, ctx).await,
        SocketType::Session => serve_session(&mut connection, ctx).await,
    }
}

async fn serve_operator(connection: &mut Connection, ctx: &ControlContext) -> Result<()> {
    loop {
        let request = tokio::select! {
            () = ctx.cancel.cancelled() => return Ok(()),
            request = connection.recv::<OperatorRequest>() => request,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(ProtocolError::Serialization { reason }) => {
                connection
                    .send(&OperatorResponse::Error {
                        message: format!("malformed request: {reason}"),
                    })
                    .await
                    .context("failed to send error reply")?;
                continue;
            },
            Err(e) => return Err(e).context("operator connection failed"),
        };

        let response = match request {
            OperatorRequest::ListPending => OperatorResponse::Pending {
                requests: ctx.gateway.pending(),
            },
            OperatorRequest::Decide {
                id,
                approve,
                reason,
            } => {
                let resolved = if approve {
                    ctx.gateway.approve(id)
                } else {
                    ctx.gateway.deny(id, reason)
                };
                info!(request_id = %id, approve, resolved, "operator decision");
                OperatorResponse::Decided { id, resolved }
            },
            OperatorRequest::ListClients => OperatorResponse::Clients {
                clients: ctx.clients.clients(),
            },
            OperatorRequest::Watch => return watch(connection, ctx).await,
        };
        connection
            .send(&response)
            .await
            .context("failed to send operator reply")?;
    }
}

/// Streams gateway events until the peer hangs up.
async fn watch(connection: &mut Connection, ctx: &ControlContext) -> Result<()> {
    let mut events = ctx.gateway.subscribe();
    debug!("operator watching gateway events");

    loop {
        let event = tokio::select! {
            () = ctx.cancel.cancelled() => return Ok(()),
            frame = connection.recv::<OperatorRequest>() => {
                match frame {
                    Ok(Some(_)) => {
                        debug!("ignoring request on watch stream");
                        continue;
                    },
                    Ok(None) | Err(_) => return Ok(()),
                }
            }
            event = events.recv() => event,
        };
        match event {
            Ok(event) => connection
                .send(&OperatorResponse::Event { event })
                .await
                .context("failed to send gateway event")?,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "operator watch lagged behind gateway events");
            },
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn serve_session(connection: &mut Connection, ctx: &ControlContext) -> Result<()> {
    loop {
        let request = tokio::select! {
            () = ctx.cancel.cancelled() => return Ok(()),
            request = connection.recv::<SessionRequest>() => request,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(ProtocolError::Serialization { reason }) => {
                connection
                    .send(&SessionResponse::Error {
                        message: format!("malformed request: {reason}"),
                    })
                    .await
                    .context("failed to send error reply")?;
                continue;
            },
            Err(e) => return Err(e).context("session connection failed"),
        };

        let SessionRequest::RequestSignature {
            repository,
            author,
            committer,
            subject,
            extra,
        } = request;

        let mut context: BTreeMap<String, String> = extra;
        context.insert("repository".to_string(), repository);
        context.insert("author".to_string(), author);
        context.insert("committer".to_string(), committer);
        context.insert("subject".to_string(), subject);

        let Some(response) = request_signature(connection, ctx, context).await else {
            debug!("signature requester hung up");
            return Ok(());
        };
        connection
            .send(&response)
            .await
            .context("failed to send signature reply")?;
    }
}

/// Waits for a `Sign` decision. Returns `None` if the peer hung up first.
async fn request_signature(
    connection: &mut Connection,
    ctx: &ControlContext,
    context: BTreeMap<String, String>,
) -> Option<SessionResponse> {
    let requester = match connection.credentials() {
        Some(credentials) => {
            resolve_local_peer(credentials, ctx.processes.as_ref(), &ctx.local_peer)
        },
        None => secretgate_core::identity::SenderInfo::unresolved("local:0"),
    };
    let input = ApprovalInput::new(LOCAL_CLIENT_NAME, RequestType::Sign, requester)
        .with_extra_context(context);

    let call = ctx.cancel.child_token();
    let approval = ctx.gateway.require_approval(&call, input);
    tokio::pin!(approval);

    let result = tokio::select! {
        result = &mut approval => result,
        () = wait_for_hangup(connection) => {
            call.cancel();
            let _ = approval.await;
            return None;
        }
    };

    Some(match result {
        Ok(()) => SessionResponse::Approved,
        Err(e) => {
            info!(reason = %e, "signature request not approved");
            SessionResponse::Denied
        },
    })
}

/// Resolves when the peer closes the connection or breaks framing.
///
/// Requests sent while a signature is pending are answered with an error.
async fn wait_for_hangup(connection: &mut Connection) {
    loop {
        let message = match connection.recv::<SessionRequest>().await {
            Ok(Some(_)) => "a signature request is already pending".to_string(),
            Err(ProtocolError::Serialization { reason }) => format!("malformed request: {reason}"),
            Ok(None) | Err(_) => return,
        };
        debug!(reason = %message, "rejecting request while a signature is pending");
        if connection.send(&SessionResponse::Error { message }).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secretgate_core::approval::ApprovalRequest;
    use tokio::net::UnixStream;

    use super::*;
    use crate::gateway::{ApprovalOutcome, GatewayEvent};
    use crate::identity::test_support::FakeProcesses;
    use crate::protocol::credentials::PeerCredentials;

    const WAIT: Duration = Duration::from_secs(5);

    fn context(gateway: &Arc<ApprovalGateway>) -> ControlContext {
        let processes = FakeProcesses::default()
            .with(10, "zsh", 1, 10)
            .with(20, "claude", 10, 10)
            .with(30, "git", 20, 10)
            .with(40, "sign-client", 30, 10);
        ControlContext::new(
            Arc::clone(gateway),
            Arc::new(ClientRegistry::new()),
            Arc::new(processes),
            CancellationToken::new(),
        )
    }

    fn pair() -> (Connection, Connection) {
        let (server, client) = UnixStream::pair().unwrap();
        let creds = PeerCredentials {
            uid: 1000,
            gid: 1000,
            pid: Some(40),
        };
        (
            Connection::new_with_credentials(server, Some(creds)),
            Connection::new_with_credentials(client, None),
        )
    }

    fn spawn_handler(
        server: Connection,
        socket_type: SocketType,
        ctx: ControlContext,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { handle_connection(server, socket_type, &ctx).await })
    }

    async fn wait_for_pending(gateway: &ApprovalGateway) -> ApprovalRequest {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(request) = gateway.pending().into_iter().next() {
                    return request;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no pending request")
    }

    fn sign_request() -> SessionRequest {
        SessionRequest::RequestSignature {
            repository: "/home/dev/project".to_string(),
            author: "Dev <dev@example.com>".to_string(),
            committer: "Dev <dev@example.com>".to_string(),
            subject: "Fix the thing".to_string(),
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_signature_approved() {
        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let (server, mut client) = pair();
        let handler = spawn_handler(server, SocketType::Session, context(&gateway));

        client.send(&sign_request()).await.unwrap();
        let pending = wait_for_pending(&gateway).await;
        assert_eq!(pending.client_name, LOCAL_CLIENT_NAME);
        assert_eq!(pending.request_type, RequestType::Sign);
        assert_eq!(pending.requester.process_name, "claude");
        assert_eq!(pending.requester.sender_id, "local:40");
        assert_eq!(pending.extra_context["subject"], "Fix the thing");
        assert_eq!(pending.extra_context["repository"], "/home/dev/project");

        assert!(gateway.approve(pending.id));
        let reply: SessionResponse = client.recv().await.unwrap().unwrap();
        assert_eq!(reply, SessionResponse::Approved);

        drop(client);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_signature_denied_without_reason() {
        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let (server, mut client) = pair();
        let _handler = spawn_handler(server, SocketType::Session, context(&gateway));

        client.send(&sign_request()).await.unwrap();
        let pending = wait_for_pending(&gateway).await;
        assert!(gateway.deny(pending.id, Some("secret reason".to_string())));

        let reply: SessionResponse = client.recv().await.unwrap().unwrap();
        assert_eq!(reply, SessionResponse::Denied);
    }

    #[tokio::test]
    async fn test_second_request_while_pending_gets_error() {
        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let (server, mut client) = pair();
        let _handler = spawn_handler(server, SocketType::Session, context(&gateway));

        client.send(&sign_request()).await.unwrap();
        let pending = wait_for_pending(&gateway).await;

        client.send(&sign_request()).await.unwrap();
        let reply: SessionResponse = client.recv().await.unwrap().unwrap();
        assert!(matches!(
            reply,
            SessionResponse::Error { message } if message.contains("already pending")
        ));
        assert_eq!(gateway.pending_count(), 1);

        assert!(gateway.approve(pending.id));
        let reply: SessionResponse = client.recv().await.unwrap().unwrap();
        assert_eq!(reply, SessionResponse::Approved);
    }

    #[tokio::test]
    async fn test_signature_hangup_cancels_request() {
        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let mut events = gateway.subscribe();
        let (server, mut client) = pair();
        let handler = spawn_handler(server, SocketType::Session, context(&gateway));

        client.send(&sign_request()).await.unwrap();
        let pending = wait_for_pending(&gateway).await;
        drop(client);

        handler.await.unwrap().unwrap();
        assert_eq!(gateway.pending_count(), 0);

        let resolved = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(GatewayEvent::Resolved { id, outcome }) = events.recv().await {
                    return (id, outcome);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(resolved, (pending.id, ApprovalOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_operator_lists_and_decides() {
        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let (server, mut client) = pair();
        let _handler = spawn_handler(server, SocketType::Operator, context(&gateway));

        let reply: OperatorResponse = client.request(&OperatorRequest::ListPending).await.unwrap();
        assert!(matches!(reply, OperatorResponse::Pending { requests } if requests.is_empty()));

        let waiter = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                let input = ApprovalInput::new(
                    "claude",
                    RequestType::GetSecret,
                    secretgate_core::identity::SenderInfo::unresolved(":1.7"),
                );
                gateway
                    .require_approval(&CancellationToken::new(), input)
                    .await
            })
        };
        let pending = wait_for_pending(&gateway).await;

        let reply: OperatorResponse = client.request(&OperatorRequest::ListPending).await.unwrap();
        match reply {
            OperatorResponse::Pending { requests } => assert_eq!(requests[0].id, pending.id),
            other => panic!("unexpected reply {other:?}"),
        }

        let decide = OperatorRequest::Decide {
            id: pending.id,
            approve: true,
            reason: None,
        };
        let reply: OperatorResponse = client.request(&decide).await.unwrap();
        assert!(matches!(reply, OperatorResponse::Decided { resolved: true, .. }));
        assert!(waiter.await.unwrap().is_ok());

        // A second decision finds nothing to resolve.
        let reply: OperatorResponse = client.request(&decide).await.unwrap();
        assert!(matches!(reply, OperatorResponse::Decided { resolved: false, .. }));

        let reply: OperatorResponse = client.request(&OperatorRequest::ListClients).await.unwrap();
        assert!(matches!(reply, OperatorResponse::Clients { clients } if clients.is_empty()));
    }

    #[tokio::test]
    async fn test_operator_watch_streams_events() {
        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let (server, mut client) = pair();
        let _handler = spawn_handler(server, SocketType::Operator, context(&gateway));

        client.send(&OperatorRequest::Watch).await.unwrap();
        // Wait until the handler has subscribed.
        tokio::time::timeout(WAIT, async {
            while gateway.subscriber_count() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let requester = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                let input = ApprovalInput::new(
                    "claude",
                    RequestType::Search,
                    secretgate_core::identity::SenderInfo::unresolved(":1.7"),
                );
                gateway
                    .require_approval(&CancellationToken::new(), input)
                    .await
            })
        };

        let frame: OperatorResponse = tokio::time::timeout(WAIT, client.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let id = match frame {
            OperatorResponse::Event {
                event: GatewayEvent::Requested(request),
            } => request.id,
            other => panic!("unexpected frame {other:?}"),
        };

        assert!(gateway.deny(id, None));
        let frame: OperatorResponse = client.recv().await.unwrap().unwrap();
        assert!(matches!(
            frame,
            OperatorResponse::Event {
                event: GatewayEvent::Resolved {
                    outcome: ApprovalOutcome::Denied,
                    ..
                }
            }
        ));
        assert!(requester.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        use bytes::Bytes;
        use futures::SinkExt;
        use tokio_util::codec::{Framed, LengthDelimitedCodec};

        let gateway = Arc::new(ApprovalGateway::new(WAIT));
        let (server, client) = UnixStream::pair().unwrap();
        let _handler = spawn_handler(
            Connection::new_with_credentials(server, None),
            SocketType::Operator,
            context(&gateway),
        );

        let mut raw = Framed::new(client, LengthDelimitedCodec::new());
        raw.send(Bytes::from_static(b"{\"type\":\"shutdown\"}")).await.unwrap();
        let mut client = Connection::new_with_credentials(raw.into_inner(), None);

        let reply: OperatorResponse = client.recv().await.unwrap().unwrap();
        assert!(matches!(
            reply,
            OperatorResponse::Error { message } if message.contains("malformed")
        ));

        let reply: OperatorResponse = client.request(&OperatorRequest::ListPending).await.unwrap();
        assert!(matches!(reply, OperatorResponse::Pending { .. }));
    }
}
