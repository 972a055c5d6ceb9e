//! WebSocket entry point for the realtime channel.
//!
//! Each socket gets a reader loop (this task) and a writer task fed by the
//! connection's outbound queue. Everything else in the crate talks to the
//! socket through [`Connection`] only.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};

use super::presence::{Identity, PresenceError};
use super::protocol::{Command, ServerEvent};
use super::registry::{Connection, Outbound};
use crate::app::AppState;
use crate::miner::MinerError;
use crate::user::Presence;

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, PartialEq, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub device: Option<String>,
}

impl ConnectParams {
    pub fn from_query(query: Option<&str>) -> Self {
        query
            .and_then(|q| {
                serde_urlencoded::from_str(q)
                    .inspect_err(|e| warn!("ignoring malformed connect query {q:?}: {e}"))
                    .ok()
            })
            .unwrap_or_default()
    }

    pub fn is_mobile(&self) -> bool {
        self.device.as_deref() == Some("mobile")
    }
}

/// Accept realtime connections on `addr` until the listener fails.
pub async fn serve(app: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Realtime gateway listening on ws://{}", listener.local_addr()?);
    serve_on(app, listener).await
}

pub async fn serve_on(app: AppState, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept realtime connection: {e}");
                continue;
            }
        };
        debug!("New realtime connection from {peer}");

        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(app, stream, peer).await {
                error!("Realtime connection {peer} failed: {e}");
            }
        });
    }
}

async fn handle_connection(
    app: AppState,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), tungstenite::Error> {
    let mut query = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        },
    )
    .await?;

    let params = ConnectParams::from_query(query.as_deref());
    let (mut sink, mut inbound) = ws.split();

    let identity = match identify(&app, &params).await {
        Ok(identity) => identity,
        Err(event) => {
            info!("Refusing realtime connection from {peer}: {event:?}");
            if let Ok(text) = event.encode() {
                sink.send(Message::text(text)).await?;
            }
            sink.send(Message::Close(None)).await?;
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        debug!("Realtime write to {peer} failed: {e}");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let connection = Connection::new(tx, params.is_mobile());
    let idle_timeout = app.config.idle_timeout;
    let session = match Session::open(app, identity, connection).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open realtime session for {peer}: {e}");
            let _ = writer.await;
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            _ = idle(idle_timeout) => {
                info!("Realtime connection {peer} idle; closing");
                break;
            }
            // Writer gone: superseded by a newer connection or a dead socket.
            _ = session.connection().closed() => break,
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary frame from {peer}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Realtime read from {peer} failed: {e}");
                    break;
                }
            },
        }
    }

    session.close().await;
    let _ = writer.await;
    Ok(())
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Work out who is connecting. No `user_id` means a fresh guest; an unknown
/// `user_id` is refused with the error event to send before closing.
pub async fn identify(app: &AppState, params: &ConnectParams) -> Result<Identity, ServerEvent> {
    let Some(user_id) = params.user_id.as_deref().filter(|id| !id.is_empty()) else {
        return Ok(Identity::guest());
    };
    match app.store.get_user(user_id).await {
        Ok(Some(record)) => Ok(Identity::user(&record)),
        Ok(None) => Err(ServerEvent::Error {
            kind: "unknown_user".to_string(),
            message: format!("User {user_id} not found"),
        }),
        Err(e) => {
            error!("Failed to look up user {user_id}: {e}");
            Err(ServerEvent::Error {
                kind: "server_error".to_string(),
                message: "Could not load user".to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MinerAction {
    PowerOn,
    PowerOff,
    Start,
    Stop,
}

/// One registered realtime connection and the identity behind it.
pub struct Session {
    app: AppState,
    identity: Identity,
    connection: Connection,
}

impl Session {
    /// Register `connection` (evicting any older one for the same identity),
    /// announce the user as online and greet the client. Waits for a
    /// teardown of the same identity still in progress.
    pub async fn open(
        app: AppState,
        identity: Identity,
        connection: Connection,
    ) -> Result<Self, PresenceError> {
        let lifecycle = app.registry.lock_identity(&identity.user_id).await;
        app.registry.add(&identity.user_id, connection.clone());

        if let Err(e) = app.presence.connect(&identity).await {
            app.registry.release(&identity.user_id, connection.id());
            connection.send(&ServerEvent::Error {
                kind: "server_error".to_string(),
                message: "Could not start session".to_string(),
            });
            connection.close();
            drop(lifecycle);
            app.registry.forget_identity(&identity.user_id);
            return Err(e);
        }

        info!(
            "Session opened for {} ({} client, connection #{})",
            identity.user_id,
            if connection.is_mobile() { "mobile" } else { "web" },
            connection.id()
        );
        connection.send(&ServerEvent::Session {
            user_id: identity.user_id.clone(),
            guest: identity.guest,
        });
        drop(lifecycle);
        Ok(Self {
            app,
            identity,
            connection,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Parse and dispatch one inbound text frame. Malformed frames are
    /// logged and dropped; the connection stays open.
    pub async fn handle_text(&self, text: &str) {
        match Command::parse(text) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => warn!(
                "Dropping malformed message from {}: {e}",
                self.identity.user_id
            ),
        }
    }

    pub async fn dispatch(&self, command: Command) {
        match command {
            Command::Ping => {
                self.connection.send(&ServerEvent::Pong);
            }
            Command::UserSetStatus { status } => self.set_status(status).await,
            Command::MinerPowerOn { miner_id } => {
                self.miner_command(&miner_id, MinerAction::PowerOn).await
            }
            Command::MinerPowerOff { miner_id } => {
                self.miner_command(&miner_id, MinerAction::PowerOff).await
            }
            Command::MinerStart { miner_id } => {
                self.miner_command(&miner_id, MinerAction::Start).await
            }
            Command::MinerStop { miner_id } => {
                self.miner_command(&miner_id, MinerAction::Stop).await
            }
        }
    }

    async fn set_status(&self, status: Presence) {
        if let Err(e) = self.app.presence.set_status(&self.identity, status).await {
            error!(
                "Failed to set status of {} to {status:?}: {e}",
                self.identity.user_id
            );
            self.connection.send(&ServerEvent::Error {
                kind: "status_update_failed".to_string(),
                message: "Could not update status".to_string(),
            });
        }
    }

    /// Successful transitions reach the owner through the state broadcaster;
    /// only rejections are answered here.
    async fn miner_command(&self, miner_id: &str, action: MinerAction) {
        let miners = &self.app.miners;
        let result = async {
            miners.authorize(miner_id, &self.identity.user_id).await?;
            match action {
                MinerAction::PowerOn => miners.power_on(miner_id).await,
                MinerAction::PowerOff => miners.power_off(miner_id).await,
                MinerAction::Start => miners.start(miner_id).await,
                MinerAction::Stop => miners.stop(miner_id).await,
            }
        }
        .await;

        let Err(e) = result else {
            return;
        };
        if e.is_validation() {
            debug!(
                "{action:?} on miner {miner_id} by {} rejected: {e}",
                self.identity.user_id
            );
        } else {
            error!("{action:?} on miner {miner_id} failed: {e}");
        }

        let miner = match e {
            MinerError::NotFound | MinerError::NotOwner => None,
            _ => miners
                .snapshot(miner_id)
                .await
                .and_then(|record| serde_json::to_value(record).ok()),
        };
        self.connection.send(&ServerEvent::MinerStatusUpdate {
            miner,
            message: e.to_string(),
        });
    }

    /// Tear the session down. Only the connection still registered for the
    /// identity stops its miners and marks the user offline; a reconnect
    /// waits until that is done.
    pub async fn close(self) {
        let user_id = &self.identity.user_id;
        let lifecycle = self.app.registry.lock_identity(user_id).await;
        if self.app.registry.release(user_id, self.connection.id()) {
            let stopped = self.app.miners.stop_all_for_user(user_id).await;
            if stopped > 0 {
                info!("Stopped {stopped} mining loop(s) for disconnected user {user_id}");
            }
            if let Err(e) = self.app.presence.disconnect(&self.identity).await {
                error!("Failed to mark {user_id} offline: {e}");
            }
        } else {
            debug!("Superseded connection for {user_id} closed");
        }
        self.connection.close();
        drop(lifecycle);
        self.app.registry.forget_identity(user_id);
    }
}
