//! Tokio driver for [`EventConnection`].
//!
//! Owns the websocket, executes the state machine's actions in order and
//! feeds it frames, timer expiries and outbound commands.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::engine::events::{ClientEvent, ErrorPayload};
use crate::gateway::connection::{ConnectionAction, ConnectionState, EventConnection};
use crate::gateway::protocol::{ClientFrame, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Snapshot of the connection readable from outside the driver task.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub latency: Option<Duration>,
    pub last_error: Option<ErrorPayload>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            latency: None,
            last_error: None,
        }
    }
}

pub type SharedStatus = Arc<Mutex<ConnectionStatus>>;

/// Wall-clock milliseconds, as carried by heartbeat frames.
pub fn unix_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

pub struct Driver {
    conn: EventConnection<Instant>,
    token: String,
    socket: Option<WsStream>,
    events: mpsc::UnboundedSender<ServerEvent>,
    notify: broadcast::Sender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<ClientFrame>,
    status: SharedStatus,
    cancel: CancellationToken,
}

impl Driver {
    pub fn new(
        conn: EventConnection<Instant>,
        token: String,
        events: mpsc::UnboundedSender<ServerEvent>,
        notify: broadcast::Sender<ClientEvent>,
        commands: mpsc::UnboundedReceiver<ClientFrame>,
        status: SharedStatus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            token,
            socket: None,
            events,
            notify,
            commands,
            status,
            cancel,
        }
    }

    /// Run until cancelled or until the client handle is dropped.
    pub async fn run(mut self) {
        let mut queue: VecDeque<ConnectionAction> =
            self.conn.connect(self.token.clone(), Instant::now()).into();

        loop {
            while let Some(action) = queue.pop_front() {
                self.execute(action, &mut queue).await;
            }
            self.publish_status();

            if self.cancel.is_cancelled() {
                break;
            }

            let deadline = self.conn.next_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                command = self.commands.recv() => {
                    let Some(frame) = command else { break };
                    match self.conn.send(frame) {
                        Ok(action) => queue.push_back(action),
                        Err(e) => debug!(error = %e, "dropping outbound frame"),
                    }
                }

                message = next_message(&mut self.socket) => {
                    self.handle_message(message, &mut queue);
                }

                _ = sleep_until(deadline) => {
                    queue.extend(self.conn.tick(Instant::now(), unix_ms()));
                }
            }
        }

        for action in self.conn.disconnect() {
            self.execute(action, &mut VecDeque::new()).await;
        }
        self.publish_status();
        debug!("driver stopped");
    }

    fn handle_message(
        &mut self,
        message: Option<Result<Message, tungstenite::Error>>,
        queue: &mut VecDeque<ConnectionAction>,
    ) {
        let now = Instant::now();
        match message {
            Some(Ok(Message::Text(text))) => {
                let version = self.conn.config().protocol;
                let event = match ServerEvent::decode(version, text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "dropping malformed frame");
                        return;
                    }
                };
                match self.conn.handle_event(event, now, unix_ms()) {
                    Ok(actions) => queue.extend(actions),
                    Err(e) => {
                        error!(error = %e, "server broke the event protocol");
                        queue.extend(self.conn.abort(now, &e));
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "server closed the socket");
                self.socket = None;
                queue.extend(self.conn.transport_closed(now));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "websocket error");
                self.socket = None;
                queue.extend(self.conn.transport_error(now, e.to_string()));
            }
            None => {
                self.socket = None;
                queue.extend(self.conn.transport_closed(now));
            }
        }
    }

    async fn execute(&mut self, action: ConnectionAction, queue: &mut VecDeque<ConnectionAction>) {
        match action {
            ConnectionAction::Open { url } => {
                self.socket = None;
                let timeout = self.conn.config().connect_timeout;
                let result = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    result = tokio::time::timeout(timeout, connect_async(url.as_str())) => result,
                };
                let now = Instant::now();
                match result {
                    Ok(Ok((socket, _response))) => {
                        self.socket = Some(socket);
                        queue.extend(self.conn.transport_opened(now));
                    }
                    Ok(Err(e)) => queue.extend(self.conn.transport_error(now, e.to_string())),
                    Err(_) => queue.extend(self.conn.transport_error(now, "handshake timed out")),
                }
            }
            ConnectionAction::Send(frame) => {
                let Some(socket) = self.socket.as_mut() else {
                    debug!(?frame, "no socket for outbound frame");
                    return;
                };
                if let Err(e) = socket.send(Message::Text(frame.to_text().into())).await {
                    self.socket = None;
                    queue.extend(self.conn.transport_error(Instant::now(), e.to_string()));
                }
            }
            ConnectionAction::Close { reason } => {
                if let Some(mut socket) = self.socket.take() {
                    debug!(%reason, "closing socket");
                    let _ = socket.close(None).await;
                }
            }
            ConnectionAction::Notify(event) => {
                // No subscribers is fine.
                let _ = self.notify.send(event);
            }
            ConnectionAction::Dispatch(event) => {
                if self.events.send(event).is_err() {
                    debug!("dispatcher gone, dropping event");
                }
            }
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.lock();
        status.state = self.conn.state();
        status.latency = self.conn.latency();
        status.last_error = self.conn.last_error().cloned();
    }
}

async fn next_message(socket: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
