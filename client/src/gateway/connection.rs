//! Realtime connection state machine.
//!
//! Pure and time-driven: every method takes the current time and returns
//! actions for the driver to execute. Timers are deadlines stored here; the
//! driver sleeps until [`EventConnection::next_deadline`] and calls `tick`.
//!
//! ```text
//!          connect            Ready
//! ┌──────┐ ──────> ┌────────────┐ ─────> ┌───────────┐
//! │ Idle │         │ Connecting │        │ Connected │
//! └──────┘         └────────────┘        └───────────┘
//!                      │    ↑                  │
//!    close/error/      │    │ reconnect        │ close/error/
//!    timeout           ↓    │ (backoff)        │ timeout
//!                  ┌──────────────┐            │
//!                  │ Disconnected │ <──────────┘
//!                  └──────────────┘
//! ```

use std::fmt;
use std::ops::Add;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::events::{ClientEvent, ErrorPayload};
use crate::error::ConnectionError;
use crate::gateway::backoff::{RetryDelayFn, default_retry_delay_fn};
use crate::gateway::protocol::{ClientFrame, ProtocolVersion, ServerEvent, TransportFormat};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Time allowed for a Pong after each Ping.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed between opening the transport and the first frame.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Settings for one realtime connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ws_url: String,
    pub protocol: ProtocolVersion,
    pub format: TransportFormat,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_url: crate::config::DEFAULT_WS_URL.to_string(),
            protocol: ProtocolVersion::default(),
            format: TransportFormat::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: true,
        }
    }
}

impl GatewayConfig {
    /// Handshake URL carrying version, format and token.
    pub fn handshake_url(&self, token: &str) -> String {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}version={}&format={}&token={}",
            self.ws_url,
            separator,
            self.protocol.as_u32(),
            self.format.as_str(),
            urlencoding::encode(token)
        )
    }
}

/// Work for the driver.
#[derive(Debug, Clone)]
pub enum ConnectionAction {
    /// Open a new transport to this URL, replacing any existing one.
    Open { url: String },
    /// Send a frame on the open transport.
    Send(ClientFrame),
    /// Close the transport.
    Close { reason: String },
    /// Publish a connection-level notification.
    Notify(ClientEvent),
    /// Forward a business event to the dispatcher, in order.
    Dispatch(ServerEvent),
}

/// Connection lifecycle for one client.
///
/// Generic over `Instant` so tests can drive virtual time.
pub struct EventConnection<I = Instant>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    state: ConnectionState,
    config: GatewayConfig,
    retry_delay: RetryDelayFn,
    token: Option<String>,
    failures: u32,

    connect_deadline: Option<I>,
    next_heartbeat: Option<I>,
    pong_deadline: Option<I>,
    reconnect_at: Option<I>,
    pending_ping: Option<u64>,

    latency: Option<Duration>,
    last_error: Option<ErrorPayload>,
}

impl<I> fmt::Debug for EventConnection<I>
where
    I: Copy + Ord + Add<Duration, Output = I> + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConnection")
            .field("state", &self.state)
            .field("failures", &self.failures)
            .field("next_deadline", &self.next_deadline())
            .field("latency", &self.latency)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl<I> EventConnection<I>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_retry_delay(config, default_retry_delay_fn())
    }

    pub fn with_retry_delay(config: GatewayConfig, retry_delay: RetryDelayFn) -> Self {
        Self {
            state: ConnectionState::Idle,
            config,
            retry_delay,
            token: None,
            failures: 0,
            connect_deadline: None,
            next_heartbeat: None,
            pong_deadline: None,
            reconnect_at: None,
            pending_ping: None,
            latency: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Consecutive failed attempts since the last `Ready`.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Round trip of the most recent heartbeat.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&ErrorPayload> {
        self.last_error.as_ref()
    }

    fn has_transport(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    fn clear_timers(&mut self) {
        self.connect_deadline = None;
        self.next_heartbeat = None;
        self.pong_deadline = None;
        self.reconnect_at = None;
        self.pending_ping = None;
    }

    /// Earliest pending timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<I> {
        [
            self.connect_deadline,
            self.next_heartbeat,
            self.pong_deadline,
            self.reconnect_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Start (or restart) a connection attempt.
    pub fn connect(&mut self, token: impl Into<String>, now: I) -> Vec<ConnectionAction> {
        let token = token.into();
        let mut actions = Vec::new();

        if self.has_transport() {
            actions.push(ConnectionAction::Close {
                reason: "reconnecting".to_string(),
            });
        }
        self.clear_timers();

        let url = self.config.handshake_url(&token);
        self.token = Some(token);
        self.state = ConnectionState::Connecting;
        self.connect_deadline = Some(now + self.config.connect_timeout);
        info!(attempt = self.failures + 1, "connecting");

        actions.push(ConnectionAction::Notify(ClientEvent::Connecting));
        actions.push(ConnectionAction::Open { url });
        actions
    }

    /// The transport finished its handshake; start the heartbeat.
    pub fn transport_opened(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            debug!(state = ?self.state, "ignoring stale transport open");
            return Vec::new();
        }
        self.next_heartbeat = Some(now + self.config.heartbeat_interval);
        Vec::new()
    }

    /// Fire every timer that is due.
    ///
    /// `unix_ms` is wall-clock time in milliseconds, carried by Pings.
    pub fn tick(&mut self, now: I, unix_ms: u64) -> Vec<ConnectionAction> {
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            return match self.token.clone() {
                Some(token) => self.connect(token, now),
                None => Vec::new(),
            };
        }

        if self.connect_deadline.is_some_and(|at| at <= now) {
            warn!("no frame before connect timeout");
            return self.drop_transport(now, "connect timeout", true);
        }

        if self.pong_deadline.is_some_and(|at| at <= now) {
            warn!("heartbeat not acknowledged");
            return self.drop_transport(now, "pong timeout", true);
        }

        let mut actions = Vec::new();
        if self.next_heartbeat.is_some_and(|at| at <= now) {
            self.next_heartbeat = Some(now + self.config.heartbeat_interval);
            // One ping in flight; its pong deadline stands until answered.
            if self.pending_ping.is_none() {
                self.pending_ping = Some(unix_ms);
                self.pong_deadline = Some(now + self.config.pong_timeout);
                actions.push(ConnectionAction::Send(ClientFrame::Ping { data: unix_ms }));
            } else {
                debug!("previous ping unanswered, skipping heartbeat");
            }
        }
        actions
    }

    /// Process one decoded frame.
    ///
    /// # Errors
    ///
    /// `ConnectionError::InvalidTransition` if the server sent a frame the
    /// protocol forbids in the current state.
    pub fn handle_event(
        &mut self,
        event: ServerEvent,
        now: I,
        unix_ms: u64,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if !self.has_transport() {
            debug!(kind = event.kind(), state = ?self.state, "dropping frame without transport");
            return Ok(Vec::new());
        }
        self.connect_deadline = None;

        match (self.state, event) {
            (_, ServerEvent::Ping { data }) => {
                Ok(vec![ConnectionAction::Send(ClientFrame::Pong { data })])
            }

            (_, ServerEvent::Pong { data }) => {
                if self.pending_ping != Some(data) {
                    debug!(data, "ignoring unmatched pong");
                    return Ok(Vec::new());
                }
                self.pending_ping = None;
                self.pong_deadline = None;
                let latency = Duration::from_millis(unix_ms.saturating_sub(data));
                self.latency = Some(latency);
                Ok(vec![ConnectionAction::Notify(ClientEvent::Heartbeat {
                    latency,
                })])
            }

            (_, ServerEvent::Error { error }) => {
                warn!(?error, "server reported an error");
                let payload = ErrorPayload::Protocol(error);
                self.last_error = Some(payload.clone());
                let mut actions = vec![ConnectionAction::Notify(ClientEvent::Error(payload))];
                actions.extend(self.drop_transport(now, "server error", true));
                Ok(actions)
            }

            (ConnectionState::Connecting, event) if is_handshake(&event) => Ok(Vec::new()),

            (ConnectionState::Connecting, event) if opens_with_ready(&event) => {
                self.state = ConnectionState::Connected;
                self.failures = 0;
                info!("connected");
                Ok(vec![
                    ConnectionAction::Notify(ClientEvent::Connected),
                    ConnectionAction::Dispatch(event),
                ])
            }

            (ConnectionState::Connected, event) if contains_ready(&event) => {
                Err(ConnectionError::InvalidTransition {
                    state: self.state,
                    event: "Ready",
                })
            }

            (ConnectionState::Connecting, event) => Err(ConnectionError::InvalidTransition {
                state: self.state,
                event: event.kind(),
            }),

            (_, event) => Ok(vec![ConnectionAction::Dispatch(event)]),
        }
    }

    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// `ConnectionError::InvalidState` unless connected.
    pub fn send(&self, frame: ClientFrame) -> Result<ConnectionAction, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "send",
            });
        }
        Ok(ConnectionAction::Send(frame))
    }

    /// The transport closed on its own.
    pub fn transport_closed(&mut self, now: I) -> Vec<ConnectionAction> {
        self.drop_transport(now, "transport closed", false)
    }

    /// The transport failed.
    pub fn transport_error(&mut self, now: I, error: impl Into<String>) -> Vec<ConnectionAction> {
        if !self.has_transport() {
            return Vec::new();
        }
        let payload = ErrorPayload::Transport(error.into());
        self.last_error = Some(payload.clone());
        let mut actions = vec![ConnectionAction::Notify(ClientEvent::Error(payload))];
        actions.extend(self.drop_transport(now, "transport error", true));
        actions
    }

    /// Force the connection down after a contract breach by the server.
    pub fn abort(&mut self, now: I, error: &ConnectionError) -> Vec<ConnectionAction> {
        let payload = ErrorPayload::InvalidTransition(error.to_string());
        self.last_error = Some(payload.clone());
        let mut actions = vec![ConnectionAction::Notify(ClientEvent::Error(payload))];
        actions.extend(self.drop_transport(now, "protocol violation", true));
        actions
    }

    /// Manual disconnect. Clears every timer, including a pending reconnect,
    /// and never schedules a new one.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        self.clear_timers();
        if !self.has_transport() {
            return Vec::new();
        }
        self.state = ConnectionState::Disconnected;
        info!("disconnected by client");
        vec![
            ConnectionAction::Close {
                reason: "client disconnect".to_string(),
            },
            ConnectionAction::Notify(ClientEvent::Disconnected),
        ]
    }

    /// Move to `Disconnected` once and apply the reconnect policy. A second
    /// signal for the same transport is ignored.
    fn drop_transport(&mut self, now: I, reason: &str, close: bool) -> Vec<ConnectionAction> {
        if !self.has_transport() {
            return Vec::new();
        }
        self.clear_timers();
        self.state = ConnectionState::Disconnected;

        let mut actions = Vec::new();
        if close {
            actions.push(ConnectionAction::Close {
                reason: reason.to_string(),
            });
        }
        actions.push(ConnectionAction::Notify(ClientEvent::Disconnected));

        if self.config.auto_reconnect && self.token.is_some() {
            let delay = (self.retry_delay)(self.failures);
            self.reconnect_at = Some(now + delay);
            self.failures += 1;
            info!(%reason, ?delay, failures = self.failures, "scheduling reconnect");
        } else {
            info!(%reason, "disconnected");
        }
        actions
    }
}

fn entry_type(entry: &Value) -> Option<&str> {
    entry.get("type").and_then(Value::as_str)
}

/// `Authenticated`, or a batch holding nothing else.
fn is_handshake(event: &ServerEvent) -> bool {
    match event {
        ServerEvent::Authenticated => true,
        ServerEvent::Bulk { v } => v
            .iter()
            .all(|entry| entry_type(entry) == Some("Authenticated")),
        _ => false,
    }
}

/// `Ready`, or a batch whose first entry after any `Authenticated` is `Ready`.
fn opens_with_ready(event: &ServerEvent) -> bool {
    match event {
        ServerEvent::Ready { .. } => true,
        ServerEvent::Bulk { v } => v
            .iter()
            .map(entry_type)
            .find(|kind| *kind != Some("Authenticated"))
            == Some(Some("Ready")),
        _ => false,
    }
}

/// `Ready`, or a batch with `Ready` anywhere in it.
fn contains_ready(event: &ServerEvent) -> bool {
    match event {
        ServerEvent::Ready { .. } => true,
        ServerEvent::Bulk { v } => v.iter().any(|entry| entry_type(entry) == Some("Ready")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::protocol::ErrorReason;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn fixed_delay() -> RetryDelayFn {
        Arc::new(|n: u32| Duration::from_secs(u64::from(n) + 1))
    }

    fn conn() -> EventConnection<Instant> {
        EventConnection::with_retry_delay(GatewayConfig::default(), fixed_delay())
    }

    fn ready() -> ServerEvent {
        ServerEvent::Ready {
            users: vec![],
            servers: vec![],
            channels: vec![],
            members: vec![],
            emojis: vec![],
        }
    }

    fn connected(t0: Instant) -> EventConnection<Instant> {
        let mut c = conn();
        c.connect("tok", t0);
        c.transport_opened(t0);
        c.handle_event(ready(), t0, 0).unwrap();
        c
    }

    #[test]
    fn test_handshake_url() {
        let config = GatewayConfig {
            ws_url: "wss://ws.example".into(),
            ..GatewayConfig::default()
        };
        assert_eq!(
            config.handshake_url("a b&c"),
            "wss://ws.example?version=1&format=json&token=a%20b%26c"
        );
    }

    #[test]
    fn test_connect_then_ready() {
        let t0 = Instant::now();
        let mut c = conn();
        assert_eq!(c.state(), ConnectionState::Idle);

        let actions = c.connect("tok", t0);
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert!(matches!(actions[0], ConnectionAction::Notify(ClientEvent::Connecting)));
        assert!(matches!(&actions[1], ConnectionAction::Open { url } if url.contains("token=tok")));
        assert_eq!(c.next_deadline(), Some(t0 + DEFAULT_CONNECT_TIMEOUT));

        // Handshake acknowledgement is fine while connecting.
        assert!(c.handle_event(ServerEvent::Authenticated, t0, 0).unwrap().is_empty());

        let actions = c.handle_event(ready(), t0, 0).unwrap();
        assert_eq!(c.state(), ConnectionState::Connected);
        assert!(matches!(actions[0], ConnectionAction::Notify(ClientEvent::Connected)));
        assert!(matches!(actions[1], ConnectionAction::Dispatch(ServerEvent::Ready { .. })));
    }

    #[test]
    fn test_business_event_while_connecting_is_invalid() {
        let t0 = Instant::now();
        let mut c = conn();
        c.connect("tok", t0);
        let err = c
            .handle_event(ServerEvent::ChannelDelete { id: "C1".into() }, t0, 0)
            .unwrap_err();
        assert_eq!(
            err,
            ConnectionError::InvalidTransition {
                state: ConnectionState::Connecting,
                event: "ChannelDelete",
            }
        );
    }

    #[test]
    fn test_second_ready_is_invalid() {
        let t0 = Instant::now();
        let mut c = connected(t0);
        let err = c.handle_event(ready(), t0, 0).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidTransition { .. }));

        let actions = c.abort(t0, &err);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(matches!(
            actions[0],
            ConnectionAction::Notify(ClientEvent::Error(ErrorPayload::InvalidTransition(_)))
        ));
    }

    #[test]
    fn test_bulk_led_by_ready_connects() {
        let t0 = Instant::now();
        let mut c = conn();
        c.connect("tok", t0);
        let bulk = ServerEvent::Bulk {
            v: vec![json!({ "type": "Ready" }), json!({ "type": "Logout" })],
        };
        c.handle_event(bulk, t0, 0).unwrap();
        assert_eq!(c.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_ready_later_in_bulk_while_connected_is_invalid() {
        let t0 = Instant::now();
        let mut c = connected(t0);
        let bulk = ServerEvent::Bulk {
            v: vec![json!({ "type": "Logout" }), json!({ "type": "Ready" })],
        };
        let err = c.handle_event(bulk, t0, 0).unwrap_err();
        assert_eq!(
            err,
            ConnectionError::InvalidTransition {
                state: ConnectionState::Connected,
                event: "Ready",
            }
        );
    }

    #[test]
    fn test_bulk_authenticated_then_ready_connects() {
        let t0 = Instant::now();
        let mut c = conn();
        c.connect("tok", t0);
        c.transport_opened(t0);
        let bulk = ServerEvent::Bulk {
            v: vec![json!({ "type": "Authenticated" }), json!({ "type": "Ready" })],
        };
        let actions = c.handle_event(bulk, t0, 0).unwrap();
        assert_eq!(c.state(), ConnectionState::Connected);
        assert!(matches!(actions[0], ConnectionAction::Notify(ClientEvent::Connected)));
        assert!(matches!(actions[1], ConnectionAction::Dispatch(ServerEvent::Bulk { .. })));

        let handshake_only = ServerEvent::Bulk {
            v: vec![json!({ "type": "Authenticated" })],
        };
        let mut c = conn();
        c.connect("tok", t0);
        assert!(c.handle_event(handshake_only, t0, 0).unwrap().is_empty());
        assert_eq!(c.state(), ConnectionState::Connecting);

        let out_of_order = ServerEvent::Bulk {
            v: vec![json!({ "type": "Logout" }), json!({ "type": "Ready" })],
        };
        assert!(c.handle_event(out_of_order, t0, 0).is_err());
    }

    #[test]
    fn test_heartbeat_and_latency() {
        let t0 = Instant::now();
        let mut c = connected(t0);
        let interval = DEFAULT_HEARTBEAT_INTERVAL;

        assert!(c.tick(t0, 1_000).is_empty());
        let actions = c.tick(t0 + interval, 5_000);
        assert!(matches!(
            actions[0],
            ConnectionAction::Send(ClientFrame::Ping { data: 5_000 })
        ));
        assert_eq!(c.next_deadline(), Some(t0 + interval + DEFAULT_PONG_TIMEOUT));

        // A stale pong is ignored.
        assert!(c.handle_event(ServerEvent::Pong { data: 1 }, t0, 0).unwrap().is_empty());

        let actions = c
            .handle_event(ServerEvent::Pong { data: 5_000 }, t0 + interval, 5_120)
            .unwrap();
        assert_eq!(c.latency(), Some(Duration::from_millis(120)));
        assert!(matches!(
            actions[0],
            ConnectionAction::Notify(ClientEvent::Heartbeat { .. })
        ));
        assert_eq!(c.next_deadline(), Some(t0 + interval + interval));
    }

    #[test]
    fn test_missed_pong_forces_disconnect() {
        let t0 = Instant::now();
        let mut c = connected(t0);
        let ping_at = t0 + DEFAULT_HEARTBEAT_INTERVAL;
        c.tick(ping_at, 0);

        let actions = c.tick(ping_at + DEFAULT_PONG_TIMEOUT, 0);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(matches!(&actions[0], ConnectionAction::Close { reason } if reason == "pong timeout"));
    }

    #[test]
    fn test_unanswered_ping_is_not_replaced() {
        let t0 = Instant::now();
        let config = GatewayConfig {
            heartbeat_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(8),
            ..GatewayConfig::default()
        };
        let mut c = EventConnection::with_retry_delay(config, fixed_delay());
        c.connect("tok", t0);
        c.transport_opened(t0);
        c.handle_event(ready(), t0, 0).unwrap();

        let mut pings = 0;
        for sec in 1..=50u64 {
            let actions = c.tick(t0 + Duration::from_secs(sec), sec * 1_000);
            pings += actions
                .iter()
                .filter(|a| matches!(a, ConnectionAction::Send(ClientFrame::Ping { .. })))
                .count();
            if c.state() == ConnectionState::Disconnected {
                assert_eq!(sec, 13);
                break;
            }
        }
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(pings, 1);
    }

    #[test]
    fn test_server_ping_answered() {
        let t0 = Instant::now();
        let mut c = connected(t0);
        let actions = c.handle_event(ServerEvent::Ping { data: 9 }, t0, 0).unwrap();
        assert!(matches!(
            actions[0],
            ConnectionAction::Send(ClientFrame::Pong { data: 9 })
        ));
    }

    #[test]
    fn test_connect_timeout() {
        let t0 = Instant::now();
        let mut c = conn();
        c.connect("tok", t0);
        c.transport_opened(t0);
        c.tick(t0 + DEFAULT_CONNECT_TIMEOUT, 0);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(c.failures(), 1);
    }

    #[test]
    fn test_close_is_idempotent_and_schedules_reconnect() {
        let t0 = Instant::now();
        let mut c = connected(t0);

        let first = c.transport_closed(t0);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(matches!(first[0], ConnectionAction::Notify(ClientEvent::Disconnected)));
        assert_eq!(c.failures(), 1);
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_secs(1)));

        assert!(c.transport_closed(t0).is_empty());
        assert!(c.transport_error(t0, "again").is_empty());
        assert_eq!(c.failures(), 1);

        let actions = c.tick(t0 + Duration::from_secs(1), 0);
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert!(actions.iter().any(|a| matches!(a, ConnectionAction::Open { .. })));

        // A second failure waits longer; Ready resets the counter.
        c.transport_closed(t0);
        assert_eq!(c.failures(), 2);
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_secs(2)));
        c.tick(t0 + Duration::from_secs(2), 0);
        c.handle_event(ready(), t0, 0).unwrap();
        assert_eq!(c.failures(), 0);
    }

    #[test]
    fn test_error_frame_records_and_disconnects() {
        let t0 = Instant::now();
        let mut c = connected(t0);
        let actions = c
            .handle_event(
                ServerEvent::Error {
                    error: ErrorReason::InvalidSession,
                },
                t0,
                0,
            )
            .unwrap();
        assert_eq!(
            c.last_error(),
            Some(&ErrorPayload::Protocol(ErrorReason::InvalidSession))
        );
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(actions.iter().any(|a| matches!(a, ConnectionAction::Close { .. })));
        // Standard reconnect policy still applies.
        assert!(c.next_deadline().is_some());
    }

    #[test]
    fn test_manual_disconnect_cancels_everything() {
        let t0 = Instant::now();
        let mut c = connected(t0);
        let actions = c.disconnect();
        assert_eq!(actions.len(), 2);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(c.next_deadline(), None);
        assert!(c.disconnect().is_empty());

        // A pending reconnect is cancelled too.
        let mut c = connected(t0);
        c.transport_closed(t0);
        assert!(c.next_deadline().is_some());
        c.disconnect();
        assert_eq!(c.next_deadline(), None);
        assert!(c.tick(t0 + Duration::from_secs(3600), 0).is_empty());
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_no_reconnect_when_disabled() {
        let t0 = Instant::now();
        let config = GatewayConfig {
            auto_reconnect: false,
            ..GatewayConfig::default()
        };
        let mut c = EventConnection::with_retry_delay(config, fixed_delay());
        c.connect("tok", t0);
        c.transport_closed(t0);
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn test_send_requires_connection() {
        let t0 = Instant::now();
        let mut c = conn();
        let frame = ClientFrame::BeginTyping {
            channel: "C1".into(),
        };
        assert!(matches!(
            c.send(frame.clone()),
            Err(ConnectionError::InvalidState { .. })
        ));
        c.connect("tok", t0);
        c.handle_event(ready(), t0, 0).unwrap();
        assert!(c.send(frame).is_ok());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect,
        Opened,
        Closed,
        Error,
        Ready,
        Business,
        Advance(u64),
        Disconnect,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Connect),
            Just(Op::Opened),
            Just(Op::Closed),
            Just(Op::Error),
            Just(Op::Ready),
            Just(Op::Business),
            (0u64..120_000).prop_map(Op::Advance),
            Just(Op::Disconnect),
        ]
    }

    proptest! {
        #[test]
        fn prop_ready_only_accepted_while_connecting(ops in prop::collection::vec(op(), 0..64)) {
            let mut now = Instant::now();
            let mut c = conn();

            for op in ops {
                let before = c.state();
                match op {
                    Op::Connect => {
                        c.connect("tok", now);
                        prop_assert_eq!(c.state(), ConnectionState::Connecting);
                    }
                    Op::Opened => {
                        c.transport_opened(now);
                    }
                    Op::Closed => {
                        c.transport_closed(now);
                        if before == ConnectionState::Idle {
                            prop_assert_eq!(c.state(), ConnectionState::Idle);
                        } else {
                            prop_assert_eq!(c.state(), ConnectionState::Disconnected);
                        }
                    }
                    Op::Error => {
                        c.transport_error(now, "boom");
                    }
                    Op::Ready => {
                        let result = c.handle_event(ready(), now, 0);
                        match before {
                            ConnectionState::Connecting => {
                                prop_assert!(result.is_ok());
                                prop_assert_eq!(c.state(), ConnectionState::Connected);
                            }
                            ConnectionState::Connected => {
                                prop_assert!(result.is_err());
                            }
                            _ => {
                                prop_assert!(result.is_ok_and(|a| a.is_empty()));
                            }
                        }
                    }
                    Op::Business => {
                        let result = c.handle_event(ServerEvent::ChannelDelete { id: "C".into() }, now, 0);
                        if before == ConnectionState::Connecting {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                        }
                        prop_assert_eq!(c.state(), before);
                    }
                    Op::Advance(ms) => {
                        now = now + Duration::from_millis(ms);
                        c.tick(now, 0);
                    }
                    Op::Disconnect => {
                        c.disconnect();
                        prop_assert_eq!(c.next_deadline(), None);
                        prop_assert_ne!(c.state(), ConnectionState::Connected);
                    }
                }
            }
        }
    }
}
