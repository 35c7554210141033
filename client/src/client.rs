use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{HttpApi, RestApi, Route};
use crate::auth::Session;
use crate::config::{DEFAULT_API_URL, DEFAULT_CDN_URL, DEFAULT_WS_URL};
use crate::engine::dispatcher::{DispatchOptions, Dispatcher};
use crate::engine::events::{ClientEvent, ErrorPayload};
use crate::engine::permissions::{self, PermissionOptions, Permissions, Target};
use crate::error::ClientError;
use crate::gateway::backoff::{RetryDelayFn, default_retry_delay_fn};
use crate::gateway::connection::{
    ConnectionState, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PONG_TIMEOUT,
    EventConnection, GatewayConfig,
};
use crate::gateway::driver::{ConnectionStatus, Driver, SharedStatus};
use crate::gateway::protocol::{ClientFrame, ProtocolVersion, TransportFormat};
use crate::store::{
    Bot, Channel, Collection, Entity, HydrationContext, MemberKey, ObjectStore, Server,
    ServerMember, User, Webhook,
};

/// Capacity of the notification channel. Slow subscribers lag, they never
/// block the dispatcher.
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct ClientOptions {
    pub api_url: String,
    pub cdn_url: String,
    pub ws_url: String,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
    pub eager_fetching: bool,
    pub partials: bool,
    pub sync_unreads: bool,
    pub retry_delay: RetryDelayFn,
    pub notification_buffer: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            cdn_url: DEFAULT_CDN_URL.into(),
            ws_url: DEFAULT_WS_URL.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: true,
            eager_fetching: true,
            partials: true,
            sync_unreads: false,
            retry_delay: default_retry_delay_fn(),
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("api_url", &self.api_url)
            .field("cdn_url", &self.cdn_url)
            .field("ws_url", &self.ws_url)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("eager_fetching", &self.eager_fetching)
            .field("partials", &self.partials)
            .field("sync_unreads", &self.sync_unreads)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            ws_url: self.ws_url.clone(),
            protocol: ProtocolVersion::default(),
            format: TransportFormat::default(),
            heartbeat_interval: self.heartbeat_interval,
            pong_timeout: self.pong_timeout,
            connect_timeout: self.connect_timeout,
            auto_reconnect: self.auto_reconnect,
        }
    }

    fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            eager_fetching: self.eager_fetching,
            sync_unreads: self.sync_unreads,
        }
    }
}

/// Background tasks of one live connection.
struct Running {
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<ClientFrame>,
    driver: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Entry point: owns the store, the connection and the notification channel.
pub struct Client {
    options: ClientOptions,
    store: Arc<RwLock<ObjectStore>>,
    notify: broadcast::Sender<ClientEvent>,
    /// Collaborator set through [`Client::with_api`]; survives reconnects.
    custom_api: Option<Arc<dyn RestApi>>,
    /// Collaborator of the current session.
    api: Option<Arc<dyn RestApi>>,
    status: SharedStatus,
    ready: Arc<AtomicBool>,
    running: Option<Running>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let ctx = HydrationContext::new(options.cdn_url.clone());
        let (notify, _) = broadcast::channel(options.notification_buffer.max(1));
        Self {
            store: Arc::new(RwLock::new(ObjectStore::new(ctx, options.partials))),
            notify,
            custom_api: None,
            api: None,
            status: Arc::new(Mutex::new(ConnectionStatus::default())),
            ready: Arc::new(AtomicBool::new(false)),
            running: None,
            options,
        }
    }

    /// Use a specific REST collaborator instead of building an [`HttpApi`]
    /// from the session on connect.
    pub fn with_api(mut self, api: Arc<dyn RestApi>) -> Self {
        self.custom_api = Some(Arc::clone(&api));
        self.api = Some(api);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Receive every notification published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.notify.subscribe()
    }

    /// Shared handle to the object store. Hold the guard briefly: the
    /// dispatcher needs the write side for every event.
    pub fn store(&self) -> Arc<RwLock<ObjectStore>> {
        Arc::clone(&self.store)
    }

    // ── Connection ─────────────────────────────────────────────────

    /// Open the realtime connection. A live connection is closed first.
    ///
    /// Failures surface as [`ClientEvent::Error`] notifications and follow
    /// the reconnect policy.
    pub async fn connect(&mut self, session: Session) {
        self.disconnect().await;

        // REST calls must authenticate with the same session as the handshake.
        let api: Arc<dyn RestApi> = match &self.custom_api {
            Some(api) => Arc::clone(api),
            None => Arc::new(HttpApi::new(self.options.api_url.clone(), session.clone())),
        };
        self.api = Some(Arc::clone(&api));

        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            self.notify.clone(),
            self.options.dispatch_options(),
        )
        .with_api(api)
        .with_session_id(session.session_id().map(str::to_string));
        self.ready = dispatcher.ready_flag();

        let conn = EventConnection::with_retry_delay(
            self.options.gateway_config(),
            Arc::clone(&self.options.retry_delay),
        );
        let driver = Driver::new(
            conn,
            session.token().to_string(),
            events_tx,
            self.notify.clone(),
            commands_rx,
            Arc::clone(&self.status),
            cancel.clone(),
        );

        info!(bot = session.is_bot(), url = %self.options.ws_url, "starting client");
        self.running = Some(Running {
            dispatcher: tokio::spawn(dispatcher.run(events_rx, cancel.clone())),
            driver: tokio::spawn(driver.run()),
            commands: commands_tx,
            cancel,
        });
    }

    /// Close the connection and stop background tasks. Idempotent; no
    /// reconnect is scheduled afterwards.
    pub async fn disconnect(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.driver.await {
            warn!(error = %e, "driver task failed");
        }
        if let Err(e) = running.dispatcher.await {
            warn!(error = %e, "dispatcher task failed");
        }
        self.ready.store(false, Ordering::Release);
        debug!("client stopped");
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// `Ready` applied and the connection still up.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.state() == ConnectionState::Connected
    }

    pub fn latency(&self) -> Option<Duration> {
        self.status.lock().latency
    }

    pub fn last_error(&self) -> Option<ErrorPayload> {
        self.status.lock().last_error.clone()
    }

    // ── Outbound frames ────────────────────────────────────────────

    fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let running = self.running.as_ref().ok_or(ClientError::NotConnected)?;
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        running
            .commands
            .send(frame)
            .map_err(|_| ClientError::NotConnected)
    }

    /// # Errors
    ///
    /// [`ClientError::NotConnected`] unless connected.
    pub fn begin_typing(&self, channel_id: &str) -> Result<(), ClientError> {
        self.send(ClientFrame::BeginTyping {
            channel: channel_id.to_string(),
        })
    }

    pub fn end_typing(&self, channel_id: &str) -> Result<(), ClientError> {
        self.send(ClientFrame::EndTyping {
            channel: channel_id.to_string(),
        })
    }

    /// Ask for presence and typing events of a server.
    pub fn subscribe_server(&self, server_id: &str) -> Result<(), ClientError> {
        self.send(ClientFrame::Subscribe {
            server_id: server_id.to_string(),
        })
    }

    // ── Lookups ────────────────────────────────────────────────────

    /// Cached full record, or fetch it over REST and cache it.
    async fn fetch<T: Entity>(
        &self,
        id: &str,
        route: Route,
        select: fn(&mut ObjectStore) -> &mut Collection<T>,
    ) -> Result<T, ClientError> {
        {
            let mut store = self.store.write();
            let records = select(&mut *store);
            if records.has_full(id)
                && let Some(record) = records.get(id)
            {
                return Ok(record);
            }
        }

        let api = self.api.clone().ok_or(ClientError::NotConnected)?;
        let raw: Value = api.get(route).await?;
        if !raw.is_object() {
            return Err(ClientError::Missing {
                kind: T::KIND,
                id: id.to_string(),
            });
        }

        let mut store = self.store.write();
        Ok(select(&mut *store).get_or_create(id, &raw, None).clone())
    }

    /// # Errors
    ///
    /// [`ClientError::Api`] if the lookup fails, [`ClientError::NotConnected`]
    /// if no REST collaborator is configured yet.
    pub async fn fetch_user(&self, id: &str) -> Result<User, ClientError> {
        self.fetch(id, Route::User(id.to_string()), |s| &mut s.users)
            .await
    }

    pub async fn fetch_channel(&self, id: &str) -> Result<Channel, ClientError> {
        self.fetch(id, Route::Channel(id.to_string()), |s| &mut s.channels)
            .await
    }

    pub async fn fetch_server(&self, id: &str) -> Result<Server, ClientError> {
        self.fetch(id, Route::Server(id.to_string()), |s| &mut s.servers)
            .await
    }

    pub async fn fetch_bot(&self, id: &str) -> Result<Bot, ClientError> {
        self.fetch(id, Route::Bot(id.to_string()), |s| &mut s.bots)
            .await
    }

    pub async fn fetch_webhook(&self, id: &str) -> Result<Webhook, ClientError> {
        self.fetch(id, Route::Webhook(id.to_string()), |s| &mut s.webhooks)
            .await
    }

    pub async fn fetch_member(&self, key: &MemberKey) -> Result<ServerMember, ClientError> {
        self.fetch(&key.composite(), Route::Member(key.clone()), |s| &mut *s.members)
            .await
    }

    // ── Permissions ────────────────────────────────────────────────

    /// The current user's permissions in a cached channel.
    pub fn channel_permissions(&self, channel_id: &str) -> Option<Permissions> {
        let store = self.store.read();
        let me = store.current_user()?;
        let channel = store.channels.get_ref(channel_id)?;
        Some(permissions::channel_permissions(
            &store,
            me,
            channel,
            &PermissionOptions::default(),
        ))
    }

    /// The current user's permissions in a cached server.
    pub fn server_permissions(&self, server_id: &str) -> Option<Permissions> {
        let store = self.store.read();
        let me = store.current_user()?;
        let server = store.servers.get_ref(server_id)?;
        Some(permissions::server_permissions(
            &store,
            me,
            server,
            &PermissionOptions::default(),
        ))
    }

    /// Raw mask for any target, with explicit options.
    pub fn permission(&self, target: Target<'_>, options: &PermissionOptions<'_>) -> Option<u64> {
        let store = self.store.read();
        let me = store.current_user()?;
        Some(permissions::calculate_permission(&store, me, target, options))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
        }
    }
}
