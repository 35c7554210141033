//! Cross-layer tests: frames through the connection state machine into the
//! dispatcher and store, permissions over the resulting state, and a full
//! client against a local websocket server.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::RwLock;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::api::{RestApi, Route};
    use crate::auth::Session;
    use crate::client::{Client, ClientOptions};
    use crate::engine::dispatcher::{DispatchOptions, Dispatcher};
    use crate::engine::events::{ClientEvent, ErrorPayload};
    use crate::engine::permissions::{
        DEFAULT_VIEW_ONLY, PermissionOptions, Permissions, Target, calculate_permission,
        channel_permissions,
    };
    use crate::error::ApiError;
    use crate::gateway::backoff::RetryDelayFn;
    use crate::gateway::connection::{
        ConnectionAction, ConnectionState, EventConnection, GatewayConfig,
    };
    use crate::gateway::protocol::{ProtocolVersion, ServerEvent};
    use crate::store::{MemberKey, ObjectStore};

    // ── Helpers ──────────────────────────────────────────────────

    /// REST collaborator answering from a fixed route table.
    struct Fixtures(HashMap<String, Value>);

    #[async_trait]
    impl RestApi for Fixtures {
        async fn get(&self, route: Route) -> Result<Value, ApiError> {
            let path = route.path();
            self.0.get(&path).cloned().ok_or(ApiError::Status {
                route: path,
                status: 404,
            })
        }
    }

    /// State machine and dispatcher wired together without a socket.
    struct Pipeline {
        conn: EventConnection,
        dispatcher: Dispatcher,
        store: Arc<RwLock<ObjectStore>>,
        now: Instant,
    }

    impl Pipeline {
        fn new() -> Self {
            let store = Arc::new(RwLock::new(ObjectStore::default()));
            let (notify, _) = broadcast::channel(256);
            let retry: RetryDelayFn = Arc::new(|_: u32| Duration::from_secs(1));
            Self {
                conn: EventConnection::with_retry_delay(GatewayConfig::default(), retry),
                dispatcher: Dispatcher::new(Arc::clone(&store), notify, DispatchOptions {
                    eager_fetching: false,
                    sync_unreads: false,
                }),
                store,
                now: Instant::now(),
            }
        }

        fn open(&mut self) -> Vec<ClientEvent> {
            let out = notifications(self.conn.connect("token", self.now));
            self.conn.transport_opened(self.now);
            out
        }

        /// Decode a frame and run it through both layers. Returns every
        /// notification, connection ones first.
        async fn frame(&mut self, frame: Value) -> Vec<ClientEvent> {
            let text = frame.to_string();
            let Ok(event) = ServerEvent::decode(ProtocolVersion::V1, &text) else {
                return Vec::new();
            };
            let actions = match self.conn.handle_event(event, self.now, 0) {
                Ok(actions) => actions,
                Err(e) => self.conn.abort(self.now, &e),
            };

            let mut out = Vec::new();
            for action in actions {
                match action {
                    ConnectionAction::Notify(event) => out.push(event),
                    ConnectionAction::Dispatch(event) => {
                        out.extend(self.dispatcher.dispatch(event).await)
                    }
                    _ => {}
                }
            }
            out
        }
    }

    fn notifications(actions: Vec<ConnectionAction>) -> Vec<ClientEvent> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                ConnectionAction::Notify(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn names(events: &[ClientEvent]) -> Vec<&'static str> {
        events.iter().map(ClientEvent::name).collect()
    }

    fn ready_frame() -> Value {
        json!({
            "type": "Ready",
            "users": [
                { "_id": "01HUSERME00000000000000000", "username": "me", "relationship": "User" },
                { "_id": "01HUSEROWNER00000000000000", "username": "owner", "relationship": "Friend" }
            ],
            "servers": [{
                "_id": "01HSERVER00000000000000000",
                "owner": "01HUSEROWNER00000000000000",
                "name": "guild",
                "channels": ["01HCHANNEL0000000000000000"],
                "default_permissions": 1,
                "roles": {
                    "R2": { "name": "low", "permissions": { "a": 2, "d": 0 }, "rank": 2 },
                    "R1": { "name": "high", "permissions": { "a": 0, "d": 1 }, "rank": 1 }
                }
            }],
            "channels": [{
                "_id": "01HCHANNEL0000000000000000",
                "channel_type": "TextChannel",
                "server": "01HSERVER00000000000000000",
                "name": "general"
            }],
            "members": [{
                "_id": { "server": "01HSERVER00000000000000000", "user": "01HUSERME00000000000000000" },
                "roles": ["R1", "R2"]
            }],
            "emojis": []
        })
    }

    const ME: &str = "01HUSERME00000000000000000";
    const SERVER: &str = "01HSERVER00000000000000000";
    const CHANNEL: &str = "01HCHANNEL0000000000000000";

    // ── Pipeline ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_ready_then_events_in_order() {
        let mut p = Pipeline::new();
        assert_eq!(names(&p.open()), vec!["connecting"]);

        assert!(p.frame(json!({ "type": "Authenticated" })).await.is_empty());
        let out = p.frame(ready_frame()).await;
        assert_eq!(names(&out), vec!["connected", "ready"]);
        assert_eq!(p.conn.state(), ConnectionState::Connected);
        assert_eq!(p.store.read().self_id(), Some(ME));

        let out = p
            .frame(json!({
                "type": "Bulk",
                "v": [
                    { "type": "Message", "_id": "M1", "channel": CHANNEL, "author": ME, "content": "a" },
                    { "type": "Message", "_id": "M2", "channel": CHANNEL, "author": ME, "content": "b" },
                    { "type": "MessageDelete", "id": "M1", "channel": CHANNEL }
                ]
            }))
            .await;
        assert_eq!(
            names(&out),
            vec!["message_create", "message_create", "message_delete"]
        );
        let store = p.store.read();
        assert_eq!(store.messages.ids(), vec!["M2".to_string()]);
        assert_eq!(
            store.channels.get_ref(CHANNEL).unwrap().last_message_id.as_deref(),
            Some("M2")
        );
    }

    #[tokio::test]
    async fn test_second_ready_is_fatal_and_reconnects() {
        let mut p = Pipeline::new();
        p.open();
        p.frame(ready_frame()).await;

        let out = p.frame(ready_frame()).await;
        assert!(matches!(
            out.first(),
            Some(ClientEvent::Error(ErrorPayload::InvalidTransition(_)))
        ));
        assert!(names(&out).contains(&"disconnected"));
        assert_eq!(p.conn.state(), ConnectionState::Disconnected);
        assert!(p.conn.next_deadline().is_some());
    }

    #[tokio::test]
    async fn test_business_event_before_ready_is_rejected() {
        let mut p = Pipeline::new();
        p.open();
        let out = p
            .frame(json!({ "type": "ChannelDelete", "id": CHANNEL }))
            .await;
        assert!(matches!(
            out.first(),
            Some(ClientEvent::Error(ErrorPayload::InvalidTransition(_)))
        ));
        assert_eq!(p.conn.state(), ConnectionState::Disconnected);
    }

    // ── Store and permissions ────────────────────────────────────

    #[tokio::test]
    async fn test_role_fold_follows_rank_after_updates() {
        let mut p = Pipeline::new();
        p.open();
        p.frame(ready_frame()).await;

        let perms = {
            let store = p.store.read();
            let me = store.users.get_ref(ME).unwrap();
            let server = store.servers.get_ref(SERVER).unwrap();
            calculate_permission(&store, me, Target::Server(server), &PermissionOptions::default())
        };
        // default 0b01 | R2 allow 0b10, then R1 denies 0b01
        assert_eq!(perms, 0b10);

        p.frame(json!({
            "type": "ServerRoleUpdate", "id": SERVER, "role_id": "R1",
            "data": { "permissions": { "a": 0, "d": 0 } }
        }))
        .await;
        let perms = {
            let store = p.store.read();
            let me = store.users.get_ref(ME).unwrap();
            let server = store.servers.get_ref(SERVER).unwrap();
            calculate_permission(&store, me, Target::Server(server), &PermissionOptions::default())
        };
        assert_eq!(perms, 0b11);
    }

    #[tokio::test]
    async fn test_member_timeout_clamps_channel() {
        let mut p = Pipeline::new();
        p.open();
        p.frame(ready_frame()).await;
        p.frame(json!({
            "type": "ServerUpdate", "id": SERVER,
            "data": { "default_permissions": Permissions::all().bits() }
        }))
        .await;
        p.frame(json!({
            "type": "ServerMemberUpdate",
            "id": { "server": SERVER, "user": ME },
            "data": { "timeout": "2999-01-01T00:00:00Z", "roles": [] }
        }))
        .await;

        let store = p.store.read();
        let me = store.users.get_ref(ME).unwrap();
        let channel = store.channels.get_ref(CHANNEL).unwrap();
        let perms = channel_permissions(&store, me, channel, &PermissionOptions::default());
        assert_eq!(perms, DEFAULT_VIEW_ONLY);
    }

    #[tokio::test]
    async fn test_wipe_inside_bulk_keeps_order() {
        let mut p = Pipeline::new();
        p.open();
        p.frame(ready_frame()).await;

        let out = p
            .frame(json!({
                "type": "Bulk",
                "v": [
                    { "type": "Message", "_id": "M1", "channel": CHANNEL, "author": "SPAM", "content": "x" },
                    { "type": "UserPlatformWipe", "user_id": "SPAM", "flags": 0 },
                    { "type": "Message", "_id": "M2", "channel": CHANNEL, "author": ME, "content": "y" }
                ]
            }))
            .await;
        assert_eq!(
            names(&out),
            vec![
                "message_create",
                "message_delete_bulk",
                "user_update",
                "message_create"
            ]
        );
        assert_eq!(p.store.read().messages.ids(), vec!["M2".to_string()]);
    }

    #[tokio::test]
    async fn test_member_leave_for_self_cascades() {
        let mut p = Pipeline::new();
        p.open();
        p.frame(ready_frame()).await;

        let out = p
            .frame(json!({ "type": "ServerMemberLeave", "id": SERVER, "user": ME }))
            .await;
        assert_eq!(names(&out), vec!["server_leave"]);
        let store = p.store.read();
        assert!(!store.servers.has(SERVER));
        assert!(!store.channels.has(CHANNEL));
        assert!(!store.members.has_by_key(&MemberKey::new(SERVER, ME)));
    }

    // ── Full client over a real socket ───────────────────────────

    async fn next_named(
        events: &mut broadcast::Receiver<ClientEvent>,
        name: &str,
    ) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.name() == name {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_client_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(json!({ "type": "Authenticated" }).to_string().into()))
                .await
                .unwrap();
            ws.send(WsMessage::Text(ready_frame().to_string().into()))
                .await
                .unwrap();

            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    received.push(text.to_string());
                }
            }
            received
        });

        let options = ClientOptions {
            ws_url: format!("ws://{addr}/"),
            auto_reconnect: false,
            ..ClientOptions::default()
        };
        let mut client = Client::new(options).with_api(Arc::new(Fixtures(HashMap::new())));
        let mut events = client.subscribe();
        client.connect(Session::Bot("secret".into())).await;

        next_named(&mut events, "connected").await;
        next_named(&mut events, "ready").await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !client.is_ready() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_ready());
        assert_eq!(
            client.server_permissions(SERVER),
            Some(Permissions::from_bits_retain(0b10))
        );

        client.begin_typing(CHANNEL).unwrap();
        // Let the driver flush the frame before closing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_ready());

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(
            received
                .iter()
                .any(|frame| frame.contains("BeginTyping") && frame.contains(CHANNEL))
        );
    }
}
