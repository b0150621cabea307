use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use duet_settings::{DuetSettings, PolicySettings};
use duet_store::PersistenceLog;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::connection;
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub policy: PolicySettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&DuetSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &DuetSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_send_queue: server.max_send_queue,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(server.client_timeout_secs),
            cleanup_interval: Duration::from_secs(server.cleanup_interval_secs),
            policy: settings.policy,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health))
        .route("/api/session/create", post(api::create_session))
        .route("/api/session/{id}", get(api::get_session))
        .route("/api/sessions/list", get(api::list_sessions))
        .route("/api/sessions/{id}/delete", delete(api::delete_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the accept loop and the sweeper. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    log: Arc<dyn PersistenceLog>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SessionRegistry::new(config.max_send_queue));
    let router = Arc::new(MessageRouter::new(log, registry, config.policy));
    let shutdown = CancellationToken::new();

    let cleanup = connection::start_cleanup_task(
        Arc::clone(&router),
        config.cleanup_interval,
        config.client_timeout,
        shutdown.clone(),
    );

    let app_state = AppState {
        router: Arc::clone(&router),
        heartbeat_interval: config.heartbeat_interval,
        shutdown: shutdown.clone(),
    };

    let app = build_router(app_state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "duet server started");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server terminated");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        router,
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Close every socket, stop accepting and wait for background tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
        let _ = self.cleanup.await;
        tracing::info!("duet server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn_id, rx) = state.router.registry().register();
    tracing::info!(connection_id = %conn_id, "websocket connected");

    connection::handle_ws_connection(
        socket,
        conn_id,
        rx,
        state.router,
        state.heartbeat_interval,
        state.shutdown,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_store::{Database, SqliteLog};
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message as TungMessage;

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start_test_server() -> ServerHandle {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let log = Arc::new(SqliteLog::new(Database::in_memory().unwrap()));
        start(config, log).await.unwrap()
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", handle.port())
    }

    async fn connect(handle: &ServerHandle) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", handle.port()))
            .await
            .unwrap();
        ws
    }

    async fn emit(ws: &mut Ws, frame: Value) {
        ws.send(TungMessage::Text(frame.to_string().into())).await.unwrap();
    }

    async fn recv(ws: &mut Ws) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .unwrap();
            if let TungMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn health_reports_database() {
        let handle = start_test_server().await;
        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["database"], "ok");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn session_api_round_trip() {
        let handle = start_test_server().await;
        let client = reqwest::Client::new();

        let created: Value = client
            .post(url(&handle, "/api/session/create"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["sessionId"].as_str().unwrap().to_string();
        assert_eq!(id.len(), duet_core::ids::SESSION_CODE_LEN);

        let fetched: Value = client
            .get(url(&handle, &format!("/api/session/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["session"]["id"], id.as_str());
        assert!(fetched["session"]["ended_at"].is_null());
        assert_eq!(fetched["messages"], json!([]));

        let listed: Value = client
            .get(url(&handle, "/api/sessions/list"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["sessions"][0]["id"], id.as_str());
        assert_eq!(listed["sessions"][0]["message_count"], 0);

        let deleted: Value = client
            .delete(url(&handle, &format!("/api/sessions/{id}/delete")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(deleted, json!({"success": true}));

        let missing = client
            .get(url(&handle, &format!("/api/session/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        let body: Value = missing.json().await.unwrap();
        assert_eq!(body, json!({"error": "Session not found"}));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn websocket_conversation_end_to_end() {
        let handle = start_test_server().await;
        let created: Value = reqwest::Client::new()
            .post(url(&handle, "/api/session/create"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let sid = created["sessionId"].clone();

        let mut expert = connect(&handle).await;
        emit(&mut expert, json!({"event": "join-session", "data": {"sessionId": sid, "role": "expert"}})).await;
        assert_eq!(recv(&mut expert).await, json!({"event": "load-messages", "data": []}));

        let mut learner = connect(&handle).await;
        emit(&mut learner, json!({"event": "join-session", "data": {"sessionId": sid, "role": "learner"}})).await;
        assert_eq!(recv(&mut learner).await, json!({"event": "load-messages", "data": []}));
        assert_eq!(
            recv(&mut expert).await,
            json!({"event": "user-joined", "data": {"role": "learner"}})
        );

        emit(
            &mut expert,
            json!({"event": "send-message", "data": {"sessionId": sid, "role": "expert", "content": "Hello", "message_type": "text"}}),
        )
        .await;
        let seen_by_expert = recv(&mut expert).await;
        let seen_by_learner = recv(&mut learner).await;
        assert_eq!(seen_by_expert, seen_by_learner);
        assert_eq!(seen_by_learner["data"]["id"], 1);

        emit(&mut learner, json!({"event": "nonsense"})).await;
        let err = recv(&mut learner).await;
        assert_eq!(err["event"], "error");
        assert_eq!(err["data"]["code"], "INVALID_EVENT");

        emit(&mut expert, json!({"event": "end-session", "data": {"sessionId": sid}})).await;
        assert_eq!(recv(&mut expert).await["event"], "session-ended");
        assert_eq!(recv(&mut learner).await["event"], "session-ended");

        let fetched: Value = reqwest::get(url(&handle, &format!("/api/session/{}", sid.as_str().unwrap())))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(fetched["session"]["ended_at"].is_i64());
        assert_eq!(fetched["messages"].as_array().unwrap().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_leaves_room_silently() {
        let handle = start_test_server().await;
        let session = handle.router().log().create_session().await.unwrap();
        let sid = json!(session.id);

        let mut a = connect(&handle).await;
        emit(&mut a, json!({"event": "join-session", "data": {"sessionId": sid, "role": "expert"}})).await;
        recv(&mut a).await;
        let mut b = connect(&handle).await;
        emit(&mut b, json!({"event": "join-session", "data": {"sessionId": sid, "role": "learner"}})).await;
        recv(&mut b).await;
        recv(&mut a).await;

        b.close(None).await.unwrap();
        for _ in 0..50 {
            if handle.router().registry().members(&session.id).len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.router().registry().members(&session.id).len(), 1);

        handle.shutdown().await;
    }

    #[test]
    fn config_from_settings() {
        let mut settings = DuetSettings::default();
        settings.server.port = 4321;
        settings.policy.reject_ended_sends = false;
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 4321);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.client_timeout, Duration::from_secs(90));
        assert!(!config.policy.reject_ended_sends);
    }
}
