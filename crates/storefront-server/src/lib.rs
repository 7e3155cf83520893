pub mod actions;
pub mod completion;
pub mod cooldown;
pub mod dispatch;
pub mod error;
pub mod journal;
pub mod orders;
pub mod plans;
pub mod sessions;
pub mod store;
pub mod transport;
pub mod ui;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use storefront_config::Config;
use storefront_contracts::{InboundEvent, InboundPayload, OrderStatus, API_VERSION};
use storefront_kernel::ACTION_TYPES;
use tokio::sync::watch;

pub use completion::{CompletionService, OpenAiCompatibleClient};
pub use dispatch::Dispatcher;
pub use error::EngineError;
pub use transport::{ChatTransport, RecordingTransport, TelegramTransport};

/// How a `serve` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Shutdown,
    /// A deferred restart was requested; the caller reloads config and serves again.
    Restart,
}

/// Deferred restart request shared between the engine and the serve loop.
#[derive(Clone)]
pub struct RestartSignal {
    tx: Arc<watch::Sender<bool>>,
    requests: Arc<AtomicUsize>,
}

impl Default for RestartSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(true);
        tracing::info!("restart requested");
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

pub async fn serve(cfg: Config) -> Result<ServeExit, String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let restart = RestartSignal::new();
    let (transport, completion) = collaborators(&cfg)?;
    let (app, _) = assemble(cfg, transport, completion, restart.clone()).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "listening");

    let shutdown = restart.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.wait() => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
            }
        })
        .await
        .map_err(|e| format!("serve failed: {e}"))?;

    Ok(if restart.is_requested() {
        ServeExit::Restart
    } else {
        ServeExit::Shutdown
    })
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let (transport, completion) = collaborators(&cfg)?;
    let (app, _) = assemble(cfg, transport, completion, RestartSignal::new()).await?;
    Ok(app)
}

/// Same router as [`build_app`] with caller-supplied collaborators. The
/// returned dispatcher shares state with the router.
pub async fn build_app_with(
    cfg: Config,
    transport: Arc<dyn ChatTransport>,
    completion: Arc<dyn CompletionService>,
) -> Result<(Router, Arc<Dispatcher>), String> {
    assemble(cfg, transport, completion, RestartSignal::new()).await
}

fn collaborators(
    cfg: &Config,
) -> Result<(Arc<dyn ChatTransport>, Arc<dyn CompletionService>), String> {
    let transport: Arc<dyn ChatTransport> = match cfg.transport.kind.as_str() {
        "telegram" => Arc::new(TelegramTransport::new(cfg)?),
        _ => Arc::new(RecordingTransport::new()),
    };
    let completion: Arc<dyn CompletionService> = Arc::new(OpenAiCompatibleClient::new(cfg)?);
    Ok((transport, completion))
}

async fn assemble(
    cfg: Config,
    transport: Arc<dyn ChatTransport>,
    completion: Arc<dyn CompletionService>,
    restart: RestartSignal,
) -> Result<(Router, Arc<Dispatcher>), String> {
    let store = store::Store::open(&cfg)
        .await
        .map_err(|e| format!("store open failed: {e}"))?;
    tracing::info!(
        store = %cfg.store.kind,
        transport = %cfg.transport.kind,
        "storefront engine ready"
    );
    let dispatcher = Arc::new(Dispatcher::new(
        &cfg,
        Arc::new(store),
        transport,
        completion,
        restart,
    ));
    let state = AppState {
        dispatcher: dispatcher.clone(),
    };
    let app = Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/events", post(events))
        .route("/v1/contracts", get(contracts))
        .with_state(state);
    Ok((app, dispatcher))
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<Value> {
    let statuses: Vec<&str> = [
        OrderStatus::PendingPayment,
        OrderStatus::AwaitingCheck,
        OrderStatus::Rejected,
        OrderStatus::Accepted,
    ]
    .into_iter()
    .map(OrderStatus::as_str)
    .collect();
    Json(json!({
        "version": API_VERSION,
        "actions": ACTION_TYPES,
        "order_statuses": statuses,
        "session_operations": sessions::SESSION_OPERATIONS,
        "event_kinds": ["text", "photo", "button"],
    }))
}

async fn events(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut event: InboundEvent = serde_json::from_value(raw)
        .map_err(|e| bad_request(format!("invalid event: {e}")))?;
    validate_event(&event).map_err(bad_request)?;
    let event_id = event
        .event_id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();
    let accepted = state.dispatcher.handle(event).await;
    Ok(Json(json!({ "accepted": accepted, "event_id": event_id })))
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"code": "validation_error", "message": message}})),
    )
}

fn validate_event(e: &InboundEvent) -> Result<(), String> {
    if e.event_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err("event_id must not be empty".to_string());
    }
    match &e.payload {
        InboundPayload::Text { text } if text.trim().is_empty() => {
            Err("text must not be empty".to_string())
        }
        InboundPayload::Photo { file_id } if file_id.trim().is_empty() => {
            Err("file_id must not be empty".to_string())
        }
        InboundPayload::Button { data, .. } if data.trim().is_empty() => {
            Err("data must not be empty".to_string())
        }
        _ => Ok(()),
    }
}
