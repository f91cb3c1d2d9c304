//! Loopback operator console: an SSE feed of loop events and a resume hook
//! for manual-intervention pauses.

use anyhow::{Result, anyhow};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

use crate::orchestrator::LoopEvent;

/// Ports tried after the configured one when it is taken.
const PORT_FALLBACKS: u16 = 9;

#[derive(Clone)]
struct ConsoleState {
    resume_tx: mpsc::Sender<()>,
    events: broadcast::Sender<LoopEvent>,
}

/// A running console. The server task lives as long as the runtime.
pub struct OperatorConsole {
    pub addr: SocketAddr,
}

impl LoopEvent {
    fn to_sse_event(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(self.name()).data(data)
    }
}

pub fn router(resume_tx: mpsc::Sender<()>, events: broadcast::Sender<LoopEvent>) -> Router {
    let state = Arc::new(ConsoleState { resume_tx, events });
    Router::new()
        .route("/resume", post(resume_handler))
        .route("/events", get(sse_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Bind on loopback at `port`, falling back through the next few ports.
pub async fn start(
    port: u16,
    resume_tx: mpsc::Sender<()>,
    events: broadcast::Sender<LoopEvent>,
) -> Result<OperatorConsole> {
    let mut bound = None;
    for p in port..=port.saturating_add(PORT_FALLBACKS) {
        match TcpListener::bind(("127.0.0.1", p)).await {
            Ok(listener) => {
                bound = Some(listener);
                break;
            }
            Err(e) => debug!("port {} unavailable: {}", p, e),
        }
    }
    let listener = bound.ok_or_else(|| {
        anyhow!(
            "could not bind any port in {}..={}",
            port,
            port.saturating_add(PORT_FALLBACKS)
        )
    })?;
    let addr = listener.local_addr()?;
    info!("operator console at http://{}", addr);

    let app = router(resume_tx, events);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("operator console stopped: {}", e);
        }
    });

    Ok(OperatorConsole { addr })
}

async fn resume_handler(State(state): State<Arc<ConsoleState>>) -> (StatusCode, &'static str) {
    info!("POST /resume");
    match state.resume_tx.try_send(()) {
        Ok(()) => (StatusCode::ACCEPTED, "resumed"),
        Err(mpsc::error::TrySendError::Full(())) => (StatusCode::OK, "resume already pending"),
        Err(mpsc::error::TrySendError::Closed(())) => (StatusCode::GONE, "run is over"),
    }
}

async fn sse_handler(
    State(state): State<Arc<ConsoleState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result: Result<LoopEvent, _>| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
