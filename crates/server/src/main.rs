use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    codec::{decode_client, encode_controller, split_frames},
    domain::{ControllerSchema, ParamName},
    error::{ApiError, ErrorCode},
    protocol::{
        Change, ClientMessage, ControllerMessage, ModeRequest, ParamRequest, SeqQuery, StateFrame,
    },
};
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod driver;

use app_state::{AppState, StateEvent, HTTP_ORIGIN};
use config::load_settings;
use driver::LoggingDriver;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let state = Arc::new(AppState::new(
        settings.schema,
        Arc::new(LoggingDriver::default()),
    ));
    let app = build_router(state, settings.max_body_bytes);

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address {}", settings.server_bind))?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/state", get(get_state))
        .route("/schema", get(get_schema))
        .route("/on", post(power_on))
        .route("/off", post(power_off))
        .route("/mode", post(set_mode))
        .route("/param/:name", post(set_param))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("received termination signal, shutting down");
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::UnknownMode => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_state(State(state): State<Arc<AppState>>) -> Json<StateFrame> {
    let (_, snapshot) = state.snapshot().await;
    Json(StateFrame::full(&snapshot, 0))
}

async fn get_schema(State(state): State<Arc<AppState>>) -> Json<ControllerSchema> {
    Json(state.schema().clone())
}

async fn commit(state: &AppState, change: Change, q: SeqQuery) -> ApiResult<Json<StateFrame>> {
    let snapshot = state
        .apply(&change, HTTP_ORIGIN, 0)
        .await
        .map_err(reject)?;
    Ok(Json(StateFrame::full(&snapshot, q.seq.unwrap_or_default())))
}

async fn power_on(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SeqQuery>,
) -> ApiResult<Json<StateFrame>> {
    commit(&state, Change::Power { on: true }, q).await
}

async fn power_off(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SeqQuery>,
) -> ApiResult<Json<StateFrame>> {
    commit(&state, Change::Power { on: false }, q).await
}

async fn set_mode(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SeqQuery>,
    Json(req): Json<ModeRequest>,
) -> ApiResult<Json<StateFrame>> {
    commit(&state, Change::Mode { mode: req.mode }, q).await
}

async fn set_param(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(q): Query<SeqQuery>,
    Json(req): Json<ParamRequest>,
) -> ApiResult<Json<StateFrame>> {
    let name = ParamName::new(name);
    if state.schema().param(&name).is_none() {
        return Err(reject(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown parameter {name}"),
        )));
    }
    commit(
        &state,
        Change::SetParam {
            name,
            value: req.value,
        },
        q,
    )
    .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

/// Writer half of one live connection. Tracks the newest commit version it
/// has sent so a snapshot is never followed by an older broadcast.
struct Outbound {
    sender: SplitSink<WebSocket, Message>,
    sent_version: u64,
}

impl Outbound {
    async fn send(&mut self, message: ControllerMessage) -> Result<(), axum::Error> {
        let bytes = encode_controller(&message).map_err(axum::Error::new)?;
        let text = String::from_utf8(bytes).map_err(axum::Error::new)?;
        self.sender.send(Message::Text(text)).await
    }

    async fn snapshot(&mut self, state: &AppState, ack_seq: u64) -> Result<(), axum::Error> {
        let (version, snapshot) = state.snapshot().await;
        self.sent_version = self.sent_version.max(version);
        self.send(ControllerMessage::State(StateFrame::full(&snapshot, ack_seq)))
            .await
    }

    async fn event(
        &mut self,
        state: &AppState,
        connection: u64,
        event: StateEvent,
    ) -> Result<(), axum::Error> {
        let own = event.origin == connection;
        if event.version > self.sent_version {
            self.sent_version = event.version;
            let mut frame = event.frame;
            if own {
                frame.ack_seq = event.ack_seq;
            }
            self.send(ControllerMessage::State(frame)).await
        } else if own {
            // Already covered by a newer snapshot, but the sender still needs its ack.
            self.snapshot(state, event.ack_seq).await
        } else {
            Ok(())
        }
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let id = state.connection_id();
    let mut events = state.subscribe();
    let (sender, mut receiver) = socket.split();
    let mut out = Outbound {
        sender,
        sent_version: 0,
    };
    info!(connection = id, "ws: connected");

    let greeting = async {
        out.send(ControllerMessage::Schema(state.schema().clone()))
            .await?;
        out.snapshot(&state, 0).await
    };
    if let Err(err) = greeting.await {
        debug!(connection = id, %err, "ws: greeting failed");
        return;
    }

    'conn: loop {
        tokio::select! {
            msg = receiver.next() => {
                let payload = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(connection = id, %err, "ws: receive failed");
                        break;
                    }
                };
                for frame in split_frames(&payload) {
                    if let Err(err) = handle_client_frame(&state, id, frame, &mut out).await {
                        debug!(connection = id, %err, "ws: send failed");
                        break 'conn;
                    }
                }
            }
            event = events.recv() => {
                let sent = match event {
                    Ok(event) => out.event(&state, id, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection = id, skipped, "ws: lagging behind, resending snapshot");
                        out.snapshot(&state, 0).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(err) = sent {
                    debug!(connection = id, %err, "ws: send failed");
                    break;
                }
            }
        }
    }
    info!(connection = id, "ws: disconnected");
}

async fn handle_client_frame(
    state: &AppState,
    connection: u64,
    frame: &[u8],
    out: &mut Outbound,
) -> Result<(), axum::Error> {
    match decode_client(frame) {
        Ok(ClientMessage::Sync) => out.snapshot(state, 0).await,
        Ok(ClientMessage::Command(command)) => {
            match state.apply(&command.change, connection, command.seq).await {
                // The ack reaches this connection through the event stream.
                Ok(_) => Ok(()),
                Err(err) => {
                    warn!(
                        connection,
                        seq = command.seq,
                        code = ?err.code,
                        message = %err.message,
                        "ws: command rejected"
                    );
                    out.send(ControllerMessage::Error(err)).await?;
                    out.snapshot(state, command.seq).await
                }
            }
        }
        Err(err) => {
            warn!(connection, %err, "ws: undecodable client frame");
            out.send(ControllerMessage::Error(err.into())).await
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
