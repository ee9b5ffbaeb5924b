use super::*;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared::{
    codec::{decode_command, decode_controller, decode_frame},
    domain::{ControllerSchema, Mode, ParamName},
    protocol::{ControllerMessage, SeqQuery, StateFrame},
};
use tokio::net::TcpListener;

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        floor: Duration::from_millis(10),
        ceiling: Duration::from_millis(40),
    }
}

fn state_message(frame: StateFrame) -> String {
    serde_json::to_string(&ControllerMessage::State(frame)).expect("encode")
}

async fn controller_socket(mut socket: WebSocket) {
    let hello = format!(
        "{}\n{}\n",
        state_message(StateFrame {
            power: Some(false),
            ..StateFrame::default()
        }),
        state_message(StateFrame {
            power: Some(true),
            ..StateFrame::default()
        }),
    );
    if socket.send(WsMessage::Text(hello)).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(command) = decode_command(text.as_bytes()) else {
            continue;
        };
        let ack = StateFrame {
            ack_seq: command.seq,
            mode: match command.change {
                Change::Mode { mode } => Some(mode),
                _ => None,
            },
            ..StateFrame::default()
        };
        if socket.send(WsMessage::Text(state_message(ack))).await.is_err() {
            break;
        }
    }
}

async fn ws_route(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(controller_socket)
}

async fn power_on(Query(q): Query<SeqQuery>) -> Json<StateFrame> {
    Json(StateFrame {
        ack_seq: q.seq.unwrap_or_default(),
        power: Some(true),
        ..StateFrame::default()
    })
}

async fn set_param(
    axum::extract::Path(name): axum::extract::Path<String>,
    Query(q): Query<SeqQuery>,
    Json(body): Json<ParamRequest>,
) -> Json<StateFrame> {
    Json(StateFrame {
        ack_seq: q.seq.unwrap_or_default(),
        parameters: [(ParamName::new(name), body.value)].into_iter().collect(),
        ..StateFrame::default()
    })
}

async fn spawn_controller() -> Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/ws", get(ws_route))
        .route("/on", post(power_on))
        .route("/param/:name", post(set_param));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

#[test]
fn backoff_exponentially_grows_to_ceiling() {
    let mut backoff = Backoff::new(policy());
    assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    assert_eq!(backoff.next_delay(), Duration::from_millis(20));
    assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    backoff.reset();
    assert_eq!(backoff.peek(), Duration::from_millis(10));
}

#[test]
fn endpoints_follow_origin_scheme() {
    let endpoints = Endpoints::from_origin("https://lights.local").expect("endpoints");
    assert_eq!(endpoints.ws_url.as_str(), "wss://lights.local/ws");
    assert_eq!(endpoints.http_base.as_str(), "https://lights.local/");

    let endpoints = Endpoints::from_origin("http://localhost:8000/panel").expect("endpoints");
    assert_eq!(endpoints.ws_url.as_str(), "ws://localhost:8000/panel/ws");
    assert_eq!(endpoints.http_base.as_str(), "http://localhost:8000/panel/");

    assert!(matches!(
        Endpoints::from_origin("ftp://lights.local"),
        Err(SyncError::Address(_))
    ));
}

#[tokio::test]
async fn send_without_link_is_not_connected() {
    let channel = TransportChannel::new(policy());
    let command = Command {
        seq: 1,
        change: Change::Power { on: true },
    };
    assert!(matches!(channel.send(&command), Err(SyncError::NotConnected)));
    assert!(!channel.is_open());
}

#[tokio::test]
async fn closed_peer_surfaces_as_transport_closed() {
    let mut channel = TransportChannel::new(policy());
    let (link, peer) = LiveLink::pair();
    channel.attach(link);
    peer.inbound.send(b"first".to_vec()).await.expect("send");
    drop(peer);

    assert!(matches!(channel.next_inbound().await, Inbound::Frame(bytes) if bytes == b"first"));
    assert!(matches!(
        channel.next_inbound().await,
        Inbound::Closed(SyncError::TransportClosed(_))
    ));
    assert_eq!(channel.close(), Duration::from_millis(10));
    assert_eq!(channel.close(), Duration::from_millis(20));
    channel.frame_received();
    assert_eq!(channel.current_delay(), Duration::from_millis(10));
}

#[tokio::test]
async fn websocket_frames_arrive_in_wire_order() {
    let server_url = spawn_controller().await.expect("spawn controller");
    let transport = WsTransport::new(Endpoints::from_origin(&server_url).expect("endpoints"));
    let schema = ControllerSchema::default();

    let mut channel = TransportChannel::new(policy());
    channel.attach(transport.connect().await.expect("connect"));

    let mut powers = Vec::new();
    for _ in 0..2 {
        let Inbound::Frame(bytes) = channel.next_inbound().await else {
            panic!("channel closed early");
        };
        let ControllerMessage::State(frame) = decode_controller(&bytes, &schema).expect("decode")
        else {
            panic!("expected state");
        };
        powers.push(frame.power);
    }
    assert_eq!(powers, vec![Some(false), Some(true)]);

    channel
        .send(&Command {
            seq: 12,
            change: Change::Mode {
                mode: Mode::from("baz"),
            },
        })
        .expect("send");
    let Inbound::Frame(bytes) = channel.next_inbound().await else {
        panic!("channel closed early");
    };
    let ControllerMessage::State(ack) = decode_controller(&bytes, &schema).expect("decode") else {
        panic!("expected state");
    };
    assert_eq!(ack.ack_seq, 12);
    assert_eq!(ack.mode, Some(Mode::from("baz")));
}

#[tokio::test]
async fn fallback_posts_to_command_route() {
    let server_url = spawn_controller().await.expect("spawn controller");
    let transport = WsTransport::new(Endpoints::from_origin(&server_url).expect("endpoints"));
    let schema = ControllerSchema::default();

    let bytes = transport
        .send_once(&Command {
            seq: 4,
            change: Change::Power { on: true },
        })
        .await
        .expect("fallback");
    let frame = decode_frame(&bytes, &schema).expect("frame");
    assert_eq!(frame.ack_seq, 4);
    assert_eq!(frame.power, Some(true));

    let bytes = transport
        .send_once(&Command {
            seq: 5,
            change: Change::SetParam {
                name: ParamName::from("foo"),
                value: 99,
            },
        })
        .await
        .expect("fallback");
    let frame = decode_frame(&bytes, &schema).expect("frame");
    assert_eq!(frame.ack_seq, 5);
    assert_eq!(frame.parameters[&ParamName::from("foo")], 99);
}

#[tokio::test]
async fn fallback_surfaces_http_errors() {
    let server_url = spawn_controller().await.expect("spawn controller");
    let transport = WsTransport::new(Endpoints::from_origin(&server_url).expect("endpoints"));
    let err = transport
        .send_once(&Command {
            seq: 1,
            change: Change::Power { on: false },
        })
        .await
        .expect_err("no /off route");
    assert!(matches!(err, SyncError::Fallback(_)));
}
