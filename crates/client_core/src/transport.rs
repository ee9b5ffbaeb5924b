use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    codec::{encode_client, encode_command, split_frames},
    protocol::{Change, ClientMessage, Command, ModeRequest, ParamRequest},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SyncError;

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ws_url: Url,
    pub http_base: Url,
}

impl Endpoints {
    /// Derives both endpoints from an `http://` or `https://` origin, with the
    /// live channel at `/ws`.
    pub fn from_origin(origin: &str) -> Result<Self, SyncError> {
        let mut http_base = Url::parse(origin)?;
        if !matches!(http_base.scheme(), "http" | "https") {
            return Err(SyncError::Address(format!(
                "controller origin must start with http:// or https://, got {origin}"
            )));
        }
        if !http_base.path().ends_with('/') {
            let path = format!("{}/", http_base.path());
            http_base.set_path(&path);
        }
        let mut ws_url = http_base.join("ws")?;
        let ws_scheme = if http_base.scheme() == "https" { "wss" } else { "ws" };
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|()| SyncError::Address(format!("cannot derive websocket url from {origin}")))?;
        Ok(Self { ws_url, http_base })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
}

#[derive(Debug)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            floor: policy.floor,
            ceiling: policy.ceiling,
            current: policy.floor,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.ceiling);
        self.current = std::cmp::min(next, self.ceiling);
        delay
    }

    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

pub struct LiveLink {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

pub struct LinkPeer {
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pub inbound: mpsc::Sender<Vec<u8>>,
}

impl LiveLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn pair() -> (Self, LinkPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        (
            Self::new(outbound_tx, inbound_rx),
            LinkPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }
}

#[async_trait]
pub trait ControllerTransport: Send + Sync {
    async fn connect(&self) -> Result<LiveLink, SyncError>;

    /// Sends one command over the request/response path and returns the
    /// encoded state frame the controller answered with.
    async fn send_once(&self, command: &Command) -> Result<Vec<u8>, SyncError>;
}

pub enum Inbound {
    Frame(Vec<u8>),
    Closed(SyncError),
}

pub struct TransportChannel {
    link: Option<LiveLink>,
    backoff: Backoff,
}

impl TransportChannel {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            link: None,
            backoff: Backoff::new(policy),
        }
    }

    pub fn attach(&mut self, link: LiveLink) {
        self.link = Some(link);
        self.backoff.reset();
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn send(&self, command: &Command) -> Result<(), SyncError> {
        self.send_bytes(encode_command(command)?)
    }

    pub fn send_message(&self, message: &ClientMessage) -> Result<(), SyncError> {
        self.send_bytes(encode_client(message)?)
    }

    fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), SyncError> {
        let link = self.link.as_ref().ok_or(SyncError::NotConnected)?;
        link.outbound
            .send(bytes)
            .map_err(|_| SyncError::NotConnected)
    }

    /// Next frame in wire order. Pending forever while no link is attached.
    pub async fn next_inbound(&mut self) -> Inbound {
        let Some(link) = self.link.as_mut() else {
            return std::future::pending().await;
        };
        match link.inbound.recv().await {
            Some(bytes) => Inbound::Frame(bytes),
            None => Inbound::Closed(SyncError::TransportClosed(
                "controller closed the live channel".to_string(),
            )),
        }
    }

    pub fn frame_received(&mut self) {
        self.backoff.reset();
    }

    pub fn close(&mut self) -> Duration {
        self.link = None;
        self.backoff.next_delay()
    }

    pub fn current_delay(&self) -> Duration {
        self.backoff.peek()
    }
}

pub struct WsTransport {
    http: Client,
    endpoints: Endpoints,
}

impl WsTransport {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            http: Client::new(),
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn fallback_request(&self, command: &Command) -> Result<reqwest::RequestBuilder, SyncError> {
        let base = &self.endpoints.http_base;
        let request = match &command.change {
            Change::Power { on: true } => self.http.post(base.join("on")?),
            Change::Power { on: false } => self.http.post(base.join("off")?),
            Change::Mode { mode } => self.http.post(base.join("mode")?).json(&ModeRequest {
                mode: mode.clone(),
            }),
            Change::SetParam { name, value } => self
                .http
                .post(base.join(&format!("param/{name}"))?)
                .json(&ParamRequest { value: *value }),
        };
        Ok(request.query(&[("seq", command.seq)]))
    }
}

#[async_trait]
impl ControllerTransport for WsTransport {
    async fn connect(&self) -> Result<LiveLink, SyncError> {
        let ws_url = self.endpoints.ws_url.as_str();
        let (ws_stream, _) = connect_async(ws_url).await.map_err(|err| {
            SyncError::TransportClosed(format!("failed to connect websocket {ws_url}: {err}"))
        })?;
        info!(%ws_url, "transport: websocket connected");
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                let text = match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%err, "transport: dropping non-utf8 outbound message");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(%err, "transport: websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
            debug!("transport: writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let payload = match msg {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(%err, "transport: websocket receive failed");
                        break;
                    }
                };
                for frame in split_frames(&payload) {
                    if inbound_tx.send(frame.to_vec()).await.is_err() {
                        return;
                    }
                }
            }
            debug!("transport: reader finished");
        });

        Ok(LiveLink::new(outbound_tx, inbound_rx))
    }

    async fn send_once(&self, command: &Command) -> Result<Vec<u8>, SyncError> {
        let response = self
            .fallback_request(command)?
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
