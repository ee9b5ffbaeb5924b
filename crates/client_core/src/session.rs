use std::{collections::BTreeSet, sync::Arc, time::Duration};

use shared::{
    codec::{decode_controller, decode_frame},
    domain::{ControllerSchema, Field, FieldValue},
    protocol::{Change, ClientMessage, Command, ControllerMessage, StateFrame},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ClientSettings,
    error::SyncError,
    queue::IntentQueue,
    store::ReconciliationStore,
    transport::{
        BackoffPolicy, ControllerTransport, Inbound, LiveLink, TransportChannel, WsTransport,
    },
    types::{ConnectionState, Intent, MergedView},
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub debounce: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive undecodable frames tolerated before the link is dropped.
    /// Zero disables the limit.
    pub max_consecutive_bad_frames: u32,
    /// Schema used until the controller advertises its own.
    pub schema: ControllerSchema,
}

impl Default for SessionOptions {
    fn default() -> Self {
        ClientSettings::default().session_options()
    }
}

enum SessionInput {
    Intent(Change),
    Shutdown,
}

type FallbackResult = (Command, Result<Vec<u8>, SyncError>);

pub struct Session {
    transport: Arc<dyn ControllerTransport>,
    channel: TransportChannel,
    queue: IntentQueue,
    store: ReconciliationStore,
    connection: watch::Sender<ConnectionState>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    connecting: Option<JoinHandle<Result<LiveLink, SyncError>>>,
    retry_at: Option<Instant>,
    fallback_tx: mpsc::UnboundedSender<FallbackResult>,
    fallback_rx: mpsc::UnboundedReceiver<FallbackResult>,
    fallback_in_flight: BTreeSet<u64>,
    fallback_retry_at: Option<Instant>,
    bad_frames: u32,
    max_bad_frames: u32,
}

impl Session {
    pub fn start(options: SessionOptions, transport: Arc<dyn ControllerTransport>) -> SessionHandle {
        let store = ReconciliationStore::new(options.schema);
        let view = store.subscribe();
        let (connection, connection_rx) = watch::channel(ConnectionState::Disconnected);
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();

        let session = Self {
            transport,
            channel: TransportChannel::new(options.backoff),
            queue: IntentQueue::new(options.debounce),
            store,
            connection,
            inputs,
            connecting: None,
            retry_at: None,
            fallback_tx,
            fallback_rx,
            fallback_in_flight: BTreeSet::new(),
            fallback_retry_at: None,
            bad_frames: 0,
            max_bad_frames: options.max_consecutive_bad_frames,
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            inputs: inputs_tx,
            view,
            connection: connection_rx,
            task: Some(task),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<SessionHandle, SyncError> {
        let transport = WsTransport::new(settings.endpoints()?);
        info!(
            mode = ?settings.deployment_mode,
            ws_url = %transport.endpoints().ws_url,
            "session: starting"
        );
        Ok(Self::start(settings.session_options(), Arc::new(transport)))
    }

    async fn run(mut self) {
        self.begin_connect();
        loop {
            let send_at = self.next_send_at();
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(SessionInput::Intent(change)) => self.accept(change),
                    Some(SessionInput::Shutdown) | None => break,
                },
                result = join_connect(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(link) => self.on_connected(link),
                        Err(err) => self.on_disconnected(err),
                    }
                }
                inbound = self.channel.next_inbound() => match inbound {
                    Inbound::Frame(bytes) => self.on_frame(&bytes),
                    Inbound::Closed(err) => self.on_disconnected(err),
                },
                Some((command, result)) = self.fallback_rx.recv() => {
                    self.on_fallback_result(command, result);
                }
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.begin_connect();
                }
                _ = sleep_until(send_at) => {}
            }
            self.pump();
        }
        self.release();
    }

    fn accept(&mut self, change: Change) {
        if let Err(err) = change.validate(self.store.schema()) {
            warn!(field = %change.field(), %err, "session: dropping intent rejected by schema");
            return;
        }
        let intent = Intent::new(change, Instant::now());
        self.store.record_intent(intent.clone());
        if let Some(replaced) = self.queue.submit(intent) {
            trace!(field = %replaced.field(), value = %replaced.value(), "session: intent superseded");
        }
    }

    fn begin_connect(&mut self) {
        if self.connecting.is_some() || self.channel.is_open() {
            return;
        }
        self.connection.send_replace(ConnectionState::Connecting);
        let transport = Arc::clone(&self.transport);
        self.connecting = Some(tokio::spawn(async move { transport.connect().await }));
    }

    fn on_connected(&mut self, link: LiveLink) {
        self.channel.attach(link);
        self.bad_frames = 0;
        self.retry_at = None;
        self.connection.send_replace(ConnectionState::Connected);
        info!("session: connected");
        if let Err(err) = self.channel.send_message(&ClientMessage::Sync) {
            self.on_disconnected(err);
        }
    }

    fn on_disconnected(&mut self, err: SyncError) {
        let was_open = self.channel.is_open();
        let delay = self.channel.close();
        self.bad_frames = 0;
        if was_open {
            // Commands sent over the dropped link can never be acknowledged.
            let fallback = &self.fallback_in_flight;
            let orphaned = self
                .store
                .take_outstanding_where(|command| !fallback.contains(&command.seq));
            for intent in orphaned {
                self.queue.requeue(intent);
            }
        }
        warn!(%err, ?delay, "session: live channel unavailable");
        self.connection.send_replace(ConnectionState::Backoff(delay));
        self.retry_at = Some(Instant::now() + delay);
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        match decode_controller(bytes, self.store.schema()) {
            Ok(message) => {
                self.bad_frames = 0;
                self.channel.frame_received();
                match message {
                    ControllerMessage::State(frame) => self.apply_frame(&frame),
                    ControllerMessage::Schema(schema) => {
                        info!(
                            modes = schema.modes.len(),
                            params = schema.params.len(),
                            "session: controller schema received"
                        );
                        self.queue
                            .retain(|intent| intent.change.validate(&schema).is_ok());
                        for command in self.store.set_schema(schema) {
                            let field = command.change.field();
                            debug!(
                                %field,
                                seq = command.seq,
                                "session: outstanding command invalidated"
                            );
                            self.queue.acknowledge(&field, command.seq);
                        }
                        let schema = self.store.schema();
                        self.queue.prune_fields(|field| match field {
                            Field::Param(name) => schema.param(name).is_some(),
                            _ => true,
                        });
                    }
                    ControllerMessage::Error(err) => {
                        warn!(
                            code = ?err.code,
                            message = %err.message,
                            "session: controller reported an error"
                        );
                    }
                }
            }
            Err(err) => {
                self.bad_frames += 1;
                warn!(%err, consecutive = self.bad_frames, "session: rejected inbound frame");
                if self.max_bad_frames > 0 && self.bad_frames >= self.max_bad_frames {
                    let count = self.bad_frames;
                    self.on_disconnected(SyncError::TransportClosed(format!(
                        "{count} consecutive bad frames"
                    )));
                }
            }
        }
    }

    fn apply_frame(&mut self, frame: &StateFrame) {
        let outcome = self.store.apply_state_frame(frame);
        if let Some((field, seq)) = &outcome.resolved {
            self.queue.acknowledge(field, *seq);
            debug!(%field, seq, "session: command acknowledged");
        }
        for err in outcome.stale_errors(frame.ack_seq) {
            debug!(%err, "session: ignored");
        }
    }

    fn on_fallback_result(&mut self, command: Command, result: Result<Vec<u8>, SyncError>) {
        self.fallback_in_flight.remove(&command.seq);
        let decoded =
            result.and_then(|bytes| Ok(decode_frame(&bytes, self.store.schema())?));
        match decoded {
            Ok(mut frame) => {
                // The response answers this request even if it does not say so.
                if frame.is_unsolicited() {
                    frame.ack_seq = command.seq;
                }
                self.apply_frame(&frame);
            }
            Err(err) => {
                let delay = self.channel.current_delay();
                warn!(
                    seq = command.seq,
                    %err,
                    ?delay,
                    "session: fallback request failed"
                );
                match self.store.abandon(&command) {
                    Some(intent) => self.queue.requeue(intent),
                    None => {
                        self.queue.acknowledge(&command.change.field(), command.seq);
                    }
                }
                self.fallback_retry_at = Some(Instant::now() + delay);
            }
        }
    }

    /// Hands every eligible intent to the live channel, or power intents to the
    /// fallback path while the channel is down.
    fn pump(&mut self) {
        let now = Instant::now();
        if self.channel.is_open() {
            while let Some(intent) = self.queue.drain_ready(now) {
                let command = intent.command();
                if let Err(err) = self.channel.send(&command) {
                    self.queue.requeue(intent);
                    self.on_disconnected(err);
                    return;
                }
                debug!(seq = command.seq, field = %command.change.field(), "session: command sent");
                self.store.apply_command(&command);
            }
            return;
        }

        if self.fallback_retry_at.is_some_and(|at| at > now) {
            return;
        }
        self.fallback_retry_at = None;
        while let Some(intent) = self
            .queue
            .drain_ready_where(now, |field| *field == Field::Power)
        {
            self.send_fallback(intent.command());
        }
    }

    fn send_fallback(&mut self, command: Command) {
        info!(seq = command.seq, change = ?command.change, "session: sending over fallback");
        self.store.apply_command(&command);
        self.fallback_in_flight.insert(command.seq);
        let transport = Arc::clone(&self.transport);
        let results = self.fallback_tx.clone();
        tokio::spawn(async move {
            let result = transport.send_once(&command).await;
            let _ = results.send((command, result));
        });
    }

    fn next_send_at(&self) -> Option<Instant> {
        if self.channel.is_open() {
            return self.queue.next_ready_at();
        }
        let ready = self
            .queue
            .next_ready_at_where(|field| *field == Field::Power)?;
        Some(match self.fallback_retry_at {
            Some(retry) => retry.max(ready),
            None => ready,
        })
    }

    fn release(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        let _ = self.channel.close();
        self.connection.send_replace(ConnectionState::Disconnected);
        info!("session: stopped");
    }
}

async fn join_connect(
    task: &mut Option<JoinHandle<Result<LiveLink, SyncError>>>,
) -> Result<LiveLink, SyncError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(SyncError::TransportClosed(format!("connect task failed: {err}"))),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    view: watch::Receiver<MergedView>,
    connection: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Records a user intent. Values that do not fit the field or the current
    /// controller schema are rejected here and never reach the queue.
    pub fn submit_intent(&self, field: Field, value: FieldValue) -> Result<(), SyncError> {
        let change = Change::from_parts(field.clone(), value.clone()).ok_or_else(|| {
            SyncError::InvalidIntent {
                field: field.clone(),
                reason: format!("{value} is not a valid value for {field}"),
            }
        })?;
        change
            .validate(&self.view.borrow().schema)
            .map_err(|err| SyncError::InvalidIntent {
                field,
                reason: err.to_string(),
            })?;
        self.inputs
            .send(SessionInput::Intent(change))
            .map_err(|_| SyncError::SessionClosed)
    }

    pub fn subscribe(&self) -> watch::Receiver<MergedView> {
        self.view.clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn view(&self) -> MergedView {
        self.view.borrow().clone()
    }

    /// Stops reconnecting, releases the transport and waits for the task.
    pub async fn shutdown(mut self) {
        let _ = self.inputs.send(SessionInput::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(%err, "session: task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
