use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use shared::{
    domain::{ControllerSchema, LightState},
    error::{ApiError, ErrorCode},
    protocol::{Change, StateFrame},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error};

use crate::driver::LightsDriver;

/// Origin used for changes that arrive over the HTTP routes.
pub(crate) const HTTP_ORIGIN: u64 = 0;

/// A committed change, fanned out to every live connection. Only the `origin`
/// connection sees `ack_seq`; `version` orders it against snapshots.
#[derive(Debug, Clone)]
pub(crate) struct StateEvent {
    pub(crate) origin: u64,
    pub(crate) ack_seq: u64,
    pub(crate) version: u64,
    pub(crate) frame: StateFrame,
}

struct Committed {
    version: u64,
    state: LightState,
}

pub(crate) struct AppState {
    schema: ControllerSchema,
    committed: Mutex<Committed>,
    driver: Arc<dyn LightsDriver>,
    events: broadcast::Sender<StateEvent>,
    next_connection: AtomicU64,
}

impl AppState {
    pub(crate) fn new(schema: ControllerSchema, driver: Arc<dyn LightsDriver>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            committed: Mutex::new(Committed {
                version: 0,
                state: schema.initial_state(),
            }),
            schema,
            driver,
            events,
            next_connection: AtomicU64::new(HTTP_ORIGIN + 1),
        }
    }

    pub(crate) fn schema(&self) -> &ControllerSchema {
        &self.schema
    }

    /// Current state and the commit version it reflects.
    pub(crate) async fn snapshot(&self) -> (u64, LightState) {
        let committed = self.committed.lock().await;
        (committed.version, committed.state.clone())
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Validates and commits `change`, last writer wins. The driver renders the
    /// new state before anyone else observes it.
    pub(crate) async fn apply(
        &self,
        change: &Change,
        origin: u64,
        ack_seq: u64,
    ) -> Result<LightState, ApiError> {
        change.validate(&self.schema)?;
        let mut committed = self.committed.lock().await;
        let mut next = committed.state.clone();
        next.set(&change.field(), change.value());
        self.driver.render(&next).map_err(|err| {
            error!(%err, "driver rejected state");
            ApiError::new(ErrorCode::Internal, format!("driver failure: {err}"))
        })?;
        committed.version += 1;
        committed.state = next;
        debug!(
            origin,
            version = committed.version,
            field = %change.field(),
            value = %change.value(),
            "state committed"
        );
        // Sent under the lock so subscribers see commits in version order.
        let _ = self.events.send(StateEvent {
            origin,
            ack_seq,
            version: committed.version,
            frame: StateFrame::full(&committed.state, 0),
        });
        Ok(committed.state.clone())
    }
}

#[cfg(test)]
#[path = "tests/app_state_tests.rs"]
mod tests;
