use std::{collections::BTreeSet, fmt, time::Duration};

use shared::{
    domain::{ControllerSchema, Field, FieldValue, LightState},
    protocol::{Change, Command},
};
use tokio::time::Instant;

/// An unconfirmed, locally originated change.
///
/// `local_seq` stays 0 until the intent is handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub change: Change,
    pub local_seq: u64,
    pub created_at: Instant,
}

impl Intent {
    pub fn new(change: Change, created_at: Instant) -> Self {
        Self {
            change,
            local_seq: 0,
            created_at,
        }
    }

    pub fn field(&self) -> Field {
        self.change.field()
    }

    pub fn value(&self) -> FieldValue {
        self.change.value()
    }

    pub fn is_sent(&self) -> bool {
        self.local_seq != 0
    }

    pub fn command(&self) -> Command {
        Command {
            seq: self.local_seq,
            change: self.change.clone(),
        }
    }

    pub(crate) fn from_command(command: &Command, created_at: Instant) -> Self {
        Self {
            change: command.change.clone(),
            local_seq: command.seq,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff(Duration),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Backoff(delay) => write!(f, "retrying in {}ms", delay.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedView {
    pub state: LightState,
    pub pending: BTreeSet<Field>,
    pub schema: ControllerSchema,
    /// False until the controller has reported its state at least once.
    pub synced: bool,
}

impl MergedView {
    pub fn is_pending(&self, field: &Field) -> bool {
        self.pending.contains(field)
    }

    pub fn value(&self, field: &Field) -> Option<FieldValue> {
        self.state.value(field)
    }
}
