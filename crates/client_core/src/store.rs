use std::collections::BTreeMap;

use shared::{
    domain::{ControllerSchema, Field, LightState},
    protocol::{Command, StateFrame},
};
use tokio::{sync::watch, time::Instant};
use tracing::debug;

use crate::{error::SyncError, types::Intent, types::MergedView};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameOutcome {
    pub resolved: Option<(Field, u64)>,
    pub stale: Vec<Field>,
}

impl FrameOutcome {
    pub fn stale_errors(&self, ack_seq: u64) -> Vec<SyncError> {
        self.stale
            .iter()
            .cloned()
            .map(|field| SyncError::StaleAck { field, ack_seq })
            .collect()
    }
}

pub struct ReconciliationStore {
    schema: ControllerSchema,
    confirmed: LightState,
    synced: bool,
    pending: BTreeMap<Field, Intent>,
    outstanding: BTreeMap<Field, Command>,
    applied_ack: BTreeMap<Field, u64>,
    view: watch::Sender<MergedView>,
}

impl ReconciliationStore {
    pub fn new(schema: ControllerSchema) -> Self {
        let confirmed = schema.initial_state();
        let (view, _) = watch::channel(MergedView {
            state: confirmed.clone(),
            pending: Default::default(),
            schema: schema.clone(),
            synced: false,
        });
        Self {
            schema,
            confirmed,
            synced: false,
            pending: BTreeMap::new(),
            outstanding: BTreeMap::new(),
            applied_ack: BTreeMap::new(),
            view,
        }
    }

    pub fn schema(&self) -> &ControllerSchema {
        &self.schema
    }

    pub fn confirmed(&self) -> &LightState {
        &self.confirmed
    }

    pub fn subscribe(&self) -> watch::Receiver<MergedView> {
        self.view.subscribe()
    }

    pub fn outstanding(&self, field: &Field) -> Option<&Command> {
        self.outstanding.get(field)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn record_intent(&mut self, intent: Intent) {
        self.pending.insert(intent.field(), intent);
        self.publish();
    }

    pub fn apply_command(&mut self, command: &Command) {
        let field = command.change.field();
        match self.pending.get_mut(&field) {
            Some(intent) if !intent.is_sent() && intent.change == command.change => {
                intent.local_seq = command.seq;
            }
            Some(_) => {}
            None => {
                self.pending
                    .insert(field.clone(), Intent::from_command(command, Instant::now()));
            }
        }
        if let Some(previous) = self.outstanding.insert(field.clone(), command.clone()) {
            debug!(%field, seq = previous.seq, "store: replaced outstanding command");
        }
        self.publish();
    }

    pub fn apply_state_frame(&mut self, frame: &StateFrame) -> FrameOutcome {
        let ack_seq = frame.ack_seq;
        let mut outcome = FrameOutcome::default();
        let mut applied_any = false;

        let matched = (ack_seq != 0)
            .then(|| {
                self.outstanding
                    .iter()
                    .find(|(_, command)| command.seq == ack_seq)
                    .map(|(field, _)| field.clone())
            })
            .flatten();

        if let Some(field) = &matched {
            if let Some(command) = self.outstanding.remove(field) {
                if self
                    .pending
                    .get(field)
                    .is_some_and(|intent| intent.local_seq == ack_seq)
                {
                    self.pending.remove(field);
                }
                if !self.is_stale(field, ack_seq) {
                    let value = frame
                        .value(field)
                        .unwrap_or_else(|| command.change.value());
                    self.confirmed.set(field, value);
                    self.applied_ack.insert(field.clone(), ack_seq);
                    applied_any = true;
                }
                outcome.resolved = Some((field.clone(), ack_seq));
            }
        }

        for field in frame.mentioned_fields() {
            if matched.as_ref() == Some(&field) {
                continue;
            }
            if self.is_stale(&field, ack_seq) {
                outcome.stale.push(field);
                continue;
            }
            if let Some(value) = frame.value(&field) {
                self.confirmed.set(&field, value);
            }
            if ack_seq != 0 {
                self.applied_ack.insert(field, ack_seq);
            }
            applied_any = true;
        }

        if applied_any || frame.mentioned_fields().is_empty() {
            self.confirmed
                .extensions
                .extend(frame.extensions.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.synced = true;
        }
        self.publish();
        outcome
    }

    /// Forgets a sent command that failed to reach the controller and returns
    /// the intent so it can be queued again.
    pub fn abandon(&mut self, command: &Command) -> Option<Intent> {
        let field = command.change.field();
        if self.outstanding.get(&field).map(|c| c.seq) != Some(command.seq) {
            return None;
        }
        self.outstanding.remove(&field);
        let intent = self.unsend(&field, command);
        self.publish();
        Some(intent)
    }

    /// Drains every outstanding command after the live channel dropped. The
    /// returned intents carry no sequence number and must be sent again.
    pub fn take_outstanding(&mut self) -> Vec<Intent> {
        self.take_outstanding_where(|_| true)
    }

    pub fn take_outstanding_where(
        &mut self,
        mut filter: impl FnMut(&Command) -> bool,
    ) -> Vec<Intent> {
        let (taken, kept): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::take(&mut self.outstanding)
                .into_iter()
                .partition(|(_, command)| filter(command));
        self.outstanding = kept;
        let intents = taken
            .iter()
            .map(|(field, command)| self.unsend(field, command))
            .collect::<Vec<_>>();
        self.publish();
        intents
    }

    /// Replaces the schema advertised by the controller. Outstanding commands
    /// the new schema rejects are dropped and returned.
    pub fn set_schema(&mut self, schema: ControllerSchema) -> Vec<Command> {
        schema.normalize(&mut self.confirmed);
        self.pending
            .retain(|_, intent| intent.change.validate(&schema).is_ok());
        let (kept, dropped): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::take(&mut self.outstanding)
                .into_iter()
                .partition(|(_, command)| command.change.validate(&schema).is_ok());
        self.outstanding = kept;
        self.applied_ack.retain(|field, _| match field {
            Field::Param(name) => schema.param(name).is_some(),
            _ => true,
        });
        self.schema = schema;
        self.publish();
        dropped.into_values().collect()
    }

    pub fn merged(&self) -> MergedView {
        let mut state = self.confirmed.clone();
        for (field, intent) in &self.pending {
            state.set(field, intent.value());
        }
        MergedView {
            state,
            pending: self.pending.keys().cloned().collect(),
            schema: self.schema.clone(),
            synced: self.synced,
        }
    }

    fn is_stale(&self, field: &Field, ack_seq: u64) -> bool {
        ack_seq != 0
            && self
                .applied_ack
                .get(field)
                .is_some_and(|applied| ack_seq < *applied)
    }

    fn unsend(&mut self, field: &Field, command: &Command) -> Intent {
        match self.pending.get_mut(field) {
            Some(intent) if intent.local_seq == command.seq => {
                intent.local_seq = 0;
                intent.clone()
            }
            Some(_) => Intent::new(command.change.clone(), Instant::now()),
            None => {
                let intent = Intent::new(command.change.clone(), Instant::now());
                self.pending.insert(field.clone(), intent.clone());
                intent
            }
        }
    }

    fn publish(&self) {
        let next = self.merged();
        self.view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
