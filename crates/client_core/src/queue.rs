use std::{collections::BTreeMap, time::Duration};

use shared::domain::Field;
use tokio::time::Instant;

use crate::types::Intent;

#[derive(Debug, Default)]
struct Slot {
    queued: Option<Intent>,
    in_flight: Option<u64>,
    last_sent_at: Option<Instant>,
}

impl Slot {
    fn ready_at(&self, debounce: Duration) -> Option<Instant> {
        if self.in_flight.is_some() {
            return None;
        }
        let queued = self.queued.as_ref()?;
        Some(match self.last_sent_at {
            Some(sent_at) => sent_at + debounce,
            None => queued.created_at,
        })
    }
}

#[derive(Debug)]
pub struct IntentQueue {
    debounce: Duration,
    slots: BTreeMap<Field, Slot>,
    next_seq: u64,
}

impl IntentQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            slots: BTreeMap::new(),
            next_seq: 1,
        }
    }

    pub fn submit(&mut self, intent: Intent) -> Option<Intent> {
        let slot = self.slots.entry(intent.field()).or_default();
        slot.queued.replace(Intent {
            local_seq: 0,
            ..intent
        })
    }

    pub fn drain_ready(&mut self, now: Instant) -> Option<Intent> {
        self.drain_ready_where(now, |_| true)
    }

    pub fn drain_ready_where(
        &mut self,
        now: Instant,
        mut filter: impl FnMut(&Field) -> bool,
    ) -> Option<Intent> {
        let debounce = self.debounce;
        let (field, slot) = self.slots.iter_mut().find(|(field, slot)| {
            filter(*field) && slot.ready_at(debounce).is_some_and(|at| at <= now)
        })?;
        let mut intent = slot.queued.take()?;
        intent.local_seq = self.next_seq;
        self.next_seq += 1;
        slot.in_flight = Some(intent.local_seq);
        slot.last_sent_at = Some(now);
        tracing::trace!(%field, seq = intent.local_seq, "queue: intent released");
        Some(intent)
    }

    /// Clears the in-flight marker if `seq` is the command outstanding for `field`.
    pub fn acknowledge(&mut self, field: &Field, seq: u64) -> bool {
        match self.slots.get_mut(field) {
            Some(slot) if slot.in_flight == Some(seq) => {
                slot.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Puts back an intent whose command will never be acknowledged. A newer
    /// queued value for the same field wins over the returned one.
    pub fn requeue(&mut self, intent: Intent) {
        let slot = self.slots.entry(intent.field()).or_default();
        slot.in_flight = None;
        slot.last_sent_at = None;
        if slot.queued.is_none() {
            slot.queued = Some(Intent {
                local_seq: 0,
                ..intent
            });
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Intent) -> bool) {
        for slot in self.slots.values_mut() {
            if slot.queued.as_ref().is_some_and(|intent| !keep(intent)) {
                slot.queued = None;
            }
        }
    }

    pub fn prune_fields(&mut self, mut keep: impl FnMut(&Field) -> bool) {
        self.slots.retain(|field, slot| {
            keep(field) || slot.queued.is_some() || slot.in_flight.is_some()
        });
    }

    pub fn field_count(&self) -> usize {
        self.slots.len()
    }

    pub fn next_ready_at(&self) -> Option<Instant> {
        self.next_ready_at_where(|_| true)
    }

    pub fn next_ready_at_where(&self, mut filter: impl FnMut(&Field) -> bool) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|(field, _)| filter(*field))
            .filter_map(|(_, slot)| slot.ready_at(self.debounce))
            .min()
    }

    pub fn queued(&self, field: &Field) -> Option<&Intent> {
        self.slots.get(field)?.queued.as_ref()
    }

    pub fn in_flight(&self, field: &Field) -> Option<u64> {
        self.slots.get(field)?.in_flight
    }

    pub fn queued_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.queued.is_some())
            .count()
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
