use crate::clock::SharedClock;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
};
use tracing::warn;

pub const DEFAULT_COOLDOWN_SECS: i64 = 3600;

/// Per provider-family "disabled until" timestamps. Cells only move forward,
/// so concurrent trips from different jobs cannot shorten a cooldown.
#[derive(Clone)]
pub struct CircuitBreakers {
    cells: Arc<Mutex<HashMap<&'static str, Arc<AtomicI64>>>>,
    clock: SharedClock,
    cooldown_secs: i64,
}

impl CircuitBreakers {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_cooldown(clock, DEFAULT_COOLDOWN_SECS)
    }

    pub fn with_cooldown(clock: SharedClock, cooldown_secs: i64) -> Self {
        Self {
            cells: Arc::new(Mutex::new(HashMap::new())),
            clock,
            cooldown_secs,
        }
    }

    fn cell(&self, family: &'static str) -> Arc<AtomicI64> {
        let mut cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells
            .entry(family)
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    pub fn is_open(&self, family: &'static str) -> bool {
        self.cell(family).load(Ordering::SeqCst) > self.clock.now_secs()
    }

    pub fn disabled_until(&self, family: &'static str) -> Option<i64> {
        let until = self.cell(family).load(Ordering::SeqCst);
        (until > self.clock.now_secs()).then_some(until)
    }

    pub fn trip(&self, family: &'static str) {
        let until = self.clock.now_secs() + self.cooldown_secs;
        let previous = self.cell(family).fetch_max(until, Ordering::SeqCst);
        warn!(
            target = "smartenrich.search",
            family = family,
            disabled_until = until.max(previous),
            "circuit_tripped"
        );
    }
}
