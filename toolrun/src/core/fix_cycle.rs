//! Per-identity retry bookkeeping for one run.
//!
//! Each identity moves `Clean -> Failing(n) -> Exhausted`. A success from any
//! state resets it to `Clean`.
//!
//! A failing identity is re-run after each workspace change. A re-run that
//! fails again waits for the next change before it is tried again.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::types::{FixIdentity, OperationRequest, Outcome};

pub const DEFAULT_MAX_FIX_ATTEMPTS: u32 = 3;

/// Observable state of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "attempts", rename_all = "snake_case")]
pub enum FixState {
    Clean,
    Failing(u32),
    Exhausted,
}

#[derive(Debug, Clone)]
struct FixEntry {
    attempts: u32,
    needs_verification: bool,
    failures: Vec<String>,
    last_request: OperationRequest,
}

#[derive(Debug, Clone)]
pub struct FixCycleTracker {
    max_attempts: u32,
    entries: BTreeMap<FixIdentity, FixEntry>,
}

impl Default for FixCycleTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIX_ATTEMPTS)
    }
}

impl FixCycleTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fold one classified result into the identity's state.
    ///
    /// Infrastructure errors count as failures. Failures recorded after the
    /// identity is exhausted leave the attempt count unchanged.
    pub fn record_result(
        &mut self,
        identity: &FixIdentity,
        outcome: &Outcome,
        request: &OperationRequest,
    ) -> FixState {
        self.record(identity, outcome, request, true)
    }

    /// Like [`record_result`](Self::record_result), for an automatic re-run
    /// after a workspace change. A failed re-run is not pending again until
    /// [`arm_verifications`](Self::arm_verifications).
    pub fn record_verification(
        &mut self,
        identity: &FixIdentity,
        outcome: &Outcome,
        request: &OperationRequest,
    ) -> FixState {
        self.record(identity, outcome, request, false)
    }

    /// Mark every failing, non-exhausted identity for re-run.
    pub fn arm_verifications(&mut self) {
        let max = self.max_attempts;
        for entry in self.entries.values_mut() {
            entry.needs_verification = entry.attempts < max;
        }
    }

    fn record(
        &mut self,
        identity: &FixIdentity,
        outcome: &Outcome,
        request: &OperationRequest,
        pending: bool,
    ) -> FixState {
        if outcome.is_success() {
            self.entries.remove(identity);
            return FixState::Clean;
        }

        let max = self.max_attempts;
        let entry = self
            .entries
            .entry(identity.clone())
            .or_insert_with(|| FixEntry {
                attempts: 0,
                needs_verification: false,
                failures: Vec::new(),
                last_request: request.clone(),
            });
        if entry.attempts < max {
            entry.attempts += 1;
            entry.failures.push(failure_line(outcome));
        }
        entry.needs_verification = pending && entry.attempts < max;
        entry.last_request = request.clone();
        state_of(entry.attempts, max)
    }

    pub fn state(&self, identity: &FixIdentity) -> FixState {
        self.entries
            .get(identity)
            .map_or(FixState::Clean, |e| state_of(e.attempts, self.max_attempts))
    }

    pub fn attempts(&self, identity: &FixIdentity) -> u32 {
        self.entries.get(identity).map_or(0, |e| e.attempts)
    }

    pub fn is_exhausted(&self, identity: &FixIdentity) -> bool {
        self.state(identity) == FixState::Exhausted
    }

    /// True while the identity is failing and has not been re-run since the
    /// last workspace change.
    pub fn needs_verification(&self, identity: &FixIdentity) -> bool {
        self.entries
            .get(identity)
            .is_some_and(|e| e.needs_verification)
    }

    /// Failing identities awaiting a re-run, with the request to re-run.
    pub fn pending_verifications(&self) -> Vec<(FixIdentity, OperationRequest)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.needs_verification)
            .map(|(id, e)| (id.clone(), e.last_request.clone()))
            .collect()
    }

    /// Failure summaries recorded for the identity, oldest first.
    pub fn failure_history(&self, identity: &FixIdentity) -> &[String] {
        self.entries
            .get(identity)
            .map(|e| e.failures.as_slice())
            .unwrap_or(&[])
    }

    /// All exhausted identities, in deterministic order.
    pub fn exhausted(&self) -> Vec<FixIdentity> {
        self.entries
            .iter()
            .filter(|(_, e)| e.attempts >= self.max_attempts)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn state_of(attempts: u32, max: u32) -> FixState {
    if attempts == 0 {
        FixState::Clean
    } else if attempts >= max {
        FixState::Exhausted
    } else {
        FixState::Failing(attempts)
    }
}

fn failure_line(outcome: &Outcome) -> String {
    match outcome.failure_detail() {
        Some(detail) if !detail.is_empty() => format!("{}\n{detail}", outcome.summary()),
        _ => outcome.summary().to_string(),
    }
}
