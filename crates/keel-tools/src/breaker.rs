//! Per-tool circuit breakers.
//!
//! `Closed` passes calls and counts failures. Reaching the threshold inside
//! the rolling window opens the breaker. After the cool-down one trial call
//! is admitted (`HalfOpen`); its success closes the breaker, its failure
//! reopens it and restarts the cool-down.
//!
//! Every transition into `Open` starts a new epoch. A permit only settles
//! against the epoch that issued it, so calls admitted before the breaker
//! opened cannot close it early or disturb the half-open trial.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_core::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Read-only view of one breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub tool: String,
    pub state: BreakerState,
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Record {
    state: BreakerState,
    failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    epoch: u64,
}

impl Record {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            last_failure_at: None,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
            epoch: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.epoch += 1;
    }
}

/// Process-wide breaker table, one record per tool name.
pub struct CircuitBreakerRegistry {
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    records: Mutex<HashMap<String, Record>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        // Records stay consistent under every mutation, so a poisoned lock is still usable.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask to make a call. `None` means the breaker refuses it.
    pub fn try_acquire(&self, tool: &str) -> Option<BreakerPermit<'_>> {
        let mut records = self.lock();
        let record = records.entry(tool.to_string()).or_insert_with(Record::new);

        let trial = match record.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let cooled = record
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if !cooled {
                    return None;
                }
                info!(tool, "Circuit breaker half-open, admitting trial call");
                record.state = BreakerState::HalfOpen;
                record.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if record.trial_in_flight {
                    return None;
                }
                record.trial_in_flight = true;
                true
            }
        };

        Some(BreakerPermit {
            registry: self,
            tool: tool.to_string(),
            trial,
            epoch: record.epoch,
            settled: false,
        })
    }

    fn record_success(&self, tool: &str, epoch: u64) {
        let mut records = self.lock();
        let Some(record) = records.get_mut(tool) else {
            return;
        };
        if record.epoch != epoch {
            debug!(tool, "Ignoring success from a call admitted before the breaker opened");
            return;
        }
        if record.state != BreakerState::Closed {
            info!(tool, "Circuit breaker closed");
        }
        record.state = BreakerState::Closed;
        record.failures = 0;
        record.opened_at = None;
        record.trial_in_flight = false;
    }

    fn record_failure(&self, tool: &str, epoch: u64) {
        let now = Instant::now();
        let mut records = self.lock();
        let Some(record) = records.get_mut(tool) else {
            return;
        };
        if record.epoch != epoch {
            debug!(tool, "Ignoring failure from a call admitted before the breaker opened");
            return;
        }

        if record.state == BreakerState::Closed
            && record
                .last_failure
                .is_some_and(|at| now.duration_since(at) > self.window)
        {
            record.failures = 0;
        }

        record.failures = record.failures.saturating_add(1);
        record.last_failure = Some(now);
        record.last_failure_at = Some(Utc::now());

        match record.state {
            BreakerState::HalfOpen => {
                warn!(tool, "Trial call failed, circuit breaker reopened");
                record.open(now);
            }
            BreakerState::Closed if record.failures >= self.threshold => {
                warn!(tool, failures = record.failures, "Circuit breaker opened");
                record.open(now);
            }
            _ => {}
        }
    }

    fn release_trial(&self, tool: &str, epoch: u64) {
        if let Some(record) = self.lock().get_mut(tool) {
            if record.epoch == epoch && record.state == BreakerState::HalfOpen {
                record.trial_in_flight = false;
            }
        }
    }

    pub fn state(&self, tool: &str) -> BreakerState {
        self.lock()
            .get(tool)
            .map_or(BreakerState::Closed, |r| r.state)
    }

    pub fn failures(&self, tool: &str) -> u32 {
        self.lock().get(tool).map_or(0, |r| r.failures)
    }

    /// All known breakers, sorted by tool name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let records = self.lock();
        let mut out: Vec<BreakerSnapshot> = records
            .iter()
            .map(|(tool, r)| BreakerSnapshot {
                tool: tool.clone(),
                state: r.state,
                failures: r.failures,
                last_failure_at: r.last_failure_at,
            })
            .collect();
        out.sort_by(|a, b| a.tool.cmp(&b.tool));
        out
    }

    /// Forget one tool's breaker.
    pub fn reset_tool(&self, tool: &str) {
        self.lock().remove(tool);
    }

    /// Forget every breaker.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

/// Admission for one call. Settle it with [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it unsettled counts as a failure.
pub struct BreakerPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    tool: String,
    trial: bool,
    epoch: u64,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.registry.record_success(&self.tool, self.epoch);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.registry.record_failure(&self.tool, self.epoch);
    }

    /// Give the permit back without an outcome (the caller was cancelled).
    pub fn abandon(mut self) {
        self.settled = true;
        if self.trial {
            self.registry.release_trial(&self.tool, self.epoch);
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.record_failure(&self.tool, self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(&BreakerConfig {
            failure_threshold: threshold,
            window_secs: 60,
            cooldown_secs: 30,
        })
    }

    fn fail(reg: &CircuitBreakerRegistry, tool: &str, n: u32) {
        for _ in 0..n {
            reg.try_acquire(tool).unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let reg = registry(3);
        fail(&reg, "route", 2);
        assert_eq!(reg.state("route"), BreakerState::Closed);
        fail(&reg, "route", 1);
        assert_eq!(reg.state("route"), BreakerState::Open);
        assert_eq!(reg.failures("route"), 3);
        assert!(reg.try_acquire("route").is_none());
        // Other tools are unaffected.
        assert!(reg.try_acquire("weather").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let reg = registry(2);
        fail(&reg, "route", 2);
        tokio::time::advance(Duration::from_secs(31)).await;

        let trial = reg.try_acquire("route").unwrap();
        assert!(trial.is_trial());
        assert_eq!(reg.state("route"), BreakerState::HalfOpen);
        assert!(reg.try_acquire("route").is_none());

        trial.success();
        assert_eq!(reg.state("route"), BreakerState::Closed);
        assert_eq!(reg.failures("route"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_cooldown() {
        let reg = registry(2);
        fail(&reg, "route", 2);
        tokio::time::advance(Duration::from_secs(31)).await;

        reg.try_acquire("route").unwrap().failure();
        assert_eq!(reg.state("route"), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(reg.try_acquire("route").is_none());
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(reg.try_acquire("route").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failures_fall_out_of_window() {
        let reg = registry(3);
        fail(&reg, "pricing", 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&reg, "pricing", 1);
        assert_eq!(reg.failures("pricing"), 1);
        assert_eq!(reg.state("pricing"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let reg = registry(3);
        fail(&reg, "pricing", 2);
        reg.try_acquire("pricing").unwrap().success();
        fail(&reg, "pricing", 2);
        assert_eq!(reg.state("pricing"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_counts_as_failure_and_abandon_does_not() {
        let reg = registry(5);
        drop(reg.try_acquire("weather").unwrap());
        assert_eq!(reg.failures("weather"), 1);
        reg.try_acquire("weather").unwrap().abandon();
        assert_eq!(reg.failures("weather"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let reg = registry(1);
        fail(&reg, "route", 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        reg.try_acquire("route").unwrap().abandon();
        assert!(reg.try_acquire("route").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_breaker() {
        let reg = registry(2);
        let late = reg.try_acquire("route").unwrap();
        fail(&reg, "route", 2);
        assert_eq!(reg.state("route"), BreakerState::Open);

        late.success();
        assert_eq!(reg.state("route"), BreakerState::Open);
        assert_eq!(reg.failures("route"), 2);
        assert!(reg.try_acquire("route").is_none());

        // The cool-down and single trial still apply.
        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = reg.try_acquire("route").unwrap();
        assert!(trial.is_trial());
        trial.success();
        assert_eq!(reg.state("route"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_does_not_disturb_trial() {
        let reg = registry(2);
        let late_failure = reg.try_acquire("route").unwrap();
        let late_drop = reg.try_acquire("route").unwrap();
        fail(&reg, "route", 2);
        tokio::time::advance(Duration::from_secs(31)).await;

        let trial = reg.try_acquire("route").unwrap();
        late_failure.failure();
        drop(late_drop);
        assert_eq!(reg.state("route"), BreakerState::HalfOpen);
        // The trial slot is still taken.
        assert!(reg.try_acquire("route").is_none());

        trial.success();
        assert_eq!(reg.state("route"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_snapshot_and_reset() {
        let reg = registry(1);
        fail(&reg, "weather", 1);
        reg.try_acquire("route").unwrap().success();
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].tool, "route");
        assert_eq!(snap[1].state, BreakerState::Open);
        assert!(snap[1].last_failure_at.is_some());

        reg.reset();
        assert!(reg.snapshot().is_empty());
        assert_eq!(reg.state("weather"), BreakerState::Closed);
    }
}
