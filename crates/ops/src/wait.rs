//! Blocking until the cluster reports convergence after a write.
//!
//! Polls with `tokio::time`, so tests can drive the clock with a paused runtime.

use std::time::Duration;

use metrics::{counter, histogram};
use rekon_core::capabilities::Readiness;
use rekon_core::{ClientError, ClusterClient, ObjectRef, ReconcileError, WaitSpec};
use serde_json::{json, Value as Json};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::readiness::{condition_met, is_ready};

/// Consecutive NotFound polls tolerated while waiting for an object that was just written.
pub const DEFAULT_NOT_FOUND_TOLERANCE: u32 = 3;

fn not_found_tolerance() -> u32 {
    std::env::var("REKON_WAIT_NOT_FOUND_TOLERANCE")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(DEFAULT_NOT_FOUND_TOLERANCE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// The object exists and satisfies the condition or readiness predicate.
    Present,
    /// The object no longer resolves.
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// Last observed object; empty after an absence wait.
    pub object: Json,
    pub elapsed: Duration,
}

impl WaitOutcome {
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.as_secs()
    }
}

enum Predicate<'a> {
    Condition(&'a rekon_core::WaitCondition),
    Ready(Readiness),
}

impl Predicate<'_> {
    fn holds(&self, obj: &Json) -> bool {
        match self {
            Self::Condition(c) => condition_met(obj, c),
            Self::Ready(r) => is_ready(*r, obj),
        }
    }
}

pub struct WaitCoordinator<'c, C: ?Sized> {
    client: &'c C,
    not_found_tolerance: u32,
}

impl<'c, C: ClusterClient + ?Sized> WaitCoordinator<'c, C> {
    pub fn new(client: &'c C) -> Self {
        Self { client, not_found_tolerance: not_found_tolerance() }
    }

    pub fn with_not_found_tolerance(mut self, polls: u32) -> Self {
        self.not_found_tolerance = polls;
        self
    }

    /// Poll `target` until it reaches `goal`.
    ///
    /// A configured condition takes precedence over the kind's readiness
    /// predicate. With neither, a presence wait returns `current` at once.
    pub async fn wait(
        &self,
        target: &ObjectRef,
        goal: WaitTarget,
        spec: &WaitSpec,
        readiness: Option<Readiness>,
        current: &Json,
    ) -> Result<WaitOutcome, ReconcileError> {
        let start = Instant::now();
        let predicate = match (goal, spec.condition(), readiness) {
            (WaitTarget::Absent, _, _) => None,
            (WaitTarget::Present, Some(c), _) => Some(Predicate::Condition(c)),
            (WaitTarget::Present, None, Some(r)) => Some(Predicate::Ready(r)),
            (WaitTarget::Present, None, None) => {
                debug!(object = %target, "no readiness predicate; not waiting");
                return Ok(WaitOutcome { object: current.clone(), elapsed: Duration::ZERO });
            }
        };

        let mut last_observed: Option<Json> = None;
        let mut misses = 0u32;
        loop {
            match (self.client.get(target).await, &predicate) {
                (Err(ClientError::NotFound(_)), None) => return Ok(self.converged(target, start, json!({}))),
                (Ok(obj), None) => last_observed = Some(obj),
                (Ok(obj), Some(p)) => {
                    misses = 0;
                    if p.holds(&obj) {
                        return Ok(self.converged(target, start, obj));
                    }
                    last_observed = Some(obj);
                }
                (Err(e @ ClientError::NotFound(_)), Some(_)) => {
                    misses += 1;
                    if misses > self.not_found_tolerance {
                        return Err(self.failed(target, start, e));
                    }
                    debug!(object = %target, misses, "object not found yet while waiting");
                }
                (Err(e), _) => return Err(self.failed(target, start, e)),
            }

            let elapsed = start.elapsed();
            if elapsed >= spec.timeout {
                counter!("wait_timeout_total", 1u64);
                warn!(object = %target, elapsed_s = elapsed.as_secs(), "wait timed out");
                return Err(ReconcileError::WaitTimeout {
                    msg: format!("Timed out waiting on {} after {}s", target, elapsed.as_secs()),
                    elapsed: elapsed.as_secs(),
                    last_observed,
                });
            }
            sleep(spec.poll_interval.min(spec.timeout - elapsed)).await;
        }
    }

    fn converged(&self, target: &ObjectRef, start: Instant, object: Json) -> WaitOutcome {
        let elapsed = start.elapsed();
        histogram!("wait_duration_ms", elapsed.as_secs_f64() * 1000.0);
        info!(object = %target, elapsed_s = elapsed.as_secs(), "converged");
        WaitOutcome { object, elapsed }
    }

    fn failed(&self, target: &ObjectRef, start: Instant, source: ClientError) -> ReconcileError {
        counter!("wait_error_total", 1u64);
        ReconcileError::WaitFailed {
            msg: format!("Failed while waiting on {}: {}", target, source),
            elapsed: start.elapsed().as_secs(),
            source,
        }
    }
}
