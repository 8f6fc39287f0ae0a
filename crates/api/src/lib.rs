//! Rekon public API: the reconciler frontends (CLI, embedding programs) depend on.
//!
//! A [`Reconciler`] drives one definition at a time to its desired state
//! through any [`ClusterClient`], so the same flow runs against a live cluster
//! or the in-memory fake.

#![forbid(unsafe_code)]

mod reconciler;

use std::sync::Arc;

use rekon_core::capabilities::CapabilityTable;
use rekon_core::{ClusterClient, ReconcileFailure, ReconcileOptions, ReconcileResult, Validator};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use rekon_apply::DiffSummary;
pub use rekon_core::{prelude, ReconcileError, ValidationIssue};

pub struct Reconciler<C> {
    client: C,
    capabilities: CapabilityTable,
    validator: Option<Arc<dyn Validator>>,
    not_found_tolerance: Option<u32>,
}

impl<C: ClusterClient> Reconciler<C> {
    pub fn new(client: C) -> Self {
        Self { client, capabilities: CapabilityTable::default(), validator: None, not_found_tolerance: None }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Schema validator used when options ask for validation.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Override the NotFound polls tolerated during a presence wait.
    pub fn with_not_found_tolerance(mut self, polls: u32) -> Self {
        self.not_found_tolerance = Some(polls);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Reconcile every definition the options describe, in order, stopping at the first failure.
    pub async fn run(&self, opts: &ReconcileOptions) -> Result<RunReport, RunFailure> {
        opts.check().map_err(|e| RunFailure { completed: Vec::new(), failure: e.into() })?;
        let definitions = opts.definitions().map_err(|e| RunFailure { completed: Vec::new(), failure: e.into() })?;
        info!(count = definitions.len(), state = ?opts.state, check_mode = opts.check_mode, "reconcile run start");
        let mut results = Vec::with_capacity(definitions.len());
        for def in definitions {
            match self.reconcile(def, opts).await {
                Ok(r) => results.push(r),
                Err(failure) => return Err(RunFailure { completed: results, failure }),
            }
        }
        Ok(RunReport { changed: results.iter().any(|r| r.changed), results })
    }
}

/// Results of a multi-definition run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub changed: bool,
    pub results: Vec<ReconcileResult>,
}

/// A run that stopped early: what finished, and the failure that stopped it.
#[derive(Debug, thiserror::Error)]
#[error("{failure}")]
pub struct RunFailure {
    pub completed: Vec<ReconcileResult>,
    #[source]
    pub failure: ReconcileFailure,
}

impl RunFailure {
    pub fn changed(&self) -> bool {
        self.failure.changed || self.completed.iter().any(|r| r.changed)
    }
}
