use std::time::Instant;

use metrics::{counter, histogram};
use rekon_apply::{self as apply, StrategyPlan};
use rekon_core::capabilities::{KindCapabilities, Readiness};
use rekon_core::{
    object, ClientError, ClusterClient, DesiredState, MergeStrategy, Method, ObjectRef, ReconcileError, ReconcileFailure,
    ReconcileOptions, ReconcileResult, ValidateOptions, WaitSpec,
};
use rekon_ops::{provision, WaitCoordinator, WaitOutcome, WaitTarget};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::Reconciler;

// What the initial lookup found.
enum Lookup {
    Found(Json),
    Missing,
    /// Missing (or unreadable) and created through a request kind.
    Provision,
}

impl<C: ClusterClient> Reconciler<C> {
    /// Drive one definition to the state `opts` asks for.
    ///
    /// Errors raised before any write report `changed=false`; a failure after a
    /// write (a wait timing out after a create, say) carries the method and the
    /// written object.
    pub async fn reconcile(&self, definition: Json, opts: &ReconcileOptions) -> Result<ReconcileResult, ReconcileFailure> {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);
        let res = self.reconcile_one(definition, opts).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) => {
                counter!("reconcile_ok", 1u64);
                if r.changed {
                    counter!("reconcile_changed", 1u64);
                } else {
                    counter!("reconcile_noop", 1u64);
                }
                info!(method = %r.method, changed = r.changed, took_ms = %t0.elapsed().as_millis(), "reconciled");
            }
            Err(f) => {
                counter!("reconcile_err", 1u64);
                warn!(error = %f, changed = f.changed, took_ms = %t0.elapsed().as_millis(), "reconcile failed");
            }
        }
        res
    }

    async fn reconcile_one(&self, mut def: Json, opts: &ReconcileOptions) -> Result<ReconcileResult, ReconcileFailure> {
        opts.check()?;
        let plan = apply::select_strategies(&opts.merge_type, opts.apply)?;
        let kind = object::kind(&def).ok_or_else(|| ReconcileError::Definition("definition missing kind".into()))?.to_string();
        let caps = self.capabilities.lookup(&kind);

        if opts.append_hash {
            match caps.hash_fields {
                Some(fields) => {
                    let name = apply::append_hash(&mut def, fields)?;
                    debug!(name = %name, "appended content hash");
                }
                None => debug!(kind = %kind, "kind is not hashable; append_hash ignored"),
            }
        }

        let mut warnings = Vec::new();
        if let (DesiredState::Present, Some(v)) = (opts.state, opts.validate.as_ref()) {
            self.validate(&def, v, &mut warnings).await?;
        }

        let target = ObjectRef::from_definition(&def)?;
        debug!(object = %target, state = ?opts.state, "reconcile start");
        let lookup = self.lookup(&target, caps, opts.state).await?;
        let wait = opts.wait_spec();

        let mut result = match (opts.state, lookup) {
            (DesiredState::Absent, Lookup::Found(_)) => self.delete(&target, &wait, opts.check_mode).await?,
            (DesiredState::Absent, _) => ReconcileResult::noop(json!({})),
            (DesiredState::Present, Lookup::Provision) => self.provision(&target, &def, caps, opts.check_mode).await?,
            (DesiredState::Present, Lookup::Missing) => self.create(&target, &def, caps, &plan, &wait, opts.check_mode).await?,
            (DesiredState::Present, Lookup::Found(live)) => self.patch(&target, &def, live, caps, &plan, &wait, opts.check_mode).await?,
        };
        warnings.append(&mut result.warnings);
        result.warnings = warnings;
        Ok(result)
    }

    async fn validate(&self, def: &Json, opts: &ValidateOptions, warnings: &mut Vec<String>) -> Result<(), ReconcileError> {
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| ReconcileError::Capability("validation requested but no schema validator is configured".into()))?;
        match validator.validate(def, opts.version.as_deref(), opts.strict).await {
            Ok(issues) if issues.is_empty() => Ok(()),
            Ok(issues) if opts.fail_on_error => {
                counter!("validation_failed_total", 1u64);
                Err(ReconcileError::Validation { msg: format!("validation failed with {} issue(s)", issues.len()), issues })
            }
            Ok(issues) => {
                warnings.extend(issues.iter().map(|i| i.render()));
                Ok(())
            }
            Err(e) if opts.fail_on_error => {
                Err(ReconcileError::Validation { msg: format!("validation could not run: {:#}", e), issues: Vec::new() })
            }
            Err(e) => {
                warn!(error = %e, "validation skipped");
                warnings.push(format!("validation skipped: {:#}", e));
                Ok(())
            }
        }
    }

    async fn lookup(&self, target: &ObjectRef, caps: KindCapabilities, state: DesiredState) -> Result<Lookup, ReconcileError> {
        match self.client.get(target).await {
            Ok(live) => Ok(Lookup::Found(live)),
            Err(e) if state == DesiredState::Present && caps.provisioning.is_some() && provision::is_provisioning_signal(target, &e) => {
                Ok(Lookup::Provision)
            }
            Err(ClientError::NotFound(_)) => Ok(Lookup::Missing),
            Err(e) => Err(ReconcileError::cluster(format!("Failed to retrieve requested object: {}", e), e)),
        }
    }

    async fn delete(&self, target: &ObjectRef, wait: &WaitSpec, check_mode: bool) -> Result<ReconcileResult, ReconcileFailure> {
        if !check_mode {
            self.client
                .delete(target)
                .await
                .map_err(|e| ReconcileError::cluster(format!("Failed to delete object: {}", e), e))?;
        }
        let empty = json!({});
        let outcome = self
            .wait_after(target, WaitTarget::Absent, wait, None, &empty, check_mode)
            .await
            .map_err(|e| ReconcileFailure::after_write(Method::Delete, Some(json!({})), e))?;
        Ok(written(Method::Delete, empty, outcome, None))
    }

    async fn provision(&self, target: &ObjectRef, def: &Json, caps: KindCapabilities, check_mode: bool) -> Result<ReconcileResult, ReconcileFailure> {
        let Some(prov) = caps.provisioning else {
            return Err(ReconcileError::Capability(format!("{} has no provisioning request kind", target.kind)).into());
        };
        let created = if check_mode { def.clone() } else { provision::submit(&self.client, target, def, prov).await? };
        Ok(written(Method::Provision, created, None, None))
    }

    async fn create(
        &self,
        target: &ObjectRef,
        def: &Json,
        caps: KindCapabilities,
        plan: &StrategyPlan,
        wait: &WaitSpec,
        check_mode: bool,
    ) -> Result<ReconcileResult, ReconcileFailure> {
        let payload = if plan.is_apply() { apply::annotate(def) } else { def.clone() };
        let created = if check_mode {
            payload
        } else {
            self.client
                .create(&target.api_version, &target.kind, target.namespace.as_deref(), &payload)
                .await
                .map_err(|e| ReconcileError::cluster(format!("Failed to create object: {}", e), e))?
        };
        let outcome = self
            .wait_after(target, WaitTarget::Present, wait, caps.readiness, &created, check_mode)
            .await
            .map_err(|e| ReconcileFailure::after_write(Method::Create, Some(created.clone()), e))?;
        let summary = apply::diff_summary(&apply::strip_noisy(created.clone()), &json!({}));
        Ok(written(Method::Create, created, outcome, Some(summary)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn patch(
        &self,
        target: &ObjectRef,
        def: &Json,
        live: Json,
        caps: KindCapabilities,
        plan: &StrategyPlan,
        wait: &WaitSpec,
        check_mode: bool,
    ) -> Result<ReconcileResult, ReconcileFailure> {
        let strategies = plan.strategies();
        // The first strategy alone decides whether anything changed.
        let Some(first) = patch_for(plan, strategies[0], def, &live) else {
            debug!(object = %target, "already converged");
            return Ok(ReconcileResult::noop(live));
        };

        let before = apply::strip_noisy(live.clone());
        if check_mode {
            let projected = project(&live, strategies[0], def, &first);
            let summary = apply::diff_summary(&apply::strip_noisy(projected.clone()), &before);
            return Ok(written(Method::Patch, projected, None, Some(summary)));
        }

        let mut patched = None;
        let mut rejected = Vec::new();
        for (i, strategy) in strategies.iter().copied().enumerate() {
            let payload = if i == 0 { first.clone() } else { patch_for(plan, strategy, def, &live).unwrap_or_else(|| first.clone()) };
            match self.client.patch(target, strategy, &payload).await {
                Ok(obj) => {
                    debug!(object = %target, strategy = %strategy, "patched");
                    patched = Some((obj, strategy));
                    break;
                }
                Err(e @ ClientError::UnsupportedStrategy { .. }) if i + 1 < strategies.len() => {
                    counter!("patch_strategy_fallback", 1u64);
                    warn!(object = %target, strategy = %strategy, error = %e, "patch strategy rejected; trying next");
                    rejected.push(strategy);
                }
                Err(e) => return Err(ReconcileError::cluster(format!("Failed to patch object: {}", e), e).into()),
            }
        }
        let Some((patched, used)) = patched else {
            return Err(ReconcileError::Configuration("no patch strategy available".into()).into());
        };
        let fallbacks: Vec<String> =
            rejected.iter().map(|r| format!("{} patch not supported for {}; used {}", r, target.kind, used)).collect();

        let outcome = self
            .wait_after(target, WaitTarget::Present, wait, caps.readiness, &patched, false)
            .await
            .map_err(|e| ReconcileFailure::after_write(Method::Patch, Some(patched.clone()), e))?;
        let summary = apply::diff_summary(&apply::strip_noisy(patched.clone()), &before);
        let mut result = written(Method::Patch, patched, outcome, Some(summary));
        result.warnings = fallbacks;
        Ok(result)
    }

    async fn wait_after(
        &self,
        target: &ObjectRef,
        goal: WaitTarget,
        spec: &WaitSpec,
        readiness: Option<Readiness>,
        current: &Json,
        check_mode: bool,
    ) -> Result<Option<WaitOutcome>, ReconcileError> {
        if !spec.enabled || check_mode {
            return Ok(None);
        }
        let mut coordinator = WaitCoordinator::new(&self.client);
        if let Some(n) = self.not_found_tolerance {
            coordinator = coordinator.with_not_found_tolerance(n);
        }
        coordinator.wait(target, goal, spec, readiness, current).await.map(Some)
    }
}

fn patch_for(plan: &StrategyPlan, strategy: MergeStrategy, def: &Json, live: &Json) -> Option<Json> {
    match plan {
        StrategyPlan::Apply => apply::apply_patch(def, live),
        StrategyPlan::Patch(_) => apply::compute_patch(def, live, strategy),
    }
}

// What `live` becomes once `patch` lands, for check mode.
fn project(live: &Json, strategy: MergeStrategy, def: &Json, patch: &Json) -> Json {
    let mut out = live.clone();
    match strategy {
        MergeStrategy::Merge => json_patch::merge(&mut out, patch),
        MergeStrategy::Json => {
            let applied = serde_json::from_value::<json_patch::Patch>(patch.clone())
                .map_err(|e| e.to_string())
                .and_then(|ops| json_patch::patch(&mut out, &ops).map_err(|e| e.to_string()));
            if let Err(e) = applied {
                debug!(error = %e, "json patch projection failed; overlaying definition");
                return apply::overlay(live, def);
            }
        }
        // keyed list elements in the body are partial; overlay the definition instead
        MergeStrategy::StrategicMerge => return apply::overlay(live, def),
    }
    out
}

// Result of a write; after a wait the observed object replaces the written one.
fn written(method: Method, object: Json, outcome: Option<WaitOutcome>, diff: Option<apply::DiffSummary>) -> ReconcileResult {
    let (result, duration) = match outcome {
        Some(o) if method == Method::Delete => (object, Some(o.elapsed_secs())),
        Some(o) => {
            let secs = o.elapsed_secs();
            (o.object, Some(secs))
        }
        None => (object, None),
    };
    ReconcileResult { changed: true, method, result, duration, diff, warnings: Vec::new() }
}
