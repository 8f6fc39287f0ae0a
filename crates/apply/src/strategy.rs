//! Which patch strategies to try, and in what order.

use rekon_core::{MergeStrategy, ReconcileError};
use smallvec::SmallVec;

pub const DEFAULT_ORDER: [MergeStrategy; 2] = [MergeStrategy::StrategicMerge, MergeStrategy::Merge];

pub type Strategies = SmallVec<[MergeStrategy; 3]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyPlan {
    /// Three-way apply against the last-applied annotation, sent as a merge patch.
    Apply,
    /// Two-way patches, tried in order until one is accepted.
    Patch(Strategies),
}

impl StrategyPlan {
    /// Strategies in attempt order. The first one decides whether anything changed.
    pub fn strategies(&self) -> &[MergeStrategy] {
        match self {
            Self::Apply => &[MergeStrategy::Merge],
            Self::Patch(list) => list.as_slice(),
        }
    }

    pub fn is_apply(&self) -> bool {
        matches!(self, Self::Apply)
    }
}

/// Resolve the configured strategies. Duplicates are dropped keeping the first
/// occurrence; an empty list means [`DEFAULT_ORDER`].
pub fn select_strategies(configured: &[MergeStrategy], apply: bool) -> Result<StrategyPlan, ReconcileError> {
    if apply && !configured.is_empty() {
        return Err(ReconcileError::Configuration("parameters are mutually exclusive: apply|merge_type".into()));
    }
    if apply {
        return Ok(StrategyPlan::Apply);
    }
    let source: &[MergeStrategy] = if configured.is_empty() { &DEFAULT_ORDER } else { configured };
    let mut out = Strategies::new();
    for s in source {
        if !out.contains(s) {
            out.push(*s);
        }
    }
    Ok(StrategyPlan::Patch(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_configuration_uses_default_order() {
        let plan = select_strategies(&[], false).unwrap();
        assert_eq!(plan.strategies(), &[MergeStrategy::StrategicMerge, MergeStrategy::Merge]);
    }

    #[test]
    fn configured_order_is_kept_without_duplicates() {
        let plan = select_strategies(&[MergeStrategy::Json, MergeStrategy::Merge, MergeStrategy::Json], false).unwrap();
        assert_eq!(plan.strategies(), &[MergeStrategy::Json, MergeStrategy::Merge]);
    }

    #[test]
    fn apply_excludes_merge_type() {
        let err = select_strategies(&[MergeStrategy::Merge], true).unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)));
        let plan = select_strategies(&[], true).unwrap();
        assert!(plan.is_apply());
        assert_eq!(plan.strategies(), &[MergeStrategy::Merge]);
    }
}
