use crate::errors::EngineResult;
use crate::models::EntityKind;

/// Observer for bulk runs. Implementations should be cheap; a failing
/// reporter never fails the run.
pub trait ProgressReporter: Send + Sync {
    fn mark_created(&self, kind: EntityKind, ref_id: i64, name: &str) -> EngineResult<()>;
    fn mark_updated(&self, kind: EntityKind, ref_id: i64, name: &str) -> EngineResult<()>;
    fn mark_removed(&self, kind: EntityKind, ref_id: i64) -> EngineResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn mark_created(&self, _kind: EntityKind, _ref_id: i64, _name: &str) -> EngineResult<()> {
        Ok(())
    }

    fn mark_updated(&self, _kind: EntityKind, _ref_id: i64, _name: &str) -> EngineResult<()> {
        Ok(())
    }

    fn mark_removed(&self, _kind: EntityKind, _ref_id: i64) -> EngineResult<()> {
        Ok(())
    }
}

pub(crate) fn report_created(
    reporter: &dyn ProgressReporter,
    kind: EntityKind,
    ref_id: i64,
    name: &str,
) {
    if let Err(err) = reporter.mark_created(kind, ref_id, name) {
        tracing::warn!(kind = kind.as_str(), ref_id, error = %err, "progress reporter failed");
    }
}

pub(crate) fn report_updated(
    reporter: &dyn ProgressReporter,
    kind: EntityKind,
    ref_id: i64,
    name: &str,
) {
    if let Err(err) = reporter.mark_updated(kind, ref_id, name) {
        tracing::warn!(kind = kind.as_str(), ref_id, error = %err, "progress reporter failed");
    }
}

pub(crate) fn report_removed(reporter: &dyn ProgressReporter, kind: EntityKind, ref_id: i64) {
    if let Err(err) = reporter.mark_removed(kind, ref_id) {
        tracing::warn!(kind = kind.as_str(), ref_id, error = %err, "progress reporter failed");
    }
}
