//! Weave outcome reporting

use crate::catalog::PatchId;
use crate::error::WeaveError;
use tracing::{debug, warn};

/// A class kept unmodified because a weave failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeaveFailureReport {
    /// Target class
    pub class: String,
    /// Offending patch; `None` when the failure is not attributable to one
    pub patch: Option<PatchId>,
    /// Reason
    pub reason: WeaveError,
}

/// Receives weave outcomes from the coordinator
///
/// Called on the loading thread, inside the coordinator's panic boundary.
pub trait WeaveListener: Send + Sync {
    /// A class was left unmodified
    fn on_weave_failed(&self, report: &WeaveFailureReport);

    /// Patches were applied to a class
    fn on_weave_applied(&self, class: &str, patches: &[PatchId]) {
        let _ = (class, patches);
    }
}

/// Listener that logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl WeaveListener for TracingListener {
    fn on_weave_failed(&self, report: &WeaveFailureReport) {
        match &report.patch {
            Some(patch) => warn!(
                class = %report.class,
                %patch,
                reason = %report.reason,
                "instrumentation skipped for class"
            ),
            None => warn!(
                class = %report.class,
                reason = %report.reason,
                "instrumentation skipped for class"
            ),
        }
    }

    fn on_weave_applied(&self, class: &str, patches: &[PatchId]) {
        debug!(class, patches = patches.len(), "class instrumented");
    }
}
