//! Latched operator stop: blocks all motion until explicitly cleared.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::safety::{ActionKind, SafetyAction, SafetyCheck};

/// Session-scoped latch (no persistence). While active, `check()` reports
/// EMERGENCY and every proposed action is blocked.
///
/// The latch is a shared atomic so in-flight work can poll it directly:
/// the imaging driver uses it as its cancellation flag (see
/// [`OperatorStopCheck::latch`]), which makes activation take effect at the
/// job's next loop boundary instead of waiting for a queue gate.
pub struct OperatorStopCheck {
    active: Arc<AtomicBool>,
}

impl OperatorStopCheck {
    pub fn new() -> Self {
        Self { active: Arc::new(AtomicBool::new(false)) }
    }

    /// Latch the stop state; all motion is blocked until cleared.
    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            tracing::warn!("operator stop activated");
        }
    }

    /// Release the stop state; motion may resume.
    pub fn clear(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::info!("operator stop cleared");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The latch itself, for components that must observe the stop
    /// mid-flight (per-job cancellation).
    pub fn latch(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }
}

impl Default for OperatorStopCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyCheck for OperatorStopCheck {
    fn name(&self) -> &'static str {
        "operator_stop"
    }

    fn check(&self) -> anyhow::Result<SafetyAction> {
        Ok(if self.is_active() { SafetyAction::Emergency } else { SafetyAction::Safe })
    }

    fn check_proposed_action(&self, _kind: ActionKind) -> anyhow::Result<bool> {
        Ok(!self.is_active())
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({ "active": self.is_active() })
    }
}
