//! Microscope and experiment state enums shared by every component.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The operational state of the physical microscope, as reported by the
/// translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeState {
    /// State has not yet been determined (translator has not polled the device).
    Undefined,
    /// Idle; any command may be issued.
    Free,
    /// The tip or stage is moving but not scanning or probing.
    Moving,
    /// A 2D scan is in progress.
    Scanning,
    /// A 1D spectrum is being collected.
    CollectingSpec,
    /// A parameter change is being applied and has not yet settled.
    BusyParam,
    /// The scope was interrupted (e.g. a stop request mid-scan).
    Interrupted,
    /// A coarse (non-piezo) motor move is in progress.
    CoarseMotor,
}

impl Default for ScopeState {
    fn default() -> Self {
        ScopeState::Undefined
    }
}

/// Who is allowed to issue control requests right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlMode {
    /// Experiment automation loops may request control.
    Automated,
    /// A human operator has taken exclusive manual control.
    Manual,
    /// The experiment has one or more unresolved problems; only
    /// problem-handling clients may act.
    Problem,
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::Automated
    }
}

/// A reported obstruction to automated experiment progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentProblem {
    /// The tip is believed to need changing.
    TipChange,
    /// The device itself is reporting a fault.
    DeviceMalfunction,
    /// Thermal drift has exceeded a tolerable bound.
    ThermalDrift,
    /// The feedback loop's setpoint is too high (tip losing contact risk).
    FeedbackOverset,
    /// The feedback loop's setpoint is too low (tip crash risk).
    FeedbackUnderset,
    /// A device-specific problem not in the closed set above.
    Other(String),
}

/// The full arbitration state tracked by the control router and visible to
/// clients via `ControlState` snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    /// Current arbitration mode.
    pub control_mode: ControlMode,
    /// Outstanding problems blocking automated control, if any.
    pub problems: HashSet<ExperimentProblem>,
}

impl ControlState {
    /// True if no problems are outstanding and automated clients may act.
    pub fn is_automated_and_clear(&self) -> bool {
        self.control_mode == ControlMode::Automated && self.problems.is_empty()
    }
}
