//! Wire data model: the message types exchanged between components.
//!
//! [`drift::CorrectionInfo`]'s offset and rate are always stored in meters
//! (and meters/second) regardless of the unit a given [`scan::ProbePosition`]
//! arrives in; conversion happens at the edges.

pub mod action;
pub mod drift;
pub mod param;
pub mod scan;
pub mod state;

pub use action::{ActionMsg, PortableAction};
pub use drift::{CorrectionInfo, DriftLogRow, DriftSnapshot};
pub use param::{ParameterMsg, ParameterUnit, ParameterValue, PortableParameter};
pub use scan::{ProbePosition, Scan2D, ScanParameters2D, Spec1D, SpatialMessage, ZCtrlParameters};
pub use state::{ControlMode, ControlState, ExperimentProblem, ScopeState};
