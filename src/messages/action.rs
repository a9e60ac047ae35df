//! Portable action naming and action request/response messages.

use serde::{Deserialize, Serialize};

/// A portable (device-independent) action identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortableAction {
    /// Begin a 2D scan using the currently-set scan parameters.
    StartScan,
    /// Stop a 2D scan in progress.
    StopScan,
    /// Begin a 1D spectroscopy collection at the current probe position.
    StartSpec,
    /// Stop a spectroscopy collection in progress.
    StopSpec,
    /// Move the probe to the currently-set probe position.
    MoveProbe,
}

/// A request to perform a portable action, sent from an action client to
/// the action handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionMsg {
    /// Request execution of `action`.
    Request {
        /// Action to perform.
        action: PortableAction,
    },
    /// The action was accepted and is in progress or complete.
    Started {
        /// Action performed.
        action: PortableAction,
    },
    /// The handler rejected the request.
    Error {
        /// Action the request concerned.
        action: PortableAction,
        /// Human-readable reason.
        reason: String,
    },
}
