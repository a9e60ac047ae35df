//! Canonical topic names for every message kind the translator publishes.
//!
//! Topics are derived from a fixed string per type rather than by
//! reflecting on the payload's type name at runtime, since every payload
//! type here is a closed, locally-defined enum/struct.

use crate::messages::ScanParameters2D;
use serde::{Deserialize, Serialize};

/// Topic for `Scan2D` publications when the cache's topic policy is
/// "one topic per concrete type".
pub const SCAN2D: &str = "scan2d";
/// Topic for `ScanParameters2D` publications.
pub const SCAN_PARAMS: &str = "scan_params";
/// Topic for `ZCtrlParameters` publications.
pub const ZCTRL_PARAMS: &str = "zctrl_params";
/// Topic for `ScopeState` publications.
pub const SCOPE_STATE: &str = "scope_state";
/// Topic for `ProbePosition` publications.
pub const PROBE_POSITION: &str = "probe_position";
/// Topic for `Spec1D` publications.
pub const SPEC1D: &str = "spec1d";
/// Topic for `ControlState` publications.
pub const CONTROL_STATE: &str = "control_state";
/// Topic for a rescan request re-published by the drift scheduler's
/// rescan trigger.
pub const RESCAN_REQUEST: &str = "rescan_request";
/// Reserved topic terminating every subscriber that observes it.
pub const KILL: &str = "KILL";

/// How the cache derives a topic for an incoming `Scan2D`: "one topic per
/// concrete type" vs "one topic per (type, roi-size) pair, so that scans at
/// different zoom levels are cached independently."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanTopicPolicy {
    /// Policy (a): every `Scan2D` shares one topic.
    PerType,
    /// Policy (b): `Scan2D`s are partitioned by their ROI size, so a
    /// subscriber replaying history for one zoom level never sees a
    /// last-value cache entry from a different zoom level clobber it.
    PerTypeAndRoiSize,
}

/// Derive the topic a given `Scan2D`'s parameters should publish/cache
/// under, per `policy`.
pub fn scan_topic(policy: ScanTopicPolicy, params: &ScanParameters2D) -> String {
    match policy {
        ScanTopicPolicy::PerType => SCAN2D.to_string(),
        ScanTopicPolicy::PerTypeAndRoiSize => {
            format!("{SCAN2D}.{}x{}", params.size_x as i64, params.size_y as i64)
        }
    }
}
