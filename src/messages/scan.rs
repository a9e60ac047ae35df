//! Scan, spectrum, and spatial parameter data types.

use crate::units::{AngleUnit, LengthUnit};
use serde::{Deserialize, Serialize};

/// A completed 2D scan image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan2D {
    /// Row-major pixel data, one `f64` per pixel.
    pub data: Vec<f64>,
    /// Number of columns.
    pub width: usize,
    /// Number of rows.
    pub height: usize,
    /// The scan parameters that produced this image.
    pub params: ScanParameters2D,
    /// Wall-clock time the scan completed.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Physical channel this scan represents (e.g. "height", "phase").
    pub channel: String,
}

/// A completed 1D spectroscopy collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec1D {
    /// Independent-variable samples (e.g. bias voltage).
    pub x: Vec<f64>,
    /// Dependent-variable samples (e.g. current).
    pub y: Vec<f64>,
    /// Tip position at which the spectrum was collected.
    pub position: ProbePosition,
    /// Wall-clock time the collection completed.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Physical channel this spectrum represents.
    pub channel: String,
}

/// The geometric parameters of a 2D scan region, in the sample coordinate
/// system (SCS) unless otherwise noted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters2D {
    /// Top-left corner X.
    pub top_left_x: f64,
    /// Top-left corner Y.
    pub top_left_y: f64,
    /// Scan size in X.
    pub size_x: f64,
    /// Scan size in Y.
    pub size_y: f64,
    /// Unit of the four geometry fields above.
    pub length_unit: LengthUnit,
    /// Number of pixels in X.
    pub data_shape_x: u32,
    /// Number of pixels in Y.
    pub data_shape_y: u32,
    /// In-plane rotation of the scan region.
    pub angle: f64,
    /// Unit of `angle`.
    pub angle_unit: AngleUnit,
}

/// Z-feedback controller parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZCtrlParameters {
    /// Whether the Z feedback loop is enabled.
    pub feedback_on: bool,
    /// Proportional gain.
    pub proportional_gain: f64,
    /// Integral gain.
    pub integral_gain: f64,
    /// Feedback setpoint.
    pub setpoint: f64,
}

/// A single probe (tip) position, in the sample coordinate system (SCS)
/// unless otherwise noted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbePosition {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Unit of `x`/`y`.
    pub length_unit: LengthUnit,
}

/// The closed set of wire message shapes that carry spatial information and
/// therefore require coordinate-frame drift correction.
///
/// This enum replaces a reflective "walk every field of a generic message
/// looking for spatial sub-messages" approach (the redesign this project
/// intentionally rejects, see `DESIGN.md`) with an exhaustive match over a
/// small closed set. Adding a new spatial message type is a compile error
/// at every match site until handled, which is the point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpatialMessage {
    /// A standalone scan-parameters message.
    ScanParams(ScanParameters2D),
    /// A standalone probe-position message.
    Probe(ProbePosition),
    /// A completed scan, which embeds scan parameters.
    Scan(Scan2D),
    /// A completed spectrum, which embeds a probe position.
    Spec(Spec1D),
}

impl SpatialMessage {
    /// Replace the spatial payload in place with `params`/`position` as
    /// appropriate, preserving every non-spatial field untouched.
    pub fn with_scan_params(mut self, params: ScanParameters2D) -> Self {
        match &mut self {
            SpatialMessage::ScanParams(p) => *p = params,
            SpatialMessage::Scan(s) => s.params = params,
            SpatialMessage::Probe(_) | SpatialMessage::Spec(_) => {}
        }
        self
    }

    /// Replace the probe position in place, preserving every other field.
    pub fn with_probe_position(mut self, position: ProbePosition) -> Self {
        match &mut self {
            SpatialMessage::Probe(p) => *p = position,
            SpatialMessage::Spec(s) => s.position = position,
            SpatialMessage::ScanParams(_) | SpatialMessage::Scan(_) => {}
        }
        self
    }
}
