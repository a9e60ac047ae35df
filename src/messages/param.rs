//! Portable parameter naming and parameter request/response messages.
//!
//! The variant set covers a closed, device-independent parameter
//! vocabulary as a Rust enum instead of a string-keyed catalog, so that
//! translators get a compile-time-checked match rather than a runtime
//! string lookup.

use crate::units::{AngleUnit, LengthUnit};
use serde::{Deserialize, Serialize};

/// The unit a [`ParameterValue::Float`] is expressed in, when the parameter
/// is a physical quantity. `None` for dimensionless/boolean/integer
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterUnit {
    /// A length quantity, in the given unit.
    Length(LengthUnit),
    /// An angle quantity, in the given unit.
    Angle(AngleUnit),
    /// No unit conversion applies.
    Dimensionless,
}

/// A portable (device-independent) parameter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortableParameter {
    /// Read-only: current `ScopeState`.
    ScopeState,
    /// Scan region top-left X.
    ScanTopLeftX,
    /// Scan region top-left Y.
    ScanTopLeftY,
    /// Scan region size X.
    ScanSizeX,
    /// Scan region size Y.
    ScanSizeY,
    /// Scan region in-plane rotation.
    ScanAngle,
    /// Scan resolution, pixels in X.
    ScanResolutionX,
    /// Scan resolution, pixels in Y.
    ScanResolutionY,
    /// Z feedback loop enabled.
    ZCtrlFeedbackOn,
    /// Z feedback proportional gain.
    ZCtrlProportionalGain,
    /// Z feedback integral gain.
    ZCtrlIntegralGain,
    /// Z feedback setpoint.
    ZCtrlSetpoint,
    /// Probe X position.
    ProbePositionX,
    /// Probe Y position.
    ProbePositionY,
}

/// The value carried by a parameter get/set, before device-specific
/// conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    /// A floating-point magnitude.
    Float(f64),
    /// A boolean flag.
    Bool(bool),
    /// An integer magnitude.
    Int(i64),
    /// A `ScopeState` snapshot (read-only parameters only).
    State(super::state::ScopeState),
}

/// A request to read or write a portable parameter, sent from a parameter
/// client to the parameter handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParameterMsg {
    /// Read the current value of `parameter`.
    Get {
        /// Parameter to read.
        parameter: PortableParameter,
    },
    /// Write `value` to `parameter`, expressed in `unit` when `value` is a
    /// physical quantity. A physical `Set` with `unit: None` is a
    /// `ParameterError`: missing units when a unit is required.
    Set {
        /// Parameter to write.
        parameter: PortableParameter,
        /// New value.
        value: ParameterValue,
        /// Unit `value` is expressed in, if `value` is a physical quantity.
        unit: Option<ParameterUnit>,
    },
    /// Successful response to a `Get` or `Set`, paired with the descriptor's
    /// native unit.
    Value {
        /// Parameter the value corresponds to.
        parameter: PortableParameter,
        /// Current value after the operation.
        value: ParameterValue,
        /// Unit `value` is expressed in, if `value` is a physical quantity.
        unit: Option<ParameterUnit>,
    },
    /// The handler rejected the request.
    Error {
        /// Parameter the request concerned.
        parameter: PortableParameter,
        /// Human-readable reason.
        reason: String,
    },
}
