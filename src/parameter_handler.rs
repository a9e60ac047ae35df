//! C6: Parameter Handler.
//!
//! A device-independent catalog mapping portable parameter names to
//! device-specific get/set, in the builder/registry shape of a typed value
//! with an optional range and a hardware read/write callback per entry.
//!
//! This crate's wire types already carry a typed [`ParameterValue`] and an
//! optional [`ParameterUnit`] (see `messages/param.rs`), so validating an
//! incoming `Set` is a type-tag check against the descriptor's
//! `sample_value` rather than a string parse.

use crate::error::{Result, SpmError};
use crate::messages::{ParameterUnit, ParameterValue, PortableParameter};
use crate::units::{convert_angle, convert_length};
use std::collections::HashMap;
use std::sync::Arc;

/// A device-specific parameter descriptor.
pub struct Descriptor {
    /// Device-specific identifier the translator's device adapter uses to
    /// address this parameter.
    pub device_id: String,
    /// The unit the device adapter's raw get/set expects/returns.
    pub native_unit: ParameterUnit,
    /// Inclusive `[lo, hi]` clamp range, if any.
    pub range: Option<(f64, f64)>,
    /// A value of the expected scalar type, used only to validate that an
    /// incoming `Set`'s `ParameterValue` variant matches.
    pub sample_value: ParameterValue,
}

type CustomGetter = dyn Fn() -> Result<ParameterValue> + Send + Sync;
type CustomSetter = dyn Fn(ParameterValue) -> Result<()> + Send + Sync;

/// The device-facing boundary a descriptor-driven parameter dispatches raw
/// (native-unit) float reads/writes through. Boolean/int/state parameters
/// are expected to register a custom getter/setter instead, since a single
/// raw-float device channel cannot carry them.
pub trait DeviceParameterIo: Send + Sync {
    /// Read the current raw (native-unit) magnitude for `device_id`.
    fn get_raw(&self, device_id: &str) -> Result<f64>;
    /// Write `value`, a raw (native-unit) magnitude, for `device_id`.
    fn set_raw(&self, device_id: &str, value: f64) -> Result<()>;
}

enum Mapping {
    /// Descriptor form: dispatch through `DeviceParameterIo` by device id.
    Descriptor(Descriptor),
    /// Custom getter/setter form, wins if both are registered for the same
    /// parameter — enforced by `ParameterHandler::register_custom` replacing
    /// rather than coexisting with a prior descriptor.
    Custom {
        getter: Option<Arc<CustomGetter>>,
        setter: Option<Arc<CustomSetter>>,
    },
}

/// Maps portable parameter names to device-specific get/set, performing
/// unit conversion and range clamping along the way.
pub struct ParameterHandler {
    device: Arc<dyn DeviceParameterIo>,
    mappings: HashMap<PortableParameter, Mapping>,
}

impl ParameterHandler {
    /// Create a handler dispatching descriptor-driven parameters through
    /// `device`.
    pub fn new(device: Arc<dyn DeviceParameterIo>) -> Self {
        Self {
            device,
            mappings: HashMap::new(),
        }
    }

    /// Register a descriptor-driven mapping for `parameter`. A subsequent
    /// `register_custom` for the same parameter takes precedence.
    pub fn register_descriptor(&mut self, parameter: PortableParameter, descriptor: Descriptor) {
        self.mappings.insert(parameter, Mapping::Descriptor(descriptor));
    }

    /// Register an explicit getter/setter pair for `parameter`, overriding
    /// any descriptor previously registered for it.
    pub fn register_custom(
        &mut self,
        parameter: PortableParameter,
        getter: Option<Arc<CustomGetter>>,
        setter: Option<Arc<CustomSetter>>,
    ) {
        self.mappings.insert(parameter, Mapping::Custom { getter, setter });
    }

    /// True if `parameter` has any mapping registered.
    pub fn supports(&self, parameter: PortableParameter) -> bool {
        self.mappings.contains_key(&parameter)
    }

    /// `get(param) -> (value, unit)`.
    pub fn get(&self, parameter: PortableParameter) -> Result<(ParameterValue, Option<ParameterUnit>)> {
        match self.mappings.get(&parameter) {
            None => Err(SpmError::ParameterNotSupported(format!("{parameter:?}"))),
            Some(Mapping::Custom { getter: Some(getter), .. }) => Ok((getter()?, None)),
            Some(Mapping::Custom { getter: None, .. }) => {
                Err(SpmError::ConfigurationError(format!("{parameter:?} has no getter")))
            }
            Some(Mapping::Descriptor(descriptor)) => {
                let raw = self
                    .device
                    .get_raw(&descriptor.device_id)
                    .map_err(|e| SpmError::ParameterError(e.to_string()))?;
                let value = coerce_sample_type(raw, &descriptor.sample_value)?;
                Ok((value, Some(descriptor.native_unit)))
            }
        }
    }

    /// `set(param, value, unit)`: typify, convert, clamp, then dispatch.
    pub fn set(&self, parameter: PortableParameter, value: ParameterValue, unit: Option<ParameterUnit>) -> Result<()> {
        match self.mappings.get(&parameter) {
            None => Err(SpmError::ParameterNotSupported(format!("{parameter:?}"))),
            Some(Mapping::Custom { setter: Some(setter), .. }) => setter(value),
            Some(Mapping::Custom { setter: None, .. }) => {
                Err(SpmError::ConfigurationError(format!("{parameter:?} has no setter")))
            }
            Some(Mapping::Descriptor(descriptor)) => self.set_via_descriptor(descriptor, value, unit),
        }
    }

    /// `set_many`: validate every conversion first, then commit all sets, so
    /// a multi-parameter update never partially applies.
    pub fn set_many(&self, writes: Vec<(PortableParameter, ParameterValue, Option<ParameterUnit>)>) -> Result<()> {
        let mut planned = Vec::with_capacity(writes.len());
        for (parameter, value, unit) in writes {
            match self.mappings.get(&parameter) {
                None => return Err(SpmError::ParameterNotSupported(format!("{parameter:?}"))),
                Some(Mapping::Custom { setter: Some(setter), .. }) => planned.push(PlannedWrite::Custom {
                    setter: setter.clone(),
                    value,
                }),
                Some(Mapping::Custom { setter: None, .. }) => {
                    return Err(SpmError::ConfigurationError(format!("{parameter:?} has no setter")))
                }
                Some(Mapping::Descriptor(descriptor)) => {
                    let native_value = convert_and_clamp(descriptor, &value, unit)?;
                    planned.push(PlannedWrite::Descriptor {
                        device_id: descriptor.device_id.clone(),
                        native_value,
                    });
                }
            }
        }
        for write in planned {
            match write {
                PlannedWrite::Custom { setter, value } => setter(value)?,
                PlannedWrite::Descriptor { device_id, native_value } => self
                    .device
                    .set_raw(&device_id, native_value)
                    .map_err(|e| SpmError::ParameterError(e.to_string()))?,
            }
        }
        Ok(())
    }

    fn set_via_descriptor(&self, descriptor: &Descriptor, value: ParameterValue, unit: Option<ParameterUnit>) -> Result<()> {
        let native_value = convert_and_clamp(descriptor, &value, unit)?;
        self.device
            .set_raw(&descriptor.device_id, native_value)
            .map_err(|e| SpmError::ParameterError(e.to_string()))
    }
}

enum PlannedWrite {
    Custom {
        setter: Arc<CustomSetter>,
        value: ParameterValue,
    },
    Descriptor {
        device_id: String,
        native_value: f64,
    },
}

/// Typify, convert, and clamp a parameter write. Returns the native-unit raw
/// magnitude ready for `DeviceParameterIo::set_raw`.
fn convert_and_clamp(descriptor: &Descriptor, value: &ParameterValue, unit: Option<ParameterUnit>) -> Result<f64> {
    let magnitude = match (value, &descriptor.sample_value) {
        (ParameterValue::Bool(b), ParameterValue::Bool(_)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        (ParameterValue::Int(i), ParameterValue::Int(_)) => *i as f64,
        (ParameterValue::Float(f), ParameterValue::Float(_)) => match (unit, descriptor.native_unit) {
            (Some(ParameterUnit::Length(from)), ParameterUnit::Length(to)) => convert_length(*f, from, to),
            (Some(ParameterUnit::Angle(from)), ParameterUnit::Angle(to)) => convert_angle(*f, from, to),
            (Some(ParameterUnit::Dimensionless), ParameterUnit::Dimensionless) | (None, ParameterUnit::Dimensionless) => *f,
            (None, ParameterUnit::Length(_)) | (None, ParameterUnit::Angle(_)) => {
                return Err(SpmError::ParameterError(
                    "missing unit for physical-quantity parameter".to_string(),
                ))
            }
            _ => {
                return Err(SpmError::ConversionError {
                    from: format!("{unit:?}"),
                    to: format!("{:?}", descriptor.native_unit),
                })
            }
        },
        _ => {
            return Err(SpmError::ParameterError(format!(
                "value type mismatch: expected {:?}, got {value:?}",
                descriptor.sample_value
            )))
        }
    };

    let clamped = match descriptor.range {
        Some((lo, hi)) if magnitude < lo => {
            tracing::debug!(device_id = %descriptor.device_id, magnitude, lo, hi, "clamped parameter to range lower bound");
            lo
        }
        Some((lo, hi)) if magnitude > hi => {
            tracing::debug!(device_id = %descriptor.device_id, magnitude, lo, hi, "clamped parameter to range upper bound");
            hi
        }
        _ => magnitude,
    };
    Ok(clamped)
}

/// Coerce a raw device float back into the portable `ParameterValue`
/// variant matching `sample_value`'s discriminant (the read-side mirror of
/// `convert_and_clamp`'s type check).
fn coerce_sample_type(raw: f64, sample_value: &ParameterValue) -> Result<ParameterValue> {
    match sample_value {
        ParameterValue::Float(_) => Ok(ParameterValue::Float(raw)),
        ParameterValue::Int(_) => Ok(ParameterValue::Int(raw.round() as i64)),
        ParameterValue::Bool(_) => Ok(ParameterValue::Bool(raw != 0.0)),
        ParameterValue::State(_) => Err(SpmError::ConfigurationError(
            "ScopeState parameters cannot be read through the generic raw-float device boundary".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::LengthUnit;
    use std::sync::Mutex;

    struct MockDevice {
        values: Mutex<HashMap<String, f64>>,
    }

    impl MockDevice {
        fn new() -> Self {
            Self {
                values: Mutex::new(HashMap::new()),
            }
        }
    }

    impl DeviceParameterIo for MockDevice {
        fn get_raw(&self, device_id: &str) -> Result<f64> {
            Ok(*self.values.lock().unwrap().get(device_id).unwrap_or(&0.0))
        }
        fn set_raw(&self, device_id: &str, value: f64) -> Result<()> {
            self.values.lock().unwrap().insert(device_id.to_string(), value);
            Ok(())
        }
    }

    fn handler_with_scan_size_x() -> (Arc<MockDevice>, ParameterHandler) {
        let device = Arc::new(MockDevice::new());
        let mut handler = ParameterHandler::new(device.clone());
        handler.register_descriptor(
            PortableParameter::ScanSizeX,
            Descriptor {
                device_id: "scan.size_x".to_string(),
                native_unit: ParameterUnit::Length(LengthUnit::Nanometer),
                range: Some((1.0, 10_000.0)),
                sample_value: ParameterValue::Float(0.0),
            },
        );
        (device, handler)
    }

    #[test]
    fn unmapped_parameter_is_not_supported() {
        let (_device, handler) = handler_with_scan_size_x();
        let err = handler.get(PortableParameter::ZCtrlSetpoint).unwrap_err();
        assert!(matches!(err, SpmError::ParameterNotSupported(_)));
    }

    #[test]
    fn set_converts_units_to_native() {
        let (device, handler) = handler_with_scan_size_x();
        handler
            .set(
                PortableParameter::ScanSizeX,
                ParameterValue::Float(1.0),
                Some(ParameterUnit::Length(LengthUnit::Micrometer)),
            )
            .unwrap();
        assert_eq!(device.get_raw("scan.size_x").unwrap(), 1000.0);
    }

    #[test]
    fn set_without_unit_on_physical_quantity_is_parameter_error() {
        let (_device, handler) = handler_with_scan_size_x();
        let err = handler
            .set(PortableParameter::ScanSizeX, ParameterValue::Float(5.0), None)
            .unwrap_err();
        assert!(matches!(err, SpmError::ParameterError(_)));
    }

    #[test]
    fn set_clamps_to_range_without_failing() {
        let (device, handler) = handler_with_scan_size_x();
        handler
            .set(
                PortableParameter::ScanSizeX,
                ParameterValue::Float(50_000.0),
                Some(ParameterUnit::Length(LengthUnit::Nanometer)),
            )
            .unwrap();
        assert_eq!(device.get_raw("scan.size_x").unwrap(), 10_000.0);
    }

    #[test]
    fn set_many_does_not_partially_apply_on_conversion_failure() {
        let (device, handler) = handler_with_scan_size_x();
        let result = handler.set_many(vec![
            (
                PortableParameter::ScanSizeX,
                ParameterValue::Float(2.0),
                Some(ParameterUnit::Length(LengthUnit::Micrometer)),
            ),
            (PortableParameter::ZCtrlSetpoint, ParameterValue::Float(1.0), None),
        ]);
        assert!(result.is_err());
        // The first write must not have committed despite succeeding in isolation.
        assert_eq!(device.get_raw("scan.size_x").unwrap(), 0.0);
    }

    #[test]
    fn custom_setter_wins_over_descriptor() {
        let (_device, mut handler) = handler_with_scan_size_x();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        handler.register_custom(
            PortableParameter::ScanSizeX,
            None,
            Some(Arc::new(move |v| {
                *seen_clone.lock().unwrap() = Some(v);
                Ok(())
            })),
        );
        handler
            .set(PortableParameter::ScanSizeX, ParameterValue::Float(3.0), None)
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(ParameterValue::Float(3.0)));
    }
}
