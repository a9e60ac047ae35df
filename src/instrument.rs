//! Instrument-translator contract: the boundary between the core and a
//! device-specific adapter.
//!
//! A hardware boundary expressed as an `async_trait` the device adapter
//! implements and the core depends on only through `Arc<dyn Trait>`. Unlike
//! a descriptor-driven parameter/action (C6/C7), this trait covers the
//! instrument's *polled state*: the four `poll_*` methods the Translator's
//! main loop calls every tick, plus the two state-setters
//! (`on_set_scan_params`/`on_set_zctrl_params`) whose completion semantics
//! are device-specific enough to need a dedicated hook rather than routing
//! through `DeviceParameterIo`.

use crate::error::Result;
use crate::messages::{ProbePosition, Scan2D, ScanParameters2D, Spec1D, ScopeState, ZCtrlParameters};
use crate::parameter_handler::DeviceParameterIo;
use crate::action_handler::DeviceActionIo;
use async_trait::async_trait;

/// The device-facing boundary a Translator polls every main-loop tick and
/// issues scan/z-control parameter writes through.
///
/// Implementors additionally provide a [`DeviceParameterIo`] and a
/// [`DeviceActionIo`] (via [`InstrumentBackend::parameter_io`] /
/// [`InstrumentBackend::action_io`]) so a single device adapter backs all
/// three device-facing traits the Translator composes.
#[async_trait]
pub trait InstrumentBackend: Send + Sync {
    /// `poll_scope_state() -> ScopeState`.
    async fn poll_scope_state(&self) -> Result<ScopeState>;

    /// `poll_scan_params() -> ScanParameters2D`.
    async fn poll_scan_params(&self) -> Result<ScanParameters2D>;

    /// `poll_zctrl_params() -> ZCtrlParameters` (may return default).
    async fn poll_zctrl_params(&self) -> Result<ZCtrlParameters>;

    /// `poll_scans() -> [Scan2D]` (may be empty; caller tolerates).
    async fn poll_scans(&self) -> Result<Vec<Scan2D>>;

    /// `poll_spec() -> Spec1D?`.
    async fn poll_spec(&self) -> Result<Option<Spec1D>>;

    /// `poll_probe_pos() -> ProbePosition?`.
    async fn poll_probe_pos(&self) -> Result<Option<ProbePosition>>;

    /// The device-facing parameter I/O boundary this backend registers its
    /// descriptor-driven parameters through (C6).
    fn parameter_io(&self) -> std::sync::Arc<dyn DeviceParameterIo>;

    /// The device-facing action I/O boundary this backend registers its
    /// device-driven actions through (C7).
    fn action_io(&self) -> std::sync::Arc<dyn DeviceActionIo>;

    /// Apply a new scan-parameters write directly (outside the portable
    /// parameter catalog), for instruments whose ROI geometry must be set
    /// atomically rather than field-by-field. Returns `true` if the device
    /// reports the change will complete asynchronously (the Translator
    /// should transition to `BUSY_PARAM`).
    async fn on_set_scan_params(&self, params: ScanParameters2D) -> Result<bool>;

    /// Apply a new Z-control parameters write atomically. Returns `true` if
    /// asynchronous completion is expected (`BUSY_PARAM`).
    async fn on_set_zctrl_params(&self, params: ZCtrlParameters) -> Result<bool>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::action_handler::DeviceActionIo;
    use crate::messages::PortableAction;
    use crate::parameter_handler::DeviceParameterIo;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    pub struct MockDeviceIo {
        pub raw: Mutex<HashMap<String, f64>>,
    }

    impl DeviceParameterIo for MockDeviceIo {
        fn get_raw(&self, device_id: &str) -> Result<f64> {
            Ok(*self.raw.lock().unwrap().get(device_id).unwrap_or(&0.0))
        }
        fn set_raw(&self, device_id: &str, value: f64) -> Result<()> {
            self.raw.lock().unwrap().insert(device_id.to_string(), value);
            Ok(())
        }
    }

    impl DeviceActionIo for MockDeviceIo {
        fn perform(&self, _action: PortableAction) -> Result<()> {
            Ok(())
        }
    }

    /// A scripted instrument backend: tests push the sequence of states it
    /// should report and drain it tick by tick.
    pub struct MockInstrument {
        pub io: Arc<MockDeviceIo>,
        pub scope_state: Mutex<ScopeState>,
        pub scan_params: Mutex<ScanParameters2D>,
        pub zctrl_params: Mutex<ZCtrlParameters>,
        pub scans: Mutex<Vec<Scan2D>>,
        pub spec: Mutex<Option<Spec1D>>,
        pub probe_pos: Mutex<Option<ProbePosition>>,
    }

    impl MockInstrument {
        pub fn new(scan_params: ScanParameters2D) -> Self {
            Self {
                io: Arc::new(MockDeviceIo { raw: Mutex::new(HashMap::new()) }),
                scope_state: Mutex::new(ScopeState::Free),
                scan_params: Mutex::new(scan_params),
                zctrl_params: Mutex::new(ZCtrlParameters {
                    feedback_on: true,
                    proportional_gain: 1.0,
                    integral_gain: 1.0,
                    setpoint: 1.0,
                }),
                scans: Mutex::new(Vec::new()),
                spec: Mutex::new(None),
                probe_pos: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl InstrumentBackend for MockInstrument {
        async fn poll_scope_state(&self) -> Result<ScopeState> {
            Ok(*self.scope_state.lock().unwrap())
        }
        async fn poll_scan_params(&self) -> Result<ScanParameters2D> {
            Ok(*self.scan_params.lock().unwrap())
        }
        async fn poll_zctrl_params(&self) -> Result<ZCtrlParameters> {
            Ok(*self.zctrl_params.lock().unwrap())
        }
        async fn poll_scans(&self) -> Result<Vec<Scan2D>> {
            Ok(self.scans.lock().unwrap().clone())
        }
        async fn poll_spec(&self) -> Result<Option<Spec1D>> {
            Ok(self.spec.lock().unwrap().clone())
        }
        async fn poll_probe_pos(&self) -> Result<Option<ProbePosition>> {
            Ok(*self.probe_pos.lock().unwrap())
        }
        fn parameter_io(&self) -> Arc<dyn DeviceParameterIo> {
            self.io.clone()
        }
        fn action_io(&self) -> Arc<dyn DeviceActionIo> {
            self.io.clone()
        }
        async fn on_set_scan_params(&self, params: ScanParameters2D) -> Result<bool> {
            *self.scan_params.lock().unwrap() = params;
            Ok(false)
        }
        async fn on_set_zctrl_params(&self, params: ZCtrlParameters) -> Result<bool> {
            *self.zctrl_params.lock().unwrap() = params;
            Ok(false)
        }
    }
}
