//! C7: Action Handler.
//!
//! A closed enum of requests dispatched through a single device-facing
//! call, rather than a string-keyed command table.

use crate::error::{Result, SpmError};
use crate::messages::PortableAction;
use std::collections::HashMap;
use std::sync::Arc;

/// The device-facing boundary an action dispatches to. Implemented by the
/// instrument adapter (or a mock, in tests).
pub trait DeviceActionIo: Send + Sync {
    /// Perform `action`. Returning `Ok(())` means the action was accepted;
    /// completion, if asynchronous on the device side, is reported through
    /// the translator's own state polling rather than this call.
    fn perform(&self, action: PortableAction) -> Result<()>;
}

type ActionFn = dyn Fn() -> Result<()> + Send + Sync;

/// Maps portable actions this translator supports to a device-facing
/// implementation via `request(action)`/`supports(action)`.
pub struct ActionHandler {
    device: Arc<dyn DeviceActionIo>,
    overrides: HashMap<PortableAction, Arc<ActionFn>>,
    supported: std::collections::HashSet<PortableAction>,
}

impl ActionHandler {
    /// Create a handler dispatching every registered action through
    /// `device`'s `perform`.
    pub fn new(device: Arc<dyn DeviceActionIo>) -> Self {
        Self {
            device,
            overrides: HashMap::new(),
            supported: std::collections::HashSet::new(),
        }
    }

    /// Declare `action` as supported, dispatched through the shared
    /// `DeviceActionIo`.
    pub fn register(&mut self, action: PortableAction) {
        self.supported.insert(action);
    }

    /// Declare `action` as supported via a custom closure instead of the
    /// shared device boundary (e.g. a composite action implemented purely
    /// in software, such as a sequenced `MoveProbe` + settle delay).
    pub fn register_custom(&mut self, action: PortableAction, handler: Arc<ActionFn>) {
        self.supported.insert(action);
        self.overrides.insert(action, handler);
    }

    /// `supports(action)` introspection.
    pub fn supports(&self, action: PortableAction) -> bool {
        self.supported.contains(&action)
    }

    /// `request(action)`: dispatch to the custom handler if registered,
    /// otherwise the shared device boundary. `ActionNotSupported` if
    /// neither is registered for `action`.
    pub fn request(&self, action: PortableAction) -> Result<()> {
        if !self.supported.contains(&action) {
            return Err(SpmError::ActionNotSupported(format!("{action:?}")));
        }
        if let Some(handler) = self.overrides.get(&action) {
            return handler();
        }
        self.device
            .perform(action)
            .map_err(|e| SpmError::ActionError(e.to_string()))
    }
}
