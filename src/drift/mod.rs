//! C10: Drift-Corrected Scheduler.
//!
//! Wraps a [`crate::scheduler::Scheduler`] with a correction-aware router
//! and cache pair rather than subclassing or monkey-patching the wrapped
//! scheduler in place: the wrapping is expressed as composition with
//! explicit transform hooks registered on the collaborators at
//! construction, since [`crate::transport::control_router::ControlRouter`]
//! and [`crate::transport::cache::PubSubCache`] are not subclassable.

pub mod correction;
pub mod scheduler;

pub use correction::{CandidateSelection, DriftOracle};
pub use scheduler::{DriftScheduler, DriftSchedulerConfig};
