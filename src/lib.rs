//! # SPM Coordination Substrate
//!
//! A library for coordinating an automated scanning-probe-microscopy
//! experiment across many collaborating software components sharing one
//! physical instrument. The library is organized into several modules, each
//! with a distinct responsibility:
//!
//! - **`transport`**: wire framing plus the pub/sub (C2), cache (C3), and
//!   control-router (C4/C5) protocols every other component builds on.
//! - **`heartbeat`**: the liveness pair (C1) the Component Monitor uses to
//!   tell a crashed component from a planned exit.
//! - **`messages`**: the shared wire types (scans, spectra, parameters,
//!   control/arbitration state, drift correction).
//! - **`units`**: length/angle unit conversion used throughout the parameter
//!   and drift-correction paths.
//! - **`topics`**: canonical pub/sub topic names and scan-topic policy.
//! - **`parameter_handler`** / **`action_handler`**: the descriptor-driven
//!   portable parameter (C6) and action (C7) abstractions a Translator
//!   dispatches through.
//! - **`instrument`**: the device-facing boundary (`InstrumentBackend`) a
//!   concrete microscope adapter implements.
//! - **`translator`**: the Microscope Translator state machine (C8).
//! - **`scheduler`**: the single-writer Scheduler/Router (C9).
//! - **`drift`**: the Drift-Corrected Scheduler (C10) wrapping a Scheduler
//!   with coordinate-system drift correction.
//! - **`component`**: the descriptor tree and dependency graph the Monitor
//!   spawns from.
//! - **`monitor`**: the Component Monitor (C11), supervising a tree of
//!   isolated component processes via heartbeats.
//! - **`config`**: TOML + environment configuration loading and validation.
//! - **`tracing_setup`**: structured logging initialization.
//! - **`cli`**: the `clap`-derived argument surface for the `spm-node`
//!   binary.
//! - **`error`**: the crate-wide `SpmError` taxonomy.
//! - **`validation`**: small, reusable configuration-value validators.

pub mod action_handler;
pub mod cli;
pub mod component;
pub mod config;
pub mod drift;
pub mod error;
pub mod heartbeat;
pub mod instrument;
pub mod messages;
pub mod monitor;
pub mod parameter_handler;
pub mod scheduler;
pub mod topics;
pub mod tracing_setup;
pub mod transport;
pub mod translator;
pub mod units;
pub mod validation;
