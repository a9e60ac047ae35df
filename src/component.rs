//! Component descriptor tree and dependency introspection.
//!
//! A descriptor is a plain, deserializable value naming a component and the
//! concrete construction arguments for one of the fixed set of component
//! kinds this crate knows how to build, in a tagged-enum shape (discriminant
//! plus per-kind typed fields) rather than an open-ended dynamic config
//! blob, since every component kind's construction arguments are statically
//! known here. `DependencyGraph` tracks which components declare a
//! dependency on which other components, generalized from instrument/module
//! role assignments down to a plain "component depends on another
//! component's bound address" relationship.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::topics::ScanTopicPolicy;

fn default_heartbeat_period_ms() -> u64 {
    1000
}

fn default_missed_beats_before_dead() -> u32 {
    5
}

/// One entry in the configured component tree: a name, heartbeat tuning, and
/// the construction arguments for a concrete component kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Unique name, used to derive this component's heartbeat address (see
    /// [`crate::heartbeat::heartbeat_addr`]) and as its `run-component`
    /// argument.
    pub name: String,
    /// Base port the deterministic heartbeat address is derived from.
    pub heartbeat_base_port: u16,
    /// Heartbeat period. Default 1000ms.
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// Missed beats tolerated before the Monitor considers this component
    /// dead. Default 5.
    #[serde(default = "default_missed_beats_before_dead")]
    pub missed_beats_before_dead: u32,
    /// The concrete component this descriptor builds. Flattened so a TOML
    /// entry names its discriminant via a single top-level `kind` key
    /// rather than a nested table.
    #[serde(flatten)]
    pub kind: ComponentKind,
}

/// The fixed set of component kinds the Monitor knows how to spawn, each
/// carrying its own bind/connect addresses, realized as TCP addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentKind {
    /// A Microscope Translator (C8) fronting an instrument backend.
    Translator {
        /// Identifier of the instrument adapter to construct; resolution of
        /// this id to a concrete `InstrumentBackend` is left to the binary
        /// embedding this crate. Individual microscope back-end adapters are
        /// out of scope for this crate.
        instrument: String,
        /// Address the translator's publisher binds.
        publish_addr: String,
        /// Address the translator's control server binds.
        control_addr: String,
        /// How scan topics are named.
        #[serde(default = "default_scan_topic_policy")]
        scan_topic_policy: ScanTopicPolicy,
        /// Name of the translator this one subscribes to for `KILL`.
        depends_on: Vec<String>,
    },
    /// A Scheduler (C9) fronting one translator.
    Scheduler {
        /// Translator's publish address (cache upstream).
        cache_upstream: String,
        /// Address this scheduler's cache republishes on.
        cache_downstream: String,
        /// Default replay buffer length applied to any topic with no entry
        /// in `cache_capacity_overrides`.
        #[serde(default = "default_cache_capacity")]
        cache_capacity: usize,
        /// Per-topic-prefix replay buffer length overrides, e.g. a larger
        /// `K` for `scan2d` images than the default used for everything
        /// else. The longest matching prefix wins.
        #[serde(default)]
        cache_capacity_overrides: HashMap<String, usize>,
        /// Address this scheduler's control router binds.
        router_addr: String,
        /// Translator's control server address (router upstream).
        router_upstream: String,
        /// Name of the translator this scheduler fronts.
        depends_on: Vec<String>,
    },
    /// A Drift-Corrected Scheduler (C10) wrapping a Scheduler.
    DriftScheduler {
        /// Translator's publish address (cache upstream).
        cache_upstream: String,
        /// Address this scheduler's cache republishes on.
        cache_downstream: String,
        /// Default replay buffer length applied to any topic with no entry
        /// in `cache_capacity_overrides`.
        #[serde(default = "default_cache_capacity")]
        cache_capacity: usize,
        /// Per-topic-prefix replay buffer length overrides, e.g. a larger
        /// `K` for `scan2d` images than the default used for everything
        /// else. The longest matching prefix wins.
        #[serde(default)]
        cache_capacity_overrides: HashMap<String, usize>,
        /// Address this scheduler's control router binds.
        router_addr: String,
        /// Translator's control server address (router upstream).
        router_upstream: String,
        /// Address this scheduler's own rescan-request publisher binds.
        rescan_publisher_addr: String,
        /// Path the drift CSV log is appended to.
        csv_path: String,
        /// Scan channel analyzed for drift (case-insensitive substring).
        channel_id: String,
        /// Name of the translator this scheduler fronts.
        depends_on: Vec<String>,
    },
}

fn default_scan_topic_policy() -> ScanTopicPolicy {
    ScanTopicPolicy::PerType
}

fn default_cache_capacity() -> usize {
    256
}

impl ComponentDescriptor {
    /// The names of every other descriptor this one's `depends_on` names.
    /// A startup-time diagnostic only, not a runtime coupling.
    pub fn depends_on(&self) -> &[String] {
        match &self.kind {
            ComponentKind::Translator { depends_on, .. }
            | ComponentKind::Scheduler { depends_on, .. }
            | ComponentKind::DriftScheduler { depends_on, .. } => depends_on,
        }
    }
}

/// Dependency graph tracking which components declare a dependency on which
/// other components, keyed by the component names a descriptor's
/// `depends_on` names.
///
/// Purely a startup-time diagnostic: `spawn-single` uses it to report which
/// other descriptors a requested component implicitly needs, not to enforce
/// any runtime coupling.
pub struct DependencyGraph {
    component_to_dependents: HashMap<String, HashSet<String>>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    /// Creates an empty dependency graph.
    pub fn new() -> Self {
        Self { component_to_dependents: HashMap::new() }
    }

    /// Builds a graph from a full descriptor tree: for every descriptor's
    /// `depends_on` entry, records that the named component has this
    /// descriptor as a dependent.
    pub fn from_descriptors(descriptors: &[ComponentDescriptor]) -> Self {
        let mut graph = Self::new();
        for descriptor in descriptors {
            for dependency in descriptor.depends_on() {
                graph.add_dependent(dependency, &descriptor.name);
            }
        }
        graph
    }

    /// Records that `dependent` depends on `component`.
    pub fn add_dependent(&mut self, component: &str, dependent: &str) {
        self.component_to_dependents
            .entry(component.to_string())
            .or_default()
            .insert(dependent.to_string());
    }

    /// Every component currently depending on `component`.
    pub fn get_dependents(&self, component: &str) -> Vec<String> {
        self.component_to_dependents
            .get(component)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `component` can be removed from the tree without leaving a
    /// dangling dependency.
    pub fn can_remove(&self, component: &str) -> Result<(), Vec<String>> {
        let dependents = self.get_dependents(component);
        if dependents.is_empty() {
            Ok(())
        } else {
            Err(dependents)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator(name: &str) -> ComponentDescriptor {
        ComponentDescriptor {
            name: name.to_string(),
            heartbeat_base_port: 9000,
            heartbeat_period_ms: 1000,
            missed_beats_before_dead: 5,
            kind: ComponentKind::Translator {
                instrument: "mock".to_string(),
                publish_addr: "127.0.0.1:19000".to_string(),
                control_addr: "127.0.0.1:19001".to_string(),
                scan_topic_policy: ScanTopicPolicy::PerType,
                depends_on: vec![],
            },
        }
    }

    fn scheduler(name: &str, depends_on: &str) -> ComponentDescriptor {
        ComponentDescriptor {
            name: name.to_string(),
            heartbeat_base_port: 9000,
            heartbeat_period_ms: 1000,
            missed_beats_before_dead: 5,
            kind: ComponentKind::Scheduler {
                cache_upstream: "127.0.0.1:19000".to_string(),
                cache_downstream: "127.0.0.1:19010".to_string(),
                cache_capacity: 256,
                cache_capacity_overrides: HashMap::new(),
                router_addr: "127.0.0.1:19011".to_string(),
                router_upstream: "127.0.0.1:19001".to_string(),
                depends_on: vec![depends_on.to_string()],
            },
        }
    }

    #[test]
    fn graph_tracks_dependents_from_descriptors() {
        let descriptors = vec![translator("translator"), scheduler("scheduler", "translator")];
        let graph = DependencyGraph::from_descriptors(&descriptors);
        assert_eq!(graph.get_dependents("translator"), vec!["scheduler".to_string()]);
        assert!(graph.can_remove("scheduler").is_ok());
        assert_eq!(graph.can_remove("translator"), Err(vec!["scheduler".to_string()]));
    }

    #[test]
    fn descriptor_with_no_dependents_can_be_removed() {
        let graph = DependencyGraph::new();
        assert!(graph.can_remove("anything").is_ok());
    }

    #[test]
    fn kind_tag_round_trips_through_toml() {
        let descriptor = translator("translator");
        let encoded = toml::to_string(&descriptor).unwrap();
        let decoded: ComponentDescriptor = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.name, descriptor.name);
        assert!(matches!(decoded.kind, ComponentKind::Translator { .. }));
    }
}
