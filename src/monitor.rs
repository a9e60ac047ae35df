//! C11: Component Monitor.
//!
//! A per-component-name map of spawned processes and
//! [`HeartbeatListener`]s, started up sequentially (each one must beat once
//! before the next is started, the whole startup aborting and tearing down
//! everything already running if any component fails to report alive),
//! then driven by a main loop that restarts a component whose listener
//! reports dead without a kill signal (crash/freeze) and removes one that
//! died after a kill signal (planned exit).
//!
//! Each component needs its own fresh process image and socket set, not a
//! forked copy sharing the parent's. That isolation is realized with
//! `std::process::Command` re-exec of the Monitor's own binary under a
//! hidden `run-component <name>` subcommand; every child gets an entirely
//! fresh process image and socket set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use crate::component::ComponentDescriptor;
use crate::error::{Result, SpmError};
use crate::heartbeat::{heartbeat_addr, HeartbeatListener};

/// How long [`ComponentMonitor::startup`] waits for a freshly spawned
/// component's first heartbeat before declaring the startup failed.
const STARTUP_BEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between retries while connecting to a heartbeat listener and while
/// polling for its first beat.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct RunningComponent {
    descriptor: ComponentDescriptor,
    process: Child,
    listener: HeartbeatListener,
}

/// Spawns and supervises the descriptor tree loaded from configuration.
///
/// Grounded on `AfspmComponentsMonitor.__init__`'s `component_params_dict`,
/// `component_processes`, and `listeners` — here folded into one map keyed
/// by component name, since every running component's descriptor, process
/// handle, and listener are always looked up together.
pub struct ComponentMonitor {
    binary_path: PathBuf,
    config_path: PathBuf,
    monitor_loop_sleep: Duration,
    running: HashMap<String, RunningComponent>,
}

impl ComponentMonitor {
    /// Build a monitor that re-execs `binary_path run-component <name>
    /// --config <config_path>` for each descriptor it starts.
    pub fn new(binary_path: impl Into<PathBuf>, config_path: impl Into<PathBuf>, monitor_loop_sleep: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            config_path: config_path.into(),
            monitor_loop_sleep,
            running: HashMap::new(),
        }
    }

    /// True once every supervised component has been removed (grounded on
    /// `run()`'s exit condition: `component_processes` and `listeners` both
    /// empty).
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Number of components currently supervised.
    pub fn len(&self) -> usize {
        self.running.len()
    }

    /// Sequentially spawn every descriptor in `descriptors`, blocking after
    /// each one for its first heartbeat before starting the next. If any
    /// component fails to report alive within [`STARTUP_BEAT_TIMEOUT`], every
    /// component already started is torn down and the error is returned
    /// (grounded on `_startup_processes_and_listeners`'s all-or-nothing
    /// startup).
    pub async fn startup(&mut self, descriptors: Vec<ComponentDescriptor>) -> Result<()> {
        for descriptor in descriptors {
            if let Err(err) = self.startup_one(&descriptor).await {
                tracing::error!(component = %descriptor.name, error = %err, "component failed to start, aborting startup");
                self.shutdown_all();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Spawn and await the first heartbeat of a single descriptor, without
    /// tearing down other already-running components on failure. Used both
    /// by [`ComponentMonitor::startup`] and by the restart path.
    ///
    /// Connecting and waiting for the first beat share one
    /// [`STARTUP_BEAT_TIMEOUT`] budget: the child's actual first beat only
    /// arrives once its own main loop has run for a full
    /// `heartbeat_period_ms`, well after the socket connects, so
    /// `received_first_beat` is polled in a loop here rather than checked
    /// once immediately after connecting.
    async fn startup_one(&mut self, descriptor: &ComponentDescriptor) -> Result<()> {
        let process = self.spawn_process(descriptor)?;
        let addr = heartbeat_addr(&descriptor.name, descriptor.heartbeat_base_port);
        let period = Duration::from_millis(descriptor.heartbeat_period_ms);

        let result = tokio::time::timeout(STARTUP_BEAT_TIMEOUT, async {
            let listener = loop {
                match HeartbeatListener::connect(&addr, period, descriptor.missed_beats_before_dead).await {
                    Ok(listener) => break listener,
                    Err(_) => tokio::time::sleep(STARTUP_POLL_INTERVAL).await,
                }
            };
            while !listener.received_first_beat().await {
                tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            }
            listener
        })
        .await;

        let listener = result.map_err(|_| {
            SpmError::ComponentProcess(format!(
                "component '{}' did not report alive within {:?}",
                descriptor.name, STARTUP_BEAT_TIMEOUT
            ))
        })?;

        self.running.insert(descriptor.name.clone(), RunningComponent {
            descriptor: descriptor.clone(),
            process,
            listener,
        });
        Ok(())
    }

    fn spawn_process(&self, descriptor: &ComponentDescriptor) -> Result<Child> {
        Command::new(&self.binary_path)
            .arg("run-component")
            .arg(&descriptor.name)
            .arg("--config")
            .arg(&self.config_path)
            .spawn()
            .map_err(|err| SpmError::ComponentProcess(format!("failed to spawn '{}': {err}", descriptor.name)))
    }

    /// Drive the main loop until every supervised component has been
    /// removed (grounded on `run()`): repeatedly call
    /// [`ComponentMonitor::run_per_loop`], sleeping `monitor_loop_sleep`
    /// between iterations.
    pub async fn run(&mut self) -> Result<()> {
        while !self.is_empty() {
            self.run_per_loop().await;
            tokio::time::sleep(self.monitor_loop_sleep).await;
        }
        Ok(())
    }

    /// One iteration: for every supervised component whose listener reports
    /// dead, either remove it (if it died after a kill signal, a planned
    /// exit) or restart it (otherwise, a crash or freeze). Grounded on
    /// `run_per_loop`.
    pub async fn run_per_loop(&mut self) {
        let mut to_remove = Vec::new();
        let mut to_restart = Vec::new();

        for (name, running) in &self.running {
            if running.listener.is_alive().await {
                continue;
            }
            if running.listener.received_kill_signal().await {
                to_remove.push(name.clone());
            } else {
                to_restart.push(name.clone());
            }
        }

        for name in to_remove {
            tracing::info!(component = %name, "component exited after kill signal, removing");
            self.remove_component(&name);
        }

        for name in to_restart {
            tracing::warn!(component = %name, "component stopped beating without a kill signal, restarting");
            if let Err(err) = self.restart_component(&name).await {
                tracing::error!(component = %name, error = %err, "failed to restart component, removing");
                self.remove_component(&name);
            }
        }
    }

    async fn restart_component(&mut self, name: &str) -> Result<()> {
        let descriptor = match self.running.get(name) {
            Some(running) => running.descriptor.clone(),
            None => return Ok(()),
        };
        self.terminate_process(name);
        self.startup_one(&descriptor).await
    }

    /// Terminate and forget a component, grounded on `_remove_process`.
    fn remove_component(&mut self, name: &str) {
        self.terminate_process(name);
        self.running.remove(name);
    }

    fn terminate_process(&mut self, name: &str) {
        if let Some(running) = self.running.get_mut(name) {
            if let Err(err) = running.process.kill() {
                tracing::debug!(component = %name, error = %err, "component process already exited");
            }
            let _ = running.process.wait();
        }
    }

    /// Tear down every currently-supervised component, used when startup
    /// aborts partway through (`_startup_processes_and_listeners`'s
    /// rollback) and when the experiment ends.
    pub fn shutdown_all(&mut self) {
        let names: Vec<String> = self.running.keys().cloned().collect();
        for name in names {
            self.remove_component(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use crate::heartbeat::Heartbeater;
    use crate::topics::ScanTopicPolicy;

    fn descriptor(name: &str, base_port: u16) -> ComponentDescriptor {
        ComponentDescriptor {
            name: name.to_string(),
            heartbeat_base_port: base_port,
            heartbeat_period_ms: 20,
            missed_beats_before_dead: 5,
            kind: ComponentKind::Translator {
                instrument: "mock".to_string(),
                publish_addr: "127.0.0.1:0".to_string(),
                control_addr: "127.0.0.1:0".to_string(),
                scan_topic_policy: ScanTopicPolicy::PerType,
                depends_on: vec![],
            },
        }
    }

    #[test]
    fn empty_monitor_is_empty() {
        let monitor = ComponentMonitor::new("spm-node", "config.toml", Duration::from_millis(10));
        assert!(monitor.is_empty());
        assert_eq!(monitor.len(), 0);
    }

    #[tokio::test]
    async fn startup_one_waits_for_real_first_beat() {
        let name = "translator-startup-wait-test";
        let base_port = 19550;
        let addr = heartbeat_addr(name, base_port);
        let period = Duration::from_millis(20);

        tokio::spawn(async move {
            let mut beater = Heartbeater::bind(addr, period).await.unwrap();
            loop {
                tokio::time::sleep(period).await;
                beater.tick();
            }
        });

        let mut monitor = ComponentMonitor::new("true", "config.toml", Duration::from_millis(10));
        let result = monitor.startup_one(&descriptor(name, base_port)).await;
        assert!(result.is_ok());
        assert_eq!(monitor.len(), 1);
    }

    #[tokio::test]
    async fn run_per_loop_removes_component_after_kill_signal() {
        let name = "translator-kill-test";
        let addr = heartbeat_addr(name, 19500);
        let beater = Heartbeater::bind(addr.clone(), Duration::from_millis(20)).await.unwrap();
        let listener = HeartbeatListener::connect(addr, Duration::from_millis(20), 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        beater.handle_closing();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A process handle is required by `RunningComponent`; spawn a
        // trivial, already-exited one rather than the real binary.
        let process = Command::new("true").spawn().unwrap();

        let mut monitor = ComponentMonitor::new("spm-node", "config.toml", Duration::from_millis(10));
        monitor.running.insert(
            name.to_string(),
            RunningComponent { descriptor: descriptor(name, 19500), process, listener },
        );

        assert_eq!(monitor.len(), 1);
        monitor.run_per_loop().await;
        assert!(monitor.is_empty());
    }
}
