//! C9: Microscope Scheduler.
//!
//! Composes one Pub/Sub Cache and one Control Router, owns a `ControlState`
//! mirror, and republishes it through the cache whenever the router's
//! arbitration state changes, finally publishing `KILL` and stopping once
//! the router reports `shutdown_requested`.
//!
//! A per-iteration "tick the cache, tick the router" poll of each socket
//! isn't needed here: [`PubSubCache`] and [`ControlRouter`] already run
//! their own accept/forward loops as background tasks from the moment they
//! are constructed (see their own module docs), so there is nothing left
//! for the Scheduler's tick to drive directly; [`Scheduler::tick`]
//! therefore only performs the two steps that need the Scheduler's own
//! state: the mirror comparison and the shutdown check.

use crate::error::Result;
use crate::messages::ControlState;
use crate::topics;
use crate::transport::cache::{CacheCapacity, PubSubCache};
use crate::transport::control_router::ControlRouter;
use std::time::Duration;
use tokio::net::ToSocketAddrs;

/// Composes a Pub/Sub Cache and a Control Router into the single-writer
/// scheduling component every translator sits behind.
pub struct Scheduler {
    cache: PubSubCache,
    router: ControlRouter,
    control_state_mirror: ControlState,
}

impl Scheduler {
    /// Start a scheduler: the cache proxies `cache_upstream` (the
    /// translator's publisher) to `cache_downstream`, and the router
    /// listens on `router_addr`, forwarding control-gated requests to the
    /// translator's control server at `router_upstream`.
    pub async fn bind(
        cache_upstream: impl ToSocketAddrs,
        cache_downstream: impl ToSocketAddrs,
        cache_capacity: CacheCapacity,
        router_addr: impl ToSocketAddrs,
        router_upstream: impl Into<String>,
    ) -> Result<Self> {
        let cache = PubSubCache::start(cache_upstream, cache_downstream, cache_capacity).await?;
        let router = ControlRouter::bind(router_addr, router_upstream).await?;
        Ok(Self {
            cache,
            router,
            control_state_mirror: ControlState::default(),
        })
    }

    /// Read-only access to the router, for a wrapping component (the drift
    /// scheduler, C10) that needs to register a transform hook or read
    /// `last_scan_params`.
    pub fn router(&self) -> &ControlRouter {
        &self.router
    }

    /// Read-only access to the cache, for the same reason.
    pub fn cache(&self) -> &PubSubCache {
        &self.cache
    }

    /// Compares the control-state mirror and checks for a requested
    /// shutdown. Returns `true` once shutdown has been published and the
    /// caller's main loop should stop.
    pub async fn tick(&mut self) -> Result<bool> {
        let current = self.router.get_control_state().await;
        if current != self.control_state_mirror {
            self.cache.publish(topics::CONTROL_STATE, &current).await?;
            self.control_state_mirror = current;
        }

        if self.router.was_shutdown_requested().await {
            self.cache.publish_kill().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drive [`Scheduler::tick`] in a loop until shutdown is observed,
    /// sleeping `period` between iterations.
    pub async fn run(&mut self, period: Duration) -> Result<()> {
        loop {
            if self.tick().await? {
                return Ok(());
            }
            tokio::time::sleep(period).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ControlMode, ExperimentProblem};
    use crate::transport::control_client::{ControlClient, ControlRequest};

    #[tokio::test]
    async fn tick_republishes_control_state_on_change() {
        let _upstream_publisher = crate::transport::pubsub::Publisher::bind("127.0.0.1:18200").await.unwrap();
        let mut scheduler = Scheduler::bind(
            "127.0.0.1:18200",
            "127.0.0.1:18201",
            CacheCapacity::uniform(4),
            "127.0.0.1:18202",
            "127.0.0.1:1",
        )
        .await
        .unwrap();

        assert!(!scheduler.tick().await.unwrap());

        let client = ControlClient::new("127.0.0.1:18202", "alice");
        let response = client
            .send(ControlRequest::ReportProblem { problem: ExperimentProblem::TipChange })
            .await
            .unwrap();
        assert!(matches!(
            response,
            crate::transport::control_client::ControlResponse::Ok
        ));

        assert!(!scheduler.tick().await.unwrap());
        assert_eq!(scheduler.control_state_mirror.control_mode, ControlMode::Problem);
    }

    #[tokio::test]
    async fn end_experiment_publishes_kill_and_stops() {
        let _upstream_publisher = crate::transport::pubsub::Publisher::bind("127.0.0.1:18210").await.unwrap();
        let mut scheduler = Scheduler::bind(
            "127.0.0.1:18210",
            "127.0.0.1:18211",
            CacheCapacity::uniform(4),
            "127.0.0.1:18212",
            "127.0.0.1:1",
        )
        .await
        .unwrap();

        let client = crate::transport::control_client::ControlClient::new("127.0.0.1:18212", "admin");
        client.send(ControlRequest::EndExperiment).await.unwrap();

        assert!(scheduler.tick().await.unwrap());
    }
}
