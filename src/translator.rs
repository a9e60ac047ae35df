//! C8: Microscope Translator.
//!
//! Owns a [`Publisher`], a [`ControlServer`], a cached view of polled
//! instrument state, a [`ParameterHandler`], and an [`ActionHandler`].
//! Request dispatch (mapping a request to `on_start_scan`/
//! `on_set_scan_params`/parameter and action handling etc.) is an exhaustive
//! match in [`Translator::dispatch`]; the two dedicated
//! `on_set_scan_params`/`on_set_zctrl_params` handlers are kept distinct
//! from the per-field [`ParameterHandler`] path since a scan/z-control
//! parameter write needs to observe whether the instrument moved the scope
//! out of `Free`, which a generic parameter set does not.

use crate::action_handler::ActionHandler;
use crate::error::Result;
use crate::instrument::InstrumentBackend;
use crate::messages::{
    ActionMsg, ParameterMsg, PortableAction, Scan2D, ScanParameters2D, ScopeState, Spec1D, ZCtrlParameters,
};
use crate::parameter_handler::ParameterHandler;
use crate::topics::{self, ScanTopicPolicy};
use crate::transport::control_client::{ControlRequest, ControlResponse};
use crate::transport::control_server::ControlServer;
use crate::transport::pubsub::{Publisher, Subscriber};
use std::sync::Arc;
use std::time::Duration;

/// Requests the Translator serves even when `scope_state != Free`.
fn is_whitelisted_while_not_free(request: &ControlRequest) -> bool {
    matches!(
        request,
        ControlRequest::Action(ActionMsg::Request { action: PortableAction::StopScan })
    )
}

/// Turns an opaque instrument into a request/reply + event-emitting
/// component.
pub struct Translator {
    instrument: Arc<dyn InstrumentBackend>,
    publisher: Publisher,
    control_server: ControlServer,
    parameter_handler: ParameterHandler,
    action_handler: ActionHandler,
    kill_subscriber: Option<Subscriber>,
    scan_topic_policy: ScanTopicPolicy,

    scope_state: ScopeState,
    scan_params: ScanParameters2D,
    zctrl_params: ZCtrlParameters,
    scans: Vec<Scan2D>,
    spec: Option<Spec1D>,

    /// Scan parameters captured at the moment `StartScan` was last issued;
    /// written into every Scan2D's `params` before publication. Falls back
    /// to the last-polled scan params until a scan has actually been
    /// started.
    scan_params_in_force: ScanParameters2D,

    /// Set after a successful `StopScan`; the next poll/publish tick emits
    /// one `ScopeState::Interrupted` event ahead of the normal state
    /// publication.
    pending_interrupt: bool,
}

impl Translator {
    /// Build a translator around `instrument`, binding its Publisher and
    /// Control Server on the given addresses. Call
    /// [`Translator::subscribe_to_kill`] afterward to also have it detect
    /// the experiment-wide `KILL` signal and exit its own main loop.
    pub async fn bind(
        instrument: Arc<dyn InstrumentBackend>,
        publish_addr: impl tokio::net::ToSocketAddrs,
        control_addr: impl tokio::net::ToSocketAddrs,
        scan_topic_policy: ScanTopicPolicy,
    ) -> Result<Self> {
        let publisher = Publisher::bind(publish_addr).await?;
        let control_server = ControlServer::bind(control_addr).await?;
        let parameter_handler = ParameterHandler::new(instrument.parameter_io());
        let action_handler = ActionHandler::new(instrument.action_io());
        let scan_params = instrument.poll_scan_params().await?;

        Ok(Self {
            instrument,
            publisher,
            control_server,
            parameter_handler,
            action_handler,
            kill_subscriber: None,
            scan_topic_policy,
            scope_state: ScopeState::Undefined,
            scan_params,
            zctrl_params: ZCtrlParameters {
                feedback_on: false,
                proportional_gain: 0.0,
                integral_gain: 0.0,
                setpoint: 0.0,
            },
            scans: Vec::new(),
            spec: None,
            scan_params_in_force: scan_params,
            pending_interrupt: false,
        })
    }

    /// Subscribe to `addr` so this translator observes and reacts to the
    /// reserved `KILL` topic.
    pub async fn subscribe_to_kill(&mut self, addr: impl tokio::net::ToSocketAddrs) -> Result<()> {
        self.kill_subscriber = Some(Subscriber::connect(addr, &[topics::KILL.to_string()]).await?);
        Ok(())
    }

    /// Mutable access to the registered `ParameterHandler`, for device
    /// adapters to register their descriptors/custom mappings at startup.
    pub fn parameter_handler_mut(&mut self) -> &mut ParameterHandler {
        &mut self.parameter_handler
    }

    /// Mutable access to the registered `ActionHandler`.
    pub fn action_handler_mut(&mut self) -> &mut ActionHandler {
        &mut self.action_handler
    }

    /// True if the KILL signal has been observed on the optional subscriber.
    /// Callers should stop calling [`Translator::tick`] once this is true.
    pub async fn kill_received(&mut self) -> bool {
        let Some(subscriber) = self.kill_subscriber.as_mut() else {
            return false;
        };
        match tokio::time::timeout(Duration::from_millis(1), subscriber.recv::<()>()).await {
            Ok(Ok(envelope)) => Subscriber::is_kill_topic(&envelope.topic),
            _ => false,
        }
    }

    /// One main-loop iteration: serve at most one pending request, then poll
    /// instrument state and emit change events in a fixed order.
    pub async fn tick(&mut self, poll_timeout: Duration) -> Result<()> {
        self.serve_pending_request(poll_timeout).await?;
        self.poll_and_publish().await?;
        Ok(())
    }

    async fn serve_pending_request(&mut self, timeout: Duration) -> Result<()> {
        let Some((_client_id, request)) = self.control_server.poll(timeout).await? else {
            return Ok(());
        };

        if self.scope_state != ScopeState::Free && !is_whitelisted_while_not_free(&request) {
            self.control_server.reply(ControlResponse::NotFree(self.scope_state)).await?;
            return Ok(());
        }

        let response = self.dispatch(request).await;
        self.control_server.reply(response).await?;
        Ok(())
    }

    /// Request dispatch, as an exhaustive match.
    async fn dispatch(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Parameter(msg) => self.dispatch_parameter(msg),
            ControlRequest::Action(msg) => self.dispatch_action(msg).await,
            ControlRequest::SetScanParams(params) => match self.instrument.on_set_scan_params(params).await {
                Ok(true) => {
                    self.scope_state = ScopeState::BusyParam;
                    ControlResponse::Ok
                }
                Ok(false) => ControlResponse::Ok,
                Err(err) => ControlResponse::Error(err.to_string()),
            },
            ControlRequest::SetZCtrlParams(params) => match self.instrument.on_set_zctrl_params(params).await {
                Ok(true) => {
                    self.scope_state = ScopeState::BusyParam;
                    ControlResponse::Ok
                }
                Ok(false) => ControlResponse::Ok,
                Err(err) => ControlResponse::Error(err.to_string()),
            },
            // Control-arbitration requests are the Router's concern; the
            // Translator only ever sees requests forwarded past arbitration.
            other => ControlResponse::Error(format!("translator cannot handle {other:?}")),
        }
    }

    fn dispatch_parameter(&mut self, msg: ParameterMsg) -> ControlResponse {
        match msg {
            ParameterMsg::Get { parameter } => match self.parameter_handler.get(parameter) {
                Ok((value, unit)) => ControlResponse::Parameter(ParameterMsg::Value { parameter, value, unit }),
                Err(err) => ControlResponse::Parameter(ParameterMsg::Error { parameter, reason: err.to_string() }),
            },
            ParameterMsg::Set { parameter, value, unit } => {
                match self.parameter_handler.set(parameter, value.clone(), unit) {
                    Ok(()) => ControlResponse::Parameter(ParameterMsg::Value { parameter, value, unit }),
                    Err(err) => ControlResponse::Parameter(ParameterMsg::Error { parameter, reason: err.to_string() }),
                }
            }
            ParameterMsg::Value { .. } | ParameterMsg::Error { .. } => {
                ControlResponse::Error("unexpected parameter response sent as a request".to_string())
            }
        }
    }

    async fn dispatch_action(&mut self, msg: ActionMsg) -> ControlResponse {
        let ActionMsg::Request { action } = msg else {
            return ControlResponse::Error("unexpected action response sent as a request".to_string());
        };

        match action {
            PortableAction::StartScan => {
                self.scan_params_in_force = self.scan_params;
            }
            PortableAction::StartSpec => {
                // Probe position in force is captured lazily at publish
                // time from the last poll, mirroring the scan-params path.
            }
            _ => {}
        }

        let outcome = self.action_handler.request(action);
        if action == PortableAction::StopScan && outcome.is_ok() {
            self.pending_interrupt = true;
        }
        match outcome {
            Ok(()) => ControlResponse::Action(ActionMsg::Started { action }),
            Err(err) => ControlResponse::Action(ActionMsg::Error { action, reason: err.to_string() }),
        }
    }

    async fn poll_and_publish(&mut self) -> Result<()> {
        if self.pending_interrupt {
            self.publisher.publish(topics::SCOPE_STATE, &ScopeState::Interrupted)?;
            self.pending_interrupt = false;
        }

        let new_scope_state = self.instrument.poll_scope_state().await?;
        let new_scans = self.instrument.poll_scans().await?;
        let new_scan_params = self.instrument.poll_scan_params().await?;
        let new_zctrl_params = self.instrument.poll_zctrl_params().await?;
        let new_spec = self.instrument.poll_spec().await?;

        if scans_are_new(&self.scans, &new_scans) {
            for scan in &new_scans {
                let enriched = Scan2D { params: self.scan_params_in_force, ..scan.clone() };
                let topic = topics::scan_topic(self.scan_topic_policy, &enriched.params);
                self.publisher.publish(topic, &enriched)?;
            }
            self.scans = new_scans;
        }

        if new_scan_params != self.scan_params {
            self.scan_params = new_scan_params;
            self.publisher.publish(topics::SCAN_PARAMS, &self.scan_params)?;
        }

        if new_zctrl_params != self.zctrl_params {
            self.zctrl_params = new_zctrl_params;
            self.publisher.publish(topics::ZCTRL_PARAMS, &self.zctrl_params)?;
        }

        if spec_is_new(self.spec.as_ref(), new_spec.as_ref()) {
            if let Some(spec) = &new_spec {
                self.publisher.publish(topics::SPEC1D, spec)?;
            }
            self.spec = new_spec;
        }

        if new_scope_state != self.scope_state {
            self.scope_state = new_scope_state;
            self.publisher.publish(topics::SCOPE_STATE, &self.scope_state)?;
        }

        Ok(())
    }
}

/// Scan-change detection: compares the first-channel scan of each set by
/// timestamp, falling back to a value comparison when timestamps coincide.
fn scans_are_new(old: &[Scan2D], new: &[Scan2D]) -> bool {
    match (old.first(), new.first()) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => {
            if a.timestamp != b.timestamp {
                true
            } else {
                a.data != b.data
            }
        }
    }
}

fn spec_is_new(old: Option<&Spec1D>, new: Option<&Spec1D>) -> bool {
    match (old, new) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a.timestamp != b.timestamp || a.y != b.y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockInstrument;
    use crate::units::{AngleUnit, LengthUnit};

    fn default_params() -> ScanParameters2D {
        ScanParameters2D {
            top_left_x: 0.0,
            top_left_y: 0.0,
            size_x: 100.0,
            size_y: 100.0,
            length_unit: LengthUnit::Nanometer,
            data_shape_x: 64,
            data_shape_y: 64,
            angle: 0.0,
            angle_unit: AngleUnit::Degree,
        }
    }

    fn scan_at(ts: chrono::DateTime<chrono::Utc>, value: f64) -> Scan2D {
        Scan2D {
            data: vec![value; 4],
            width: 2,
            height: 2,
            params: default_params(),
            timestamp: ts,
            channel: "height".to_string(),
        }
    }

    #[test]
    fn empty_to_nonempty_scans_is_new() {
        assert!(scans_are_new(&[], &[scan_at(chrono::DateTime::UNIX_EPOCH, 1.0)]));
    }

    #[test]
    fn identical_timestamp_and_values_is_not_new() {
        let a = scan_at(chrono::DateTime::UNIX_EPOCH, 1.0);
        let b = scan_at(chrono::DateTime::UNIX_EPOCH, 1.0);
        assert!(!scans_are_new(std::slice::from_ref(&a), std::slice::from_ref(&b)));
    }

    #[test]
    fn identical_timestamp_different_values_falls_back_to_data_comparison() {
        let a = scan_at(chrono::DateTime::UNIX_EPOCH, 1.0);
        let b = scan_at(chrono::DateTime::UNIX_EPOCH, 2.0);
        assert!(scans_are_new(std::slice::from_ref(&a), std::slice::from_ref(&b)));
    }

    #[test]
    fn differing_timestamp_is_new_regardless_of_values() {
        let a = scan_at(chrono::DateTime::UNIX_EPOCH, 1.0);
        let b = scan_at(chrono::DateTime::UNIX_EPOCH + chrono::Duration::seconds(1), 1.0);
        assert!(scans_are_new(std::slice::from_ref(&a), std::slice::from_ref(&b)));
    }

    #[tokio::test]
    async fn stop_scan_while_not_free_is_whitelisted() {
        let request = ControlRequest::Action(ActionMsg::Request { action: PortableAction::StopScan });
        assert!(is_whitelisted_while_not_free(&request));
        let other = ControlRequest::Action(ActionMsg::Request { action: PortableAction::StartScan });
        assert!(!is_whitelisted_while_not_free(&other));
    }

    #[tokio::test]
    async fn first_tick_publishes_initial_scope_state() {
        let instrument = Arc::new(MockInstrument::new(default_params()));
        let mut translator = Translator::bind(
            instrument,
            "127.0.0.1:18100",
            "127.0.0.1:18101",
            ScanTopicPolicy::PerType,
        )
        .await
        .unwrap();
        translator.tick(Duration::from_millis(10)).await.unwrap();
        assert_eq!(translator.scope_state, ScopeState::Free);
    }

    #[tokio::test]
    async fn translator_serves_parameter_get_through_control_server() {
        use crate::messages::PortableParameter;
        use crate::parameter_handler::Descriptor;
        use crate::messages::{ParameterUnit, ParameterValue};

        let instrument = Arc::new(MockInstrument::new(default_params()));
        let mut translator = Translator::bind(
            instrument,
            "127.0.0.1:18102",
            "127.0.0.1:18103",
            ScanTopicPolicy::PerType,
        )
        .await
        .unwrap();
        translator.parameter_handler_mut().register_descriptor(
            PortableParameter::ScanSizeX,
            Descriptor {
                device_id: "scan.size_x".to_string(),
                native_unit: ParameterUnit::Length(LengthUnit::Nanometer),
                range: None,
                sample_value: ParameterValue::Float(0.0),
            },
        );

        let tick_task = tokio::spawn(async move {
            translator.tick(Duration::from_millis(500)).await.unwrap();
        });

        let client = crate::transport::control_client::ControlClient::new("127.0.0.1:18103", "tester");
        let response = client
            .send(ControlRequest::Parameter(ParameterMsg::Get { parameter: PortableParameter::ScanSizeX }))
            .await
            .unwrap();
        assert!(matches!(response, ControlResponse::Parameter(ParameterMsg::Value { .. })));

        tick_task.await.unwrap();
    }
}
