//! C5: Control Router.
//!
//! A single point of arbitration between many control clients and one
//! microscope translator. The router holds the authoritative
//! `ControlState` (mode + outstanding problems) and the identity of
//! whichever client currently holds control, forwards every other request
//! upstream to the translator's control server only from the client
//! currently entitled to issue it, and answers `GetControlState` to anyone.
//!
//! Every incoming request is one of the shapes handled below by a dedicated
//! `handle_*` function.

use crate::messages::{ControlMode, ControlState, ExperimentProblem};
use crate::transport::control_client::{ControlClient, ControlRequest, ControlResponse};
use crate::transport::wire::{read_frame, write_frame};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Mutex;

struct RouterState {
    control_state: ControlState,
    client_in_control_id: Option<String>,
    shutdown_was_requested: bool,
    /// The last `ScanParameters2D`-bearing request forwarded upstream, kept
    /// so the drift scheduler's rescan trigger can compare a newly-arrived
    /// scan against what was actually requested. No shared mutable ownership
    /// outside this struct; the drift scheduler only ever reads it via
    /// [`ControlRouter::last_scan_params`].
    last_scan_params: Option<crate::messages::ScanParameters2D>,
}

impl RouterState {
    fn new() -> Self {
        Self {
            control_state: ControlState::default(),
            client_in_control_id: None,
            shutdown_was_requested: false,
            last_scan_params: None,
        }
    }
}

/// A closure applied to a `ScanParameters2D` write before the router
/// forwards it upstream to the translator.
///
/// Lets the drift scheduler apply `point ← point + T(now)` to a scan
/// request's spatial fields before it reaches the instrument. Of this
/// crate's closed set of `ControlRequest` variants, `SetScanParams` is the
/// only one that carries a full spatial struct as a unit (`ProbePosition` is
/// never set as a whole request, only field-by-field through
/// `ParameterMsg`), so this hook is typed directly over `ScanParameters2D`
/// rather than over the whole request enum.
pub type RouterTransformHook =
    Arc<dyn Fn(crate::messages::ScanParameters2D) -> crate::messages::ScanParameters2D + Send + Sync>;

/// Arbitrates control requests between many clients and one upstream
/// translator control server. Cheap to clone: every clone shares the same
/// underlying arbitration state and transform hook (needed by the drift
/// scheduler, C10, which holds its own handle alongside the wrapped
/// `Scheduler`'s).
#[derive(Clone)]
pub struct ControlRouter {
    state: Arc<Mutex<RouterState>>,
    transform: Arc<Mutex<Option<RouterTransformHook>>>,
}

impl ControlRouter {
    /// Bind the router's client-facing frontend on `addr`, forwarding
    /// control-gated requests to the translator's control server at
    /// `upstream_addr`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        upstream_addr: impl Into<String>,
    ) -> crate::error::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let state = Arc::new(Mutex::new(RouterState::new()));
        let transform: Arc<Mutex<Option<RouterTransformHook>>> = Arc::new(Mutex::new(None));
        let upstream_addr = upstream_addr.into();

        let accept_state = state.clone();
        let accept_transform = transform.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _peer)) => {
                        let state = accept_state.clone();
                        let transform = accept_transform.clone();
                        let upstream = new_upstream_client(&upstream_addr);
                        tokio::spawn(serve_client(socket, state, transform, upstream));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "control router accept failed");
                        break;
                    }
                }
            }
        });
        Ok(Self { state, transform })
    }

    /// Install (or clear, with `None`) the forward transform hook applied to
    /// every `SetScanParams` write before it is forwarded upstream. Replaces
    /// any previously-installed hook.
    pub async fn set_transform(&self, hook: Option<RouterTransformHook>) {
        *self.transform.lock().await = hook;
    }

    /// Snapshot of the current arbitration state.
    pub async fn get_control_state(&self) -> ControlState {
        self.state.lock().await.control_state.clone()
    }

    /// True once an `EndExperiment` request has been handled.
    pub async fn was_shutdown_requested(&self) -> bool {
        self.state.lock().await.shutdown_was_requested
    }

    /// The most recently forwarded scan-parameters request, if any (used by
    /// the drift scheduler's rescan trigger).
    pub async fn last_scan_params(&self) -> Option<crate::messages::ScanParameters2D> {
        self.state.lock().await.last_scan_params
    }

    /// Record the scan parameters most recently set through this router, in
    /// the sample (drift-corrected) frame. Set automatically on every
    /// successfully-forwarded `SetScanParams` request (see
    /// `handle_send_scan_params`); exposed here too so the drift scheduler,
    /// which wraps this router and applies its own transform before
    /// forwarding, can overwrite it with the transformed geometry it actually
    /// sent upstream. Never cleared by unrelated commands, only overwritten
    /// by a newer scan-parameters write.
    pub async fn record_scan_params(&self, params: crate::messages::ScanParameters2D) {
        self.state.lock().await.last_scan_params = Some(params);
    }
}

/// The control server's request/reply timeout.
const SERVER_TIMEOUT: Duration = Duration::from_millis(2500);

fn new_upstream_client(addr: &str) -> ControlClient {
    // A fresh TCP connection per forwarded request is the "close and reopen
    // the upstream socket on timeout" behavior this router needs;
    // `max_retries(0)` keeps this a single attempt rather than the
    // client-side bounded resend loop `ControlClient` otherwise implements.
    ControlClient::new(addr.to_string(), "control-router")
        .with_request_timeout(SERVER_TIMEOUT)
        .with_max_retries(0)
}

async fn serve_client(
    mut socket: tokio::net::TcpStream,
    state: Arc<Mutex<RouterState>>,
    transform: Arc<Mutex<Option<RouterTransformHook>>>,
    upstream: ControlClient,
) {
    // One-time identity handshake: every request on this connection is
    // attributed to this client id for the rest of its lifetime, the
    // transport-level counterpart of a ROUTER socket's identity frame. A
    // connection that sends `None` here is an anonymous peer: it can never
    // hold or release control, and reconnecting anonymously after a crash
    // does not reclaim whatever grant the crashed connection held.
    let client_id: Option<String> = match read_frame(&mut socket).await {
        Ok(id) => id,
        Err(_) => return,
    };

    loop {
        let request: ControlRequest = match read_frame(&mut socket).await {
            Ok(r) => r,
            Err(_) => return,
        };
        let response = handle_request(&state, &transform, &upstream, &client_id, request).await;
        if write_frame(&mut socket, &response).await.is_err() {
            return;
        }
    }
}

async fn handle_request(
    state: &Arc<Mutex<RouterState>>,
    transform: &Arc<Mutex<Option<RouterTransformHook>>>,
    upstream: &ControlClient,
    client_id: &Option<String>,
    request: ControlRequest,
) -> ControlResponse {
    match request {
        ControlRequest::RequestControl { mode } => match client_id {
            Some(id) => handle_control_request(state, id.clone(), mode).await,
            None => ControlResponse::Failure,
        },
        ControlRequest::ReleaseControl => handle_control_release(state, client_id.as_deref()).await,
        ControlRequest::ReportProblem { problem } => handle_experiment_problem(state, problem, true).await,
        ControlRequest::ResolveProblem { problem } => handle_experiment_problem(state, problem, false).await,
        ControlRequest::Parameter(msg) => {
            handle_send_req(state, upstream, client_id.as_deref(), ControlRequest::Parameter(msg)).await
        }
        ControlRequest::Action(msg) => {
            handle_send_req(state, upstream, client_id.as_deref(), ControlRequest::Action(msg)).await
        }
        ControlRequest::SetScanParams(params) => {
            handle_send_scan_params(state, transform, upstream, client_id.as_deref(), params).await
        }
        ControlRequest::SetZCtrlParams(params) => {
            handle_send_req(state, upstream, client_id.as_deref(), ControlRequest::SetZCtrlParams(params)).await
        }
        ControlRequest::SetControlMode { mode } => handle_set_control_mode(state, mode).await,
        ControlRequest::EndExperiment => handle_end_experiment(state).await,
        ControlRequest::GetControlState => ControlResponse::State(state.lock().await.control_state.clone()),
    }
}

/// Grant control only if nobody holds it *and* the requested mode matches
/// the router's current mode; otherwise reject with `AlreadyUnderControl`
/// (someone else holds it) or `WrongControlMode` (mode mismatch).
async fn handle_control_request(
    state: &Arc<Mutex<RouterState>>,
    client_id: String,
    mode: ControlMode,
) -> ControlResponse {
    let mut state = state.lock().await;
    if state.client_in_control_id.is_some() {
        return ControlResponse::AlreadyUnderControl;
    }
    if state.control_state.control_mode == mode {
        state.client_in_control_id = Some(client_id);
        ControlResponse::Ok
    } else {
        ControlResponse::WrongControlMode
    }
}

/// Release control only if the caller is the current holder. An anonymous
/// caller (`client_id` is `None`) never matches any holder.
async fn handle_control_release(state: &Arc<Mutex<RouterState>>, client_id: Option<&str>) -> ControlResponse {
    let mut state = state.lock().await;
    match (client_id, &state.client_in_control_id) {
        (Some(id), Some(holder)) if holder == id => {
            state.client_in_control_id = None;
            ControlResponse::Ok
        }
        _ => ControlResponse::Failure,
    }
}

/// Add/remove a problem from the outstanding set, moving `control_mode`
/// to/from `Problem` as the set's emptiness changes, and unconditionally
/// clearing `client_in_control_id` on any such mode transition (see
/// `DESIGN.md` for why this is the conservative choice).
async fn handle_experiment_problem(
    state: &Arc<Mutex<RouterState>>,
    problem: ExperimentProblem,
    reported: bool,
) -> ControlResponse {
    let mut state = state.lock().await;
    let was_empty = state.control_state.problems.is_empty();
    if reported {
        state.control_state.problems.insert(problem);
    } else {
        state.control_state.problems.remove(&problem);
    }
    let is_empty = state.control_state.problems.is_empty();

    if was_empty && !is_empty {
        state.control_state.control_mode = ControlMode::Problem;
        state.client_in_control_id = None;
    } else if !was_empty && is_empty {
        state.control_state.control_mode = ControlMode::Automated;
        state.client_in_control_id = None;
    }
    ControlResponse::Ok
}

/// If `client_id` is not the current control holder, reply `NotInControl`
/// without forwarding. An anonymous caller (`client_id` is `None`) never
/// holds control, so this always rejects it regardless of who (if anyone)
/// currently does. Otherwise forward the request to the upstream
/// translator control server and return its reply verbatim; on timeout, the
/// socket is implicitly closed and reopened (a fresh `ControlClient`
/// connection per call) and `NoResponse` is returned instead. See
/// `translator.rs` for the whitelist/`NotFree` check that additionally gates
/// dispatch at the translator itself.
async fn handle_send_req(
    state: &Arc<Mutex<RouterState>>,
    upstream: &ControlClient,
    client_id: Option<&str>,
    request: ControlRequest,
) -> ControlResponse {
    {
        let state = state.lock().await;
        match (client_id, &state.client_in_control_id) {
            (Some(id), Some(holder)) if holder == id => {}
            _ => return ControlResponse::NotInControl,
        }
    }
    match upstream.send(request).await {
        Ok(response) => response,
        Err(_) => ControlResponse::NoResponse,
    }
}

/// Forwards a `SetScanParams` request exactly like `handle_send_req`, first
/// applying the installed forward transform hook (if any) to the geometry
/// actually sent upstream, and, on a non-rejected forward, records the
/// *original, untransformed* `params` as the router's last-known requested
/// scan geometry in the sample frame (the drift scheduler's rescan trigger
/// reads this back via [`ControlRouter::last_scan_params`]). Recording the
/// pre-transform value, rather than what was actually sent to the
/// instrument, is deliberate: `last_scan_params` is documented as living in
/// the sample frame, and the drift scheduler is the only caller that installs
/// a transform here in the first place.
async fn handle_send_scan_params(
    state: &Arc<Mutex<RouterState>>,
    transform: &Arc<Mutex<Option<RouterTransformHook>>>,
    upstream: &ControlClient,
    client_id: Option<&str>,
    params: crate::messages::ScanParameters2D,
) -> ControlResponse {
    let outbound = match transform.lock().await.as_ref() {
        Some(hook) => hook(params),
        None => params,
    };
    let response = handle_send_req(state, upstream, client_id, ControlRequest::SetScanParams(outbound)).await;
    if !matches!(response, ControlResponse::NotInControl | ControlResponse::NoResponse) {
        state.lock().await.last_scan_params = Some(params);
    }
    response
}

/// Admin-only direct mode change. Clears the current control holder
/// unconditionally, same as `handle_experiment_problem`.
async fn handle_set_control_mode(state: &Arc<Mutex<RouterState>>, mode: ControlMode) -> ControlResponse {
    let mut state = state.lock().await;
    state.control_state.control_mode = mode;
    state.client_in_control_id = None;
    ControlResponse::Ok
}

/// Mark shutdown requested so the owning process's main loop can drain and
/// exit.
async fn handle_end_experiment(state: &Arc<Mutex<RouterState>>) -> ControlResponse {
    let mut state = state.lock().await;
    state.shutdown_was_requested = true;
    ControlResponse::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_request_then_release() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        let resp = handle_control_request(&state, "alice".to_string(), ControlMode::Automated).await;
        assert!(matches!(resp, ControlResponse::Ok));

        let resp = handle_control_request(&state, "bob".to_string(), ControlMode::Automated).await;
        assert!(matches!(resp, ControlResponse::AlreadyUnderControl));

        let resp = handle_control_release(&state, Some("bob")).await;
        assert!(matches!(resp, ControlResponse::Failure));

        let resp = handle_control_release(&state, Some("alice")).await;
        assert!(matches!(resp, ControlResponse::Ok));

        // Idempotence: releasing twice leaves state unchanged.
        let resp = handle_control_release(&state, Some("alice")).await;
        assert!(matches!(resp, ControlResponse::Failure));
    }

    #[tokio::test]
    async fn request_control_with_wrong_mode_is_rejected() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        let resp = handle_control_request(&state, "alice".to_string(), ControlMode::Problem).await;
        assert!(matches!(resp, ControlResponse::WrongControlMode));
    }

    #[tokio::test]
    async fn problem_report_enters_and_clears_problem_mode() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        handle_control_request(&state, "alice".to_string(), ControlMode::Automated).await;

        handle_experiment_problem(&state, ExperimentProblem::TipChange, true).await;
        {
            let s = state.lock().await;
            assert_eq!(s.control_state.control_mode, ControlMode::Problem);
            assert!(s.client_in_control_id.is_none());
        }

        handle_experiment_problem(&state, ExperimentProblem::TipChange, false).await;
        let s = state.lock().await;
        assert_eq!(s.control_state.control_mode, ControlMode::Automated);
    }

    #[tokio::test]
    async fn set_control_mode_clears_holder() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        handle_control_request(&state, "alice".to_string(), ControlMode::Automated).await;
        handle_set_control_mode(&state, ControlMode::Manual).await;
        let s = state.lock().await;
        assert!(s.client_in_control_id.is_none());
        assert_eq!(s.control_state.control_mode, ControlMode::Manual);
    }

    #[tokio::test]
    async fn single_writer_invariant_scenario() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        let a = handle_control_request(&state, "A".to_string(), ControlMode::Automated).await;
        assert!(matches!(a, ControlResponse::Ok));
        let b = handle_control_request(&state, "B".to_string(), ControlMode::Automated).await;
        assert!(matches!(b, ControlResponse::AlreadyUnderControl));
    }

    #[tokio::test]
    async fn anonymous_caller_cannot_release_holders_grant() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        handle_control_request(&state, "alice".to_string(), ControlMode::Automated).await;

        let resp = handle_control_release(&state, None).await;
        assert!(matches!(resp, ControlResponse::Failure));

        let s = state.lock().await;
        assert_eq!(s.client_in_control_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn anonymous_caller_is_rejected_even_with_no_current_holder() {
        // An anonymous request must never be mistaken for matching "nobody
        // holds control" (both sides `None`).
        let state = Arc::new(Mutex::new(RouterState::new()));
        let resp = handle_control_release(&state, None).await;
        assert!(matches!(resp, ControlResponse::Failure));

        let upstream = new_upstream_client("127.0.0.1:1");
        let resp =
            handle_send_req(&state, &upstream, None, ControlRequest::Action(crate::messages::ActionMsg::Request {
                action: crate::messages::PortableAction::StopScan,
            }))
            .await;
        assert!(matches!(resp, ControlResponse::NotInControl));
    }

    #[tokio::test]
    async fn reconnecting_without_identity_does_not_inherit_previous_grant() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        handle_control_request(&state, "controller".to_string(), ControlMode::Automated).await;

        // Simulate the controller crashing and a fresh, identity-less
        // connection taking its place: that connection never becomes the
        // holder, so the original grant is simply orphaned rather than
        // transferred.
        let transform: Arc<Mutex<Option<RouterTransformHook>>> = Arc::new(Mutex::new(None));
        let upstream = new_upstream_client("127.0.0.1:1");
        let response = handle_request(
            &state,
            &transform,
            &upstream,
            &None,
            ControlRequest::RequestControl { mode: ControlMode::Automated },
        )
        .await;
        assert!(matches!(response, ControlResponse::Failure));
        assert_eq!(state.lock().await.client_in_control_id.as_deref(), Some("controller"));
    }

    #[tokio::test]
    async fn forwarding_rejects_non_controller_without_touching_upstream() {
        // Client B issues a StopScan action while A holds control, expecting
        // NotInControl. The upstream address is unreachable; if the
        // rejection below did not
        // short-circuit before `upstream.send`, this would hang on connect
        // instead of returning immediately.
        let state = Arc::new(Mutex::new(RouterState::new()));
        handle_control_request(&state, "A".to_string(), ControlMode::Automated).await;

        let upstream = new_upstream_client("127.0.0.1:1");
        let action = crate::messages::ActionMsg::Request {
            action: crate::messages::PortableAction::StopScan,
        };
        let resp = handle_send_req(&state, &upstream, Some("B"), ControlRequest::Action(action)).await;
        assert!(matches!(resp, ControlResponse::NotInControl));
    }

    #[tokio::test]
    async fn rejected_scan_params_forward_does_not_record_last_scan_params() {
        let state = Arc::new(Mutex::new(RouterState::new()));
        handle_control_request(&state, "A".to_string(), ControlMode::Automated).await;
        let upstream = new_upstream_client("127.0.0.1:1");
        let params = crate::messages::ScanParameters2D {
            top_left_x: 1.0,
            top_left_y: 2.0,
            size_x: 5.0,
            size_y: 5.0,
            length_unit: crate::units::LengthUnit::Nanometer,
            data_shape_x: 256,
            data_shape_y: 256,
            angle: 0.0,
            angle_unit: crate::units::AngleUnit::Degree,
        };
        let transform: Arc<Mutex<Option<RouterTransformHook>>> = Arc::new(Mutex::new(None));
        let resp = handle_send_scan_params(&state, &transform, &upstream, Some("B"), params).await;
        assert!(matches!(resp, ControlResponse::NotInControl));
        assert!(state.lock().await.last_scan_params.is_none());
    }
}
