//! C4: Control Client.
//!
//! Implements a Lazy Pirate reconnect loop: a request that times out is
//! retried on a fresh connection up to a bounded number of attempts before
//! surfacing [`SpmError::TransportTimeout`], rather than blocking forever on
//! a request whose peer died mid-request.

use crate::error::{Result, SpmError};
use crate::messages::{ActionMsg, ControlState, ParameterMsg};
use crate::transport::wire::{read_frame, write_frame};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

/// Requests a control client can send to the control router.
///
/// Every request travels over a connection that opened with a one-time
/// identity handshake (see [`ControlClient::send_once`]); the router ties
/// that handshake identity to `client_in_control_id` for every subsequent
/// request on that connection, rather than having each variant's payload
/// restate it — the connection's identity is a transport concept here, not
/// a message field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Ask to become the controlling client. The router only grants control
    /// if `mode` matches its current `control_mode`.
    RequestControl {
        /// The control mode the client believes it is requesting under.
        mode: crate::messages::ControlMode,
    },
    /// Release control, if currently held by this connection's identity.
    ReleaseControl,
    /// Report an experiment problem, moving the router into `Problem` mode.
    ReportProblem {
        /// The problem being reported.
        problem: crate::messages::ExperimentProblem,
    },
    /// Report that a previously-reported problem has been resolved.
    ResolveProblem {
        /// The problem being resolved.
        problem: crate::messages::ExperimentProblem,
    },
    /// Forward a parameter request to the translator via the router.
    Parameter(ParameterMsg),
    /// Forward an action request to the translator via the router.
    Action(ActionMsg),
    /// Atomically set the full scan-region geometry, dispatched by the
    /// translator to a dedicated `on_set_scan_params` handler rather than
    /// through the per-field Parameter Handler.
    SetScanParams(crate::messages::ScanParameters2D),
    /// Atomically set the full Z-control feedback parameters, dispatched to
    /// a dedicated `on_set_zctrl_params` handler.
    SetZCtrlParams(crate::messages::ZCtrlParameters),
    /// Admin-only: change the control mode directly.
    SetControlMode {
        /// New mode.
        mode: crate::messages::ControlMode,
    },
    /// Admin-only: signal that the experiment is ending, prompting every
    /// listening component to shut down.
    EndExperiment,
    /// Ask for the current arbitration snapshot.
    GetControlState,
}

/// Responses a control router can send back to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// The request succeeded with no further payload.
    Ok,
    /// The request succeeded and returns the current arbitration state.
    State(ControlState),
    /// A forwarded parameter request's response.
    Parameter(ParameterMsg),
    /// A forwarded action request's response.
    Action(ActionMsg),
    /// The caller does not hold control and the request required it.
    NotInControl,
    /// Another client already holds control.
    AlreadyUnderControl,
    /// The client requested control under a mode that does not match the
    /// router's current `control_mode`.
    WrongControlMode,
    /// A release/other request failed because its precondition was not met.
    Failure,
    /// The microscope was not `Free` and the request was not whitelisted.
    NotFree(crate::messages::ScopeState),
    /// A forwarded request's backend connection timed out and was reopened;
    /// no reply was obtained for this attempt.
    NoResponse,
    /// The request was rejected for a reason not covered by a dedicated
    /// variant above.
    Error(String),
}

/// A client of the control router, implementing bounded retry-on-timeout.
pub struct ControlClient {
    addr: String,
    client_id: Option<String>,
    request_timeout: Duration,
    max_retries: u32,
}

impl ControlClient {
    /// Create a client targeting `addr` with the given stable identifier.
    /// Reconnecting later with the same id is how a client resumes a grant
    /// of control across a dropped socket.
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: Some(client_id.into()),
            request_timeout: Duration::from_millis(2500),
            max_retries: 3,
        }
    }

    /// Create a client with no stable identity. The router treats every
    /// request from this connection as coming from a brand-new anonymous
    /// peer that can never hold or release control, the same as a client
    /// reconnecting after a crash that silently dropped its previous
    /// socket without releasing whatever grant it held: that grant is left
    /// orphaned rather than handed to this connection.
    pub fn anonymous(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: None,
            request_timeout: Duration::from_millis(2500),
            max_retries: 3,
        }
    }

    /// Override the per-request timeout (default 2500ms).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the retry count (default 3). The control router's own
    /// forwarding path uses a single attempt instead: one timeout, one
    /// close-and-reopen, then `NoResponse`, not the client-side bounded
    /// resend loop this type otherwise implements.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// This client's configured identity, `None` if anonymous.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Send `request` and wait for a response, retrying on timeout up to
    /// `max_retries` times on a fresh connection each attempt.
    pub async fn send(&self, request: ControlRequest) -> Result<ControlResponse> {
        let mut last_err = SpmError::TransportTimeout(self.addr.clone());
        for _attempt in 0..=self.max_retries {
            match self.send_once(&request).await {
                Ok(response) => return Ok(response),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn send_once(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let connect = timeout(self.request_timeout, TcpStream::connect(&self.addr));
        let mut stream = connect
            .await
            .map_err(|_| SpmError::TransportTimeout(self.addr.clone()))??;

        // One-time identity handshake: the router ties this connection's
        // subsequent requests to this client id for the lifetime of the
        // socket, the same way a ROUTER socket tags every frame with the
        // peer's identity without the payload needing to carry it. `None`
        // here means this connection is anonymous and can never hold or
        // release control.
        let handshake = write_frame(&mut stream, &self.client_id);
        timeout(self.request_timeout, handshake)
            .await
            .map_err(|_| SpmError::TransportTimeout(self.addr.clone()))??;

        let send = write_frame(&mut stream, request);
        timeout(self.request_timeout, send)
            .await
            .map_err(|_| SpmError::TransportTimeout(self.addr.clone()))??;

        let recv = read_frame::<_, ControlResponse>(&mut stream);
        timeout(self.request_timeout, recv)
            .await
            .map_err(|_| SpmError::TransportTimeout(self.addr.clone()))?
    }

    /// Convenience wrapper for `RequestControl`, requesting under the given
    /// `mode`. Identity is conveyed by this client's per-connection
    /// handshake, not by the request payload.
    pub async fn request_control(&self, mode: crate::messages::ControlMode) -> Result<ControlResponse> {
        self.send(ControlRequest::RequestControl { mode }).await
    }

    /// Convenience wrapper for `ReleaseControl`.
    pub async fn release_control(&self) -> Result<ControlResponse> {
        self.send(ControlRequest::ReleaseControl).await
    }

    /// Convenience wrapper for `SetScanParams`.
    pub async fn set_scan_params(&self, params: crate::messages::ScanParameters2D) -> Result<ControlResponse> {
        self.send(ControlRequest::SetScanParams(params)).await
    }

    /// Convenience wrapper for `SetZCtrlParams`.
    pub async fn set_zctrl_params(&self, params: crate::messages::ZCtrlParameters) -> Result<ControlResponse> {
        self.send(ControlRequest::SetZCtrlParams(params)).await
    }
}

/// An admin-privileged control client, exposing the mode-change and
/// experiment-termination operations ordinary clients cannot reach.
pub struct AdminControlClient {
    inner: ControlClient,
}

impl AdminControlClient {
    /// Wrap an existing client with admin privileges.
    pub fn new(inner: ControlClient) -> Self {
        Self { inner }
    }

    /// Change the router's control mode directly.
    pub async fn set_control_mode(&self, mode: crate::messages::ControlMode) -> Result<ControlResponse> {
        self.inner.send(ControlRequest::SetControlMode { mode }).await
    }

    /// Signal every listening component to end the experiment.
    pub async fn end_experiment(&self) -> Result<ControlResponse> {
        self.inner.send(ControlRequest::EndExperiment).await
    }
}
