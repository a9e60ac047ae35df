//! C4: Control Server (the translator-facing half of the control channel).
//!
//! The translator's side of the request/reply channel, offering `poll`/
//! `reply` instead of an async request handler so the translator's
//! single-threaded main loop stays in charge of exactly when a request is
//! served. `reply` must be the first action taken after a successful
//! `poll`; this type enforces that by holding the one outstanding reply
//! channel in `pending` and refusing a second `poll` until it is consumed.
//!
//! Each [`ControlClient`](super::control_client::ControlClient) request is
//! its own short-lived connection (identity handshake, request, reply,
//! close — see `control_client.rs`); the server accordingly spawns one task
//! per accepted connection that blocks on a reply before closing its
//! socket, and serializes those across connections onto a single mpsc
//! channel so `poll` always observes one request at a time.

use crate::error::{Result, SpmError};
use crate::transport::control_client::{ControlRequest, ControlResponse};
use crate::transport::wire::{read_frame, write_frame};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

struct PendingRequest {
    client_id: Option<String>,
    request: ControlRequest,
    reply_tx: oneshot::Sender<ControlResponse>,
}

/// The translator's endpoint of the control channel: `poll` for the next
/// request, `reply` to answer it.
pub struct ControlServer {
    rx: Mutex<mpsc::Receiver<PendingRequest>>,
    pending_reply: Mutex<Option<oneshot::Sender<ControlResponse>>>,
    last_client_id: Mutex<Option<String>>,
}

impl ControlServer {
    /// Bind the server on `addr` and start accepting client connections in
    /// the background.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _peer)) => {
                        let tx = tx.clone();
                        tokio::spawn(serve_connection(socket, tx));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "control server accept failed");
                        break;
                    }
                }
            }
        });
        Ok(Self {
            rx: Mutex::new(rx),
            pending_reply: Mutex::new(None),
            last_client_id: Mutex::new(None),
        })
    }

    /// Wait up to `timeout_dur` for the next request. Returns `(client_id,
    /// request)` if one arrived; `None` on timeout. `client_id` is `None`
    /// when the connection completed its handshake with no identity.
    /// The caller MUST call [`ControlServer::reply`] before calling `poll`
    /// again.
    pub async fn poll(
        &self,
        timeout_dur: std::time::Duration,
    ) -> Result<Option<(Option<String>, ControlRequest)>> {
        let mut rx = self.rx.lock().await;
        match timeout(timeout_dur, rx.recv()).await {
            Ok(Some(pending)) => {
                *self.pending_reply.lock().await = Some(pending.reply_tx);
                *self.last_client_id.lock().await = pending.client_id.clone();
                Ok(Some((pending.client_id, pending.request)))
            }
            Ok(None) => Err(SpmError::TransportIo(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "control server channel closed",
            ))),
            Err(_) => Ok(None),
        }
    }

    /// Answer the most recently polled request. Calling this without a
    /// pending request surfaces as an error rather than silently dropping
    /// the reply.
    pub async fn reply(&self, response: ControlResponse) -> Result<()> {
        let sender = self
            .pending_reply
            .lock()
            .await
            .take()
            .ok_or_else(|| SpmError::ConfigurationError("reply() called with no pending request".to_string()))?;
        let _ = sender.send(response);
        Ok(())
    }
}

async fn serve_connection(mut socket: TcpStream, tx: mpsc::Sender<PendingRequest>) {
    let client_id: Option<String> = match read_frame(&mut socket).await {
        Ok(id) => id,
        Err(_) => return,
    };
    let request: ControlRequest = match read_frame(&mut socket).await {
        Ok(r) => r,
        Err(_) => return,
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if tx
        .send(PendingRequest {
            client_id,
            request,
            reply_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    if let Ok(response) = reply_rx.await {
        let _ = write_frame(&mut socket, &response).await;
    }
}
