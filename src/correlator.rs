// ===============================
// src/correlator.rs
// ===============================
//
// Request correlation over one venue connection:
// - every call gets a fresh u64 id (starts at 1, never reused in-process)
// - the pending entry is registered BEFORE the frame is queued to the transport
// - a reply resolves exactly one pending entry, exactly once
// - fail_all() closes the gate and fails every outstanding call
// - frames carry the session they were issued in; mark_open() starts a new one
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result, RpcError};
use crate::metrics::{RPC_CALLS, RPC_FAILURES, RPC_PENDING};
use crate::protocol::{OutboundFrame, RpcRequest};

pub type RpcOutcome = Result<Value>;

/// Bookkeeping for one in-flight call.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub issued_at: Instant,
    continuation: oneshot::Sender<RpcOutcome>,
}

/// Handle returned by [`Correlator::call`]; resolves once.
#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    pub method: String,
    rx: oneshot::Receiver<RpcOutcome>,
}

impl PendingCall {
    /// Wait for the reply. Dropping the handle only ignores the result, the
    /// venue cannot withdraw a sent request.
    pub async fn wait(self, timeout: Duration) -> RpcOutcome {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed(format!(
                "request {} dropped without a reply",
                self.id
            ))),
            Err(_) => Err(GatewayError::Timeout { id: self.id, method: self.method, after: timeout }),
        }
    }
}

#[derive(Default)]
struct Pending {
    open: bool,
    session: u64,
    requests: HashMap<u64, PendingRequest>,
}

pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<Pending>,
    outbound: mpsc::Sender<OutboundFrame>,
}

impl Correlator {
    /// `outbound` feeds the transport session. Starts closed until the first
    /// `mark_open()`.
    pub fn new(outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Pending::default()),
            outbound,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        // a poisoned map is still consistent: entries are only inserted/removed whole
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Transport is up, accept calls again. Each call numbers a new session,
    /// matching the transport's count of successful connects.
    pub fn mark_open(&self) {
        let mut p = self.lock();
        p.open = true;
        p.session += 1;
    }

    pub fn session(&self) -> u64 {
        self.lock().session
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn pending_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Register a pending entry, then hand the encoded frame to the transport.
    pub async fn call(&self, method: &str, params: Value) -> Result<PendingCall> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = RpcRequest::new(id, method, &params).encode()?;
        let (tx, rx) = oneshot::channel();

        let frame = {
            let mut p = self.lock();
            if !p.open {
                RPC_FAILURES.with_label_values(&["not_connected"]).inc();
                return Err(GatewayError::ConnectionClosed("venue not connected".into()));
            }
            p.requests.insert(
                id,
                PendingRequest {
                    id,
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    continuation: tx,
                },
            );
            RPC_PENDING.set(p.requests.len() as i64);
            OutboundFrame::new(p.session, text)
        };

        if self.outbound.send(frame).await.is_err() {
            self.forget(id);
            RPC_FAILURES.with_label_values(&["transport"]).inc();
            return Err(GatewayError::Transport("outbound queue closed".into()));
        }
        RPC_CALLS.inc();
        debug!(id, method, "request sent");
        Ok(PendingCall { id, method: method.to_string(), rx })
    }

    /// `call` + `wait`; a timed-out entry is removed so it cannot leak.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> RpcOutcome {
        let call = self.call(method, params).await?;
        let id = call.id;
        let out = call.wait(timeout).await;
        if let Err(GatewayError::Timeout { .. }) = &out {
            self.forget(id);
            RPC_FAILURES.with_label_values(&["timeout"]).inc();
        }
        out
    }

    /// Resolve the call matching `id`. Unknown or duplicate ids are logged and
    /// dropped; returns whether a continuation ran.
    pub fn complete(&self, id: u64, outcome: std::result::Result<Value, RpcError>) -> bool {
        let entry = {
            let mut p = self.lock();
            let e = p.requests.remove(&id);
            RPC_PENDING.set(p.requests.len() as i64);
            e
        };
        let Some(req) = entry else {
            warn!(id, "reply for unknown or already-resolved request, dropped");
            return false;
        };

        debug!(id, method = %req.method, elapsed_us = req.issued_at.elapsed().as_micros() as u64, "reply");
        let outcome = outcome.map_err(|e| {
            RPC_FAILURES.with_label_values(&["venue"]).inc();
            GatewayError::Rpc(e)
        });
        if req.continuation.send(outcome).is_err() {
            debug!(id, "caller gave up before the reply arrived");
        }
        true
    }

    /// Drop a pending entry without resolving it (caller timed out).
    pub fn forget(&self, id: u64) -> bool {
        let mut p = self.lock();
        let removed = p.requests.remove(&id).is_some();
        RPC_PENDING.set(p.requests.len() as i64);
        removed
    }

    /// Close the gate and fail every outstanding call once with a
    /// connection-closed error. Returns how many were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut p = self.lock();
            p.open = false;
            RPC_PENDING.set(0);
            p.requests.drain().map(|(_, r)| r).collect()
        };
        let n = drained.len();
        for req in drained {
            let _ = req
                .continuation
                .send(Err(GatewayError::ConnectionClosed(reason.to_string())));
        }
        if n > 0 {
            RPC_FAILURES.with_label_values(&["connection_closed"]).inc_by(n as u64);
            warn!(failed = n, %reason, "failed all pending requests");
        }
        n
    }
}
