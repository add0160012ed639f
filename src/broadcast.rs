// ===============================
// src/broadcast.rs (downstream fan-out)
// ===============================
//
// Each downstream client owns a bounded queue drained by its own writer task.
// broadcast() snapshots the live set, then try_send()s to each entry:
// - a full or closed queue is logged + counted, delivery continues
// - failed clients are NOT removed here; only the connection's own close does that
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use ahash::AHashMap as HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use crate::error::{DeliveryFailure, GatewayError, Result};
use crate::metrics::{DELIVERIES, DELIVERY_FAILURES, DOWNSTREAM_CLIENTS};

pub type ConnId = u64;
pub type Payload = Arc<str>;

#[derive(Debug, Clone)]
pub struct DownstreamConn {
    pub id: ConnId,
    tx: mpsc::Sender<Payload>,
}

impl DownstreamConn {
    pub fn new(id: ConnId, tx: mpsc::Sender<Payload>) -> Self {
        Self { id, tx }
    }

    fn try_deliver(&self, msg: &Payload) -> std::result::Result<(), DeliveryFailure> {
        self.tx.try_send(msg.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::Full,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct Broadcaster {
    next_id: AtomicU64,
    conns: RwLock<HashMap<ConnId, DownstreamConn>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Idempotent: adding an id that is already live keeps the existing entry.
    pub fn add_connection(&self, conn: DownstreamConn) -> bool {
        self.add_connection_with(conn, Vec::new)
    }

    /// Like `add_connection`, but `initial` is evaluated and queued while the
    /// membership lock is held: any broadcast that misses the new client
    /// finished before `initial` ran, and every later one lands after it.
    pub fn add_connection_with<F>(&self, conn: DownstreamConn, initial: F) -> bool
    where
        F: FnOnce() -> Vec<Payload>,
    {
        let mut m = self.conns.write().unwrap_or_else(|p| p.into_inner());
        if m.contains_key(&conn.id) {
            return false;
        }
        for msg in initial() {
            if let Err(reason) = conn.try_deliver(&msg) {
                DELIVERY_FAILURES.with_label_values(&[failure_label(reason)]).inc();
                debug!(conn = conn.id, %reason, "initial message not queued");
            } else {
                DELIVERIES.inc();
            }
        }
        info!(conn = conn.id, "downstream client added");
        m.insert(conn.id, conn);
        DOWNSTREAM_CLIENTS.set(m.len() as i64);
        true
    }

    /// Idempotent.
    pub fn remove_connection(&self, id: ConnId) -> bool {
        let mut m = self.conns.write().unwrap_or_else(|p| p.into_inner());
        let removed = m.remove(&id).is_some();
        if removed {
            info!(conn = id, "downstream client removed");
        }
        DOWNSTREAM_CLIENTS.set(m.len() as i64);
        removed
    }

    pub fn len(&self) -> usize {
        self.conns.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcast(&self, msg: impl Into<Payload>) -> BroadcastReport {
        let msg: Payload = msg.into();
        // snapshot under the lock, deliver without it
        let targets: Vec<DownstreamConn> = {
            let m = self.conns.read().unwrap_or_else(|p| p.into_inner());
            m.values().cloned().collect()
        };

        let mut report = BroadcastReport::default();
        for conn in &targets {
            match conn.try_deliver(&msg) {
                Ok(()) => {
                    report.delivered += 1;
                    DELIVERIES.inc();
                }
                Err(reason) => {
                    report.failed += 1;
                    DELIVERY_FAILURES.with_label_values(&[failure_label(reason)]).inc();
                    debug!(conn = conn.id, %reason, "downstream delivery failed");
                }
            }
        }
        report
    }

    pub fn send(&self, id: ConnId, msg: impl Into<Payload>) -> Result<()> {
        let conn = {
            let m = self.conns.read().unwrap_or_else(|p| p.into_inner());
            m.get(&id).cloned()
        };
        let conn = conn.ok_or(GatewayError::Delivery {
            conn: id,
            reason: DeliveryFailure::UnknownConnection,
        })?;
        conn.try_deliver(&msg.into()).map_err(|reason| {
            DELIVERY_FAILURES.with_label_values(&[failure_label(reason)]).inc();
            GatewayError::Delivery { conn: id, reason }
        })?;
        DELIVERIES.inc();
        Ok(())
    }
}

fn failure_label(f: DeliveryFailure) -> &'static str {
    match f {
        DeliveryFailure::Full => "full",
        DeliveryFailure::Closed => "closed",
        DeliveryFailure::UnknownConnection => "unknown",
    }
}
