// ===============================
// src/router.rs (inbound frame dispatch)
// ===============================
//
// Frames with an id go to the correlator, never to a channel handler.
// Frames without an id are pushed to the handler registered for their channel;
// no handler means the push is dropped (late push after an unsubscribe).
//
use std::sync::{Arc, RwLock};

use ahash::AHashMap as HashMap;
use tracing::{trace, warn};

use crate::correlator::Correlator;
use crate::error::ProtocolError;
use crate::metrics::{FRAMES_IN, PROTOCOL_ERRORS};
use crate::protocol::{parse_frame, HeartbeatKind, Inbound, PushEvent};

pub type ChannelHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&ProtocolError, &str) + Send + Sync>;

/// What `route` did with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Reply { id: u64, matched: bool },
    Push { channel: String, handled: bool },
    Heartbeat(HeartbeatKind),
    Dropped,
}

pub struct EventRouter {
    correlator: Arc<Correlator>,
    handlers: RwLock<HashMap<String, ChannelHandler>>,
    error_hook: RwLock<Option<ErrorHook>>,
}

impl EventRouter {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self {
            correlator,
            handlers: RwLock::new(HashMap::new()),
            error_hook: RwLock::new(None),
        }
    }

    /// Replaces any handler already registered for `channel`.
    pub fn register_handler(&self, channel: impl Into<String>, handler: ChannelHandler) {
        let mut h = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        h.insert(channel.into(), handler);
    }

    pub fn unregister_handler(&self, channel: &str) -> bool {
        let mut h = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        h.remove(channel).is_some()
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        let h = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        h.contains_key(channel)
    }

    /// Observer for malformed frames; receives the error and the raw text.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        *self.error_hook.write().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    pub fn route(&self, frame: &str) -> Routed {
        let inbound = match parse_frame(frame) {
            Ok(i) => i,
            Err(e) => {
                PROTOCOL_ERRORS.inc();
                FRAMES_IN.with_label_values(&["invalid"]).inc();
                warn!(error = %e, "dropping invalid venue frame");
                let hook = self.error_hook.read().unwrap_or_else(|p| p.into_inner()).clone();
                if let Some(hook) = hook {
                    hook(&e, frame);
                }
                return Routed::Dropped;
            }
        };

        match inbound {
            Inbound::Reply { id, outcome } => {
                FRAMES_IN.with_label_values(&["reply"]).inc();
                let matched = self.correlator.complete(id, outcome);
                Routed::Reply { id, matched }
            }
            Inbound::Push(ev) => {
                FRAMES_IN.with_label_values(&["push"]).inc();
                // Clone the handler out so the lock is not held while it runs;
                // a concurrent unregister either happened before (skip) or
                // after (the clone runs to completion).
                let handler = {
                    let h = self.handlers.read().unwrap_or_else(|p| p.into_inner());
                    h.get(&ev.channel).cloned()
                };
                match handler {
                    Some(handler) => {
                        handler(&ev);
                        Routed::Push { channel: ev.channel, handled: true }
                    }
                    None => {
                        trace!(channel = %ev.channel, "push without handler, dropped");
                        Routed::Push { channel: ev.channel, handled: false }
                    }
                }
            }
            Inbound::Heartbeat(kind) => {
                FRAMES_IN.with_label_values(&["heartbeat"]).inc();
                Routed::Heartbeat(kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundFrame;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn router() -> (EventRouter, Arc<Correlator>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let c = Arc::new(Correlator::new(tx));
        c.mark_open();
        (EventRouter::new(c.clone()), c, rx)
    }

    fn counting_handler(n: &Arc<AtomicUsize>) -> ChannelHandler {
        let n = n.clone();
        Arc::new(move |_ev: &PushEvent| {
            n.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn reply_goes_to_correlator_not_handler() {
        let (r, c, _rx) = router();
        let hits = Arc::new(AtomicUsize::new(0));
        r.register_handler("book.BTC-PERPETUAL.raw", counting_handler(&hits));

        let call = c.call("public/test", json!({})).await.unwrap();
        let frame = json!({
            "id": call.id,
            "result": {"version": "1.2"},
            "params": {"channel": "book.BTC-PERPETUAL.raw", "data": {}}
        })
        .to_string();
        assert_eq!(r.route(&frame), Routed::Reply { id: call.id, matched: true });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(
            call.wait(Duration::from_secs(1)).await.unwrap(),
            json!({"version": "1.2"})
        );
    }

    #[test]
    fn push_dispatches_to_registered_channel() {
        let (r, _c, _rx) = router();
        let hits = Arc::new(AtomicUsize::new(0));
        r.register_handler("trades.ETH-PERPETUAL.raw", counting_handler(&hits));
        let frame = r#"{"method":"subscription","params":{"channel":"trades.ETH-PERPETUAL.raw","data":[]}}"#;
        assert_eq!(
            r.route(frame),
            Routed::Push { channel: "trades.ETH-PERPETUAL.raw".into(), handled: true }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_for_unregistered_channel_is_noop() {
        let (r, _c, _rx) = router();
        let hits = Arc::new(AtomicUsize::new(0));
        r.register_handler("book.A.raw", counting_handler(&hits));
        assert!(r.unregister_handler("book.A.raw"));
        assert!(!r.unregister_handler("book.A.raw"));
        let frame = r#"{"method":"subscription","params":{"channel":"book.A.raw","data":{}}}"#;
        assert_eq!(r.route(frame), Routed::Push { channel: "book.A.raw".into(), handled: false });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_frames_reach_error_hook() {
        let (r, _c, _rx) = router();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        r.set_error_hook(Arc::new(move |_e: &ProtocolError, _raw: &str| {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(r.route("garbage"), Routed::Dropped);
        assert_eq!(r.route(r#"{"hello":"world"}"#), Routed::Dropped);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_may_unregister_itself() {
        let (tx, _rx) = mpsc::channel(1);
        let r = Arc::new(EventRouter::new(Arc::new(Correlator::new(tx))));
        let weak = Arc::downgrade(&r);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        r.register_handler(
            "once",
            Arc::new(move |_ev: &PushEvent| {
                h.fetch_add(1, Ordering::SeqCst);
                if let Some(r) = weak.upgrade() {
                    r.unregister_handler("once");
                }
            }),
        );
        let frame = r#"{"method":"subscription","params":{"channel":"once","data":1}}"#;
        r.route(frame);
        r.route(frame);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn heartbeat_is_reported() {
        let (r, _c, _rx) = router();
        let frame = r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#;
        assert_eq!(r.route(frame), Routed::Heartbeat(HeartbeatKind::TestRequest));
    }
}
