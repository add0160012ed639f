// ===============================
// src/transport.rs (venue websocket session)
// ===============================
//
// One task owns the socket. It forwards outbound frames from an mpsc queue
// and turns everything it reads into TransportEvents:
//   Connected -> Frame* -> Disconnected(reason) -> (backoff) -> Connected ...
//
// Backoff: min * 2^min(attempt,6) capped at max, plus 0..=250ms jitter,
// reset after every successful connect. Dropping the outbound sender stops it.
//
// Successful connects are numbered from 1. Outbound frames tagged for any
// other connection are dropped instead of written to the current socket.
//
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::metrics::{VENUE_CONNECTED, VENUE_RECONNECTS};
use crate::protocol::OutboundFrame;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Frame(String),
    Disconnected(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { min: Duration::from_millis(500), max: Duration::from_millis(32_000) }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(6);
        let base = self.min.saturating_mul(factor).min(self.max);
        let jitter = rand::thread_rng().gen_range(0..=250);
        base + Duration::from_millis(jitter)
    }
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

pub async fn run_session(
    ws_url: String,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    events_tx: mpsc::Sender<TransportEvent>,
    policy: ReconnectPolicy,
) {
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad venue ws url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    let mut session: u64 = 0;
    loop {
        info!(%ws_url, "connecting to venue");
        match connect_async(url.as_str()).await {
            Ok((ws, _resp)) => {
                attempt = 0;
                session += 1;
                VENUE_CONNECTED.set(1);
                info!(session, "venue connected");

                // frames queued for the previous socket are stale
                while outbound_rx.try_recv().is_ok() {}

                if events_tx.send(TransportEvent::Connected).await.is_err() {
                    return;
                }

                let (mut sink, mut stream) = ws.split();
                let end = loop {
                    tokio::select! {
                        out = outbound_rx.recv() => match out {
                            Some(frame) if !frame.belongs_to(session) => {
                                debug!(frame_session = frame.session, session, "stale outbound frame dropped");
                            }
                            Some(frame) => {
                                if let Err(e) = sink.send(Message::Text(frame.text)).await {
                                    break SessionEnd::Lost(format!("write failed: {e}"));
                                }
                            }
                            None => {
                                let _ = sink.send(Message::Close(None)).await;
                                break SessionEnd::Shutdown;
                            }
                        },
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                if events_tx.send(TransportEvent::Frame(text)).await.is_err() {
                                    break SessionEnd::Shutdown;
                                }
                            }
                            Some(Ok(Message::Close(cf))) => {
                                break SessionEnd::Lost(match cf {
                                    Some(cf) => format!("closed by venue: {} {}", cf.code, cf.reason),
                                    None => "closed by venue".to_string(),
                                });
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break SessionEnd::Lost(format!("read failed: {e}")),
                            None => break SessionEnd::Lost("stream ended".to_string()),
                        },
                    }
                };

                VENUE_CONNECTED.set(0);
                match end {
                    SessionEnd::Shutdown => {
                        info!("venue session shut down");
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!(%reason, "venue disconnected, will reconnect");
                        if events_tx.send(TransportEvent::Disconnected(reason)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!(?e, "venue connect failed");
            }
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        VENUE_RECONNECTS.inc();
        tokio::select! {
            _ = sleep(delay) => {}
            _ = events_tx.closed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    #[test]
    fn backoff_is_capped() {
        let p = ReconnectPolicy { min: Duration::from_millis(500), max: Duration::from_millis(4_000) };
        let d0 = p.delay(0);
        assert!(d0 >= Duration::from_millis(500) && d0 <= Duration::from_millis(750));
        let d9 = p.delay(9);
        assert!(d9 >= Duration::from_millis(4_000) && d9 <= Duration::from_millis(4_250));
    }

    async fn next(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn frames_flow_and_session_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // venue: echo one frame back, then drop; accept a second session
        let venue = tokio::spawn(async move {
            for round in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(tcp).await.unwrap();
                if round == 0 {
                    if let Some(Ok(Message::Text(t))) = ws.next().await {
                        ws.send(Message::Text(format!("echo:{t}"))).await.unwrap();
                    }
                    ws.close(None).await.ok();
                } else {
                    while ws.next().await.is_some() {}
                }
            }
        });

        let (out_tx, out_rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        let policy = ReconnectPolicy { min: Duration::from_millis(10), max: Duration::from_millis(20) };
        let session = tokio::spawn(run_session(format!("ws://{addr}"), out_rx, ev_tx, policy));

        assert_eq!(next(&mut ev_rx).await, TransportEvent::Connected);
        out_tx.send("hello".into()).await.unwrap();
        assert_eq!(next(&mut ev_rx).await, TransportEvent::Frame("echo:hello".into()));
        assert!(matches!(next(&mut ev_rx).await, TransportEvent::Disconnected(_)));
        assert_eq!(next(&mut ev_rx).await, TransportEvent::Connected);

        drop(out_tx);
        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        venue.await.unwrap();
    }

    #[tokio::test]
    async fn frames_for_another_session_are_not_written() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let venue = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(t))) = ws.next().await {
                ws.send(Message::Text(format!("first:{t}"))).await.unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let (out_tx, out_rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        let session = tokio::spawn(run_session(format!("ws://{addr}"), out_rx, ev_tx, ReconnectPolicy::default()));

        assert_eq!(next(&mut ev_rx).await, TransportEvent::Connected);
        // only frames for connection 1 (or untagged ones) reach this socket
        out_tx.send(OutboundFrame::new(7, "stale")).await.unwrap();
        out_tx.send(OutboundFrame::new(1, "current")).await.unwrap();
        assert_eq!(next(&mut ev_rx).await, TransportEvent::Frame("first:current".into()));

        drop(out_tx);
        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        venue.abort();
    }

    #[tokio::test]
    async fn bad_url_returns() {
        let (_out_tx, out_rx) = mpsc::channel(1);
        let (ev_tx, _ev_rx) = mpsc::channel(1);
        timeout(
            Duration::from_secs(1),
            run_session("not a url".into(), out_rx, ev_tx, ReconnectPolicy::default()),
        )
        .await
        .unwrap();
    }
}
