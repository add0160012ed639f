// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Everything below registers here, not in the prometheus default registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Upstream (venue) --------
pub static FRAMES_IN: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("venue_frames_total", "inbound venue frames (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static PROTOCOL_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("venue_protocol_errors_total", "malformed or unrecognized frames").unwrap()
});

pub static RPC_CALLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("rpc_calls_total", "requests sent to the venue").unwrap());

pub static RPC_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rpc_failures_total", "failed requests (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static RPC_PENDING: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("rpc_pending", "requests awaiting a reply").unwrap());

pub static VENUE_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("venue_ws_connected", "1 if the venue websocket is open, 0 otherwise").unwrap()
});

pub static VENUE_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("venue_ws_reconnects_total", "venue websocket reconnect attempts").unwrap()
});

// 0 = unauthenticated, 1 = authenticating, 2 = authenticated
pub static AUTH_STATE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("auth_state", "authentication state machine").unwrap());

// -------- Downstream fan-out --------
pub static DOWNSTREAM_CLIENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("downstream_clients", "connected downstream clients").unwrap());

pub static DELIVERIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("downstream_deliveries_total", "messages queued to downstream clients")
        .unwrap()
});

pub static DELIVERY_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("downstream_delivery_failures_total", "failed deliveries (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

// -------- State stores --------
pub static BOOK_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("book_updates_total", "order book snapshots stored per instrument"),
        &["instrument"],
    )
    .unwrap()
});

pub static ORDER_UPDATES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("order_updates_total", "order store writes").unwrap());

/// Idempotent; a second call leaves the registry as it is.
pub fn init() {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(FRAMES_IN.clone()),
        Box::new(PROTOCOL_ERRORS.clone()),
        Box::new(RPC_CALLS.clone()),
        Box::new(RPC_FAILURES.clone()),
        Box::new(RPC_PENDING.clone()),
        Box::new(VENUE_CONNECTED.clone()),
        Box::new(VENUE_RECONNECTS.clone()),
        Box::new(AUTH_STATE.clone()),
        Box::new(DOWNSTREAM_CLIENTS.clone()),
        Box::new(DELIVERIES.clone()),
        Box::new(DELIVERY_FAILURES.clone()),
        Box::new(BOOK_UPDATES.clone()),
        Box::new(ORDER_UPDATES.clone()),
    ];
    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!(error = %e, "metric not registered");
        }
    }
}

fn scrape_body() -> Vec<u8> {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() || buf.is_empty() {
        buf = b"# no metrics\n".to_vec();
    }
    buf
}

/// Full HTTP/1.1 response for one scrape. The request line is not inspected:
/// every path answers with the text exposition.
fn scrape_response() -> Vec<u8> {
    let body = scrape_body();
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        TEXT_FORMAT,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);
    out
}

fn answer_scrape(mut stream: TcpStream) -> std::io::Result<()> {
    let mut head = [0u8; 1024];
    let _request_len = stream.read(&mut head)?;
    stream.write_all(&scrape_response())?;
    stream.flush()
}

/// Blocking exporter on its own thread, outside the tokio runtime.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed, exporter disabled");
                return;
            }
        };
        tracing::info!(%addr, "metrics exporter listening");

        for conn in listener.incoming() {
            let res = conn.and_then(answer_scrape);
            if let Err(e) = res {
                tracing::debug!(?e, "metrics scrape failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        init();
        init();
        RPC_CALLS.inc();
        let text = String::from_utf8(scrape_body()).unwrap();
        assert!(text.contains("rpc_calls_total"));
        assert!(text.contains("downstream_clients"));
    }

    #[test]
    fn scrape_response_is_complete_http() {
        init();
        let raw = String::from_utf8(scrape_response()).unwrap();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert!(head.contains("text/plain"));
    }

    #[test]
    fn exporter_answers_over_tcp() {
        init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            answer_scrape(stream).unwrap();
        });
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
        let mut raw = String::new();
        client.read_to_string(&mut raw).unwrap();
        server.join().unwrap();
        assert!(raw.contains("rpc_calls_total"));
    }
}
