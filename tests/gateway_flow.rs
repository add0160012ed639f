use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

use deribit_bridge::broadcast::Broadcaster;
use deribit_bridge::domain::{OrderBookSnapshot, PriceLevel};
use deribit_bridge::server;
use deribit_bridge::transport::{run_session, ReconnectPolicy, TransportEvent};
use deribit_bridge::{Gateway, GatewayConfig};

fn config(instruments: &[&str]) -> GatewayConfig {
    GatewayConfig {
        heartbeat_secs: 0,
        request_timeout: Duration::from_secs(3),
        instruments: instruments.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(t) = msg {
            return serde_json::from_str(&t).unwrap();
        }
    }
}

async fn start_downstream(gw: Arc<Gateway>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, gw, 64));
    format!("ws://{addr}")
}

#[tokio::test]
async fn downstream_client_gets_snapshot_then_live_events() {
    let (out_tx, _out_rx) = mpsc::channel(16);
    let bc = Arc::new(Broadcaster::new());
    let gw = Gateway::new(config(&["BTC-PERPETUAL"]), None, out_tx, bc.clone());
    gw.books().upsert(OrderBookSnapshot::new(
        "BTC-PERPETUAL",
        vec![PriceLevel { price: 100.0, size: 2.0 }],
        vec![PriceLevel { price: 101.0, size: 3.0 }],
        1,
    ));

    let url = start_downstream(gw.clone()).await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let first = next_json(&mut client).await;
    assert_eq!(first["type"], "book");
    assert_eq!(first["data"]["instrument"], "BTC-PERPETUAL");
    wait_until(|| bc.len() == 1).await;

    let push = json!({
        "jsonrpc": "2.0",
        "method": "subscription",
        "params": {
            "channel": "book.BTC-PERPETUAL.raw",
            "data": { "timestamp": 2, "bids": [[99, 1]], "asks": [[102, 4]] }
        }
    });
    gw.handle_event(TransportEvent::Frame(push.to_string()));

    let live = next_json(&mut client).await;
    assert_eq!(live["type"], "book");
    assert_eq!(live["data"]["timestamp"], 2);
    assert_eq!(live["data"]["bids"][0]["price"], 99.0);

    client.close(None).await.unwrap();
    wait_until(|| bc.is_empty()).await;
}

#[tokio::test]
async fn closed_client_does_not_affect_others() {
    let (out_tx, _out_rx) = mpsc::channel(16);
    let bc = Arc::new(Broadcaster::new());
    let gw = Gateway::new(config(&[]), None, out_tx, bc.clone());
    let url = start_downstream(gw.clone()).await;

    let (mut a, _) = connect_async(url.as_str()).await.unwrap();
    let (b, _) = connect_async(url.as_str()).await.unwrap();
    wait_until(|| bc.len() == 2).await;
    drop(b);

    for i in 0..3 {
        bc.broadcast(format!("{{\"n\":{i}}}"));
    }
    for i in 0..3 {
        assert_eq!(next_json(&mut a).await["n"], i);
    }
    wait_until(|| bc.len() == 1).await;
}

/// Minimal venue: answers subscribe and get_order_book, pushes one book after subscribe.
async fn fake_venue(listener: TcpListener) {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(tcp).await.unwrap();
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let req: Value = serde_json::from_str(&text).unwrap();
        let id = req["id"].clone();
        match req["method"].as_str().unwrap_or_default() {
            "public/subscribe" => {
                let channels = req["params"]["channels"].clone();
                let reply = json!({ "jsonrpc": "2.0", "id": id, "result": channels });
                ws.send(Message::Text(reply.to_string())).await.unwrap();
                let push = json!({
                    "jsonrpc": "2.0",
                    "method": "subscription",
                    "params": {
                        "channel": "book.BTC-PERPETUAL.raw",
                        "data": {
                            "instrument_name": "BTC-PERPETUAL",
                            "timestamp": 7,
                            "bids": [["new", 100, 2], ["new", 99, 1]],
                            "asks": [["new", 101, 3]]
                        }
                    }
                });
                ws.send(Message::Text(push.to_string())).await.unwrap();
            }
            "public/get_order_book" => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "instrument_name": req["params"]["instrument_name"],
                        "timestamp": 9,
                        "bids": [[2000.5, 10]],
                        "asks": [[2001, 5], [2002, 7]]
                    }
                });
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            _ => {
                let reply = json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32601, "message": "Method not found" } });
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
        }
    }
}

#[tokio::test]
async fn venue_to_downstream_end_to_end() {
    let venue = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let venue_url = format!("ws://{}", venue.local_addr().unwrap());
    tokio::spawn(fake_venue(venue));

    let (out_tx, out_rx) = mpsc::channel(64);
    let (ev_tx, ev_rx) = mpsc::channel(64);
    let bc = Arc::new(Broadcaster::new());
    let gw = Gateway::new(config(&["BTC-PERPETUAL"]), None, out_tx, bc.clone());

    let downstream_url = start_downstream(gw.clone()).await;
    let (mut client, _) = connect_async(downstream_url.as_str()).await.unwrap();
    wait_until(|| bc.len() == 1).await;

    let policy = ReconnectPolicy { min: Duration::from_millis(10), max: Duration::from_millis(50) };
    tokio::spawn(run_session(venue_url, out_rx, ev_tx, policy));
    tokio::spawn(gw.clone().run(ev_rx));

    // resubscribe after connect triggers the venue push
    let ev = next_json(&mut client).await;
    assert_eq!(ev["type"], "book");
    assert_eq!(ev["data"]["timestamp"], 7);
    let book = gw.books().get("BTC-PERPETUAL").unwrap();
    assert_eq!(book.best_bid(), Some(PriceLevel { price: 100.0, size: 2.0 }));
    assert_eq!(book.spread(), Some(1.0));

    let eth = gw.get_order_book("ETH-PERPETUAL", Some(5)).await.unwrap();
    assert_eq!(eth.asks.len(), 2);
    assert_eq!(gw.books().instruments(), vec!["BTC-PERPETUAL", "ETH-PERPETUAL"]);

    let err = gw.request("public/nope", json!({})).await.unwrap_err();
    assert!(matches!(err, deribit_bridge::GatewayError::Rpc(ref e) if e.code == -32601));
    assert_eq!(gw.pending_requests(), 0);
}
