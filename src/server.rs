// ===============================
// src/server.rs (downstream websocket listener)
// ===============================
//
// Per client:
// - bounded queue registered with the Broadcaster (slow reader = dropped frames, not a stall)
// - writer task: queue -> socket
// - reader loop: inbound frames are ignored until close; then the client is removed
//
// The current books are queued inside the registration itself, so a client
// never gets a snapshot that is older than a live event ahead of it.
//
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::broadcast::{DownstreamConn, Payload};
use crate::domain::DownstreamEvent;
use crate::error::Result;
use crate::gateway::Gateway;

pub async fn run_server(addr: &str, gateway: Arc<Gateway>, buffer: usize) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "downstream websocket listening");
    serve(listener, gateway, buffer).await
}

pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>, buffer: usize) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_client(stream, peer, gateway.clone(), buffer));
            }
            Err(e) => {
                warn!(?e, "accept failed");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, gateway: Arc<Gateway>, buffer: usize) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, ?e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Payload>(buffer.max(1));
    let broadcaster = gateway.broadcaster().clone();
    let id = broadcaster.next_conn_id();
    broadcaster.add_connection_with(DownstreamConn::new(id, tx), || book_snapshots(&gateway));
    info!(conn = id, %peer, "downstream client connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(msg.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(t)) => debug!(conn = id, len = t.len(), "downstream input ignored"),
            Ok(_) => {}
            Err(e) => {
                debug!(conn = id, ?e, "downstream read error");
                break;
            }
        }
    }

    broadcaster.remove_connection(id);
    writer.abort();
    info!(conn = id, %peer, "downstream client disconnected");
}

fn book_snapshots(gateway: &Gateway) -> Vec<Payload> {
    gateway
        .books()
        .list()
        .into_iter()
        .filter_map(|book| match DownstreamEvent::Book((*book).clone()).to_json() {
            Ok(text) => Some(Payload::from(text)),
            Err(e) => {
                warn!(error = %e, "snapshot encode failed");
                None
            }
        })
        .collect()
}
