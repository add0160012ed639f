// ===============================
// src/gateway.rs (venue facade)
// ===============================
//
// Wires correlator, router, auth, stores and the broadcaster together and
// drives them from TransportEvents:
//   Connected       -> open the correlator; login, heartbeat, resubscribe (spawned)
//   Frame(text)     -> router (replies to correlator, pushes to channel handlers)
//   Disconnected(r) -> fail every pending call, back to Unauthenticated
//
// Channel handlers capture the stores and the broadcaster, never the Gateway.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthState, AuthSupervisor, Credentials, RetryPolicy};
use crate::broadcast::Broadcaster;
use crate::correlator::Correlator;
use crate::domain::{
    now_ms, DownstreamEvent, Order, OrderBookSnapshot, OrderRequest, OrderStatus, Position, Side,
};
use crate::error::{GatewayError, ProtocolError, Result};
use crate::market_data::{book_channel, book_channel_instrument, MarketStore, SubscriptionSet};
use crate::orders::OrderStore;
use crate::protocol::{HeartbeatKind, OutboundFrame, PushEvent};
use crate::router::{ChannelHandler, EventRouter, Routed};
use crate::transport::TransportEvent;

pub const DEFAULT_BOOK_DEPTH: u32 = 10;
const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub request_timeout: Duration,
    /// Venue heartbeat interval in seconds; 0 disables.
    pub heartbeat_secs: u64,
    pub instruments: Vec<String>,
    pub book_interval: String,
    pub order_channel: Option<String>,
    pub auth_retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5_000),
            heartbeat_secs: 30,
            instruments: Vec::new(),
            book_interval: "raw".into(),
            order_channel: None,
            auth_retry: RetryPolicy::default(),
        }
    }
}

pub struct Gateway {
    cfg: GatewayConfig,
    correlator: Arc<Correlator>,
    router: EventRouter,
    auth: Arc<AuthSupervisor>,
    orders: Arc<OrderStore>,
    books: Arc<MarketStore>,
    subscriptions: SubscriptionSet,
    broadcaster: Arc<Broadcaster>,
    local_seq: AtomicU64,
}

pub fn is_private_channel(channel: &str) -> bool {
    channel.starts_with("user.")
}

impl Gateway {
    pub fn new(
        cfg: GatewayConfig,
        credentials: Option<Credentials>,
        outbound_tx: mpsc::Sender<OutboundFrame>,
        broadcaster: Arc<Broadcaster>,
    ) -> Arc<Self> {
        let correlator = Arc::new(Correlator::new(outbound_tx));
        let router = EventRouter::new(correlator.clone());
        router.set_error_hook(Arc::new(|e: &ProtocolError, raw: &str| {
            let head: String = raw.chars().take(256).collect();
            debug!(error = %e, frame = %head, "invalid frame contents");
        }));
        let auth = Arc::new(AuthSupervisor::new(credentials, cfg.auth_retry));

        let gw = Arc::new(Self {
            correlator,
            router,
            auth,
            orders: Arc::new(OrderStore::new()),
            books: Arc::new(MarketStore::new()),
            subscriptions: SubscriptionSet::new(),
            broadcaster,
            local_seq: AtomicU64::new(0),
            cfg,
        });

        for instrument in &gw.cfg.instruments {
            gw.track(&book_channel(instrument, &gw.cfg.book_interval));
        }
        if let Some(ch) = gw.cfg.order_channel.clone() {
            if gw.auth.has_credentials() {
                gw.track(&ch);
            } else {
                warn!(channel = %ch, "no credentials, private order channel skipped");
            }
        }
        gw
    }

    pub fn orders(&self) -> &OrderStore {
        &self.orders
    }

    pub fn books(&self) -> &MarketStore {
        &self.books
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    pub fn auth(&self) -> &AuthSupervisor {
        &self.auth
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn is_connected(&self) -> bool {
        self.correlator.is_open()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    // -------- event loop --------

    pub async fn run(self: Arc<Self>, mut events_rx: mpsc::Receiver<TransportEvent>) {
        while let Some(ev) = events_rx.recv().await {
            self.handle_event(ev);
        }
        self.correlator.fail_all("transport stopped");
        self.auth.on_disconnect();
        info!("gateway event loop finished");
    }

    /// Never awaits; anything that needs a reply is spawned so the loop keeps
    /// routing frames.
    pub fn handle_event(self: &Arc<Self>, ev: TransportEvent) {
        match ev {
            TransportEvent::Connected => {
                self.correlator.mark_open();
                tokio::spawn(self.clone().on_connected());
            }
            TransportEvent::Frame(text) => match self.router.route(&text) {
                Routed::Heartbeat(HeartbeatKind::TestRequest) => {
                    let gw = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gw.request("public/test", json!({})).await {
                            warn!(error = %e, "heartbeat test reply failed");
                        }
                    });
                }
                Routed::Heartbeat(HeartbeatKind::Heartbeat) => debug!("venue heartbeat"),
                _ => {}
            },
            TransportEvent::Disconnected(reason) => {
                let failed = self.correlator.fail_all(&reason);
                self.auth.on_disconnect();
                warn!(%reason, failed, "venue session lost");
            }
        }
    }

    async fn on_connected(self: Arc<Self>) {
        if self.auth.has_credentials() {
            match self.auth.authenticate(&self.correlator, self.cfg.request_timeout).await {
                Ok(()) => {
                    let epoch = self.auth.epoch();
                    tokio::spawn(self.clone().refresh_loop(epoch));
                }
                Err(e) if e.is_connection_level() => {
                    warn!(error = %e, "login aborted by disconnect");
                    return;
                }
                Err(e) => error!(error = %e, "venue authentication failed"),
            }
        }

        if self.cfg.heartbeat_secs > 0 {
            let params = json!({ "interval": self.cfg.heartbeat_secs });
            if let Err(e) = self.request("public/set_heartbeat", params).await {
                warn!(error = %e, "set_heartbeat failed");
            }
        }

        self.resubscribe_all().await;
    }

    async fn refresh_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let Some(wait) = self.auth.refresh_in() else { return };
            sleep(wait).await;
            if self.auth.epoch() != epoch {
                return;
            }
            match self.auth.refresh(&self.correlator, self.cfg.request_timeout).await {
                Ok(()) => info!("access token refreshed"),
                Err(e) => {
                    error!(error = %e, "token refresh failed, private calls disabled until reconnect");
                    return;
                }
            }
        }
    }

    async fn resubscribe_all(&self) {
        let (private, public): (Vec<String>, Vec<String>) =
            self.subscriptions.list().into_iter().partition(|c| is_private_channel(c));
        if !public.is_empty() {
            if let Err(e) = self.send_subscribe(public, false).await {
                error!(error = %e, "public resubscribe failed");
            }
        }
        if !private.is_empty() {
            if self.auth.state() != AuthState::Authenticated {
                warn!(channels = private.len(), "not authenticated, private channels left unsubscribed");
            } else if let Err(e) = self.send_subscribe(private, true).await {
                error!(error = %e, "private resubscribe failed");
            }
        }
    }

    async fn send_subscribe(&self, channels: Vec<String>, private: bool) -> Result<Value> {
        let method = if private { "private/subscribe" } else { "public/subscribe" };
        info!(method, ?channels, "subscribing");
        self.request(method, json!({ "channels": channels })).await
    }

    // -------- subscriptions --------

    fn handler_for(&self, channel: &str) -> ChannelHandler {
        if book_channel_instrument(channel).is_some() {
            book_handler(self.books.clone(), self.broadcaster.clone())
        } else if channel.starts_with("user.orders.") {
            order_handler(self.orders.clone(), self.broadcaster.clone())
        } else {
            relay_handler(self.broadcaster.clone())
        }
    }

    /// Returns true when `channel` was not tracked before.
    fn track(&self, channel: &str) -> bool {
        if !self.router.has_handler(channel) {
            self.router.register_handler(channel, self.handler_for(channel));
        }
        self.subscriptions.add(channel)
    }

    /// Track `channel` and ask the venue for it. While disconnected (or, for
    /// private channels, not yet logged in) it is only tracked and gets
    /// subscribed after the next login. A venue rejection untracks a channel
    /// this call added; connection-level failures keep it for the next login.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        let added = self.track(channel);
        let private = is_private_channel(channel);
        if !self.correlator.is_open() || (private && self.auth.state() != AuthState::Authenticated) {
            debug!(%channel, "subscription deferred until connected");
            return Ok(());
        }
        match self.send_subscribe(vec![channel.to_string()], private).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Rpc(e)) => {
                if added {
                    self.subscriptions.remove(channel);
                    self.router.unregister_handler(channel);
                }
                warn!(%channel, code = e.code, message = %e.message, "subscription rejected");
                Err(GatewayError::Rpc(e))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let tracked = self.subscriptions.remove(channel);
        self.router.unregister_handler(channel);
        let private = is_private_channel(channel);
        if !tracked || !self.correlator.is_open() {
            return Ok(());
        }
        if private && self.auth.state() != AuthState::Authenticated {
            return Ok(());
        }
        let method = if private { "private/unsubscribe" } else { "public/unsubscribe" };
        self.request(method, json!({ "channels": [channel] })).await?;
        Ok(())
    }

    // -------- calls --------

    /// Any venue method. `private/*` is refused locally unless authenticated,
    /// so nothing is put on the wire.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if method.starts_with("private/") {
            self.auth.require_authenticated()?;
        }
        self.correlator.request(method, params, self.cfg.request_timeout).await
    }

    pub async fn place_order(&self, req: OrderRequest) -> Result<Order> {
        self.auth.require_authenticated()?;

        let label = format!("{LOCAL_ID_PREFIX}{}", self.local_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let placeholder = Order {
            id: label.clone(),
            instrument: req.instrument.clone(),
            side: req.side,
            order_type: req.order_type,
            quantity: req.quantity,
            limit_price: req.limit_price,
            filled_quantity: 0.0,
            status: OrderStatus::Pending,
            created_at: now_ms(),
            label: Some(label.clone()),
        };
        self.orders.upsert(placeholder.clone());
        publish(&self.broadcaster, &DownstreamEvent::Order(placeholder));

        let method = match req.side {
            Side::Buy => "private/buy",
            Side::Sell => "private/sell",
        };
        let mut params = json!({
            "instrument_name": req.instrument,
            "amount": req.quantity,
            "type": req.order_type.as_str(),
            "label": label,
        });
        if let Some(price) = req.limit_price {
            params["price"] = json!(price);
        }

        match self.request(method, params).await {
            Ok(result) => {
                let order = Order::from_venue(result.get("order").unwrap_or(&result))?;
                info!(local = %label, order_id = %order.id, status = ?order.status, "order accepted");
                absorb_order(&self.orders, order.clone());
                publish(&self.broadcaster, &DownstreamEvent::Order(order.clone()));
                Ok(order)
            }
            Err(GatewayError::Rpc(e)) => {
                warn!(local = %label, error = %e, "order rejected");
                if let Some(o) = self.orders.update(&label, |o| o.status = OrderStatus::Rejected) {
                    publish(&self.broadcaster, &DownstreamEvent::Order(o));
                }
                Err(GatewayError::Rpc(e))
            }
            Err(e) => {
                // outcome unknown; a later order push with this label settles it
                warn!(local = %label, error = %e, "order placement unconfirmed");
                Err(e)
            }
        }
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<Order> {
        let result = self.request("private/cancel", json!({ "order_id": order_id })).await?;
        let order = Order::from_venue(&result)?;
        self.orders.upsert(order.clone());
        publish(&self.broadcaster, &DownstreamEvent::Order(order.clone()));
        Ok(order)
    }

    pub async fn modify_order(&self, order_id: &str, amount: f64, price: f64) -> Result<Order> {
        let params = json!({ "order_id": order_id, "amount": amount, "price": price });
        let result = self.request("private/edit", params).await?;
        let order = Order::from_venue(result.get("order").unwrap_or(&result))?;
        self.orders.upsert(order.clone());
        publish(&self.broadcaster, &DownstreamEvent::Order(order.clone()));
        Ok(order)
    }

    /// Fetch a book snapshot and store it.
    pub async fn get_order_book(&self, instrument: &str, depth: Option<u32>) -> Result<OrderBookSnapshot> {
        let params = json!({
            "instrument_name": instrument,
            "depth": depth.unwrap_or(DEFAULT_BOOK_DEPTH),
        });
        let result = self.request("public/get_order_book", params).await?;
        let snapshot = OrderBookSnapshot::from_venue(instrument, &result)?;
        self.books.upsert(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn get_positions(&self, currency: Option<&str>, kind: Option<&str>) -> Result<Vec<Position>> {
        let mut params = serde_json::Map::new();
        if let Some(c) = currency {
            params.insert("currency".into(), json!(c));
        }
        if let Some(k) = kind {
            params.insert("kind".into(), json!(k));
        }
        let result = self.request("private/get_positions", Value::Object(params)).await?;
        Ok(serde_json::from_value(result)?)
    }
}

fn publish(broadcaster: &Broadcaster, ev: &DownstreamEvent) {
    match ev.to_json() {
        Ok(text) => {
            broadcaster.broadcast(text);
        }
        Err(e) => warn!(error = %e, "downstream encode failed"),
    }
}

/// Upsert a venue order, retiring the local placeholder it was labelled with.
fn absorb_order(orders: &OrderStore, order: Order) {
    if let Some(label) = order.label.as_deref() {
        if label.starts_with(LOCAL_ID_PREFIX) && label != order.id {
            orders.delete(label);
        }
    }
    orders.upsert(order);
}

fn book_handler(books: Arc<MarketStore>, broadcaster: Arc<Broadcaster>) -> ChannelHandler {
    Arc::new(move |ev: &PushEvent| {
        let hint = book_channel_instrument(&ev.channel).unwrap_or_default();
        match OrderBookSnapshot::from_venue(hint, &ev.data) {
            Ok(snapshot) => {
                // store first: a client joining now reads a snapshot no older than its first live event
                books.upsert(snapshot.clone());
                publish(&broadcaster, &DownstreamEvent::Book(snapshot));
            }
            Err(e) => warn!(channel = %ev.channel, error = %e, "bad book push"),
        }
    })
}

fn order_handler(orders: Arc<OrderStore>, broadcaster: Arc<Broadcaster>) -> ChannelHandler {
    Arc::new(move |ev: &PushEvent| {
        let items: Vec<&Value> = match &ev.data {
            Value::Array(a) => a.iter().collect(),
            other => vec![other],
        };
        for item in items {
            match Order::from_venue(item) {
                Ok(order) => {
                    debug!(order_id = %order.id, status = ?order.status, "order update");
                    absorb_order(&orders, order.clone());
                    publish(&broadcaster, &DownstreamEvent::Order(order));
                }
                Err(e) => warn!(channel = %ev.channel, error = %e, "bad order push"),
            }
        }
    })
}

fn relay_handler(broadcaster: Arc<Broadcaster>) -> ChannelHandler {
    Arc::new(move |ev: &PushEvent| {
        publish(
            &broadcaster,
            &DownstreamEvent::Push { channel: ev.channel.clone(), data: ev.data.clone() },
        );
    })
}
