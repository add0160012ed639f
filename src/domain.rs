// ===============================
// src/domain.rs
// ===============================
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ProtocolError;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self { Side::Buy => "buy", Side::Sell => "sell" }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
    StopLimit,
    StopMarket,
    TakeLimit,
    TakeMarket,
    MarketLimit,
    TrailingStop,
    #[serde(other)]
    Other,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
            OrderType::StopLimit => "stop_limit",
            OrderType::StopMarket => "stop_market",
            OrderType::TakeLimit => "take_limit",
            OrderType::TakeMarket => "take_market",
            OrderType::MarketLimit => "market_limit",
            OrderType::TrailingStop => "trailing_stop",
            OrderType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Sent, venue has not confirmed yet (local only).
    Pending,
    Open,
    Untriggered,
    Filled,
    Rejected,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    /// None for market orders.
    pub limit_price: Option<f64>,
    pub filled_quantity: f64,
    pub status: OrderStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Order {
    /// Decode the venue's order object (`order_id`, `instrument_name`,
    /// `direction`, `order_type`, `amount`, `price`, `filled_amount`,
    /// `order_state`, `creation_timestamp`, `label`).
    pub fn from_venue(v: &Value) -> Result<Self, ProtocolError> {
        let id = v
            .get("order_id")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("order_id"))?;
        let instrument = v
            .get("instrument_name")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("instrument_name"))?;
        let side = v
            .get("direction")
            .and_then(Value::as_str)
            .and_then(Side::parse)
            .ok_or(ProtocolError::MissingField("direction"))?;
        let order_type = v
            .get("order_type")
            .cloned()
            .map(serde_json::from_value::<OrderType>)
            .transpose()
            .map_err(|e| ProtocolError::Malformed(format!("order_type: {e}")))?
            .unwrap_or(OrderType::Other);
        let status = v
            .get("order_state")
            .cloned()
            .map(serde_json::from_value::<OrderStatus>)
            .transpose()
            .map_err(|e| ProtocolError::Malformed(format!("order_state: {e}")))?
            .unwrap_or(OrderStatus::Unknown);

        let quantity =
            number_field(v, "amount")?.ok_or(ProtocolError::MissingField("amount"))?;
        let filled_quantity = match number_field(v, "filled_amount")? {
            Some(f) => f,
            None => {
                debug!(order_id = id, "order without filled_amount, taken as unfilled");
                0.0
            }
        };

        Ok(Order {
            id: id.to_string(),
            instrument: instrument.to_string(),
            side,
            order_type,
            quantity,
            // market orders carry "market_price" instead of a number
            limit_price: v.get("price").and_then(Value::as_f64),
            filled_quantity,
            status,
            created_at: v.get("creation_timestamp").and_then(Value::as_i64).unwrap_or_else(now_ms),
            label: v
                .get("label")
                .and_then(Value::as_str)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        })
    }
}

/// What a caller asks for; turned into `private/buy|sell`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
}

/// Absent or null is `None`; anything other than a number is malformed.
fn number_field(v: &Value, field: &'static str) -> Result<Option<f64>, ProtocolError> {
    match v.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(x) => x
            .as_f64()
            .map(Some)
            .ok_or_else(|| ProtocolError::Malformed(format!("{field}: not a number: {x}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub instrument: String,
    /// Descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ascending by price.
    pub asks: Vec<PriceLevel>,
    pub timestamp: i64,
}

impl OrderBookSnapshot {
    pub fn new(instrument: impl Into<String>, mut bids: Vec<PriceLevel>, mut asks: Vec<PriceLevel>, timestamp: i64) -> Self {
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        Self { instrument: instrument.into(), bids, asks, timestamp }
    }

    /// Decode book data from a push or a `get_order_book` result.
    /// `instrument` is used when the payload has no `instrument_name`.
    pub fn from_venue(instrument: &str, v: &Value) -> Result<Self, ProtocolError> {
        let instrument = v
            .get("instrument_name")
            .and_then(Value::as_str)
            .unwrap_or(instrument);
        if instrument.is_empty() {
            return Err(ProtocolError::MissingField("instrument_name"));
        }
        let bids = decode_side(v.get("bids").ok_or(ProtocolError::MissingField("bids"))?)?;
        let asks = decode_side(v.get("asks").ok_or(ProtocolError::MissingField("asks"))?)?;
        let ts = v.get("timestamp").and_then(Value::as_i64).unwrap_or_else(now_ms);
        Ok(Self::new(instrument, bids, asks, ts))
    }

    pub fn best_bid(&self) -> Option<PriceLevel> { self.bids.first().copied() }
    pub fn best_ask(&self) -> Option<PriceLevel> { self.asks.first().copied() }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}

// Levels come as [price, size] or, on raw channels, [action, price, size].
fn decode_side(v: &Value) -> Result<Vec<PriceLevel>, ProtocolError> {
    let rows = v
        .as_array()
        .ok_or_else(|| ProtocolError::Malformed("book side is not an array".into()))?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .as_array()
            .ok_or_else(|| ProtocolError::Malformed(format!("bad level {row}")))?;
        let (price, size) = match cells.as_slice() {
            [p, s] => (p, s),
            [action, p, s] => {
                if action.as_str() == Some("delete") {
                    continue;
                }
                (p, s)
            }
            _ => return Err(ProtocolError::Malformed(format!("bad level {row}"))),
        };
        match (price.as_f64(), size.as_f64()) {
            (Some(price), Some(size)) => out.push(PriceLevel { price, size }),
            _ => return Err(ProtocolError::Malformed(format!("non-numeric level {row}"))),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub mark_price: f64,
    #[serde(default)]
    pub floating_profit_loss: f64,
    #[serde(default)]
    pub realized_profit_loss: f64,
}

/// Normalized message sent to downstream clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DownstreamEvent {
    Book(OrderBookSnapshot),
    Order(Order),
    Push { channel: String, data: Value },
}

impl DownstreamEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
