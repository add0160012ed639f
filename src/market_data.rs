// ===============================
// src/market_data.rs
// ===============================
//
// MarketStore    : latest OrderBookSnapshot per instrument, whole-snapshot replace
// SubscriptionSet: channels the venue is currently asked to push
//
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use ahash::AHashMap as HashMap;

use crate::domain::OrderBookSnapshot;
use crate::metrics::BOOK_UPDATES;

#[derive(Default)]
pub struct MarketStore {
    books: RwLock<HashMap<String, Arc<OrderBookSnapshot>>>,
}

impl MarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored snapshot for its instrument.
    pub fn upsert(&self, snapshot: OrderBookSnapshot) {
        BOOK_UPDATES.with_label_values(&[snapshot.instrument.as_str()]).inc();
        let mut m = self.books.write().unwrap_or_else(|p| p.into_inner());
        m.insert(snapshot.instrument.clone(), Arc::new(snapshot));
    }

    pub fn get(&self, instrument: &str) -> Option<Arc<OrderBookSnapshot>> {
        let m = self.books.read().unwrap_or_else(|p| p.into_inner());
        m.get(instrument).cloned()
    }

    pub fn list(&self) -> Vec<Arc<OrderBookSnapshot>> {
        let m = self.books.read().unwrap_or_else(|p| p.into_inner());
        let mut v: Vec<_> = m.values().cloned().collect();
        v.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        v
    }

    pub fn instruments(&self) -> Vec<String> {
        self.list().iter().map(|b| b.instrument.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.books.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct SubscriptionSet {
    channels: RwLock<BTreeSet<String>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if newly added.
    pub fn add(&self, channel: &str) -> bool {
        self.channels.write().unwrap_or_else(|p| p.into_inner()).insert(channel.to_string())
    }

    /// True if it was present.
    pub fn remove(&self, channel: &str) -> bool {
        self.channels.write().unwrap_or_else(|p| p.into_inner()).remove(channel)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.read().unwrap_or_else(|p| p.into_inner()).contains(channel)
    }

    pub fn list(&self) -> Vec<String> {
        self.channels.read().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }
}

/// `book.<instrument>.<interval>` → instrument.
pub fn book_channel_instrument(channel: &str) -> Option<&str> {
    let rest = channel.strip_prefix("book.")?;
    let instrument = rest.split('.').next()?;
    (!instrument.is_empty()).then_some(instrument)
}

pub fn book_channel(instrument: &str, interval: &str) -> String {
    format!("book.{instrument}.{interval}")
}
