// ===============================
// src/orders.rs (order store)
// ===============================
//
// Keyed by order id. Every operation takes the lock once, so readers see an
// order either before or after a write, never half-applied. Cancelled/filled
// orders stay in the map with a terminal status; `delete` is explicit only.
//
use std::sync::RwLock;

use ahash::AHashMap as HashMap;

use crate::domain::Order;
use crate::metrics::ORDER_UPDATES;

#[derive(Default)]
pub struct OrderStore {
    orders: RwLock<HashMap<String, Order>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous value.
    pub fn upsert(&self, order: Order) -> Option<Order> {
        ORDER_UPDATES.inc();
        let mut m = self.orders.write().unwrap_or_else(|p| p.into_inner());
        m.insert(order.id.clone(), order)
    }

    pub fn get(&self, id: &str) -> Option<Order> {
        let m = self.orders.read().unwrap_or_else(|p| p.into_inner());
        m.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Order> {
        let m = self.orders.read().unwrap_or_else(|p| p.into_inner());
        let mut v: Vec<Order> = m.values().cloned().collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        v
    }

    pub fn list_for_instrument(&self, instrument: &str) -> Vec<Order> {
        self.list().into_iter().filter(|o| o.instrument == instrument).collect()
    }

    pub fn delete(&self, id: &str) -> Option<Order> {
        let mut m = self.orders.write().unwrap_or_else(|p| p.into_inner());
        m.remove(id)
    }

    /// Mutate an existing order in place under the write lock; returns the
    /// updated copy, or None if absent.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Order>
    where
        F: FnOnce(&mut Order),
    {
        let mut m = self.orders.write().unwrap_or_else(|p| p.into_inner());
        let o = m.get_mut(id)?;
        f(o);
        ORDER_UPDATES.inc();
        Some(o.clone())
    }

    pub fn len(&self) -> usize {
        self.orders.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderStatus, OrderType, Side};
    use std::sync::Arc;

    fn order(id: &str, instrument: &str, ts: i64) -> Order {
        Order {
            id: id.into(),
            instrument: instrument.into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: 10.0,
            limit_price: Some(100.0),
            filled_quantity: 0.0,
            status: OrderStatus::Open,
            created_at: ts,
            label: None,
        }
    }

    #[test]
    fn upsert_then_get_returns_written_value() {
        let s = OrderStore::new();
        assert!(s.upsert(order("a", "BTC-PERPETUAL", 1)).is_none());
        let mut changed = order("a", "BTC-PERPETUAL", 1);
        changed.filled_quantity = 4.0;
        assert!(s.upsert(changed.clone()).is_some());
        assert_eq!(s.get("a"), Some(changed));
    }

    #[test]
    fn absent_key_is_none() {
        let s = OrderStore::new();
        assert_eq!(s.get("nope"), None);
        assert!(s.update("nope", |o| o.status = OrderStatus::Cancelled).is_none());
    }

    #[test]
    fn list_counts_distinct_keys_minus_deletes() {
        let s = OrderStore::new();
        s.upsert(order("a", "BTC-PERPETUAL", 3));
        s.upsert(order("b", "ETH-PERPETUAL", 2));
        s.upsert(order("c", "BTC-PERPETUAL", 1));
        s.upsert(order("a", "BTC-PERPETUAL", 3));
        assert!(s.delete("b").is_some());
        assert!(s.delete("b").is_none());
        let ids: Vec<String> = s.list().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(s.list_for_instrument("BTC-PERPETUAL").len(), 2);
        assert!(s.list_for_instrument("ETH-PERPETUAL").is_empty());
    }

    #[test]
    fn cancel_keeps_order_with_terminal_status() {
        let s = OrderStore::new();
        s.upsert(order("a", "X", 1));
        let o = s.update("a", |o| o.status = OrderStatus::Cancelled).unwrap();
        assert!(o.status.is_terminal());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn concurrent_readers_never_see_torn_orders() {
        let s = Arc::new(OrderStore::new());
        s.upsert(order("a", "X", 1));
        let writer = {
            let s = s.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    s.update("a", |o| {
                        o.quantity = i as f64;
                        o.filled_quantity = i as f64;
                    });
                }
            })
        };
        let reader = {
            let s = s.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    for o in s.list() {
                        assert_eq!(o.quantity, o.filled_quantity);
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
