//! Compares a fresh snapshot with the stored product.
use crate::model::{ChangeEvent, Product, ProductSnapshot};

/// Deltas between `previous` and `current`, price first.
///
/// The first observation of a product is a baseline and yields nothing.
/// Prices are compared after rounding to kopecks.
pub fn detect(previous: Option<&Product>, current: &ProductSnapshot) -> Vec<ChangeEvent> {
    let Some(previous) = previous else {
        return Vec::new();
    };

    let mut events = Vec::with_capacity(2);
    let old_price = previous.price.round_dp(2);
    let new_price = current.price.round_dp(2);
    if old_price != new_price {
        events.push(ChangeEvent::PriceChanged {
            old: old_price,
            new: new_price,
        });
    }
    if previous.quantity != current.quantity {
        events.push(ChangeEvent::QuantityChanged {
            old: previous.quantity,
            new: current.quantity,
        });
    }
    events
}
