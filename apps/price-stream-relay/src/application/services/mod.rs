//! Application Services
//!
//! - `SubscriptionMultiplexer`: reference-counted fan-out of upstream updates
//!   to client sessions

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::application::ports::{DeliverFn, DeliveryError, UpdateSink, UpstreamControl};
use crate::domain::streaming::{PriceUpdate, Symbol};
use crate::domain::subscription::{
    SubscribeOutcome, SubscriberId, SubscriptionStats, SubscriptionTable, UnsubscribeOutcome,
};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Subscriber
// =============================================================================

/// Delivery slot for one (symbol, subscriber) pair.
struct Subscriber {
    deliver: DeliverFn,
    failed: AtomicBool,
}

impl Subscriber {
    fn new(deliver: DeliverFn) -> Self {
        Self {
            deliver,
            failed: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Subscription Multiplexer
// =============================================================================

/// Owns the symbol → subscriber table and decides when the upstream
/// subscription for a symbol starts and stops.
///
/// Subscribe, unsubscribe and cleanup take the write lock; dispatch takes the
/// read lock. Upstream requests for a 0→1 or 1→0 transition are issued while
/// the write lock is held, so the sequence of upstream requests for a symbol
/// always matches its reference-count transitions.
///
/// A subscriber whose delivery reports `Closed` is marked failed: later
/// dispatches skip it and its session's cleanup removes it.
pub struct SubscriptionMultiplexer {
    table: RwLock<SubscriptionTable<Subscriber>>,
    upstream: Arc<dyn UpstreamControl>,
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionMultiplexer {
    /// Create a multiplexer driving `upstream`.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamControl>) -> Self {
        Self {
            table: RwLock::new(SubscriptionTable::new()),
            upstream,
        }
    }

    /// Register `deliver` for `symbol` under `subscriber`.
    ///
    /// Idempotent per (symbol, subscriber): a repeat keeps the first callback.
    pub fn subscribe(
        &self,
        symbol: &Symbol,
        subscriber: SubscriberId,
        deliver: DeliverFn,
    ) -> SubscribeOutcome {
        let mut table = self.table.write();
        let outcome = table.subscribe(symbol, subscriber, Subscriber::new(deliver));

        if outcome.needs_upstream() {
            tracing::info!(%symbol, subscriber_id = subscriber, "First subscriber, subscribing upstream");
            self.upstream.subscribe(symbol);
            metrics::set_active_symbols(symbol_count(&table));
        }

        outcome
    }

    /// Remove `subscriber` from `symbol`. Unknown pairs are a no-op.
    pub fn unsubscribe(&self, symbol: &Symbol, subscriber: SubscriberId) -> UnsubscribeOutcome {
        let mut table = self.table.write();
        let outcome = table.unsubscribe(symbol, subscriber);

        if outcome.needs_upstream() {
            tracing::info!(%symbol, subscriber_id = subscriber, "Last subscriber left, unsubscribing upstream");
            self.upstream.unsubscribe(symbol);
            metrics::set_active_symbols(symbol_count(&table));
        }

        outcome
    }

    /// Remove `subscriber` from every symbol it still holds.
    ///
    /// Returns the number of symbols released upstream.
    pub fn remove_subscriber(&self, subscriber: SubscriberId) -> usize {
        let mut table = self.table.write();
        let emptied = table.remove_subscriber(subscriber);

        for symbol in &emptied {
            tracing::info!(%symbol, subscriber_id = subscriber, "Last subscriber left, unsubscribing upstream");
            self.upstream.unsubscribe(symbol);
        }
        if !emptied.is_empty() {
            metrics::set_active_symbols(symbol_count(&table));
        }

        emptied.len()
    }

    /// Deliver `update` to every live subscriber of its symbol.
    ///
    /// Returns the number of subscribers that accepted it.
    pub fn dispatch(&self, update: PriceUpdate) -> usize {
        let started = Instant::now();
        let table = self.table.read();
        let Some(entry) = table.entry(update.symbol.as_str()) else {
            tracing::trace!(symbol = %update.symbol, "No subscribers for update");
            return 0;
        };

        let update = Arc::new(update);
        let mut delivered = 0_usize;

        for (subscriber_id, subscriber) in entry.iter() {
            if subscriber.failed.load(Ordering::Acquire) {
                continue;
            }
            match (subscriber.deliver)(Arc::clone(&update)) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Lagged) => {
                    tracing::debug!(subscriber_id, symbol = %update.symbol, "Subscriber lagging, update dropped");
                    metrics::record_update_dropped(DropReason::Lagged);
                }
                Err(DeliveryError::Closed) => {
                    tracing::warn!(subscriber_id, symbol = %update.symbol, "Subscriber closed, marking failed");
                    subscriber.failed.store(true, Ordering::Release);
                    metrics::record_update_dropped(DropReason::Closed);
                }
            }
        }
        drop(table);

        metrics::record_updates_delivered(delivered as u64);
        metrics::record_dispatch_duration(started.elapsed());
        delivered
    }

    /// Reference count of `symbol`.
    #[must_use]
    pub fn reference_count(&self, symbol: &str) -> usize {
        self.table.read().reference_count(symbol)
    }

    /// Number of symbols `subscriber` is still registered for.
    #[must_use]
    pub fn references(&self, subscriber: SubscriberId) -> usize {
        self.table.read().subscriber_symbols(subscriber).len()
    }

    /// Symbols with at least one subscriber, sorted.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut symbols = self.table.read().active_symbols();
        symbols.sort();
        symbols
    }

    /// Table statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.table.read().stats()
    }
}

impl UpdateSink for SubscriptionMultiplexer {
    fn dispatch(&self, update: PriceUpdate) {
        Self::dispatch(self, update);
    }
}

#[allow(clippy::cast_precision_loss)]
fn symbol_count<D>(table: &SubscriptionTable<D>) -> f64 {
    table.stats().symbol_count as f64
}

// =============================================================================
// Tests
// =============================================================================
