//! Subscription Table
//!
//! Domain type tracking which subscribers are interested in which symbols.
//!
//! # Design
//!
//! The table tracks:
//! - Per symbol, the set of subscribers and their delivery slot
//! - Per subscriber, the symbols it holds (for cleanup and stats)
//! - The reference count of a symbol, which is the size of its subscriber set
//!
//! Every mutation reports whether it crossed the 0→1 or 1→0 boundary so the
//! caller can issue exactly one upstream subscribe or unsubscribe for it.
//! The table itself is not synchronized; the multiplexer owns it behind a
//! lock.

use std::collections::{HashMap, HashSet};

use super::streaming::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscriber (one per client session).
pub type SubscriberId = u64;

/// Result of adding a subscriber to a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Reference count went 0→1; the symbol needs an upstream subscribe.
    FirstSubscriber,
    /// Joined an existing entry.
    Joined,
    /// Subscriber already held the symbol; nothing changed.
    AlreadySubscribed,
}

impl SubscribeOutcome {
    /// Check if an upstream subscribe must be issued.
    #[must_use]
    pub const fn needs_upstream(self) -> bool {
        matches!(self, Self::FirstSubscriber)
    }
}

/// Result of removing a subscriber from a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Reference count went 1→0; the entry is gone and the symbol needs an
    /// upstream unsubscribe.
    LastSubscriber,
    /// Left an entry that still has other subscribers.
    Left,
    /// The subscriber did not hold the symbol; nothing changed.
    NotSubscribed,
}

impl UnsubscribeOutcome {
    /// Check if an upstream unsubscribe must be issued.
    #[must_use]
    pub const fn needs_upstream(self) -> bool {
        matches!(self, Self::LastSubscriber)
    }
}

// =============================================================================
// Subscription Entry
// =============================================================================

/// Subscribers of one symbol. Exists only while it has at least one.
#[derive(Debug)]
pub struct SubscriptionEntry<D> {
    subscribers: HashMap<SubscriberId, D>,
}

impl<D> SubscriptionEntry<D> {
    fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
        }
    }

    /// Number of subscribers holding the symbol.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Iterate over subscribers and their delivery slots.
    pub fn iter(&self) -> impl Iterator<Item = (SubscriberId, &D)> {
        self.subscribers.iter().map(|(id, slot)| (*id, slot))
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Reference-counted symbol → subscriber table.
///
/// `D` is whatever the owner needs to reach a subscriber (a delivery
/// callback in the relay).
///
/// # Example
///
/// ```rust
/// use price_stream_relay::domain::streaming::Symbol;
/// use price_stream_relay::domain::subscription::{
///     SubscribeOutcome, SubscriptionTable, UnsubscribeOutcome,
/// };
///
/// let mut table = SubscriptionTable::new();
/// let aapl = Symbol::parse("AAPL").unwrap();
///
/// // Subscriber 1 is first - upstream subscribe needed
/// assert_eq!(table.subscribe(&aapl, 1, ()), SubscribeOutcome::FirstSubscriber);
///
/// // Subscriber 2 joins - no upstream change
/// assert_eq!(table.subscribe(&aapl, 2, ()), SubscribeOutcome::Joined);
///
/// // Subscriber 1 leaves - still held by subscriber 2
/// assert_eq!(table.unsubscribe(&aapl, 1), UnsubscribeOutcome::Left);
///
/// // Subscriber 2 leaves - now unsubscribe upstream
/// assert_eq!(table.unsubscribe(&aapl, 2), UnsubscribeOutcome::LastSubscriber);
/// ```
#[derive(Debug)]
pub struct SubscriptionTable<D> {
    entries: HashMap<Symbol, SubscriptionEntry<D>>,
    subscriber_symbols: HashMap<SubscriberId, HashSet<Symbol>>,
}

impl<D> Default for SubscriptionTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> SubscriptionTable<D> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            subscriber_symbols: HashMap::new(),
        }
    }

    /// Register `subscriber` for `symbol`.
    ///
    /// Re-subscribing keeps the existing slot and reports
    /// `AlreadySubscribed`.
    pub fn subscribe(&mut self, symbol: &Symbol, subscriber: SubscriberId, slot: D) -> SubscribeOutcome {
        let held = self.subscriber_symbols.entry(subscriber).or_default();
        if held.contains(symbol) {
            return SubscribeOutcome::AlreadySubscribed;
        }
        held.insert(symbol.clone());

        let entry = self
            .entries
            .entry(symbol.clone())
            .or_insert_with(SubscriptionEntry::new);
        entry.subscribers.insert(subscriber, slot);

        if entry.reference_count() == 1 {
            SubscribeOutcome::FirstSubscriber
        } else {
            SubscribeOutcome::Joined
        }
    }

    /// Remove `subscriber` from `symbol`.
    ///
    /// Unknown pairs are a no-op reported as `NotSubscribed`.
    pub fn unsubscribe(&mut self, symbol: &Symbol, subscriber: SubscriberId) -> UnsubscribeOutcome {
        let Some(held) = self.subscriber_symbols.get_mut(&subscriber) else {
            return UnsubscribeOutcome::NotSubscribed;
        };
        if !held.remove(symbol) {
            return UnsubscribeOutcome::NotSubscribed;
        }
        if held.is_empty() {
            self.subscriber_symbols.remove(&subscriber);
        }

        self.detach(symbol, subscriber)
    }

    /// Remove `subscriber` from every symbol it holds.
    ///
    /// Returns the symbols whose reference count dropped to zero.
    pub fn remove_subscriber(&mut self, subscriber: SubscriberId) -> Vec<Symbol> {
        let Some(held) = self.subscriber_symbols.remove(&subscriber) else {
            return vec![];
        };

        held.into_iter()
            .filter(|symbol| self.detach(symbol, subscriber).needs_upstream())
            .collect()
    }

    fn detach(&mut self, symbol: &Symbol, subscriber: SubscriberId) -> UnsubscribeOutcome {
        let Some(entry) = self.entries.get_mut(symbol) else {
            return UnsubscribeOutcome::NotSubscribed;
        };
        if entry.subscribers.remove(&subscriber).is_none() {
            return UnsubscribeOutcome::NotSubscribed;
        }

        if entry.subscribers.is_empty() {
            self.entries.remove(symbol);
            UnsubscribeOutcome::LastSubscriber
        } else {
            UnsubscribeOutcome::Left
        }
    }

    /// Get the entry for a symbol, if anyone subscribes to it.
    #[must_use]
    pub fn entry(&self, symbol: &str) -> Option<&SubscriptionEntry<D>> {
        self.entries.get(symbol)
    }

    /// Get the reference count of a symbol (0 when unknown).
    #[must_use]
    pub fn reference_count(&self, symbol: &str) -> usize {
        self.entries
            .get(symbol)
            .map_or(0, SubscriptionEntry::reference_count)
    }

    /// Get all symbols with at least one subscriber.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.entries.keys().cloned().collect()
    }

    /// Get the symbols a subscriber holds.
    #[must_use]
    pub fn subscriber_symbols(&self, subscriber: SubscriberId) -> Vec<Symbol> {
        self.subscriber_symbols
            .get(&subscriber)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get table statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            symbol_count: self.entries.len(),
            subscriber_count: self.subscriber_symbols.len(),
            reference_count: self.entries.values().map(SubscriptionEntry::reference_count).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionStats {
    /// Number of symbols with an upstream subscription.
    pub symbol_count: usize,
    /// Number of subscribers holding at least one symbol.
    pub subscriber_count: usize,
    /// Sum of reference counts over all symbols.
    pub reference_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
