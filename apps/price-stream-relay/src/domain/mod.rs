//! Domain Layer - Core relay types and subscription logic.
//!
//! This layer contains the canonical price update, the symbol key and the
//! reference-counted subscription table. Nothing here performs I/O.

/// Symbols, price updates and connection state.
pub mod streaming;

/// Reference-counted subscription tracking.
pub mod subscription;
