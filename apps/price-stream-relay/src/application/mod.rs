//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the subscription multiplexer and the port interfaces
//! it uses to reach the upstream provider and the client sessions.

/// Port interfaces for the provider link, update sink and delivery.
pub mod ports;

/// Subscription multiplexing service.
pub mod services;
