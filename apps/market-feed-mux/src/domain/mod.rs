//! Domain Layer - Core market data types and business rules.
//!
//! This layer contains the market data model, the subscription registry
//! and the connection health model. Nothing here performs I/O or reads
//! the clock; time is passed in by the caller.

/// Connection state and health quality model.
pub mod health;

/// Market data types (order books, trades, mid prices) and control frames.
pub mod streaming;

/// Subscription keys and the handler registry.
pub mod subscription;
