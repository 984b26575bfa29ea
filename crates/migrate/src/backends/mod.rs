//! Database Backend Abstractions
//!
//! The engine is written against the traits in [`core`]; [`postgres`] is the
//! production implementation.

pub mod core;
pub mod postgres;

// Re-export core traits and types
pub use self::core::*;
pub use self::postgres::{connect_options, PostgresConnection, PostgresPool, PostgresTransaction};
