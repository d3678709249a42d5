//! Core domain types
//!
//! Pure types with no I/O dependencies: link parameters, port naming,
//! the server-side channel configuration and the error taxonomy.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::*;
pub use types::*;
