//! Security Module
//!
//! Read-only guard applied to every generated statement before it reaches
//! the warehouse.

pub mod query_guards;

pub use query_guards::*;
