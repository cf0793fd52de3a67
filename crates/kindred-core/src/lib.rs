//! Core types and collaborator contracts for the Kindred contacts engine.
//!
//! This crate is deliberately free of database dependencies. The storage
//! engine (`kindred-store-sqlite`) and any adapter layers depend on it; it
//! depends on nothing heavier than `serde` and `chrono`.

pub mod collection;
pub mod contact;
pub mod detail;
pub mod error;
pub mod filter;
pub mod flags;
pub mod label;
pub mod phone;
pub mod relationship;

pub use error::{Error, ErrorMap, Result};
