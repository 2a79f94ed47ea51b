//! EmberDB stores logically unbounded bitmap values on top of an
//! ordered, write-ahead-logged key-value store.
//!
//! The `store` module provides the ordered substrate: point reads,
//! range scans and atomic batch commits over a skip list that is
//! rebuilt from its log on open. The `db` module layers typed key
//! spaces on it: per-database segmented bitmaps with point-bit access,
//! population counts, multi-key bitwise operators and expiry.

pub mod config;
pub mod db;
pub mod error;
pub mod hasher;
pub mod store;

pub use config::Config;
pub use db::{BitOp, Db};
pub use error::{Error, Result};
pub use store::{Batch, Memory, Store};
