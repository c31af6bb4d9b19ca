//! A durable, append-only undo log engine: one byte-addressable log per
//! attached transaction, a variable-layout record codec that can straddle
//! buffer-cache pages, and a checkpoint/recovery coordinator that lets a
//! host storage engine resume undo state after a restart.
//!
//! See `addr`/`layout` for the address scheme, `record` for the wire
//! format, `log`/`control` for allocation and shared state, and
//! `checkpoint`/`wal` for durability.

pub mod addr;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod encode;
pub mod error;
pub mod fetch;
pub mod layout;
pub mod log;
pub mod page;
pub mod record;
pub mod segment;
pub mod wal;
