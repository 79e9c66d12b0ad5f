//! # Warden
//!
//! A standalone network service that issues, holds and releases named
//! distributed locks on behalf of remote clients, speaking a fixed 64-byte
//! binary protocol (plus a RESP-style text channel for administration).
//!
//! The interesting part lives in [`engine`]: a shard-partitioned in-memory
//! lock database with per-key wait queues, two time-bucketed timer wheels
//! and an online-doubling fast key index. Everything else, namely the tokio
//! transport in [`server`], the [`wire`] codec and the [`aof`] persistence
//! collaborator, is plumbing around it.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod aof;
pub mod base;
pub mod config;
pub mod engine;
pub mod server;
pub mod wire;

pub use engine::Warden;
