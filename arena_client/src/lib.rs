//! `arena_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Client-side replicated session (snapshots in, own state out)
//! - Input sampling and local player motion

pub mod client;
pub mod input;

pub use client::GameClient;
