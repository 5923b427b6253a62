//! `arena_server`
//!
//! Server-side systems:
//! - Dedicated server around one authoritative session
//! - Fixed timestep loop driving the session scheduler
//! - Per-connection handshake and frame pumps
//!
//! Networking model:
//! - TCP: handshake, then reliable router packets
//! - UDP: unreliable router packets (snapshots, client state)

pub mod server;

pub use server::GameServer;
