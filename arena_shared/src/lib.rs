//! `arena_shared`
//!
//! Networked simulation core shared by client and server.
//!
//! Design goals:
//! - One authoritative server, many clients, unreliable transport.
//! - Fixed-tickrate simulation independent of frame rate.
//! - Typed binary wire format; the order of writes is the schema.
//! - Failures in one entity, listener or subscriber never take down a tick.
//! - No `unsafe`.

pub mod codec;
pub mod config;
pub mod entity;
pub mod interp;
pub mod lifecycle;
pub mod math;
pub mod net;
pub mod registry;
pub mod replication;
pub mod session;
pub mod signal;
pub mod snapshot;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::{BufferReader, BufferWriter, ByteType, CodecError, Value};
    pub use crate::config::*;
    pub use crate::entity::{ClassRegistry, Entity, EntityId, EntityKind};
    pub use crate::lifecycle::{FixedTick, Lifecycle, TickHandler};
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::registry::{EntityHandle, EntityRegistry, RegistryError};
    pub use crate::session::*;
    pub use crate::signal::{Connection, Signal};
}
