//! Store implementations for the connector.

pub mod memory;
pub mod redis;

pub use memory::{MemoryStore, MemoryTransport};
pub use redis::{RedisStore, RedisTransport};
