//! Backend implementations

pub mod mem;

#[cfg(feature = "redis-backend")]
pub mod redis;
