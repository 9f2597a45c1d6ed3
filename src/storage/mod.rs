// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends: MySQL sessions, the Redis cache tier and the in-process
//! local tier.

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use memory::{LocalCache, SharedMemoryConnector};
pub use redis::{RedisCache, RedisConnector};
pub use sql::{MySqlConnector, MySqlSession};
pub use traits::{CacheError, Connector, RemoteCache, RemoteCacheConnector, Session, TierRead};
