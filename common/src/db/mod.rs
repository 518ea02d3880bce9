// Connection management for the coordination store

pub mod redis;

pub use self::redis::RedisPool;
