//! Upstream synchronization with the config updater
//!
//! A bounded queue feeds a single batching worker that flushes on size or
//! interval, re-emits cached state on a slower tick, reconnects with
//! backoff and drains on shutdown.

mod client;
mod wire;


pub use client::{
    UpdaterClient, UpdaterClientConfig, FLUSH_CACHE_SYNC, FLUSH_PERIODIC, FLUSH_QUEUE_SIZE,
    FLUSH_SHUTDOWN,
};
pub use wire::{Connection, Request, Response, PUSH_METHOD};
