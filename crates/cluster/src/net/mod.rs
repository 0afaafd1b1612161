//! Networked storage: the TCP server, the remote-store client, and the
//! connection pool they share.

pub mod client;
pub mod pool;
pub mod server;

pub use client::RemoteStore;
pub use pool::{Connection, ConnectionPool};
pub use server::StorageServer;

use conflux_core::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Bound an I/O future by the configured read/write timeout. A timeout
/// resolves as a transient error and abandons the operation; effects
/// already applied on the far side are not rolled back.
pub(crate) async fn io_timeout<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(what)),
    }
}
