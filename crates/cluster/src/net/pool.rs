//! Per-endpoint connection pooling.
//!
//! One arena holds every pooled connection, keyed by connection id; the
//! keep-alive list per endpoint and the in-use count are plain indices
//! and counters into it, so nothing here ever forms a reference cycle.
//! Idle connections expire after the keep-alive timeout; closing the
//! pool drains the in-use set before resolving.

use conflux_core::{Error, NetConfig, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

/// The buffered stream every session runs over.
pub type PooledStream = BufStream<TcpStream>;

#[derive(Debug)]
struct Slot {
    stream: PooledStream,
    idle_since: Instant,
}

#[derive(Debug)]
struct PoolInner {
    /// Arena of pooled connections, keyed by connection id.
    slots: Vec<Option<Slot>>,
    /// Retired arena ids available for reuse.
    free: Vec<usize>,
    /// Keep-alive pool: idle connection ids per endpoint, oldest first.
    idle: HashMap<SocketAddr, VecDeque<usize>>,
    /// Connections currently checked out.
    in_use: usize,
    closed: bool,
}

/// Pool of client connections to remote storage endpoints.
#[derive(Debug)]
pub struct ConnectionPool {
    config: NetConfig,
    inner: Mutex<PoolInner>,
    drained: Notify,
}

impl ConnectionPool {
    /// An empty pool.
    pub fn new(config: NetConfig) -> Arc<Self> {
        Arc::new(ConnectionPool {
            config,
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
                idle: HashMap::new(),
                in_use: 0,
                closed: false,
            }),
            drained: Notify::new(),
        })
    }

    /// Check out a connection to `endpoint`: a fresh-enough idle one if
    /// available, otherwise a new connect bounded by the connect timeout.
    pub async fn checkout(self: &Arc<Self>, endpoint: SocketAddr) -> Result<Connection> {
        loop {
            let reused = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(Error::Shutdown);
                }
                match inner.idle.get_mut(&endpoint).and_then(|queue| queue.pop_front()) {
                    Some(id) => {
                        let slot = inner.slots[id].take();
                        inner.free.push(id);
                        slot
                    }
                    None => None,
                }
            };
            match reused {
                Some(slot) if slot.idle_since.elapsed() < self.config.keep_alive_timeout() => {
                    self.inner.lock().in_use += 1;
                    return Ok(Connection {
                        endpoint,
                        stream: Some(slot.stream),
                        pool: Arc::clone(self),
                        released: false,
                    });
                }
                // Outlived keep-alive: dropping the slot closes the socket.
                Some(_expired) => continue,
                None => break,
            }
        }

        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(endpoint),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::transient_with(
                    format!("connect to {endpoint} failed"),
                    e,
                ))
            }
            Err(_) => return Err(Error::timeout("connect")),
        };
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::Shutdown);
            }
            inner.in_use += 1;
        }
        debug!(endpoint = %endpoint, "new pooled connection");
        Ok(Connection {
            endpoint,
            stream: Some(BufStream::new(stream)),
            pool: Arc::clone(self),
            released: false,
        })
    }

    /// Stop handing out connections, drop the keep-alive pool, and wait
    /// for every in-use connection to come back or be discarded.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.idle.clear();
            for slot in inner.slots.iter_mut() {
                *slot = None;
            }
            inner.free.clear();
        }
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().in_use == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Idle connections currently parked.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.values().map(|q| q.len()).sum()
    }

    /// Connections currently checked out.
    pub fn in_use_count(&self) -> usize {
        self.inner.lock().in_use
    }

    fn give_back(&self, endpoint: SocketAddr, stream: PooledStream) {
        {
            let mut inner = self.inner.lock();
            inner.in_use = inner.in_use.saturating_sub(1);
            if !inner.closed {
                let slot = Slot {
                    stream,
                    idle_since: Instant::now(),
                };
                let id = match inner.free.pop() {
                    Some(id) => {
                        inner.slots[id] = Some(slot);
                        id
                    }
                    None => {
                        inner.slots.push(Some(slot));
                        inner.slots.len() - 1
                    }
                };
                inner.idle.entry(endpoint).or_default().push_back(id);
            }
        }
        self.drained.notify_waiters();
    }

    fn discard_one(&self) {
        {
            let mut inner = self.inner.lock();
            inner.in_use = inner.in_use.saturating_sub(1);
        }
        self.drained.notify_waiters();
    }
}

/// A checked-out connection. [`release`] parks it back in the keep-alive
/// pool; dropping it instead closes the socket, which is how a cancelled
/// session signals failure to the far side.
///
/// [`release`]: Connection::release
#[derive(Debug)]
pub struct Connection {
    endpoint: SocketAddr,
    stream: Option<PooledStream>,
    pool: Arc<ConnectionPool>,
    released: bool,
}

impl Connection {
    /// The underlying stream.
    pub(crate) fn stream_mut(&mut self) -> &mut PooledStream {
        self.stream.as_mut().expect("connection stream taken")
    }

    /// Move the stream out, e.g. into a framed writer. Pair with
    /// [`restore_stream`](Connection::restore_stream) before release.
    pub(crate) fn take_stream(&mut self) -> Option<PooledStream> {
        self.stream.take()
    }

    /// Put a previously taken stream back.
    pub(crate) fn restore_stream(&mut self, stream: PooledStream) {
        self.stream = Some(stream);
    }

    /// Return the connection to the pool for reuse.
    pub fn release(mut self) {
        self.released = true;
        match self.stream.take() {
            Some(stream) => self.pool.give_back(self.endpoint, stream),
            None => self.pool.discard_one(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.released {
            self.pool.discard_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(NetConfig::default());
        let conn = pool.checkout(addr).await.unwrap();
        assert_eq!(pool.in_use_count(), 1);
        conn.release();
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.idle_count(), 1);

        let _conn = pool.checkout(addr).await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use_count(), 1);
    }

    #[tokio::test]
    async fn dropped_connections_are_discarded() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(NetConfig::default());
        let conn = pool.checkout(addr).await.unwrap();
        drop(conn);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn expired_idle_connections_are_not_reused() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let config = NetConfig {
            keep_alive_timeout_ms: 0,
            ..NetConfig::default()
        };
        let pool = ConnectionPool::new(config);
        pool.checkout(addr).await.unwrap().release();
        assert_eq!(pool.idle_count(), 1);

        // Keep-alive of zero: the parked connection is already expired,
        // so checkout must open a fresh one.
        let _conn = pool.checkout(addr).await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use_count(), 1);
    }

    #[tokio::test]
    async fn close_waits_for_in_use_connections() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(NetConfig::default());
        let conn = pool.checkout(addr).await.unwrap();

        let closer = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.close().await })
        };
        tokio::task::yield_now().await;
        assert!(!closer.is_finished());

        conn.release();
        closer.await.unwrap();
        assert_eq!(pool.in_use_count(), 0);

        let err = pool.checkout(addr).await.unwrap_err();
        assert!(err.is_shutdown());
    }
}
