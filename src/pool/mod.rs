//! Connection pool keyed by fingerprint-aware [`ConnectionKey`]s.
//!
//! The pool owns every live transport; borrowers get a [`Lease`] and must
//! release it with an outcome. Dials for the same host:port are serialized
//! under a per-address mutex so concurrent first requests never race a
//! redial, and an idle sweep closes transports that sat unused.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::fingerprint::spec::ConnectionKey;
use crate::transport::connector::MaybeTlsStream;
use crate::transport::h1::H1Connection;
use crate::transport::h2::H2Connection;
use crate::version::HttpVersion;

/// A live transport held by the pool.
pub enum Transport {
    /// Exclusive per lease.
    H1(H1Connection<MaybeTlsStream>),
    /// Shared between leases: HTTP/2 multiplexes, so concurrent requests
    /// with the same key ride the same connection.
    H2(Arc<Mutex<H2Connection<MaybeTlsStream>>>),
}

impl Transport {
    pub fn version(&self) -> HttpVersion {
        match self {
            Self::H1(_) => HttpVersion::Http1,
            Self::H2(_) => HttpVersion::Http2,
        }
    }
}

/// Outcome reported when a lease is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// IO error, GOAWAY, or mid-frame cancellation: discard the transport.
    Broken,
}

/// A borrowed transport. Return it with [`ConnectionPool::release`].
pub struct Lease {
    pub transport: Transport,
    key: ConnectionKey,
    /// False when the request opted out of reuse: never re-inserted.
    pooled: bool,
}

impl Lease {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Split the lease so the executor can borrow the transport
    /// exclusively; rejoin with [`Lease::from_parts`] before release.
    pub fn into_parts(self) -> (Transport, ConnectionKey, bool) {
        (self.transport, self.key, self.pooled)
    }

    pub fn from_parts(transport: Transport, key: ConnectionKey, pooled: bool) -> Self {
        Self {
            transport,
            key,
            pooled,
        }
    }
}

struct IdleEntry {
    transport: Transport,
    last_used: Instant,
}

#[derive(Default)]
struct Shelf {
    /// Idle exclusive transports (HTTP/1.1 siblings under one key).
    idle: Vec<IdleEntry>,
    /// The shared HTTP/2 connection for this key, if one is live.
    shared: Option<(Arc<Mutex<H2Connection<MaybeTlsStream>>>, Instant)>,
}

/// The pool: key → shelf, plus the per-address dial mutex map.
pub struct ConnectionPool {
    shelves: Mutex<HashMap<ConnectionKey, Shelf>>,
    dial_locks: DashMap<String, Arc<Mutex<()>>>,
    max_idle: Duration,
}

impl ConnectionPool {
    const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(90);

    pub fn new() -> Self {
        Self {
            shelves: Mutex::new(HashMap::new()),
            dial_locks: DashMap::new(),
            max_idle: Self::DEFAULT_MAX_IDLE,
        }
    }

    pub fn with_max_idle(max_idle: Duration) -> Self {
        Self {
            shelves: Mutex::new(HashMap::new()),
            dial_locks: DashMap::new(),
            max_idle,
        }
    }

    /// The dial mutex for an address. Held by the executor across dial and
    /// retry so concurrent requests to one remote serialize their dials.
    pub fn dial_lock(&self, address: &str) -> Arc<Mutex<()>> {
        self.dial_locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire a transport for `key`, dialing with `dial` when the pool has
    /// nothing live. With `reuse` false the pool is bypassed entirely: the
    /// dial happens, but the lease is never re-inserted.
    pub async fn acquire<F, Fut>(&self, key: &ConnectionKey, reuse: bool, dial: F) -> Result<Lease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Transport>>,
    {
        if !reuse {
            let transport = dial().await?;
            return Ok(Lease {
                transport,
                key: key.clone(),
                pooled: false,
            });
        }

        let lock = self.dial_lock(&key.address());
        let _guard = lock.lock().await;

        {
            let mut shelves = self.shelves.lock().await;
            if let Some(shelf) = shelves.get_mut(key) {
                if let Some((shared, last_used)) = &mut shelf.shared {
                    // A connection another request currently holds is live
                    // by definition; only an idle one is health-checked.
                    let live = match shared.try_lock() {
                        Ok(conn) => conn.reusable(),
                        Err(_) => true,
                    };
                    if live {
                        *last_used = Instant::now();
                        let shared = shared.clone();
                        return Ok(Lease {
                            transport: Transport::H2(shared),
                            key: key.clone(),
                            pooled: true,
                        });
                    }
                    shelf.shared = None;
                }
                while let Some(entry) = shelf.idle.pop() {
                    if entry.last_used.elapsed() < self.max_idle {
                        return Ok(Lease {
                            transport: entry.transport,
                            key: key.clone(),
                            pooled: true,
                        });
                    }
                    // Stale entry drops here and closes.
                }
            }
        }

        let transport = dial().await?;

        // A multiplexing transport is visible to other requests from the
        // moment it exists; exclusive ones enter the map on release.
        if let Transport::H2(shared) = &transport {
            let mut shelves = self.shelves.lock().await;
            shelves
                .entry(key.clone())
                .or_default()
                .shared = Some((shared.clone(), Instant::now()));
        }

        Ok(Lease {
            transport,
            key: key.clone(),
            pooled: true,
        })
    }

    /// Return a lease. Broken transports are removed and closed; healthy
    /// ones go back idle with a fresh timestamp.
    pub async fn release(&self, lease: Lease, outcome: Outcome) {
        if !lease.pooled {
            return; // Bypassed pool; transport drops and closes here.
        }

        let mut shelves = self.shelves.lock().await;
        match (outcome, lease.transport) {
            (Outcome::Broken, Transport::H2(returned)) => {
                if let Some(shelf) = shelves.get_mut(&lease.key) {
                    if shelf
                        .shared
                        .as_ref()
                        .is_some_and(|(shared, _)| Arc::ptr_eq(shared, &returned))
                    {
                        shelf.shared = None;
                    }
                }
            }
            (Outcome::Broken, Transport::H1(_)) => {}
            (Outcome::Ok, Transport::H2(returned)) => {
                // A GOAWAY observed mid-request leaves the connection
                // unhealthy even on a successful response.
                let healthy = returned
                    .try_lock()
                    .map(|conn| conn.reusable())
                    .unwrap_or(true);
                if let Some(shelf) = shelves.get_mut(&lease.key) {
                    match shelf.shared.as_mut() {
                        Some((shared, last_used)) if Arc::ptr_eq(shared, &returned) => {
                            if healthy {
                                *last_used = Instant::now();
                            } else {
                                shelf.shared = None;
                            }
                        }
                        _ => {}
                    }
                }
            }
            (Outcome::Ok, Transport::H1(conn)) => {
                if conn.reusable() {
                    shelves.entry(lease.key).or_default().idle.push(IdleEntry {
                        transport: Transport::H1(conn),
                        last_used: Instant::now(),
                    });
                }
            }
        }
    }

    /// Close idle transports whose key matches `selector`; entries in
    /// active use are left alone.
    pub async fn close_idle<F>(&self, selector: F)
    where
        F: Fn(&ConnectionKey) -> bool,
    {
        let mut shelves = self.shelves.lock().await;
        shelves.retain(|key, shelf| {
            if !selector(key) {
                return true;
            }
            shelf.idle.clear();
            if let Some((shared, _)) = &shelf.shared {
                // Strong count 1 means only the pool holds it: idle.
                if Arc::strong_count(shared) == 1 {
                    shelf.shared = None;
                }
            }
            shelf.shared.is_some()
        });
    }

    /// Drop every transport that has idled past the limit.
    pub async fn sweep(&self) {
        let max_idle = self.max_idle;
        let mut shelves = self.shelves.lock().await;
        shelves.retain(|_, shelf| {
            shelf.idle.retain(|entry| entry.last_used.elapsed() < max_idle);
            if let Some((shared, last_used)) = &shelf.shared {
                if Arc::strong_count(shared) == 1 && last_used.elapsed() >= max_idle {
                    shelf.shared = None;
                }
            }
            !shelf.idle.is_empty() || shelf.shared.is_some()
        });
    }

    /// Number of keys with at least one live transport.
    pub async fn len(&self) -> usize {
        self.shelves.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shelves.lock().await.is_empty()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::spec::TransportSpec;
    use tokio::io::duplex;

    const JA3: &str = "771,4865-4866,0-10-11-43,29-23,0";

    fn test_key(host: &str) -> ConnectionKey {
        let spec = TransportSpec::resolve(Some(JA3), None, None, None, true).unwrap();
        ConnectionKey::new("https", host, 443, &spec, None, None)
    }

    /// An H2 transport over an in-memory pipe; the server half is parked in
    /// a task that just holds it open.
    async fn mem_h2() -> Result<Transport> {
        let (client, server) = duplex(65536);
        tokio::spawn(async move {
            let _keepalive = server;
            std::future::pending::<()>().await;
        });
        let conn =
            H2Connection::connect(MaybeTlsStream::Mem(client), Default::default()).await?;
        Ok(Transport::H2(Arc::new(Mutex::new(conn))))
    }

    #[tokio::test]
    async fn reuse_false_bypasses_pool() {
        let pool = ConnectionPool::new();
        let key = test_key("example.com");
        let lease = pool.acquire(&key, false, mem_h2).await.unwrap();
        assert!(pool.is_empty().await);
        pool.release(lease, Outcome::Ok).await;
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn h2_transport_is_shared_under_one_key() {
        let pool = ConnectionPool::new();
        let key = test_key("example.com");

        let lease1 = pool.acquire(&key, true, mem_h2).await.unwrap();
        let lease2 = pool
            .acquire(&key, true, || async { panic!("second acquire must not dial") })
            .await
            .unwrap();

        let (Transport::H2(a), Transport::H2(b)) = (&lease1.transport, &lease2.transport) else {
            panic!("expected shared h2 transports");
        };
        assert!(Arc::ptr_eq(a, b));

        pool.release(lease1, Outcome::Ok).await;
        pool.release(lease2, Outcome::Ok).await;
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_keys_never_share() {
        let pool = ConnectionPool::new();
        let key_a = test_key("a.example.com");
        let key_b = test_key("b.example.com");

        let lease_a = pool.acquire(&key_a, true, mem_h2).await.unwrap();
        let lease_b = pool.acquire(&key_b, true, mem_h2).await.unwrap();

        let (Transport::H2(a), Transport::H2(b)) = (&lease_a.transport, &lease_b.transport) else {
            panic!("expected h2 transports");
        };
        assert!(!Arc::ptr_eq(a, b));
        pool.release(lease_a, Outcome::Ok).await;
        pool.release(lease_b, Outcome::Ok).await;
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn broken_release_discards_transport() {
        let pool = ConnectionPool::new();
        let key = test_key("example.com");
        let lease = pool.acquire(&key, true, mem_h2).await.unwrap();
        pool.release(lease, Outcome::Broken).await;

        let mut dialed = false;
        let lease = pool
            .acquire(&key, true, || {
                dialed = true;
                mem_h2()
            })
            .await
            .unwrap();
        assert!(dialed);
        pool.release(lease, Outcome::Ok).await;
    }

    #[tokio::test]
    async fn close_idle_honors_selector() {
        let pool = ConnectionPool::new();
        let key_a = test_key("a.example.com");
        let key_b = test_key("b.example.com");
        for key in [&key_a, &key_b] {
            let lease = pool.acquire(key, true, mem_h2).await.unwrap();
            pool.release(lease, Outcome::Ok).await;
        }
        assert_eq!(pool.len().await, 2);

        pool.close_idle(|key| key.host == "a.example.com").await;
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn close_idle_leaves_active_transports() {
        let pool = ConnectionPool::new();
        let key = test_key("example.com");
        let lease = pool.acquire(&key, true, mem_h2).await.unwrap();

        // Still leased: the selector matches but the transport is in use.
        pool.close_idle(|_| true).await;
        assert_eq!(pool.len().await, 1);

        pool.release(lease, Outcome::Ok).await;
        pool.close_idle(|_| true).await;
        assert!(pool.is_empty().await);
    }
}
