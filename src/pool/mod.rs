//! Bounded pool of renderer sessions
//!
//! The pool is the only shared mutable resource workers touch. A semaphore
//! caps the number of outstanding leases at the session ceiling; idle
//! sessions are reused, suspect ones are recycled and replaced lazily on the
//! next acquire.
//!
//! Every lease ends in exactly one of `release` or `recycle`. A lease dropped
//! without either is recycled, and a lease held past its TTL is reclaimed by
//! the reaper: its slot is returned and the session is closed when the holder
//! gives it back.

use crate::renderer::{RenderError, RenderOutput, RenderRequest, RenderSession, SessionFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session available for {owner} within {waited:?}")]
    Exhausted { owner: String, waited: Duration },

    #[error("session pool is shut down")]
    ShutDown,

    #[error("failed to open session: {0}")]
    Open(#[from] RenderError),
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub ceiling: usize,
    pub leased: usize,
    pub idle: usize,
    pub opened: u64,
    pub recycled: u64,
    pub reclaimed: u64,
    pub peak_leased: usize,
}

struct LeaseRecord {
    owner: String,
    deadline: Instant,
    revoked: Arc<AtomicBool>,
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    permits: Arc<Semaphore>,
    ceiling: usize,
    lease_ttl: Duration,
    idle: Mutex<VecDeque<Box<dyn RenderSession>>>,
    leases: Mutex<HashMap<u64, LeaseRecord>>,
    next_lease: AtomicU64,
    opened: AtomicU64,
    recycled: AtomicU64,
    reclaimed: AtomicU64,
    peak_leased: AtomicUsize,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<Box<dyn RenderSession>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<u64, LeaseRecord>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Shared handle to the session pool
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Creates a pool; sessions are opened on demand
    ///
    /// # Arguments
    ///
    /// * `factory` - Opens renderer sessions
    /// * `ceiling` - Maximum number of outstanding leases
    /// * `lease_ttl` - Lease lifetime after which the reaper reclaims it
    pub fn new(factory: Arc<dyn SessionFactory>, ceiling: usize, lease_ttl: Duration) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                permits: Arc::new(Semaphore::new(ceiling)),
                ceiling,
                lease_ttl,
                idle: Mutex::new(VecDeque::new()),
                leases: Mutex::new(HashMap::new()),
                next_lease: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
                reclaimed: AtomicU64::new(0),
                peak_leased: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Leases a session, waiting at most `timeout` for a free slot
    ///
    /// # Arguments
    ///
    /// * `owner` - Label of the holder, used in logs and errors
    /// * `timeout` - Bound on the wait for a free slot
    ///
    /// # Returns
    ///
    /// * `Ok(SessionLease)` - An idle session, or a freshly opened one
    /// * `Err(PoolError::Exhausted)` - No slot freed up in time
    /// * `Err(PoolError::Open)` - A new session could not be opened
    pub async fn acquire(&self, owner: &str, timeout: Duration) -> Result<SessionLease, PoolError> {
        if self.inner.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let permit = tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::Exhausted {
                owner: owner.to_string(),
                waited: timeout,
            })?
            .map_err(|_| PoolError::ShutDown)?;

        let reused = self.inner.idle().pop_front();
        let session = match reused {
            Some(session) => session,
            None => {
                let session = self.inner.factory.open().await?;
                self.inner.opened.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Opened {} session for {}", self.inner.factory.name(), owner);
                session
            }
        };

        let id = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        let revoked = Arc::new(AtomicBool::new(false));
        let leased = {
            let mut leases = self.inner.leases();
            leases.insert(
                id,
                LeaseRecord {
                    owner: owner.to_string(),
                    deadline: Instant::now() + self.inner.lease_ttl,
                    revoked: Arc::clone(&revoked),
                },
            );
            leases.len()
        };
        self.inner.peak_leased.fetch_max(leased, Ordering::Relaxed);

        Ok(SessionLease {
            id,
            session: Some(session),
            permit: Some(permit),
            revoked,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Returns a healthy session for reuse
    pub fn release(&self, lease: SessionLease) {
        lease.release();
    }

    /// Closes a suspect session; its slot becomes acquirable again
    pub async fn recycle(&self, lease: SessionLease) {
        lease.recycle().await;
    }

    /// Reclaims leases held past their TTL
    ///
    /// # Returns
    ///
    /// The number of leases reclaimed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u64, LeaseRecord)> = {
            let mut leases = self.inner.leases();
            let ids: Vec<u64> = leases
                .iter()
                .filter(|(_, record)| record.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| leases.remove(&id).map(|record| (id, record)))
                .collect()
        };

        for (id, record) in &expired {
            record.revoked.store(true, Ordering::SeqCst);
            tracing::warn!("Reclaimed lease {} held by {} past its TTL", id, record.owner);
        }

        if !expired.is_empty() {
            self.inner
                .reclaimed
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            self.inner.permits.add_permits(expired.len());
        }
        expired.len()
    }

    /// Spawns the background task that reclaims expired leases
    pub fn start_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pool.inner.is_shut_down() {
                    break;
                }
                pool.reap_expired();
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            ceiling: self.inner.ceiling,
            leased: self.inner.leases().len(),
            idle: self.inner.idle().len(),
            opened: self.inner.opened.load(Ordering::Relaxed),
            recycled: self.inner.recycled.load(Ordering::Relaxed),
            reclaimed: self.inner.reclaimed.load(Ordering::Relaxed),
            peak_leased: self.inner.peak_leased.load(Ordering::Relaxed),
        }
    }

    /// Refuses new leases, closes idle sessions and shuts the factory down
    ///
    /// Outstanding leases stay usable; their sessions are closed when returned.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<_> = self.inner.idle().drain(..).collect();
        let closed = idle.len();
        for mut session in idle {
            session.close().await;
        }

        self.inner.factory.shutdown().await;
        tracing::info!("Session pool shut down ({} idle sessions closed)", closed);
    }
}

/// Exclusive use of one session
///
/// Dropping a lease without calling `release` or `recycle` recycles it.
pub struct SessionLease {
    id: u64,
    session: Option<Box<dyn RenderSession>>,
    permit: Option<OwnedSemaphorePermit>,
    revoked: Arc<AtomicBool>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl SessionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Renders through the leased session
    pub async fn render(&mut self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        if self.is_revoked() {
            return Err(RenderError::LeaseRevoked);
        }
        let session = self.session.as_mut().ok_or(RenderError::SessionClosed)?;
        session.render(request).await
    }

    /// Returns the session for reuse, or closes it if the lease was reclaimed
    pub fn release(mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if self.is_revoked() || self.pool.is_shut_down() {
            self.finish();
            spawn_close(session);
            return;
        }

        self.pool.idle().push_back(session);
        self.finish();
    }

    /// Closes the session and frees the slot
    pub async fn recycle(mut self) {
        if let Some(mut session) = self.session.take() {
            self.pool.recycled.fetch_add(1, Ordering::Relaxed);
            self.finish();
            session.close().await;
        }
    }

    /// Drops the lease record and the permit, unless the reaper already took the slot back
    fn finish(&mut self) {
        let still_held = self.pool.leases().remove(&self.id).is_some();
        if let Some(permit) = self.permit.take() {
            if still_held {
                drop(permit);
            } else {
                permit.forget();
            }
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!("Lease {} dropped without release, recycling", self.id);
            self.pool.recycled.fetch_add(1, Ordering::Relaxed);
            self.finish();
            spawn_close(session);
        }
    }
}

fn spawn_close(mut session: Box<dyn RenderSession>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            session.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use url::Url;

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    struct CountingSession {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RenderSession for CountingSession {
        async fn render(&mut self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
            Ok(RenderOutput {
                final_url: Url::parse(&request.url).unwrap(),
                html: "<html></html>".to_string(),
                status: Some(200),
            })
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession {
                closed: Arc::clone(&self.closed),
            }))
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn pool(ceiling: usize, ttl: Duration) -> (SessionPool, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        (SessionPool::new(factory.clone(), ceiling, ttl), factory)
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_ceiling_and_exhaustion() {
        let (pool, _) = pool(2, Duration::from_secs(60));

        let a = pool.acquire("a", WAIT).await.unwrap();
        let _b = pool.acquire("b", WAIT).await.unwrap();
        assert!(matches!(
            pool.acquire("c", WAIT).await,
            Err(PoolError::Exhausted { .. })
        ));

        pool.release(a);
        assert!(pool.acquire("c", WAIT).await.is_ok());
        assert_eq!(pool.stats().peak_leased, 2);
    }

    #[tokio::test]
    async fn test_release_reuses_session() {
        let (pool, factory) = pool(1, Duration::from_secs(60));

        let lease = pool.acquire("a", WAIT).await.unwrap();
        pool.release(lease);
        let lease = pool.acquire("b", WAIT).await.unwrap();
        pool.release(lease);

        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test]
    async fn test_recycle_opens_replacement() {
        let (pool, factory) = pool(1, Duration::from_secs(60));

        let lease = pool.acquire("a", WAIT).await.unwrap();
        pool.recycle(lease).await;
        let _lease = pool.acquire("b", WAIT).await.unwrap();

        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().recycled, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_recycled() {
        let (pool, _) = pool(1, Duration::from_secs(60));

        {
            let _lease = pool.acquire("a", WAIT).await.unwrap();
        }

        // Held so its own drop does not count as a second recycle
        let _b = pool.acquire("b", WAIT).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.leased, 1);
    }

    #[tokio::test]
    async fn test_reaper_reclaims_expired_lease() {
        let (pool, factory) = pool(1, Duration::from_millis(10));

        let mut stuck = pool.acquire("stuck", WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.reap_expired(), 1);

        let request = RenderRequest {
            url: "https://example.com/".to_string(),
            expected_selector: None,
            timeout: WAIT,
        };
        assert!(matches!(
            stuck.render(&request).await,
            Err(RenderError::LeaseRevoked)
        ));

        let fresh = pool.acquire("fresh", WAIT).await.unwrap();
        stuck.release();
        pool.release(fresh);

        // The reclaimed slot was handed to `fresh`; the ceiling still holds
        assert_eq!(pool.stats().leased, 0);
        let _one = pool.acquire("one", WAIT).await.unwrap();
        assert!(pool.acquire("two", WAIT).await.is_err());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_leases() {
        let (pool, factory) = pool(2, Duration::from_secs(60));

        let lease = pool.acquire("a", WAIT).await.unwrap();
        pool.release(lease);
        pool.shutdown().await;

        assert!(matches!(
            pool.acquire("b", WAIT).await,
            Err(PoolError::ShutDown)
        ));
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }
}
