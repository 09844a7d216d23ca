//! Bounded connection pool for the analytical database client.
//!
//! Exactly `size` members circulate for the lifetime of the process: a
//! member is either idle in the pool or checked out to one caller, never
//! both. `acquire` waits up to a timeout for a free member and the
//! returned guard gives it back on drop, so every exit path of the caller
//! (normal return, `?`, unwind) restores the pool.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::types::{AppError, AppResult};

pub struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<C> {
    permits: Semaphore,
    idle: Mutex<VecDeque<C>>,
    size: usize,
}

fn lock_idle<C>(idle: &Mutex<VecDeque<C>>) -> MutexGuard<'_, VecDeque<C>> {
    match idle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Build a pool from eagerly created members. The pool never creates
    /// or destroys members on its own.
    pub fn new(members: Vec<C>) -> Self {
        let size = members.len();
        Self {
            inner: Arc::new(PoolInner {
                permits: Semaphore::new(size),
                idle: Mutex::new(members.into()),
                size,
            }),
        }
    }

    /// Check out a member, waiting up to `timeout` for one to become
    /// free. Returns `AppError::PoolExhausted` when the window elapses.
    pub async fn acquire(&self, timeout: Duration) -> AppResult<PooledConnection<C>> {
        let permit = tokio::time::timeout(timeout, self.inner.permits.acquire())
            .await
            .map_err(|_| AppError::PoolExhausted(timeout))?
            .map_err(|_| AppError::Internal("connection pool closed".to_string()))?;
        // Permit accounting is done manually: the guard's Drop re-adds it.
        permit.forget();

        match lock_idle(&self.inner.idle).pop_front() {
            Some(conn) => Ok(PooledConnection {
                conn: Some(conn),
                inner: Arc::clone(&self.inner),
            }),
            None => {
                self.inner.permits.add_permits(1);
                Err(AppError::Internal(
                    "pool permit issued without an idle member".to_string(),
                ))
            }
        }
    }

    /// Members currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        lock_idle(&self.inner.idle).len()
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }
}

/// Exclusive checkout of one pool member. Dropping the guard returns the
/// member to the pool unconditionally; no health check is performed.
pub struct PooledConnection<C> {
    conn: Option<C>,
    inner: Arc<PoolInner<C>>,
}

impl<C: std::fmt::Debug> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Invariant: `conn` is Some from construction until drop.
        self.conn.as_ref().expect("pooled connection already returned")
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection already returned")
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            lock_idle(&self.inner.idle).push_back(conn);
            self.inner.permits.add_permits(1);
        }
    }
}
