use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    ConnectionNotFound { connection_id: u64 },
    InvalidCapacity,
    AcquireTimeout { capacity: usize, waited_ms: u128 },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound { connection_id } => {
                write!(f, "connection {connection_id} not found")
            }
            Self::InvalidCapacity => write!(f, "pool capacity must be positive"),
            Self::AcquireTimeout {
                capacity,
                waited_ms,
            } => write!(
                f,
                "no free remote connection slot out of {capacity} after {waited_ms}ms"
            ),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_id: u64,
    pub peer_addr: SocketAddr,
    pub session_id: Option<Uuid>,
    pub authenticated_user: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub logged_in_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoginRecord {
    pub session_id: Uuid,
    /// True when the client presented a session id this broker has seen before.
    pub resumed: bool,
}

/// Session ids remembered for resumption before the least recently seen are forgotten.
pub const DEFAULT_KNOWN_SESSION_LIMIT: usize = 4_096;

struct KnownSession {
    user: String,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct SessionRegistry {
    connections: HashMap<u64, SessionSnapshot>,
    known_sessions: HashMap<Uuid, KnownSession>,
}

impl SessionRegistry {
    fn remember(&mut self, session_id: Uuid, user: &str, limit: usize) {
        self.known_sessions.insert(
            session_id,
            KnownSession {
                user: user.to_owned(),
                last_seen: Utc::now(),
            },
        );

        while self.known_sessions.len() > limit {
            let live: Vec<Uuid> = self
                .connections
                .values()
                .filter_map(|record| record.session_id)
                .collect();
            let oldest = self
                .known_sessions
                .iter()
                .filter(|(id, _)| **id != session_id && !live.contains(*id))
                .min_by_key(|(_, known)| known.last_seen)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    self.known_sessions.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Per-socket session state on the server side.
pub struct SessionPool {
    registry: Mutex<SessionRegistry>,
    known_session_limit: usize,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::with_known_session_limit(DEFAULT_KNOWN_SESSION_LIMIT)
    }
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that remembers at most `limit` session ids not held by a live connection.
    pub fn with_known_session_limit(limit: usize) -> Self {
        Self {
            registry: Mutex::new(SessionRegistry::default()),
            known_session_limit: limit.max(1),
        }
    }

    pub fn register(&self, connection_id: u64, peer_addr: SocketAddr) {
        let record = SessionSnapshot {
            connection_id,
            peer_addr,
            session_id: None,
            authenticated_user: None,
            connected_at: Utc::now(),
            logged_in_at: None,
        };

        self.registry
            .lock()
            .expect("session pool lock poisoned")
            .connections
            .insert(connection_id, record);
    }

    /// Marks the connection as logged in. A missing session id gets a fresh one.
    pub fn mark_logged_in(
        &self,
        connection_id: u64,
        user: &str,
        session_id: Option<Uuid>,
    ) -> Result<LoginRecord, PoolError> {
        let mut registry = self.registry.lock().expect("session pool lock poisoned");
        let session_id = session_id.unwrap_or_else(Uuid::new_v4);
        let resumed = registry
            .known_sessions
            .get(&session_id)
            .is_some_and(|known| known.user == user);

        let record = registry
            .connections
            .get_mut(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })?;
        record.session_id = Some(session_id);
        record.authenticated_user = Some(user.to_owned());
        record.logged_in_at = Some(Utc::now());

        registry.remember(session_id, user, self.known_session_limit);
        Ok(LoginRecord {
            session_id,
            resumed,
        })
    }

    pub fn authenticated_user(&self, connection_id: u64) -> Option<String> {
        self.registry
            .lock()
            .expect("session pool lock poisoned")
            .connections
            .get(&connection_id)
            .and_then(|record| record.authenticated_user.clone())
    }

    pub fn snapshot(&self, connection_id: u64) -> Option<SessionSnapshot> {
        self.registry
            .lock()
            .expect("session pool lock poisoned")
            .connections
            .get(&connection_id)
            .cloned()
    }

    pub fn remove(&self, connection_id: u64) -> Result<SessionSnapshot, PoolError> {
        self.registry
            .lock()
            .expect("session pool lock poisoned")
            .connections
            .remove(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })
    }

    pub fn count(&self) -> usize {
        self.registry
            .lock()
            .expect("session pool lock poisoned")
            .connections
            .len()
    }

    pub fn known_session_count(&self) -> usize {
        self.registry
            .lock()
            .expect("session pool lock poisoned")
            .known_sessions
            .len()
    }

    pub fn logged_in_count(&self) -> usize {
        self.registry
            .lock()
            .expect("session pool lock poisoned")
            .connections
            .values()
            .filter(|record| record.authenticated_user.is_some())
            .count()
    }
}

/// Bounds concurrent outbound connections to other managers.
pub struct RemoteConnectionPool {
    capacity: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl RemoteConnectionPool {
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }

        Ok(Self {
            capacity,
            in_use: Mutex::new(0),
            released: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock().expect("remote pool lock poisoned")
    }

    /// Blocks until a slot frees up or `timeout` passes. The slot is returned on drop.
    pub fn acquire(&self, timeout: Duration) -> Result<RemoteSlot<'_>, PoolError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut in_use = self.in_use.lock().expect("remote pool lock poisoned");

        while *in_use >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::AcquireTimeout {
                    capacity: self.capacity,
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            in_use = self
                .released
                .wait_timeout(in_use, deadline - now)
                .expect("remote pool lock poisoned")
                .0;
        }

        *in_use += 1;
        Ok(RemoteSlot { pool: self })
    }

    fn release(&self) {
        let mut in_use = self.in_use.lock().expect("remote pool lock poisoned");
        *in_use = in_use.saturating_sub(1);
        drop(in_use);
        self.released.notify_one();
    }
}

impl fmt::Debug for RemoteConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnectionPool")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

pub struct RemoteSlot<'a> {
    pool: &'a RemoteConnectionPool,
}

impl Drop for RemoteSlot<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use uuid::Uuid;

    use super::{PoolError, RemoteConnectionPool, SessionPool};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().expect("valid socket address")
    }

    #[test]
    fn session_login_and_resumption() {
        let pool = SessionPool::new();
        pool.register(1, peer());
        pool.register(2, peer());
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.logged_in_count(), 0);
        assert!(pool.authenticated_user(1).is_none());

        let session_id = Uuid::new_v4();
        let first = pool
            .mark_logged_in(1, "alice", Some(session_id))
            .expect("login should be recorded");
        assert!(!first.resumed);
        assert_eq!(pool.authenticated_user(1).as_deref(), Some("alice"));

        let second = pool
            .mark_logged_in(2, "alice", Some(session_id))
            .expect("login should be recorded");
        assert!(second.resumed);
        assert_eq!(pool.logged_in_count(), 2);

        let snapshot = pool.snapshot(2).expect("snapshot should exist");
        assert_eq!(snapshot.session_id, Some(session_id));
        assert!(snapshot.logged_in_at.is_some());
    }

    #[test]
    fn session_id_of_another_user_is_not_a_resumption() {
        let pool = SessionPool::new();
        pool.register(1, peer());
        pool.register(2, peer());
        let session_id = Uuid::new_v4();

        pool.mark_logged_in(1, "alice", Some(session_id))
            .expect("login should be recorded");
        let other = pool
            .mark_logged_in(2, "mallory", Some(session_id))
            .expect("login should be recorded");
        assert!(!other.resumed);
    }

    #[test]
    fn remembered_sessions_are_bounded_oldest_first() {
        let pool = SessionPool::with_known_session_limit(2);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        for (connection_id, session_id) in [(1, first), (2, second), (3, third)] {
            pool.register(connection_id, peer());
            pool.mark_logged_in(connection_id, "alice", Some(session_id))
                .expect("login should be recorded");
            pool.remove(connection_id).expect("connection should be registered");
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(pool.known_session_count(), 2);

        pool.register(4, peer());
        let forgotten = pool
            .mark_logged_in(4, "alice", Some(first))
            .expect("login should be recorded");
        assert!(!forgotten.resumed);

        pool.register(5, peer());
        let remembered = pool
            .mark_logged_in(5, "alice", Some(third))
            .expect("login should be recorded");
        assert!(remembered.resumed);
        assert_eq!(pool.known_session_count(), 2);
    }

    #[test]
    fn live_sessions_are_never_forgotten() {
        let pool = SessionPool::with_known_session_limit(1);
        let held = Uuid::new_v4();
        pool.register(1, peer());
        pool.mark_logged_in(1, "alice", Some(held))
            .expect("login should be recorded");

        pool.register(2, peer());
        pool.mark_logged_in(2, "bob", Some(Uuid::new_v4()))
            .expect("login should be recorded");
        assert_eq!(pool.known_session_count(), 2);

        pool.register(3, peer());
        let again = pool
            .mark_logged_in(3, "alice", Some(held))
            .expect("login should be recorded");
        assert!(again.resumed);
    }

    #[test]
    fn unknown_connection_is_reported() {
        let pool = SessionPool::new();
        assert_eq!(
            pool.mark_logged_in(9, "x", None).expect_err("unknown connection"),
            PoolError::ConnectionNotFound { connection_id: 9 }
        );

        pool.register(3, peer());
        assert!(pool.remove(3).is_ok());
        assert!(pool.remove(3).is_err());
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn remote_pool_bounds_concurrent_slots() {
        assert_eq!(
            RemoteConnectionPool::new(0).expect_err("zero capacity"),
            PoolError::InvalidCapacity
        );

        let pool = RemoteConnectionPool::new(1).expect("pool should be created");
        let slot = pool
            .acquire(Duration::from_millis(10))
            .expect("first slot should be free");
        assert_eq!(pool.in_use(), 1);

        let err = pool
            .acquire(Duration::from_millis(30))
            .err()
            .expect("second acquire should time out");
        assert!(matches!(err, PoolError::AcquireTimeout { capacity: 1, .. }));

        drop(slot);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn released_slot_wakes_a_waiter() {
        let pool = Arc::new(RemoteConnectionPool::new(1).expect("pool should be created"));
        let holder = Arc::clone(&pool);

        let slot = pool
            .acquire(Duration::from_millis(10))
            .expect("first slot should be free");
        let waiter = thread::spawn(move || {
            holder
                .acquire(Duration::from_secs(2))
                .map(|_| ())
                .is_ok()
        });

        thread::sleep(Duration::from_millis(50));
        drop(slot);
        assert!(waiter.join().expect("waiter should finish"));
        assert_eq!(pool.in_use(), 0);
    }
}
