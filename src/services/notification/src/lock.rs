//! Cross-process coordination lock for the campaign runner
//!
//! `wait` blocks until the lock is held or the lock is cancelled. Holders
//! call `wait` again before each unit of work; a Redis holder refreshes its
//! TTL there, so a crashed process loses the lock once the TTL lapses.

use crate::config::{LockBackend, LockSettings};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
pub trait Lock: Send + Sync {
    /// Returns true once held. Returns false only after `release` or
    /// cancellation.
    async fn wait(&self) -> bool;

    fn locked(&self) -> bool;

    async fn release(&self);
}

/// Build the lock configured for this process.
pub async fn from_settings(settings: &LockSettings, cancel: CancellationToken) -> Result<Arc<dyn Lock>> {
    match settings.backend {
        LockBackend::Local => Ok(Arc::new(LocalLock::new(cancel))),
        LockBackend::Redis => {
            let lock = RedisLock::connect(settings, cancel).await?;
            Ok(Arc::new(lock))
        }
    }
}

// =============================================================================
// In-process lock
// =============================================================================

/// Lock for a single process. Always granted until released.
pub struct LocalLock {
    held: AtomicBool,
    cancel: CancellationToken,
}

impl LocalLock {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            held: AtomicBool::new(false),
            cancel,
        }
    }
}

#[async_trait]
impl Lock for LocalLock {
    async fn wait(&self) -> bool {
        if self.cancel.is_cancelled() {
            self.held.store(false, Ordering::SeqCst);
            return false;
        }
        self.held.store(true, Ordering::SeqCst);
        true
    }

    fn locked(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

// =============================================================================
// Redis lock
// =============================================================================

const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Lock stored as a single key holding a random token.
pub struct RedisLock {
    conn: Mutex<ConnectionManager>,
    key: String,
    token: String,
    ttl: Duration,
    retry: Duration,
    held: AtomicBool,
    cancel: CancellationToken,
}

impl RedisLock {
    pub async fn connect(settings: &LockSettings, cancel: CancellationToken) -> Result<Self> {
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!(key = %settings.key, "Connected campaign lock to Redis");
        Ok(Self {
            conn: Mutex::new(conn),
            key: settings.key.clone(),
            token: Uuid::new_v4().to_string(),
            ttl: Duration::from_secs(settings.ttl_seconds),
            retry: Duration::from_secs(settings.retry_seconds),
            held: AtomicBool::new(false),
            cancel,
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.lock().clone()
    }

    async fn try_acquire(&self) -> Result<bool> {
        let mut conn = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn refresh(&self) -> Result<bool> {
        let mut conn = self.connection();
        let refreshed: i64 = Script::new(REFRESH_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn attempt(&self) -> Result<bool> {
        if self.held.load(Ordering::SeqCst) && self.refresh().await? {
            return Ok(true);
        }
        self.held.store(false, Ordering::SeqCst);
        self.try_acquire().await
    }
}

#[async_trait]
impl Lock for RedisLock {
    async fn wait(&self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                self.held.store(false, Ordering::SeqCst);
                return false;
            }

            match self.attempt().await {
                Ok(true) => {
                    if !self.held.swap(true, Ordering::SeqCst) {
                        info!(key = %self.key, "Acquired campaign lock");
                    }
                    return true;
                }
                Ok(false) => debug!(key = %self.key, "Campaign lock held elsewhere"),
                Err(e) => warn!(key = %self.key, error = %e, "Campaign lock attempt failed"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.held.store(false, Ordering::SeqCst);
                    return false;
                }
                _ = tokio::time::sleep(self.retry) => {}
            }
        }
    }

    fn locked(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        self.cancel.cancel();
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut conn = self.connection();
        let result: std::result::Result<i64, redis::RedisError> = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "Failed to release campaign lock");
        }
    }
}
