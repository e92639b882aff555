//! Per-tenant access token cache with single-flight refresh.
//!
//! One map guarded by a short-lived lock; the network call itself runs in a
//! shared future that every concurrent caller for the same key awaits.

use crate::channels::error::{ChannelError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
pub const FALLBACK_EXPIRES_S: u64 = 7200;
/// Upper bound on a vendor-reported lifetime.
pub const MAX_EXPIRES: Duration = Duration::from_secs(30 * 86_400);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub platform: &'static str,
    pub account_id: String,
    pub fingerprint: String,
}

impl TokenKey {
    /// `credentials` are hashed, so a rotated secret lands on a fresh key.
    pub fn new(platform: &'static str, account_id: &str, credentials: &[&str]) -> Self {
        Self {
            platform,
            account_id: account_id.to_string(),
            fingerprint: credential_fingerprint(credentials),
        }
    }
}

pub fn credential_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.trim().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        now.checked_add(margin)
            .is_some_and(|deadline| self.expires_at > deadline)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// What a vendor token endpoint reported.
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub token: String,
    pub expires_in: Duration,
}

impl FetchedToken {
    pub fn new(token: impl Into<String>, expires_in_s: u64) -> Self {
        Self {
            token: token.into(),
            expires_in: Duration::from_secs(expires_in_s).min(MAX_EXPIRES),
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<AccessToken>>>;

enum Slot {
    Ready(AccessToken),
    InFlight { generation: u64, fetch: SharedFetch },
}

struct TokenCacheInner {
    slots: Mutex<HashMap<TokenKey, Slot>>,
    generation: AtomicU64,
    margin: Duration,
}

#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<TokenCacheInner>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self::with_margin(REFRESH_MARGIN)
    }

    pub fn with_margin(margin: Duration) -> Self {
        Self {
            inner: Arc::new(TokenCacheInner {
                slots: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                margin,
            }),
        }
    }

    /// Returns a cached token or runs `fetch` once for all concurrent callers of `key`.
    ///
    /// Failures are handed to every waiter and never cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: &TokenKey, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedToken>> + Send + 'static,
    {
        let (pending, generation) = {
            let mut slots = self.inner.slots.lock();
            match slots.get(key) {
                Some(Slot::Ready(token)) if token.is_fresh(Instant::now(), self.inner.margin) => {
                    return Ok(token.token.clone());
                }
                Some(Slot::InFlight { generation, fetch }) => (fetch.clone(), *generation),
                _ => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let request = fetch();
                    let platform = key.platform;
                    let pending = async move {
                        let fetched = AssertUnwindSafe(request)
                            .catch_unwind()
                            .await
                            .map_err(|_| ChannelError::transport(platform, "token fetch panicked"))??;
                        let now = Instant::now();
                        Ok(AccessToken {
                            token: fetched.token,
                            expires_at: now
                                .checked_add(fetched.expires_in.min(MAX_EXPIRES))
                                .unwrap_or(now),
                        })
                    }
                    .boxed()
                    .shared();
                    debug!(
                        platform = key.platform,
                        account_id = %key.account_id,
                        "access token refresh started"
                    );
                    slots.insert(
                        key.clone(),
                        Slot::InFlight {
                            generation,
                            fetch: pending.clone(),
                        },
                    );
                    (pending, generation)
                }
            }
        };

        let outcome = pending.await;

        let mut slots = self.inner.slots.lock();
        let owns_slot = matches!(
            slots.get(key),
            Some(Slot::InFlight { generation: current, .. }) if *current == generation
        );
        if owns_slot {
            match &outcome {
                Ok(token) => {
                    prune_stale(&mut slots, key);
                    slots.insert(key.clone(), Slot::Ready(token.clone()));
                }
                Err(_) => {
                    slots.remove(key);
                }
            }
        }
        outcome.map(|token| token.token)
    }

    /// Drops a cached token the vendor rejected.
    pub fn invalidate(&self, key: &TokenKey) {
        let mut slots = self.inner.slots.lock();
        if matches!(slots.get(key), Some(Slot::Ready(_))) {
            slots.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drops expired tokens and tokens fetched with credentials that have since rotated.
fn prune_stale(slots: &mut HashMap<TokenKey, Slot>, fresh: &TokenKey) {
    let now = Instant::now();
    slots.retain(|key, slot| match slot {
        Slot::Ready(token) => {
            let rotated = key.platform == fresh.platform
                && key.account_id == fresh.account_id
                && key.fingerprint != fresh.fingerprint;
            !rotated && !token.is_expired(now)
        }
        Slot::InFlight { .. } => true,
    });
}
