//! Per server memory of the authenticators it has accepted.
//!
//! An authenticator is only acceptable while its timestamp is within the clock skew
//! of the server's clock, so an entry only has to be remembered until the timestamp
//! plus the skew has passed. After that the skew check alone rejects a replay.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::KrbError;
use crate::proto::{is_within_allowed_skew, KerberosTime};

type ReplayKey = (String, u64);

#[derive(Default)]
struct ReplayCache {
    seen: HashMap<ReplayKey, KerberosTime>,
    // expiry -> keys expiring at that second, for the lazy purge.
    expiry: BTreeMap<KerberosTime, Vec<ReplayKey>>,
    // Latest clock reading seen by any caller. Never moves backwards.
    latest: Option<KerberosTime>,
}

impl ReplayCache {
    /// Callers read the clock before they take the lock, so their readings arrive
    /// out of order. Once an entry is purged for some time, every later check must
    /// be made against that time or later.
    fn advance(&mut self, now: KerberosTime) -> KerberosTime {
        let latest = self.latest.map_or(now, |latest| latest.max(now));
        self.latest = Some(latest);
        latest
    }

    fn purge(&mut self, now: KerberosTime) {
        // Everything that expired strictly before now.
        let live = self.expiry.split_off(&now);
        let expired = std::mem::replace(&mut self.expiry, live);

        let mut purged = 0usize;
        for key in expired.into_values().flatten() {
            self.seen.remove(&key);
            purged += 1;
        }

        if purged > 0 {
            trace!(%purged, remaining = %self.seen.len(), "replay cache purged");
        }
    }
}

pub struct ReplayGuard {
    maximum_clock_skew: Duration,
    cache: Mutex<ReplayCache>,
}

impl ReplayGuard {
    pub fn new(maximum_clock_skew: Duration) -> Self {
        ReplayGuard {
            maximum_clock_skew,
            cache: Mutex::new(ReplayCache::default()),
        }
    }

    pub fn maximum_clock_skew(&self) -> Duration {
        self.maximum_clock_skew
    }

    fn lock(&self) -> MutexGuard<'_, ReplayCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept an authenticator exactly once. The check and the insert happen under
    /// one lock, so two concurrent requests with the same principal and nonce can
    /// never both be accepted.
    pub fn check_and_record(
        &self,
        principal: &str,
        timestamp: KerberosTime,
        nonce: u64,
        now: KerberosTime,
    ) -> Result<(), KrbError> {
        let expires = timestamp.saturating_add(self.maximum_clock_skew);
        let key = (principal.to_string(), nonce);

        let mut cache = self.lock();
        let now = cache.advance(now);

        if !is_within_allowed_skew(now, timestamp, self.maximum_clock_skew) {
            debug!(?timestamp, ?now, "authenticator outside of allowed clock skew");
            return Err(KrbError::ClockSkew);
        }

        cache.purge(now);

        if cache.seen.contains_key(&key) {
            warn!(%principal, %nonce, "replayed authenticator detected");
            return Err(KrbError::ReplayDetected);
        }

        cache.seen.insert(key.clone(), expires);
        cache.expiry.entry(expires).or_default().push(key);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::ReplayGuard;
    use crate::error::KrbError;
    use crate::proto::KerberosTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    const SKEW: Duration = Duration::from_secs(120);

    #[test]
    fn test_replay_rejected() {
        let guard = ReplayGuard::new(SKEW);
        let now = KerberosTime::from_unix_secs(1_000_000);

        assert!(guard.check_and_record("alice", now, 1, now).is_ok());
        assert_eq!(
            guard.check_and_record("alice", now, 1, now),
            Err(KrbError::ReplayDetected)
        );

        // Same nonce from another principal is a different authenticator.
        assert!(guard.check_and_record("bob", now, 1, now).is_ok());
        assert!(guard.check_and_record("alice", now, 2, now).is_ok());
        assert_eq!(guard.len(), 3);
    }

    #[test]
    fn test_clock_skew() {
        let guard = ReplayGuard::new(SKEW);
        let now = KerberosTime::from_unix_secs(1_000_000);

        let too_old = now.saturating_sub(Duration::from_secs(121));
        let too_new = now.saturating_add(Duration::from_secs(121));
        assert_eq!(
            guard.check_and_record("alice", too_old, 1, now),
            Err(KrbError::ClockSkew)
        );
        assert_eq!(
            guard.check_and_record("alice", too_new, 2, now),
            Err(KrbError::ClockSkew)
        );
        assert!(guard.is_empty());

        assert!(guard
            .check_and_record("alice", now.saturating_sub(SKEW), 3, now)
            .is_ok());
    }

    #[test]
    fn test_expired_entries_purged() {
        let guard = ReplayGuard::new(SKEW);
        let t0 = KerberosTime::from_unix_secs(1_000_000);

        assert!(guard.check_and_record("alice", t0, 1, t0).is_ok());
        assert!(guard.check_and_record("alice", t0, 2, t0).is_ok());

        // Still inside the window, still remembered.
        let t1 = t0.saturating_add(SKEW);
        assert_eq!(
            guard.check_and_record("alice", t0, 1, t1),
            Err(KrbError::ReplayDetected)
        );

        // Past the window the entries go, and the skew check covers the replay.
        let t2 = t1.saturating_add(Duration::from_secs(1));
        assert!(guard.check_and_record("bob", t2, 9, t2).is_ok());
        assert_eq!(guard.len(), 1);
        assert_eq!(
            guard.check_and_record("alice", t0, 1, t2),
            Err(KrbError::ClockSkew)
        );
    }

    #[test]
    fn test_late_clock_reading_cannot_revive_purged_entry() {
        let guard = ReplayGuard::new(SKEW);
        let t0 = KerberosTime::from_unix_secs(1_000_000);
        let t_late = t0.saturating_add(Duration::from_secs(121));

        assert!(guard.check_and_record("alice", t0, 1, t0).is_ok());

        // A request that read the clock later takes the lock first and purges
        // alice's entry.
        assert!(guard.check_and_record("bob", t_late, 2, t_late).is_ok());
        assert_eq!(guard.len(), 1);

        // The replay carries an older clock reading that is still inside the
        // window on its own.
        let t_early = t0.saturating_add(SKEW);
        assert_eq!(
            guard.check_and_record("alice", t0, 1, t_early),
            Err(KrbError::ClockSkew)
        );
    }

    #[test]
    fn test_clock_stepping_backwards() {
        let guard = ReplayGuard::new(SKEW);
        let t0 = KerberosTime::from_unix_secs(1_000_000);
        let t1 = t0.saturating_add(Duration::from_secs(60));

        assert!(guard.check_and_record("alice", t1, 1, t1).is_ok());
        // Still remembered after the clock jumps back.
        assert_eq!(
            guard.check_and_record("alice", t1, 1, t0),
            Err(KrbError::ReplayDetected)
        );
        // Fresh authenticators are judged against the latest reading.
        assert!(guard.check_and_record("alice", t0, 2, t0).is_ok());
    }

    #[test]
    fn test_concurrent_same_nonce_accepted_once() {
        let guard = ReplayGuard::new(SKEW);
        let now = KerberosTime::from_unix_secs(1_000_000);
        let accepted = AtomicUsize::new(0);
        let replayed = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..32 {
                s.spawn(|| match guard.check_and_record("alice", now, 42, now) {
                    Ok(()) => {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(KrbError::ReplayDetected) => {
                        replayed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => unreachable!("unexpected {:?}", e),
                });
            }
        });

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(replayed.load(Ordering::SeqCst), 31);
    }

    #[test]
    fn test_concurrent_distinct_nonces_all_accepted() {
        let guard = ReplayGuard::new(SKEW);
        let now = KerberosTime::from_unix_secs(1_000_000);

        thread::scope(|s| {
            let handles: Vec<_> = (0..32u64)
                .map(|nonce| {
                    let guard = &guard;
                    s.spawn(move || guard.check_and_record("alice", now, nonce, now))
                })
                .collect();

            for h in handles {
                assert!(h.join().unwrap().is_ok());
            }
        });

        assert_eq!(guard.len(), 32);
    }
}
