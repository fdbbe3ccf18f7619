//! Facade of MemoryManager. Callers use Handle as the API instead of
//! locking tier state themselves.

use crate::memory_manager::{MemoryManager, TierPool};
use crate::{Reservation, Tier, TierStatus};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Errors during API calls.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The tier cannot cover the requested amount right now. The caller may
    /// reclaim and retry; nothing was granted.
    InsufficientCapacity {
        /// Tier the request was made against.
        tier: Tier,
        /// Amount that was requested.
        requested: u64,
        /// Headroom at the time of the request.
        available: u64,
    },
    /// The tier is not configured on this manager.
    UnknownTier(Tier),
}

/// Cloneable handle for MemoryManager. Each tier has its own lock, so
/// reservations in different tiers proceed concurrently while a single
/// tier is always serialized.
#[derive(Clone)]
pub struct Handle {
    tiers: HashMap<Tier, Arc<Mutex<TierPool>>>,
}

impl Handle {
    pub(crate) fn new(manager: MemoryManager) -> Self {
        let tiers = manager
            .tiers
            .into_iter()
            .map(|pool| (pool.tier(), Arc::new(Mutex::new(pool))))
            .collect();
        Handle { tiers }
    }

    fn tier(&self, tier: Tier) -> Result<&Arc<Mutex<TierPool>>, Error> {
        self.tiers.get(&tier).ok_or(Error::UnknownTier(tier))
    }

    /// Atomically reserve `amount` MB in `tier` for `holder`. Fails fast
    /// with [`Error::InsufficientCapacity`]; there are no partial grants.
    pub fn reserve(&self, tier: Tier, amount: u64, holder: u64) -> Result<Reservation, Error> {
        let mut pool = self.tier(tier)?.lock().unwrap();
        let available = pool.status().available;
        pool.reserve(amount, holder)
            .ok_or(Error::InsufficientCapacity {
                tier,
                requested: amount,
                available,
            })
    }

    /// Return a reservation's capacity to its tier. Consumes the ticket.
    pub fn release(&self, reservation: Reservation) -> Result<(), Error> {
        let mut pool = self.tier(reservation.tier)?.lock().unwrap();
        pool.release(&reservation);
        Ok(())
    }

    /// Capacity accounting for one tier.
    pub fn query(&self, tier: Tier) -> Result<TierStatus, Error> {
        let pool = self.tier(tier)?.lock().unwrap();
        Ok(pool.status())
    }

    /// Record that `holder` was just active with the given rolling success
    /// rate. Feeds the reclaim ranking.
    pub fn update_usage(&self, tier: Tier, holder: u64, success_rate: f64) -> Result<(), Error> {
        let mut pool = self.tier(tier)?.lock().unwrap();
        pool.update_usage(holder, success_rate);
        Ok(())
    }

    /// Select holders to evict so `amount_needed` MB could be reserved in
    /// `tier`. Does not unload anything itself; the caller unloads the
    /// returned holders and releases their reservations.
    pub fn reclaim(&self, tier: Tier, amount_needed: u64) -> Result<Vec<u64>, Error> {
        let pool = self.tier(tier)?.lock().unwrap();
        Ok(pool.reclaim(amount_needed))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::thread;
    use std::time::Duration;

    fn handle() -> Handle {
        MemoryManager::from_tiers(&[(Tier::Compute, 10), (Tier::Working, 100)]).run()
    }

    #[test]
    fn test_reserve_release_cycle() {
        let handle = handle();
        let _weights = handle.reserve(Tier::Compute, 6, 1).unwrap();
        let workspace = handle.reserve(Tier::Compute, 2, 1).unwrap();
        let denied = handle.reserve(Tier::Compute, 4, 2).unwrap_err();
        assert_eq!(
            denied,
            Error::InsufficientCapacity {
                tier: Tier::Compute,
                requested: 4,
                available: 2,
            }
        );
        handle.release(workspace).unwrap();
        let _second = handle.reserve(Tier::Compute, 4, 2).unwrap();
        assert_eq!(handle.query(Tier::Compute).unwrap().allocated, 10);
        assert_eq!(handle.query(Tier::Compute).unwrap().available, 0);
    }

    #[test]
    fn test_unknown_tier() {
        let handle = handle();
        assert_eq!(
            handle.query(Tier::Cache).unwrap_err(),
            Error::UnknownTier(Tier::Cache)
        );
    }

    #[test]
    fn test_tiers_are_independent() {
        let handle = handle();
        let compute = handle.reserve(Tier::Compute, 10, 1).unwrap();
        // Compute being full does not affect Working
        let working = handle.reserve(Tier::Working, 50, 1).unwrap();
        handle.release(compute).unwrap();
        handle.release(working).unwrap();
    }

    #[test]
    fn test_concurrent_reserves_never_oversubscribe() {
        let handle = handle();
        let mut joins = vec![];
        for holder in 0..8 {
            let handle = handle.clone();
            joins.push(thread::spawn(move || {
                for _ in 0..200 {
                    if let Ok(reservation) = handle.reserve(Tier::Compute, 3, holder) {
                        let status = handle.query(Tier::Compute).unwrap();
                        assert!(status.allocated <= status.capacity);
                        handle.release(reservation).unwrap();
                    }
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(handle.query(Tier::Compute).unwrap().allocated, 0);
    }

    #[serial]
    #[test]
    fn test_reclaim_prefers_idle_unreliable_holders() {
        let handle = handle();
        let _a = handle.reserve(Tier::Compute, 4, 1).unwrap();
        let _b = handle.reserve(Tier::Compute, 4, 2).unwrap();
        thread::sleep(Duration::from_millis(20));
        // holder 2 was active recently, holder 1 stays idle
        handle.update_usage(Tier::Compute, 2, 0.5).unwrap();
        let holders = handle.reclaim(Tier::Compute, 6).unwrap();
        assert_eq!(holders, vec![1]);
    }
}
