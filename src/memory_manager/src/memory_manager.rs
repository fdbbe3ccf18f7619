use crate::idmap::IdMap;
use crate::{Reservation, Tier, TierStatus};
use std::time::Instant;

/// Bookkeeping for one active reservation.
#[derive(Debug)]
pub(crate) struct ReservationRecord {
    amount: u64,
    holder: u64,
    granted_at: Instant,
    last_used: Instant,
    success_rate: f64,
}

/// One tier's capacity accounting. All mutation of a tier happens on this
/// struct behind a single lock, so reservations can never oversubscribe it.
#[derive(Debug)]
pub(crate) struct TierPool {
    tier: Tier,
    capacity: u64,
    allocated: u64,
    records: IdMap<ReservationRecord>,
}

impl TierPool {
    fn new(tier: Tier, capacity: u64) -> Self {
        TierPool {
            tier,
            capacity,
            allocated: 0,
            records: IdMap::new(),
        }
    }

    /// Fail-fast grant: either the full amount fits or nothing is taken.
    pub fn reserve(&mut self, amount: u64, holder: u64) -> Option<Reservation> {
        if self.allocated + amount > self.capacity {
            return None;
        }
        let now = Instant::now();
        let id = self.records.insert(ReservationRecord {
            amount,
            holder,
            granted_at: now,
            last_used: now,
            success_rate: 1.0,
        });
        self.allocated += amount;
        log::debug!(
            "Reserved {} MB of {:?} for holder {} (allocated {}/{})",
            amount,
            self.tier,
            holder,
            self.allocated,
            self.capacity
        );
        Some(Reservation {
            id,
            tier: self.tier,
            amount,
            holder,
        })
    }

    pub fn release(&mut self, reservation: &Reservation) {
        match self.records.remove(reservation.id) {
            Some(record) => {
                self.allocated -= record.amount;
                log::debug!(
                    "Released {} MB of {:?} from holder {} after {:?} (allocated {}/{})",
                    record.amount,
                    self.tier,
                    record.holder,
                    record.granted_at.elapsed(),
                    self.allocated,
                    self.capacity
                );
            }
            None => {
                log::warn!(
                    "Stale release of reservation {} in {:?}, ignored",
                    reservation.id,
                    self.tier
                );
            }
        }
    }

    pub fn status(&self) -> TierStatus {
        TierStatus {
            capacity: self.capacity,
            allocated: self.allocated,
            available: self.capacity - self.allocated,
        }
    }

    /// Record holder activity so reclaim can rank eviction candidates.
    pub fn update_usage(&mut self, holder: u64, success_rate: f64) {
        let now = Instant::now();
        for (_, record) in self.records.iter_mut() {
            if record.holder == holder {
                record.last_used = now;
                record.success_rate = success_rate;
            }
        }
    }

    /// Select holders to evict until the shortfall for `amount_needed` is
    /// covered. Candidates are ranked longest-idle first, least-reliable
    /// first on ties. Holders are only selected here; the caller performs
    /// the unload and releases the reservations.
    pub fn reclaim(&self, amount_needed: u64) -> Vec<u64> {
        let available = self.capacity - self.allocated;
        let mut shortfall = amount_needed.saturating_sub(available);
        if shortfall == 0 {
            return vec![];
        }
        let mut candidates: Vec<(&u64, &ReservationRecord)> = self.records.iter().collect();
        candidates.sort_by(|(_, a), (_, b)| {
            a.last_used.cmp(&b.last_used).then(
                a.success_rate
                    .partial_cmp(&b.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        let mut holders = vec![];
        for (_, record) in candidates {
            if shortfall == 0 {
                break;
            }
            if !holders.contains(&record.holder) {
                holders.push(record.holder);
            }
            shortfall = shortfall.saturating_sub(record.amount);
        }
        log::info!(
            "Reclaim in {:?} needs {} MB across {} reservations, selected holders {:?}",
            self.tier,
            amount_needed,
            self.records.len(),
            holders
        );
        holders
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }
}

/// MemoryManager owns the configured tiers. It is consumed by [`run`] which
/// hands out the cloneable [`crate::Handle`] facade.
///
/// [`run`]: MemoryManager::run
pub struct MemoryManager {
    pub(crate) tiers: Vec<TierPool>,
}

impl MemoryManager {
    /// Create a manager from `(tier, capacity_mb)` pairs. Capacities are
    /// static configuration; they are never re-partitioned at runtime.
    pub fn from_tiers(capacities: &[(Tier, u64)]) -> Self {
        let tiers = capacities
            .iter()
            .map(|&(tier, capacity)| TierPool::new(tier, capacity))
            .collect();
        MemoryManager { tiers }
    }

    /// Wrap the manager in its API facade.
    pub fn run(self) -> crate::Handle {
        crate::Handle::new(self)
    }
}
