//! Address pool and lease tracking.
//!
//! [`LeasePool`] is the plain data structure: one [`LeaseRecord`] per address
//! in a contiguous range, created once and never resized. Every operation
//! takes the current time as a parameter so expiry is deterministic.
//!
//! [`Leases`] is the shared handle the server uses. It guards the whole pool
//! with one [`RwLock`], so the accept loop and the expiry sweeper never
//! observe a half-applied update.
//!
//! # Record States
//!
//! A record is either leased or unleased; the `leased` flag is authoritative.
//! Releasing or expiring a record clears the flag but keeps the owner, so
//! the same client is steered back to its previous address.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::HardwareAddress;

/// Largest pool a [`LeasePool`] will allocate records for (a /16).
pub const MAX_POOL_SIZE: u64 = 1 << 16;

/// One address in the pool and its lease state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub address: Ipv4Addr,

    /// Authoritative lease state. An unleased record may still carry a stale
    /// owner and expiration.
    pub leased: bool,

    /// The last owner, [`HardwareAddress::EMPTY`] if never leased.
    pub owner: HardwareAddress,

    /// Absolute expiration; the Unix epoch for a never-leased record.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn unleased(address: Ipv4Addr) -> Self {
        Self {
            address,
            leased: false,
            owner: HardwareAddress::EMPTY,
            expires_at: DateTime::default(),
        }
    }

    /// Returns true if this record is leased to `owner`.
    pub fn is_leased_to(&self, owner: &HardwareAddress) -> bool {
        self.leased && self.owner == *owner
    }

    /// Returns true if the lease has run out at `now` but was not swept yet.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.leased && self.expires_at <= now
    }

    /// Seconds left on the lease at `now`, 0 if unleased or expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        if !self.leased {
            return 0;
        }
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// A fixed, ordered set of lease records covering one address range.
#[derive(Debug, Clone)]
pub struct LeasePool {
    records: Vec<LeaseRecord>,
}

impl LeasePool {
    /// Creates an unleased record for every address from `start` to `end`
    /// inclusive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `start` is after `end` or the
    /// range holds more than [`MAX_POOL_SIZE`] addresses.
    pub fn from_range(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        let first = u32::from(start);
        let last = u32::from(end);
        if first > last {
            return Err(Error::InvalidConfig(format!(
                "pool start {} is after pool end {}",
                start, end
            )));
        }

        let size = u64::from(last - first) + 1;
        if size > MAX_POOL_SIZE {
            return Err(Error::InvalidConfig(format!(
                "pool {}-{} holds {} addresses, at most {} are supported",
                start, end, size, MAX_POOL_SIZE
            )));
        }

        let records = (first..=last)
            .map(|address| LeaseRecord::unleased(Ipv4Addr::from(address)))
            .collect();
        Ok(Self { records })
    }

    /// Creates a pool from a three-octet prefix such as `"192.168.1"` (a
    /// trailing dot is accepted) and an inclusive range of last octets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the prefix is not three octets or
    /// `first_suffix` is after `last_suffix`.
    pub fn from_suffix_range(prefix: &str, first_suffix: u8, last_suffix: u8) -> Result<Self> {
        let octets: Vec<u8> = prefix
            .trim_end_matches('.')
            .split('.')
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::InvalidConfig(format!("invalid address prefix {:?}", prefix)))?;

        let [a, b, c] = octets[..] else {
            return Err(Error::InvalidConfig(format!(
                "address prefix {:?} must have three octets",
                prefix
            )));
        };

        Self::from_range(
            Ipv4Addr::new(a, b, c, first_suffix),
            Ipv4Addr::new(a, b, c, last_suffix),
        )
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_range(config.pool_start, config.pool_end)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in pool order.
    pub fn records(&self) -> &[LeaseRecord] {
        &self.records
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.index_of(address).is_some()
    }

    fn index_of(&self, address: Ipv4Addr) -> Option<usize> {
        let first = u32::from(self.records.first()?.address);
        let offset = u32::from(address).checked_sub(first)? as usize;
        (offset < self.records.len()).then_some(offset)
    }

    /// First unleased address in pool order.
    pub fn find_available(&self) -> Option<Ipv4Addr> {
        self.records
            .iter()
            .find(|record| !record.leased)
            .map(|record| record.address)
    }

    /// Returns true only if `address` is in the pool and unleased.
    pub fn is_available_in_pool(&self, address: Ipv4Addr) -> bool {
        self.record_for(address).is_some_and(|record| !record.leased)
    }

    pub fn record_for(&self, address: Ipv4Addr) -> Option<&LeaseRecord> {
        self.index_of(address).map(|index| &self.records[index])
    }

    /// The record owned by `owner`, preferring one that is currently leased
    /// over a released one that merely retains the owner.
    pub fn record_for_owner(&self, owner: &HardwareAddress) -> Option<&LeaseRecord> {
        if owner.is_empty() {
            return None;
        }
        self.records
            .iter()
            .find(|record| record.is_leased_to(owner))
            .or_else(|| self.records.iter().find(|record| record.owner == *owner))
    }

    /// The record currently leased to `owner`, if any.
    pub fn active_lease_for(&self, owner: &HardwareAddress) -> Option<&LeaseRecord> {
        self.record_for_owner(owner).filter(|record| record.leased)
    }

    /// Picks an address to offer.
    ///
    /// In order of preference: the requested address if it is in the pool
    /// and unleased, the unleased record this owner held before, then the
    /// first unleased record.
    pub fn select_offer(
        &self,
        owner: &HardwareAddress,
        requested: Option<Ipv4Addr>,
    ) -> Option<Ipv4Addr> {
        if let Some(address) = requested
            && self.is_available_in_pool(address)
        {
            return Some(address);
        }

        if let Some(previous) = self.record_for_owner(owner)
            && !previous.leased
        {
            return Some(previous.address);
        }

        self.find_available()
    }

    /// Leases `address` to `owner` until `now + duration`.
    ///
    /// Succeeds if the record is unleased or already leased to `owner`
    /// (renewal). Any other record still leased to `owner` is returned to
    /// the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if `address` is not in the pool
    /// - [`Error::OwnershipConflict`] if it is leased to someone else
    /// - [`Error::MissingOwner`] if `owner` is all zeros
    pub fn commit(
        &mut self,
        owner: &HardwareAddress,
        address: Ipv4Addr,
        now: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Result<&LeaseRecord> {
        if owner.is_empty() {
            return Err(Error::MissingOwner { address });
        }

        let index = self
            .index_of(address)
            .ok_or(Error::AddressOutOfRange(address))?;

        let record = &self.records[index];
        if record.leased && record.owner != *owner {
            return Err(Error::OwnershipConflict { address });
        }

        for other in self
            .records
            .iter_mut()
            .filter(|other| other.address != address && other.is_leased_to(owner))
        {
            debug!(address = %other.address, owner = %owner, "Returning superseded lease to pool");
            other.leased = false;
            other.expires_at = now;
        }

        let record = &mut self.records[index];
        record.leased = true;
        record.owner = *owner;
        record.expires_at = now + duration;
        Ok(record)
    }

    /// Marks the record leased to `owner` as unleased, keeping the owner.
    ///
    /// Returns the released address, or `None` if `owner` holds no lease.
    pub fn release(&mut self, owner: &HardwareAddress, now: DateTime<Utc>) -> Option<Ipv4Addr> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.is_leased_to(owner))?;
        record.leased = false;
        record.expires_at = now;
        Some(record.address)
    }

    /// Frees every leased record whose expiration is at or before `now`.
    ///
    /// Returns the number of records freed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut freed = 0;
        for record in self
            .records
            .iter_mut()
            .filter(|record| record.is_expired_at(now))
        {
            record.leased = false;
            freed += 1;
        }
        freed
    }

    pub fn leased_count(&self) -> usize {
        self.records.iter().filter(|record| record.leased).count()
    }
}

/// Shared, lock-guarded handle to a [`LeasePool`].
///
/// Clones share the same pool. Methods read the wall clock with
/// [`Utc::now`] and return owned snapshots of records.
///
/// # Example
///
/// ```no_run
/// use leasewire::{HardwareAddress, LeasePool, Leases};
///
/// # async fn example() -> leasewire::Result<()> {
/// let leases = Leases::new(LeasePool::from_suffix_range("192.168.1", 100, 102)?, 3600);
///
/// let owner = HardwareAddress::from_mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
/// if let Some(address) = leases.select_offer(&owner, None).await {
///     leases.commit(&owner, address).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Leases {
    pool: Arc<RwLock<LeasePool>>,
    lease_duration_seconds: u32,
}

impl Leases {
    pub fn new(pool: LeasePool, lease_duration_seconds: u32) -> Self {
        Self {
            pool: Arc::new(RwLock::new(pool)),
            lease_duration_seconds,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            LeasePool::from_config(config)?,
            config.lease_duration_seconds,
        ))
    }

    pub fn lease_duration_seconds(&self) -> u32 {
        self.lease_duration_seconds
    }

    pub async fn find_available(&self) -> Option<Ipv4Addr> {
        self.pool.read().await.find_available()
    }

    pub async fn is_available_in_pool(&self, address: Ipv4Addr) -> bool {
        self.pool.read().await.is_available_in_pool(address)
    }

    pub async fn record_for(&self, address: Ipv4Addr) -> Option<LeaseRecord> {
        self.pool.read().await.record_for(address).cloned()
    }

    pub async fn record_for_owner(&self, owner: &HardwareAddress) -> Option<LeaseRecord> {
        self.pool.read().await.record_for_owner(owner).cloned()
    }

    pub async fn active_lease_for(&self, owner: &HardwareAddress) -> Option<LeaseRecord> {
        self.pool.read().await.active_lease_for(owner).cloned()
    }

    pub async fn select_offer(
        &self,
        owner: &HardwareAddress,
        requested: Option<Ipv4Addr>,
    ) -> Option<Ipv4Addr> {
        self.pool.read().await.select_offer(owner, requested)
    }

    /// Leases `address` to `owner` for the configured duration, starting now.
    pub async fn commit(&self, owner: &HardwareAddress, address: Ipv4Addr) -> Result<LeaseRecord> {
        let duration = TimeDelta::seconds(i64::from(self.lease_duration_seconds));
        let mut pool = self.pool.write().await;
        pool.commit(owner, address, Utc::now(), duration).cloned()
    }

    pub async fn release(&self, owner: &HardwareAddress) -> Option<Ipv4Addr> {
        self.pool.write().await.release(owner, Utc::now())
    }

    pub async fn sweep_expired(&self) -> usize {
        self.pool.write().await.sweep_expired(Utc::now())
    }

    pub async fn leased_count(&self) -> usize {
        self.pool.read().await.leased_count()
    }

    /// Copies every record, in pool order.
    pub async fn snapshot(&self) -> Vec<LeaseRecord> {
        self.pool.read().await.records().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(last: u8) -> HardwareAddress {
        HardwareAddress::from_mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn small_pool() -> LeasePool {
        LeasePool::from_suffix_range("192.168.1", 100, 102).unwrap()
    }

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    fn ten_seconds() -> TimeDelta {
        TimeDelta::seconds(10)
    }

    #[test]
    fn test_initialize_from_suffix_range() {
        let pool = small_pool();
        assert_eq!(pool.len(), 3);
        for (record, last) in pool.records().iter().zip(100u8..) {
            assert_eq!(record.address, addr(last));
            assert!(!record.leased);
            assert!(record.owner.is_empty());
            assert_eq!(record.expires_at, DateTime::<Utc>::default());
        }

        let dotted = LeasePool::from_suffix_range("10.0.0.", 5, 5).unwrap();
        assert_eq!(dotted.records()[0].address, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(LeasePool::from_suffix_range("192.168.1", 102, 100).is_err());
        assert!(LeasePool::from_suffix_range("192.168", 1, 2).is_err());
        assert!(LeasePool::from_suffix_range("192.168.x", 1, 2).is_err());
        assert!(LeasePool::from_range(addr(10), addr(9)).is_err());
        assert!(LeasePool::from_range(Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST).is_err());
    }

    #[test]
    fn test_lookups() {
        let pool = small_pool();
        assert!(pool.contains(addr(101)));
        assert!(!pool.contains(addr(99)));
        assert!(!pool.contains(addr(103)));
        assert!(pool.record_for(addr(50)).is_none());
        assert!(pool.record_for_owner(&owner(1)).is_none());
        assert!(pool.record_for_owner(&HardwareAddress::EMPTY).is_none());
    }

    #[test]
    fn test_find_available_skips_leased() {
        let mut pool = small_pool();
        let now = Utc::now();
        assert_eq!(pool.find_available(), Some(addr(100)));

        pool.commit(&owner(1), addr(100), now, ten_seconds()).unwrap();
        assert_eq!(pool.find_available(), Some(addr(101)));
        assert!(!pool.is_available_in_pool(addr(100)));
        assert!(pool.is_available_in_pool(addr(101)));
        assert!(!pool.is_available_in_pool(addr(200)));

        pool.commit(&owner(2), addr(101), now, ten_seconds()).unwrap();
        pool.commit(&owner(3), addr(102), now, ten_seconds()).unwrap();
        assert_eq!(pool.find_available(), None);
    }

    #[test]
    fn test_commit_sets_owner_and_expiry() {
        let mut pool = small_pool();
        let now = Utc::now();
        let record = pool
            .commit(&owner(1), addr(101), now, ten_seconds())
            .unwrap()
            .clone();

        assert!(record.leased);
        assert_eq!(record.owner, owner(1));
        assert_eq!(record.expires_at, now + ten_seconds());
        assert!(record.expires_at > now);
        assert_eq!(record.remaining_seconds(now), 10);
    }

    #[test]
    fn test_commit_conflict_and_out_of_range() {
        let mut pool = small_pool();
        let now = Utc::now();
        pool.commit(&owner(1), addr(100), now, ten_seconds()).unwrap();

        assert!(matches!(
            pool.commit(&owner(2), addr(100), now, ten_seconds()),
            Err(Error::OwnershipConflict { address }) if address == addr(100)
        ));
        assert!(matches!(
            pool.commit(&owner(2), addr(150), now, ten_seconds()),
            Err(Error::AddressOutOfRange(address)) if address == addr(150)
        ));
        assert_eq!(pool.record_for(addr(100)).unwrap().owner, owner(1));
    }

    #[test]
    fn test_commit_rejects_empty_owner() {
        let mut pool = small_pool();
        assert!(matches!(
            pool.commit(&HardwareAddress::EMPTY, addr(100), Utc::now(), ten_seconds()),
            Err(Error::MissingOwner { address }) if address == addr(100)
        ));
        assert!(!pool.record_for(addr(100)).unwrap().leased);
        assert_eq!(pool.leased_count(), 0);
    }

    #[test]
    fn test_renewal_is_idempotent() {
        let mut pool = small_pool();
        let now = Utc::now();
        pool.commit(&owner(1), addr(100), now, ten_seconds()).unwrap();

        let later = now + TimeDelta::seconds(5);
        let record = pool
            .commit(&owner(1), addr(100), later, ten_seconds())
            .unwrap();
        assert_eq!(record.expires_at, later + ten_seconds());
        assert_eq!(pool.leased_count(), 1);
    }

    #[test]
    fn test_one_lease_per_owner() {
        let mut pool = small_pool();
        let now = Utc::now();
        pool.commit(&owner(1), addr(100), now, ten_seconds()).unwrap();
        pool.commit(&owner(1), addr(102), now, ten_seconds()).unwrap();

        assert!(!pool.record_for(addr(100)).unwrap().leased);
        assert!(pool.record_for(addr(102)).unwrap().leased);
        assert_eq!(pool.leased_count(), 1);
        assert_eq!(
            pool.record_for_owner(&owner(1)).unwrap().address,
            addr(102)
        );
    }

    #[test]
    fn test_release_retains_owner() {
        let mut pool = small_pool();
        let now = Utc::now();
        pool.commit(&owner(1), addr(100), now, ten_seconds()).unwrap();

        let released_at = now + TimeDelta::seconds(1);
        assert_eq!(pool.release(&owner(1), released_at), Some(addr(100)));

        let record = pool.record_for(addr(100)).unwrap();
        assert!(!record.leased);
        assert_eq!(record.owner, owner(1));
        assert_eq!(record.expires_at, released_at);
        assert!(pool.active_lease_for(&owner(1)).is_none());
        assert_eq!(pool.record_for_owner(&owner(1)).unwrap().address, addr(100));

        assert_eq!(pool.release(&owner(1), released_at), None);
        assert_eq!(pool.release(&owner(9), released_at), None);
    }

    #[test]
    fn test_select_offer_preferences() {
        let mut pool = small_pool();
        let now = Utc::now();

        assert_eq!(pool.select_offer(&owner(1), Some(addr(102))), Some(addr(102)));
        assert_eq!(pool.select_offer(&owner(1), Some(addr(50))), Some(addr(100)));
        assert_eq!(
            pool.select_offer(&owner(1), Some(Ipv4Addr::UNSPECIFIED)),
            Some(addr(100))
        );

        pool.commit(&owner(1), addr(101), now, ten_seconds()).unwrap();
        pool.release(&owner(1), now);
        assert_eq!(pool.select_offer(&owner(1), None), Some(addr(101)));
        assert_eq!(pool.select_offer(&owner(2), None), Some(addr(100)));

        pool.commit(&owner(2), addr(101), now, ten_seconds()).unwrap();
        assert_eq!(pool.select_offer(&owner(1), Some(addr(101))), Some(addr(100)));
    }

    #[test]
    fn test_sweep_expiry_boundary() {
        let mut pool = small_pool();
        let t0 = Utc::now();
        let lease = TimeDelta::seconds(1);
        pool.commit(&owner(1), addr(100), t0, lease).unwrap();
        pool.commit(&owner(2), addr(101), t0, TimeDelta::seconds(60)).unwrap();

        assert_eq!(pool.sweep_expired(t0 + lease - TimeDelta::milliseconds(1)), 0);
        assert!(pool.record_for(addr(100)).unwrap().leased);
        assert!(pool.record_for(addr(100)).unwrap().is_leased_to(&owner(1)));

        assert_eq!(pool.sweep_expired(t0 + lease), 1);
        let record = pool.record_for(addr(100)).unwrap();
        assert!(!record.leased);
        assert_eq!(record.owner, owner(1));
        assert!(pool.record_for(addr(101)).unwrap().leased);
        assert_eq!(pool.find_available(), Some(addr(100)));

        assert_eq!(pool.sweep_expired(t0 + lease), 0);
    }

    #[test]
    fn test_expired_but_unswept_still_leased() {
        let mut pool = small_pool();
        let t0 = Utc::now();
        pool.commit(&owner(1), addr(100), t0, TimeDelta::seconds(1)).unwrap();

        let later = t0 + TimeDelta::seconds(5);
        assert!(pool.record_for(addr(100)).unwrap().is_expired_at(later));
        assert!(matches!(
            pool.commit(&owner(2), addr(100), later, ten_seconds()),
            Err(Error::OwnershipConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_handle() {
        let leases = Leases::new(small_pool(), 3600);
        let clone = leases.clone();

        let record = leases.commit(&owner(1), addr(100)).await.unwrap();
        let remaining = record.remaining_seconds(Utc::now());
        assert!((3590..=3600).contains(&remaining));

        assert!(clone.active_lease_for(&owner(1)).await.is_some());
        assert!(!clone.is_available_in_pool(addr(100)).await);
        assert_eq!(clone.find_available().await, Some(addr(101)));
        assert_eq!(clone.leased_count().await, 1);
        assert_eq!(clone.sweep_expired().await, 0);

        assert_eq!(clone.release(&owner(1)).await, Some(addr(100)));
        assert_eq!(leases.leased_count().await, 0);
        assert_eq!(leases.snapshot().await.len(), 3);
        assert_eq!(leases.record_for(addr(100)).await.unwrap().owner, owner(1));
    }

    #[tokio::test]
    async fn test_concurrent_commits() {
        let leases = Leases::new(LeasePool::from_range(addr(100), addr(110)).unwrap(), 3600);

        let mut handles = vec![];
        for index in 0..5 {
            let leases = leases.clone();
            handles.push(tokio::spawn(async move {
                let client = owner(index);
                loop {
                    let address = leases
                        .select_offer(&client, None)
                        .await
                        .ok_or(Error::PoolExhausted)?;
                    match leases.commit(&client, address).await {
                        Ok(record) => return Ok::<_, Error>(record.address),
                        Err(Error::OwnershipConflict { .. }) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }));
        }

        let mut allocated = std::collections::HashSet::new();
        for handle in handles {
            let address = handle.await.unwrap().unwrap();
            assert!(allocated.insert(address), "Duplicate address leased: {}", address);
        }
        assert_eq!(leases.leased_count().await, 5);
    }
}
