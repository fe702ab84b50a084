//! Per-cycle memo tables.
//!
//! Direct-mapped, prime-sized, keyed by address modulo length. An entry is
//! only ever written for something that passed full verification in the
//! current cycle, so a hit can skip work but never hide an error.

use crate::address::Address;
use crate::target::RegionDescriptor;

/// Slots in the verified-object table
pub const OBJECT_CACHE_SIZE: usize = 61;
/// Slots in each verified-class table
pub const CLASS_CACHE_SIZE: usize = 19;

/// Direct-mapped set of addresses.
#[derive(Debug, Clone)]
struct DirectMapped<const N: usize> {
    entries: [Address; N],
}

impl<const N: usize> DirectMapped<N> {
    fn new() -> Self {
        Self {
            entries: [Address::NULL; N],
        }
    }

    #[inline]
    fn index(address: Address) -> usize {
        (address.raw() % N as u64) as usize
    }

    #[inline]
    fn contains(&self, address: Address) -> bool {
        !address.is_null() && self.entries[Self::index(address)] == address
    }

    #[inline]
    fn insert(&mut self, address: Address) {
        self.entries[Self::index(address)] = address;
    }

    fn clear(&mut self) {
        self.entries = [Address::NULL; N];
    }
}

/// The three verification memo tables.
#[derive(Debug, Clone)]
pub struct VerificationCache {
    objects: DirectMapped<OBJECT_CACHE_SIZE>,
    classes_allow_undead: DirectMapped<CLASS_CACHE_SIZE>,
    classes: DirectMapped<CLASS_CACHE_SIZE>,
}

impl VerificationCache {
    /// Empty tables
    pub fn new() -> Self {
        Self {
            objects: DirectMapped::new(),
            classes_allow_undead: DirectMapped::new(),
            classes: DirectMapped::new(),
        }
    }

    /// Was `object` verified this cycle
    pub fn has_object(&self, object: Address) -> bool {
        self.objects.contains(object)
    }

    /// Record a verified object
    pub fn record_object(&mut self, object: Address) {
        self.objects.insert(object);
    }

    /// Was `class` verified this cycle under the same undead policy.
    ///
    /// The two tables are independent: an entry made with
    /// `allow_undead = false` does not answer an `allow_undead = true` query.
    pub fn has_class(&self, class: Address, allow_undead: bool) -> bool {
        if allow_undead {
            self.classes_allow_undead.contains(class)
        } else {
            self.classes.contains(class)
        }
    }

    /// Record a verified class
    pub fn record_class(&mut self, class: Address, allow_undead: bool) {
        if allow_undead {
            self.classes_allow_undead.insert(class);
        } else {
            self.classes.insert(class);
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.objects.clear();
        self.classes_allow_undead.clear();
        self.classes.clear();
    }
}

impl Default for VerificationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One-slot cache of the last region found.
#[derive(Debug, Clone, Default)]
pub struct RegionCache {
    last: Option<RegionDescriptor>,
}

impl RegionCache {
    /// Cached region if it contains `address`
    pub fn lookup(&self, address: Address) -> Option<RegionDescriptor> {
        self.last.filter(|region| region.contains(address))
    }

    /// Remember `region`
    pub fn store(&mut self, region: RegionDescriptor) {
        self.last = Some(region);
    }

    /// Drop the cached region
    pub fn clear(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Generation;

    #[test]
    fn test_class_tables_are_independent() {
        let mut cache = VerificationCache::new();
        let class = Address::new(0x4000);
        cache.record_class(class, false);
        assert!(cache.has_class(class, false));
        assert!(!cache.has_class(class, true));
    }

    #[test]
    fn test_collision_evicts() {
        let mut cache = VerificationCache::new();
        let a = Address::new(8);
        let b = Address::new(8 + OBJECT_CACHE_SIZE as u64);
        cache.record_object(a);
        cache.record_object(b);
        assert!(!cache.has_object(a));
        assert!(cache.has_object(b));
        cache.clear();
        assert!(!cache.has_object(b));
    }

    #[test]
    fn test_region_cache() {
        let mut cache = RegionCache::default();
        cache.store(RegionDescriptor {
            id: 0,
            start: Address::new(0x1000),
            size: 0x1000,
            object_alignment: 8,
            generation: Generation::New,
        });
        assert!(cache.lookup(Address::new(0x1800)).is_some());
        assert!(cache.lookup(Address::new(0x2000)).is_none());
        cache.clear();
        assert!(cache.lookup(Address::new(0x1800)).is_none());
    }
}
