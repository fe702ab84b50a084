//! Foreign addresses.
//!
//! Every pointer the verifier handles belongs to the runtime being
//! examined, which may be live or a post-mortem image. An [`Address`] is
//! only ever a number: there is no way to dereference it directly, all
//! reads go through the fallible capability traits in [`crate::target`].

use std::fmt;
use std::ops::{Add, Sub};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Size of a target pointer / heap slot in bytes.
pub const POINTER_SIZE: u64 = 8;

/// An address in the target runtime's address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    /// The null address
    pub const NULL: Address = Address(0);

    /// Wrap a raw address value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Is this the null address
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `true` when `self` is a multiple of `alignment`.
    ///
    /// An alignment of zero never matches.
    pub const fn is_aligned(self, alignment: u64) -> bool {
        alignment != 0 && self.0 % alignment == 0
    }

    /// `true` when no bit of `mask` is set in the address.
    pub const fn is_masked_clear(self, mask: u64) -> bool {
        self.0 & mask == 0
    }

    /// Address `bytes` further on, or `None` on overflow
    pub fn checked_add(self, bytes: u64) -> Option<Address> {
        self.0.checked_add(bytes).map(Address)
    }

    /// Address of the `index`th pointer-sized slot after `self`
    pub fn slot(self, index: u64) -> Address {
        Address(self.0.wrapping_add(index.wrapping_mul(POINTER_SIZE)))
    }

    /// Distance in bytes from `self` up to `end`, zero when `end` is below.
    pub fn bytes_until(self, end: Address) -> u64 {
        end.0.saturating_sub(self.0)
    }

    /// Clear the bits of `mask`
    pub const fn untagged(self, mask: u64) -> Address {
        Address(self.0 & !mask)
    }
}

impl From<u64> for Address {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl Add<u64> for Address {
    type Output = Address;

    fn add(self, rhs: u64) -> Address {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<Address> for Address {
    type Output = u64;

    fn sub(self, rhs: Address) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// Heap images store addresses as hex strings so dumps stay readable and
// can be used as JSON object keys.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AddressVisitor)
    }
}

struct AddressVisitor;

impl Visitor<'_> for AddressVisitor {
    type Value = Address;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an address as a hex string (\"0x1000\"), decimal string or integer")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Address, E> {
        Ok(Address(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Address, E> {
        u64::try_from(value)
            .map(Address)
            .map_err(|_| E::custom(format!("negative address {value}")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Address, E> {
        parse_address(value).ok_or_else(|| E::custom(format!("invalid address {value:?}")))
    }
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_address(text: &str) -> Option<Address> {
    let text = text.trim();
    let raw = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok()?,
        None => text.replace('_', "").parse().ok()?,
    };
    Some(Address(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_power_of_two_alignment_is_mask_clear(raw in any::<u64>(), shift in 0u32..12) {
            let alignment = 1u64 << shift;
            let address = Address::new(raw);
            prop_assert_eq!(address.is_aligned(alignment), address.is_masked_clear(alignment - 1));
        }

        #[test]
        fn prop_untagged_clears_only_the_mask(raw in any::<u64>(), mask in 0u64..256) {
            let untagged = Address::new(raw).untagged(mask);
            prop_assert!(untagged.is_masked_clear(mask));
            prop_assert_eq!(untagged.raw() | (raw & mask), raw);
        }

        #[test]
        fn prop_slot_steps_by_pointer_size(raw in 0u64..(1 << 48), index in 0u64..4096) {
            let base = Address::new(raw);
            prop_assert_eq!(base.slot(index) - base, index * POINTER_SIZE);
            prop_assert_eq!(base.bytes_until(base.slot(index)), index * POINTER_SIZE);
        }

        #[test]
        fn prop_serde_preserves_value(raw in any::<u64>()) {
            let json = serde_json::to_string(&Address::new(raw)).unwrap();
            let back: Address = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.raw(), raw);
        }
    }

    #[test]
    fn test_alignment() {
        assert!(Address::new(0x1000).is_aligned(8));
        assert!(!Address::new(0x1004).is_aligned(8));
        assert!(!Address::new(0x1000).is_aligned(0));
        assert!(Address::new(0x1100).is_masked_clear(0xFF));
        assert!(!Address::new(0x1108).is_masked_clear(0xFF));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x10"), Some(Address::new(16)));
        assert_eq!(parse_address("4096"), Some(Address::new(4096)));
        assert_eq!(parse_address("0x1_000"), Some(Address::new(0x1000)));
        assert_eq!(parse_address("zz"), None);
    }

    #[test]
    fn test_serde_hex_round_trip() {
        let json = serde_json::to_string(&Address::new(0xdead0)).unwrap();
        assert_eq!(json, "\"0xdead0\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Address::new(0xdead0));
        let from_int: Address = serde_json::from_str("4096").unwrap();
        assert_eq!(from_int, Address::new(4096));
    }
}
