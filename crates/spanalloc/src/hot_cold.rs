//! Hot/cold access-frequency hints.
//!
//! A hint byte accompanies an allocation request and steers it into a
//! dedicated locality pool: values at or above the midpoint are hot,
//! values below are cold. The classification is fixed for the lifetime
//! of the object and is independent of whether the allocation was also
//! picked for sampling. Because the pools draw from disjoint page
//! ranges, an address classified hot is never simultaneously valid as a
//! cold allocation and vice versa.

use crate::span::Locality;

/// Access-frequency hint byte attached to an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HotCold(pub u8);

impl HotCold {
    /// The coldest hint.
    pub const COLDEST: Self = Self(0);

    /// The hottest hint.
    pub const HOTTEST: Self = Self(u8::MAX);

    /// First value classified as hot.
    pub const MIDPOINT: u8 = 128;

    /// Whether this hint is classified hot.
    #[inline]
    #[must_use]
    pub const fn is_hot(self) -> bool {
        self.0 >= Self::MIDPOINT
    }

    /// The locality pool this hint selects.
    #[inline]
    #[must_use]
    pub const fn locality(self) -> Locality {
        if self.is_hot() {
            Locality::Hot
        } else {
            Locality::Cold
        }
    }
}

impl From<u8> for HotCold {
    fn from(value: u8) -> Self {
        Self(value)
    }
}
