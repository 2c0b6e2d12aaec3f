use crate::AddressRange;
use std::cmp::Ordering;
use thiserror::Error;

/// Generic map of 32-bit address ranges to values of type `T`.
///
/// The ranges cannot overlap. Lookups are a binary search over the ranges sorted by start address,
/// so they are cheap enough to run on the fault path and never allocate.
#[derive(Debug, Clone)]
pub struct AddressMap<T> {
    ordered_ranges: Vec<(AddressRange, T)>,
}

impl<T> Default for AddressMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AddressMap<T> {
    /// Create new empty map.
    pub fn new() -> Self {
        Self {
            ordered_ranges: Vec::new(),
        }
    }

    /// Returns the value that the address range containing `address` maps to, or `None` if that
    /// address is not covered by any range.
    pub fn value(&self, address: u32) -> Option<&T> {
        self.range_value(address).map(|(_, value)| value)
    }

    /// Returns the address range that contains `address` together with the value it maps to, or
    /// `None` if `address` lies in a vacant region.
    pub fn range_value(&self, address: u32) -> Option<(AddressRange, &T)> {
        self.ordered_ranges
            .binary_search_by(|(range, _)| {
                if address < range.start() {
                    Ordering::Greater
                } else if address <= range.end() {
                    Ordering::Equal
                } else {
                    Ordering::Less
                }
            })
            .ok()
            .map(|index| {
                let (range, value) = &self.ordered_ranges[index];
                (*range, value)
            })
    }

    /// Iterate over all `(range, value)` pairs in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (AddressRange, &T)> {
        self.ordered_ranges.iter().map(|(range, value)| (*range, value))
    }

    pub fn len(&self) -> usize {
        self.ordered_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_ranges.is_empty()
    }
}

impl<T> TryFrom<Vec<(AddressRange, T)>> for AddressMap<T> {
    type Error = AddressMapError;

    fn try_from(mut value: Vec<(AddressRange, T)>) -> Result<Self, Self::Error> {
        value.sort_by_key(|(range, _)| range.start());

        for pair in value.windows(2) {
            let (prev_range, _) = &pair[0];
            let (range, _) = &pair[1];
            if prev_range.overlaps(*range) {
                return Err(AddressMapError::OverlappingAddressRanges {
                    first: *prev_range,
                    second: *range,
                });
            }
        }

        Ok(Self {
            ordered_ranges: value,
        })
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum AddressMapError {
    /// Attempt to add an address range that overlaps with a previously added address range.
    #[error("address range {second} overlaps with address range {first}")]
    OverlappingAddressRanges {
        first: AddressRange,
        second: AddressRange,
    },
}

#[macro_export]
macro_rules! addr_map {
    ($([$start:expr, $end:expr] => $value:expr,)*) => {
        $crate::address_map::AddressMap::try_from(vec![
            $(($crate::address_range![$start, $end], $value)),*
        ]).unwrap()
    };
}
