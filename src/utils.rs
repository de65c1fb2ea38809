//! Utility types shared across the crate.

use std::cmp::Ordering;

/// A wrapper around f64 that implements `Ord` by using `total_cmp`.
/// Cost-model savings and estimates are f64 but need a total ordering
/// for sorting and max-selection.
///
/// # Examples
///
/// ```
/// use gridflow::utils::OrdF64;
///
/// let mut savings = vec![OrdF64(1.5e6), OrdF64(4.2e6), OrdF64(0.3e6)];
/// savings.sort();
/// assert_eq!(savings.last().unwrap().0, 4.2e6);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrdF64(pub f64);

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF64 {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for OrdF64 {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<OrdF64> for f64 {
    fn from(value: OrdF64) -> Self {
        value.0
    }
}
