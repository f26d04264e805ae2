//! Value object marker.

/// Immutable value compared by its contents.
///
/// [`crate::MoneyAmount`] is the canonical example: arithmetic returns a new
/// amount, it never mutates one in place.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
