//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values; two
/// value objects with the same values are the same value. `Money` is the
/// canonical example here: `Money::from_major(100) == Money::from_major(100)`
/// regardless of which record produced either side.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
