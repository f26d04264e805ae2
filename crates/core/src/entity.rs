//! Entity trait: identity that survives state changes.

/// Something with a stable identifier.
///
/// Two accounts with different balances are still the same account if their
/// identifiers match; two amounts are never "the same amount" by identity (see
/// [`crate::ValueObject`]).
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
