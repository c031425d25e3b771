//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// A job keeps its identity while its status changes; two snapshots with the
/// same id describe the same job.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
