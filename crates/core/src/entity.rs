//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Jobs are identified by their `JobId`; executions by `(job_id, attempt)`.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}
