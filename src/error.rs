use thiserror::Error;

/// Errors surfaced by fallible storage operations.
///
/// Contract violations (duplicate component adds, stale entity handles,
/// structural changes under an iteration lock) are not represented here;
/// they are programming errors and panic immediately.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// The chunk allocator failed to obtain a new page from the system.
    #[error("chunk allocator could not obtain a new memory page")]
    OutOfMemory,
    /// The world has run out of archetype IDs.
    #[error("archetype limit reached")]
    ArchetypeLimit,
}
