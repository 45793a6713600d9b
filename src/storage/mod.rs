//! Archetype and chunk storage.
//!
//! Entities with the same component-id set share an [archetype]; the
//! archetype packs their rows into fixed-size [chunk]s laid out
//! structure-of-arrays per the [layout] computed at archetype creation.

pub(crate) mod archetype;
pub(crate) mod chunk;
pub(crate) mod layout;

pub use archetype::ArchetypeId;
pub use layout::MAX_COMPONENTS;
