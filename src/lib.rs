//! Phalanx is a high performance entity component system (ECS) storage
//! engine.
//!
//! Entities are opaque generational handles. Components are plain data
//! values keyed by [Entity] ids, registered at runtime in a world-owned
//! component cache. Entities sharing the same component set belong to one
//! archetype, which packs them into fixed-size chunks laid out
//! structure-of-arrays, so iteration is a walk over contiguous columns.
//!
//! ```
//! use phalanx::prelude::*;
//!
//! #[derive(Clone, Copy, Debug, Default, PartialEq)]
//! struct Pos(f32, f32, f32);
//! #[derive(Clone, Copy, Debug, Default, PartialEq)]
//! struct Vel(f32, f32, f32);
//!
//! let mut world = World::new();
//! let pos = world.register::<Pos>();
//! let vel = world.register::<Vel>();
//!
//! let e = world.create().unwrap();
//! world.add_as(e, pos, Pos(1.0, 2.0, 3.0)).unwrap();
//! world.add_as(e, vel, Vel(0.5, 0.0, 0.0)).unwrap();
//!
//! let moving = world.query().all_mut(pos).all(vel).build();
//! moving.for_each_chunk(&mut world, |mut view| {
//!     let velocities: Vec<Vel> = view.column::<Vel>(1).to_vec();
//!     for (p, v) in view.column_mut::<Pos>(0).iter_mut().zip(velocities) {
//!         p.0 += v.0;
//!     }
//! });
//!
//! assert_eq!(world.get_as::<Pos>(e, pos), Some(&Pos(1.5, 2.0, 3.0)));
//! ```
//!
//! Structural mutations (`add`, `del`, `enable`, create/delete) move the
//! entity between chunks along cached archetype-graph edges. Queries are
//! compiled and interned once, then matched incrementally against newly
//! registered archetypes on each run.
//!
//! The world is single-threaded. Iterating a chunk raises its structural
//! lock; mutating a locked chunk is a programming error and panics.

pub mod alloc;
mod entity;
mod error;
mod hash;
pub mod query;
mod registry;
pub mod storage;
mod world;

pub use crate::entity::{Entity, EntityKind};
pub use crate::error::EcsError;
pub use crate::query::{ChunkView, Constraint, GroupFn, Query, QueryBuilder};
pub use crate::registry::{Component, ComponentDesc, ComponentRegistry};
pub use crate::storage::{ArchetypeId, MAX_COMPONENTS};
pub use crate::world::{Universe, World, WorldId};

pub mod prelude {
    //! Commonly used types.
    pub use crate::alloc::AllocStats;
    pub use crate::query::{ChunkView, Constraint, Query};
    pub use crate::registry::Component;
    pub use crate::{EcsError, Entity, EntityKind, Universe, World};
}
