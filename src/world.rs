//! Contains the [World]: the container that owns the entity directory, the
//! component cache, the archetype graph and the chunk allocator.
//!
//! All mutating operations resolve to moving entities between chunks along
//! archetype-graph edges. The world is single-threaded; every operation
//! runs to completion before the next begins.

use std::collections::HashMap;
use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::alloc::{AllocStats, ChunkAllocator};
use crate::entity::{Entity, EntityDirectory, EntityKind};
use crate::error::EcsError;
use crate::hash::EntityHasher;
use crate::query::{QueryBuilder, QueryStore};
use crate::registry::{Component, ComponentRegistry};
use crate::storage::archetype::{
    archetype_hash, sort_component_cond, Archetype, ArchetypeId,
};
use crate::storage::layout::MAX_COMPONENTS;

/// Unique identifier for a [World].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldId(u64);
static WORLD_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl WorldId {
    fn next() -> Self { WorldId(WORLD_ID_COUNTER.fetch_add(1, Ordering::Relaxed)) }
}

/// Shares one chunk allocator between the worlds it creates.
#[derive(Default, Clone)]
pub struct Universe {
    allocator: Arc<Mutex<ChunkAllocator>>,
}

impl Universe {
    pub fn new() -> Self { Self::default() }

    pub fn create_world(&self) -> World { World::with_allocator(self.allocator.clone()) }
}

/// A container of entities and their components.
pub struct World {
    id: WorldId,
    pub(crate) registry: ComponentRegistry,
    pub(crate) entities: EntityDirectory,
    pub(crate) archetypes: Vec<Archetype>,
    archetype_index: FnvHashMap<u64, SmallVec<[ArchetypeId; 1]>>,
    component_index: HashMap<Entity, Vec<ArchetypeId>, EntityHasher>,
    allocator: Arc<Mutex<ChunkAllocator>>,
    pub(crate) queries: QueryStore,
    version: u32,
}

impl Default for World {
    fn default() -> Self { Self::new() }
}

impl World {
    /// Creates a world with its own chunk allocator.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(Mutex::new(ChunkAllocator::new())))
    }

    fn with_allocator(allocator: Arc<Mutex<ChunkAllocator>>) -> Self {
        let id = WorldId::next();
        info!(world = id.0, "created world");
        let mut world = World {
            id,
            registry: ComponentRegistry::new(),
            entities: EntityDirectory::new(),
            archetypes: Vec::new(),
            archetype_index: FnvHashMap::default(),
            component_index: HashMap::default(),
            allocator,
            queries: QueryStore::default(),
            version: 0,
        };
        // Archetype 0 is the root: the empty id set, holding entities
        // that have no components yet.
        let root = Archetype::new(ArchetypeId::ROOT, SmallVec::new(), &[]);
        world
            .archetype_index
            .entry(root.hash())
            .or_default()
            .push(ArchetypeId::ROOT);
        world.archetypes.push(root);
        world
    }

    pub fn id(&self) -> WorldId { self.id }

    /// The current world version. Monotonically advanced by every
    /// mutation; column versions are stamped with it.
    pub fn world_version(&self) -> u32 { self.version }

    /// Explicitly advances the world version, e.g. once per frame.
    pub fn bump_version(&mut self) -> u32 {
        self.version = self.version.wrapping_add(1);
        self.version
    }

    pub fn entity_count(&self) -> usize { self.entities.live_count() }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.iter().filter(|a| !a.is_dead()).count()
    }

    /// The archetype an entity currently belongs to.
    pub fn archetype_of(&self, entity: Entity) -> ArchetypeId {
        let record = self.entities.record(entity);
        assert!(record.is_stored(), "entity has no storage");
        record.arch
    }

    /// The entity's storage location: archetype, chunk index, row.
    pub fn location_of(&self, entity: Entity) -> (ArchetypeId, u32, u32) {
        let record = self.entities.record(entity);
        assert!(record.is_stored(), "entity has no storage");
        (record.arch, record.chunk, record.row)
    }

    /// The sorted component ids of an archetype.
    pub fn archetype_components(&self, id: ArchetypeId) -> &[Entity] {
        self.archetypes[id].ids()
    }

    /// Rows one chunk of this archetype can hold.
    pub fn archetype_capacity(&self, id: ArchetypeId) -> u16 {
        self.archetypes[id].layout().capacity
    }

    /// Per-chunk `(first_enabled_row, row_count)` pairs of an archetype.
    pub fn chunk_occupancy(&self, id: ArchetypeId) -> Vec<(u16, u16)> {
        self.archetypes[id]
            .chunks()
            .iter()
            .map(|c| (c.first_enabled(), c.len()))
            .collect()
    }

    // ----------------
    // Component registration
    // ----------------

    /// Registers `T` as a generic (row-per-entity) component and returns
    /// its id. Registering the same type twice returns the same id.
    pub fn register<T: Component>(&mut self) -> Entity {
        if let Some(existing) = self.registry.lookup::<T>() {
            return existing;
        }
        let entity = self.entities.alloc(EntityKind::Generic);
        self.registry.insert::<T>(entity, EntityKind::Generic)
    }

    /// Registers `T` as a unique (one-per-chunk) component.
    pub fn register_unique<T: Component + PartialEq>(&mut self) -> Entity {
        if let Some(existing) = self.registry.lookup::<T>() {
            return existing;
        }
        let entity = self.entities.alloc(EntityKind::Unique);
        self.registry.insert_unique::<T>(entity)
    }

    pub fn registry(&self) -> &ComponentRegistry { &self.registry }

    // ----------------
    // Entity lifecycle
    // ----------------

    /// Creates an empty entity in the root archetype.
    pub fn create(&mut self) -> Result<Entity, EcsError> {
        self.bump_version();
        let version = self.version;
        let chunk = {
            let mut allocator = self.allocator.lock();
            self.archetypes[ArchetypeId::ROOT].find_or_create_chunk(&mut allocator, version)?
        };
        let entity = self.entities.alloc(EntityKind::Generic);
        let row = self.archetypes[ArchetypeId::ROOT].alloc_row(chunk, entity, version);
        let record = self.entities.record_mut(entity);
        record.arch = ArchetypeId::ROOT;
        record.chunk = chunk;
        record.row = row as u32;
        Ok(entity)
    }

    /// Creates `count` empty entities at once. Chunks are filled front to
    /// back without rescanning the ones already filled.
    pub fn create_many(&mut self, count: usize) -> Result<Vec<Entity>, EcsError> {
        self.bump_version();
        let version = self.version;
        let mut entities = Vec::with_capacity(count);
        let mut scan_from = 0;
        while entities.len() < count {
            let chunk = {
                let mut allocator = self.allocator.lock();
                self.archetypes[ArchetypeId::ROOT].find_or_create_chunk_from(
                    scan_from,
                    &mut allocator,
                    version,
                )?
            };
            scan_from = chunk;
            loop {
                let archetype = &mut self.archetypes[ArchetypeId::ROOT];
                if entities.len() == count || archetype.chunk(chunk).is_full(archetype.layout())
                {
                    break;
                }
                let entity = self.entities.alloc(EntityKind::Generic);
                let row = archetype.alloc_row(chunk, entity, version);
                let record = self.entities.record_mut(entity);
                record.arch = ArchetypeId::ROOT;
                record.chunk = chunk;
                record.row = row as u32;
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Creates an entity in `template`'s archetype with clones of every
    /// generic component value.
    pub fn create_from(&mut self, template: Entity) -> Result<Entity, EcsError> {
        self.bump_version();
        let version = self.version;
        let template_record = *self.entities.record(template);
        assert!(template_record.is_stored(), "template entity has no storage");
        let arch_id = template_record.arch;

        let chunk = {
            let mut allocator = self.allocator.lock();
            self.archetypes[arch_id].find_or_create_chunk(&mut allocator, version)?
        };
        let entity = self.entities.alloc(EntityKind::Generic);
        let archetype = &mut self.archetypes[arch_id];
        archetype.revive();
        let row = archetype.alloc_row(chunk, entity, version);
        clone_row(
            &self.archetypes[arch_id],
            template_record.chunk,
            template_record.row as u16,
            chunk,
            row,
        );
        let record = self.entities.record_mut(entity);
        record.arch = arch_id;
        record.chunk = chunk;
        record.row = row as u32;
        Ok(entity)
    }

    /// Deletes an entity, destroying its component values and recycling
    /// its directory record.
    pub fn delete(&mut self, entity: Entity) {
        self.bump_version();
        let record = *self.entities.record(entity);
        assert!(
            !self
                .component_index
                .get(&entity)
                .map(|archetypes| archetypes
                    .iter()
                    .any(|&a| !self.archetypes[a].is_dead()))
                .unwrap_or(false),
            "deleting an entity still in use as a component id"
        );
        if record.is_stored() {
            let version = self.version;
            self.archetypes[record.arch].remove_row(
                record.chunk,
                record.row as u16,
                version,
                &mut self.entities,
            );
        }
        self.entities.free(entity);
    }

    /// Returns `true` if the handle refers to a live entity.
    pub fn is_valid(&self, entity: Entity) -> bool { self.entities.is_valid(entity) }

    /// Deletes every stored entity. Registered components and interned
    /// queries stay in place.
    pub fn clear(&mut self) {
        let mut live = Vec::new();
        for index in 0..self.entities.len() as u32 {
            let record = self.entities.record_at(index);
            if record.alive && record.is_stored() {
                live.push(Entity::new(index, record.gen));
            }
        }
        for entity in live {
            self.delete(entity);
        }
    }

    // ----------------
    // Component operations
    // ----------------

    /// Adds a component to an entity, default-constructing its value.
    /// Adding a component the entity already has is a programming error.
    pub fn add(&mut self, entity: Entity, key: Entity) -> Result<(), EcsError> {
        self.add_inner(entity, key, None)
    }

    /// Adds a component, moving `value` bytes in as its initial value.
    pub fn add_with_value(
        &mut self,
        entity: Entity,
        key: Entity,
        value: &[u8],
    ) -> Result<(), EcsError> {
        self.add_inner(entity, key, Some(value))
    }

    /// Typed convenience over [World::add_with_value].
    pub fn add_as<T: Component>(
        &mut self,
        entity: Entity,
        key: Entity,
        value: T,
    ) -> Result<(), EcsError> {
        // safety: the byte view covers exactly the value; ownership moves
        // into the chunk, so the local must not drop
        let bytes = unsafe {
            slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        let result = self.add_inner(entity, key, Some(bytes));
        if result.is_ok() {
            std::mem::forget(value);
        }
        result
    }

    fn add_inner(
        &mut self,
        entity: Entity,
        key: Entity,
        value: Option<&[u8]>,
    ) -> Result<(), EcsError> {
        assert!(self.entities.is_valid(key), "component id is not alive");
        self.bump_version();
        let record = *self.entities.record(entity);
        let src_id = record.arch;
        assert!(
            !self.archetypes[src_id].contains(key),
            "entity already has component {key}"
        );

        let dst_id = match self.archetypes[src_id].add_edge(key) {
            Some(target) if !self.archetypes[target].is_dead() => target,
            _ => {
                let mut ids: SmallVec<[Entity; 8]> =
                    SmallVec::from_slice(self.archetypes[src_id].ids());
                ids.push(key);
                ids.sort_by(|a, b| sort_component_cond(*a, *b));
                let target = self.find_or_create_archetype(ids)?;
                self.archetypes[src_id].set_add_edge(key, target);
                self.archetypes[target].set_del_edge(key, src_id);
                target
            }
        };

        self.move_entity(entity, dst_id, Some((key, value)))?;
        // A freshly added unique component's value lives in the chunk,
        // not the row; write it after the move has settled the location.
        if key.kind() == EntityKind::Unique {
            if let Some(bytes) = value {
                self.write_value(entity, key, bytes, false);
            }
        }
        Ok(())
    }

    /// Removes a component from an entity. Removing a component the
    /// entity does not have is a programming error.
    pub fn del(&mut self, entity: Entity, key: Entity) -> Result<(), EcsError> {
        self.bump_version();
        let record = *self.entities.record(entity);
        let src_id = record.arch;
        assert!(
            self.archetypes[src_id].contains(key),
            "entity does not have component {key}"
        );

        let dst_id = match self.archetypes[src_id].del_edge(key) {
            Some(target) if !self.archetypes[target].is_dead() => target,
            _ => {
                let ids: SmallVec<[Entity; 8]> = self.archetypes[src_id]
                    .ids()
                    .iter()
                    .copied()
                    .filter(|id| id.raw() != key.raw())
                    .collect();
                let target = self.find_or_create_archetype(ids)?;
                self.archetypes[src_id].set_del_edge(key, target);
                self.archetypes[target].set_add_edge(key, src_id);
                target
            }
        };

        self.move_entity(entity, dst_id, None)
    }

    /// Returns `true` if the entity's archetype contains an id matching
    /// `key` (pair patterns may use [Entity::WILDCARD]).
    pub fn has(&self, entity: Entity, key: Entity) -> bool {
        let record = self.entities.record(entity);
        record.is_stored() && self.archetypes[record.arch].matches(key)
    }

    /// Reads a component value as raw bytes. Returns an empty slice for
    /// tags and `None` when the component is absent.
    pub fn get(&self, entity: Entity, key: Entity) -> Option<&[u8]> {
        let record = self.entities.record(entity);
        if !record.is_stored() {
            return None;
        }
        let archetype = &self.archetypes[record.arch];
        let layout = archetype.layout();
        let column = layout.find_column(key)?;
        let info = layout.column(column);
        if info.is_tag() {
            return Some(&[]);
        }
        let chunk = archetype.chunk(record.chunk);
        let row = match info.kind {
            EntityKind::Unique => 0,
            EntityKind::Generic => record.row as u16,
        };
        // safety: the slot holds an initialized value of `size` bytes;
        // the borrow is tied to &self
        Some(unsafe {
            slice::from_raw_parts(chunk.value_ptr(layout, column, row), info.size as usize)
        })
    }

    /// Typed convenience over [World::get].
    pub fn get_as<T: Component>(&self, entity: Entity, key: Entity) -> Option<&T> {
        let bytes = self.get(entity, key)?;
        assert_eq!(bytes.len(), std::mem::size_of::<T>(), "component size mismatch");
        // safety: sizes match and chunk columns are aligned per descriptor
        Some(unsafe { &*bytes.as_ptr().cast::<T>() })
    }

    /// Overwrites a component value and bumps its column version so
    /// change-filtered queries observe the write.
    pub fn set(&mut self, entity: Entity, key: Entity, value: &[u8]) {
        self.bump_version();
        self.write_value(entity, key, value, false);
    }

    /// Silent set: overwrites the value without a version bump.
    pub fn sset(&mut self, entity: Entity, key: Entity, value: &[u8]) {
        self.write_value(entity, key, value, true);
    }

    /// Typed convenience over [World::set].
    pub fn set_as<T: Component>(&mut self, entity: Entity, key: Entity, value: T) {
        // safety: as add_as; the value's bytes move into the chunk
        let bytes = unsafe {
            slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.set(entity, key, bytes);
        std::mem::forget(value);
    }

    /// Typed convenience over [World::sset].
    pub fn sset_as<T: Component>(&mut self, entity: Entity, key: Entity, value: T) {
        // safety: as add_as; the value's bytes move into the chunk
        let bytes = unsafe {
            slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.sset(entity, key, bytes);
        std::mem::forget(value);
    }

    fn write_value(&mut self, entity: Entity, key: Entity, value: &[u8], silent: bool) {
        let version = self.version;
        let record = *self.entities.record(entity);
        assert!(record.is_stored(), "entity has no storage");
        self.archetypes[record.arch].write_value(
            record.chunk,
            record.row as u16,
            key,
            value,
            version,
            silent,
        );
    }

    /// Enables or disables an entity. Disabled entities keep their
    /// components but are skipped by default query iteration.
    pub fn enable(&mut self, entity: Entity, enabled: bool) {
        self.bump_version();
        let version = self.version;
        let record = *self.entities.record(entity);
        if record.enabled == enabled {
            return;
        }
        assert!(record.is_stored(), "entity has no storage");
        self.archetypes[record.arch].enable_row(
            record.chunk,
            record.row as u16,
            enabled,
            version,
            &mut self.entities,
        );
        self.entities.record_mut(entity).enabled = enabled;
    }

    /// Returns `true` if the entity is enabled.
    pub fn is_enabled(&self, entity: Entity) -> bool { self.entities.record(entity).enabled }

    // ----------------
    // Queries
    // ----------------

    /// Starts building a query against this world.
    pub fn query(&mut self) -> QueryBuilder<'_> { QueryBuilder::new(self) }

    // ----------------
    // Maintenance
    // ----------------

    /// Progresses chunk and archetype lifespans, frees the ones whose
    /// countdown expired and releases empty allocator pages.
    pub fn gc(&mut self) {
        let mut expired = Vec::new();
        {
            let mut allocator = self.allocator.lock();
            for index in 0..self.archetypes.len() {
                let archetype = &mut self.archetypes[index];
                if archetype.is_dead() {
                    continue;
                }
                let mut chunk_index = 0;
                while chunk_index < archetype.chunk_count() as u32 {
                    let chunk = archetype.chunk_mut(chunk_index);
                    if chunk.is_empty() && chunk.is_dying() && chunk.progress_lifespan() {
                        archetype.free_chunk(chunk_index, &mut allocator, &mut self.entities);
                        // the swapped-in chunk now occupies this index
                        continue;
                    }
                    chunk_index += 1;
                }
                if index != ArchetypeId::ROOT.index()
                    && archetype.chunk_count() == 0
                    && archetype.is_dying()
                    && archetype.progress_lifespan()
                {
                    expired.push(ArchetypeId(index as u32));
                }
            }
        }
        for id in expired {
            self.delete_archetype(id);
        }
        self.allocator.lock().flush();
    }

    /// Migrates rows from sparse tail chunks into head chunks, moving at
    /// most `move_budget` rows across all archetypes. Returns the number
    /// of rows moved.
    pub fn defrag(&mut self, move_budget: u32) -> u32 {
        self.bump_version();
        let version = self.version;
        let mut budget = move_budget;
        let mut moved = 0;
        for archetype in self.archetypes.iter_mut() {
            if budget == 0 {
                break;
            }
            if archetype.is_dead() {
                continue;
            }
            moved += archetype.defrag(&mut budget, version, &mut self.entities);
        }
        moved
    }

    /// Writes a human-readable summary of the world to `sink`.
    pub fn diag(&self, sink: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(sink, "world #{} version:{}", self.id.0, self.version)?;
        writeln!(
            sink,
            "entities: live:{} total:{} recycle-list:{} ({})",
            self.entities.live_count(),
            self.entities.len(),
            self.entities.free_count(),
            if self.entities.validate() { "ok" } else { "BROKEN" },
        )?;
        writeln!(
            sink,
            "components: {}  queries: {}",
            self.registry.len(),
            self.queries.len(),
        )?;
        writeln!(sink, "archetypes: {}", self.archetype_count())?;
        for archetype in &self.archetypes {
            if !archetype.is_dead() {
                archetype.diag(sink)?;
            }
        }
        let stats = self.alloc_stats();
        writeln!(
            sink,
            "chunk allocator: reserved:{}B used:{}B pages:{} free-pages:{}",
            stats.reserved_bytes, stats.used_bytes, stats.page_count, stats.free_page_count,
        )
    }

    /// Chunk allocator statistics.
    pub fn alloc_stats(&self) -> AllocStats { self.allocator.lock().stats() }

    /// Cross-checks the entity directory against chunk contents. Meant
    /// for tests and debugging.
    pub fn validate(&self) -> bool {
        if !self.entities.validate() {
            return false;
        }
        for index in 0..self.entities.len() as u32 {
            let record = self.entities.record_at(index);
            if !record.alive || !record.is_stored() {
                continue;
            }
            let archetype = &self.archetypes[record.arch];
            let chunk = archetype.chunk(record.chunk);
            let stored = chunk.entity_at(archetype.layout(), record.row as u16);
            if stored.id() != index || stored.gen() != record.gen {
                return false;
            }
        }
        true
    }

    // ----------------
    // Archetype directory
    // ----------------

    pub(crate) fn find_or_create_archetype(
        &mut self,
        ids: SmallVec<[Entity; 8]>,
    ) -> Result<ArchetypeId, EcsError> {
        let hash = archetype_hash(&ids);
        if let Some(candidates) = self.archetype_index.get(&hash) {
            for &candidate in candidates.iter() {
                let archetype = &self.archetypes[candidate];
                if !archetype.is_dead() && archetype.ids() == &ids[..] {
                    return Ok(candidate);
                }
            }
        }

        assert!(
            ids.len() <= MAX_COMPONENTS,
            "an archetype may hold at most {MAX_COMPONENTS} components"
        );
        if self.archetypes.len() >= u32::MAX as usize - 1 {
            return Err(EcsError::ArchetypeLimit);
        }

        let descs: Vec<_> = ids
            .iter()
            .map(|&id| self.registry.storage_desc(id).cloned())
            .collect();
        let id = ArchetypeId(self.archetypes.len() as u32);
        let archetype = Archetype::new(id, ids, &descs);
        self.archetype_index
            .entry(hash)
            .or_default()
            .push(id);
        for &component in archetype.ids() {
            self.component_index.entry(component).or_default().push(id);
        }
        self.archetypes.push(archetype);
        Ok(id)
    }

    fn delete_archetype(&mut self, id: ArchetypeId) {
        debug!(archetype = id.0, "deleting archetype");
        let add_edges: Vec<_> = self.archetypes[id].add_edges().collect();
        let del_edges: Vec<_> = self.archetypes[id].del_edges().collect();
        // Edges are installed pairwise, so the dead archetype's own edge
        // maps identify every neighbor pointing back at it.
        for (key, target) in del_edges {
            self.archetypes[target].clear_add_edge(key);
        }
        for (key, target) in add_edges {
            self.archetypes[target].clear_del_edge(key);
        }

        let hash = self.archetypes[id].hash();
        if let Some(candidates) = self.archetype_index.get_mut(&hash) {
            candidates.retain(|&mut c| c != id);
            if candidates.is_empty() {
                self.archetype_index.remove(&hash);
            }
        }
        let ids: Vec<Entity> = self.archetypes[id].ids().to_vec();
        for component in ids {
            if let Some(list) = self.component_index.get_mut(&component) {
                list.retain(|&c| c != id);
                if list.is_empty() {
                    self.component_index.remove(&component);
                }
            }
        }
        let mut allocator = self.allocator.lock();
        self.archetypes[id].destroy(&mut allocator);
    }

    // ----------------
    // Transitions
    // ----------------

    /// Moves an entity to `dst_id`, carrying the component values the two
    /// archetypes share. `added` names a freshly added column and its
    /// optional initial value.
    fn move_entity(
        &mut self,
        entity: Entity,
        dst_id: ArchetypeId,
        added: Option<(Entity, Option<&[u8]>)>,
    ) -> Result<(), EcsError> {
        let version = self.version;
        let record = *self.entities.record(entity);
        let src_id = record.arch;
        debug_assert_ne!(src_id, dst_id);

        // Allocate the destination row first: an allocation failure must
        // leave the entity exactly where it was.
        let dst_chunk = {
            let mut allocator = self.allocator.lock();
            self.archetypes[dst_id].find_or_create_chunk(&mut allocator, version)?
        };

        let (src_arch, dst_arch) = index_twice(&mut self.archetypes, src_id, dst_id);
        dst_arch.revive();
        let dst_row = dst_arch.alloc_row(dst_chunk, entity, version);
        transfer_row(
            src_arch,
            record.chunk,
            record.row as u16,
            dst_arch,
            dst_chunk,
            dst_row,
            added,
        );
        src_arch.release_row(record.chunk, record.row as u16, version, &mut self.entities);

        let new_record = self.entities.record_mut(entity);
        new_record.arch = dst_id;
        new_record.chunk = dst_chunk;
        new_record.row = dst_row as u32;

        if !record.enabled {
            // The new row lands in the enabled region; restore the state.
            self.archetypes[dst_id].enable_row(
                dst_chunk,
                dst_row,
                false,
                version,
                &mut self.entities,
            );
        }
        Ok(())
    }
}

impl Drop for World {
    fn drop(&mut self) {
        let mut allocator = self.allocator.lock();
        for archetype in self.archetypes.iter_mut() {
            archetype.destroy(&mut allocator);
        }
    }
}

/// Two distinct mutable archetype references out of one vector.
fn index_twice(
    archetypes: &mut [Archetype],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    let (a, b) = (a.index(), b.index());
    assert_ne!(a, b);
    if a < b {
        let (head, tail) = archetypes.split_at_mut(b);
        (&mut head[a], &mut tail[0])
    } else {
        let (head, tail) = archetypes.split_at_mut(a);
        (&mut tail[0], &mut head[b])
    }
}

/// Moves one row's generic values from `src_arch` into a freshly
/// allocated, uninitialized destination row. Columns the two archetypes
/// share are moved byte-wise by a linear merge over the sorted id lists;
/// source-only values are dropped; destination-only columns take the
/// added value or a default-constructed one.
fn transfer_row(
    src_arch: &Archetype,
    src_chunk: u32,
    src_row: u16,
    dst_arch: &mut Archetype,
    dst_chunk: u32,
    dst_row: u16,
    added: Option<(Entity, Option<&[u8]>)>,
) {
    let src_layout = src_arch.layout();
    let src = src_arch.chunk(src_chunk);
    let (dst_layout, dst) = dst_arch.layout_and_chunk_mut(dst_chunk);

    let mut init_dst = |dst: &mut crate::storage::chunk::Chunk, column: usize| {
        let info = dst_layout.column(column);
        if info.is_tag() {
            return;
        }
        if let Some((key, Some(bytes))) = added {
            if key.raw() == info.id.raw() {
                assert_eq!(bytes.len(), info.size as usize, "component size mismatch");
                // safety: the slot is uninitialized; the bytes move in
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        dst.value_ptr(dst_layout, column, dst_row),
                        info.size as usize,
                    );
                }
                return;
            }
        }
        dst.construct_value(dst_layout, column, dst_row);
    };

    let (mut i, mut j) = (0, 0);
    while i < src_layout.generic_count && j < dst_layout.generic_count {
        let src_info = src_layout.column(i);
        let dst_info = dst_layout.column(j);
        match sort_component_cond(src_info.id, dst_info.id) {
            std::cmp::Ordering::Equal => {
                if !src_info.is_tag() {
                    // safety: move-construct; the source slot is treated
                    // as uninitialized afterwards and never dropped
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            src.value_ptr(src_layout, i, src_row),
                            dst.value_ptr(dst_layout, j, dst_row),
                            src_info.size as usize,
                        );
                    }
                }
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                if let Some(desc) = src_info.desc.as_ref().filter(|_| !src_info.is_tag()) {
                    // safety: the value is initialized and will not be
                    // touched again before the row is released
                    unsafe { desc.drop_in_place(src.value_ptr(src_layout, i, src_row)) };
                }
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                init_dst(dst, j);
                j += 1;
            }
        }
    }
    while i < src_layout.generic_count {
        let info = src_layout.column(i);
        if let Some(desc) = info.desc.as_ref().filter(|_| !info.is_tag()) {
            // safety: as above
            unsafe { desc.drop_in_place(src.value_ptr(src_layout, i, src_row)) };
        }
        i += 1;
    }
    while j < dst_layout.generic_count {
        init_dst(dst, j);
        j += 1;
    }
}

/// Clone-constructs every generic value of one row into another row of
/// the same archetype.
fn clone_row(archetype: &Archetype, src_chunk: u32, src_row: u16, dst_chunk: u32, dst_row: u16) {
    let layout = archetype.layout();
    let src = archetype.chunk(src_chunk);
    let dst = archetype.chunk(dst_chunk);
    for column in 0..layout.generic_count {
        let info = layout.column(column);
        if info.is_tag() {
            continue;
        }
        let desc = info.desc.as_ref().expect("sized column without descriptor");
        // safety: source initialized, destination uninitialized; rows are
        // distinct even when the chunks coincide
        unsafe {
            desc.copy(
                dst.value_ptr(layout, column, dst_row),
                src.value_ptr(layout, column, src_row),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    struct Pos(f32, f32, f32);
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    struct Rot(f32, f32, f32);

    #[test]
    fn create() { let _ = World::default(); }

    #[test]
    fn archetype_directory_dedups_id_sets() {
        let mut world = World::new();
        let pos = world.register::<Pos>();
        let rot = world.register::<Rot>();

        let ids: SmallVec<[Entity; 8]> = {
            let mut ids: SmallVec<[Entity; 8]> = SmallVec::new();
            ids.push(pos);
            ids.push(rot);
            ids.sort_by(|a, b| sort_component_cond(*a, *b));
            ids
        };
        let a = world.find_or_create_archetype(ids.clone()).unwrap();
        let b = world.find_or_create_archetype(ids).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn transitions_reuse_graph_edges() {
        let mut world = World::new();
        let pos = world.register::<Pos>();

        let first = world.create().unwrap();
        world.add(first, pos).unwrap();
        let created = world.archetypes.len();
        assert_eq!(world.archetypes[ArchetypeId::ROOT].add_edge(pos), Some(world.archetype_of(first)));

        // the second transition must follow the cached edge
        let second = world.create().unwrap();
        world.add(second, pos).unwrap();
        assert_eq!(world.archetypes.len(), created);
        assert_eq!(world.archetype_of(first), world.archetype_of(second));

        // and removal installs the inverse edge back to the root
        world.del(first, pos).unwrap();
        let with_pos = world.archetype_of(second);
        assert_eq!(world.archetypes[with_pos].del_edge(pos), Some(ArchetypeId::ROOT));
    }

    #[test]
    fn create_many_packs_rows_densely() {
        let mut world = World::new();
        let entities = world.create_many(2500).unwrap();
        assert_eq!(entities.len(), 2500);
        assert_eq!(world.entity_count(), 2500);
        assert!(world.validate());

        let occupancy = world.chunk_occupancy(ArchetypeId::ROOT);
        let capacity = world.archetype_capacity(ArchetypeId::ROOT) as usize;
        let total: usize = occupancy.iter().map(|(_, n)| *n as usize).sum();
        assert_eq!(total, 2500);
        // every chunk but the last is full
        for (_, rows) in &occupancy[..occupancy.len() - 1] {
            assert_eq!(*rows as usize, capacity);
        }
    }

    #[test]
    fn clear_removes_all_entities_but_keeps_components() {
        let mut world = World::new();
        let pos = world.register::<Pos>();
        for _ in 0..10 {
            let e = world.create().unwrap();
            world.add(e, pos).unwrap();
        }
        assert_eq!(world.entity_count(), 11); // 10 + the component id

        world.clear();
        assert_eq!(world.entity_count(), 1);
        assert!(world.validate());

        // the registry survives and the id keeps working
        let e = world.create().unwrap();
        world.add(e, pos).unwrap();
        assert!(world.has(e, pos));
    }
}
