//! Archetypes: one per distinct component-id set, owning the chunks that
//! store entities with exactly that set.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Index, IndexMut};

use smallvec::SmallVec;
use tracing::debug;

use crate::alloc::ChunkAllocator;
use crate::entity::{Entity, EntityDirectory, EntityKind};
use crate::error::EcsError;
use crate::hash::{lookup_hash, EntityHasher};
use crate::storage::chunk::Chunk;
use crate::storage::layout::ChunkLayout;

/// Ticks an empty archetype survives before gc deletes it (7-bit
/// countdown, at least as long as a chunk's).
pub(crate) const MAX_ARCHETYPE_LIFESPAN: u8 = 127;

/// Row capacity cap for the root archetype's chunks.
const ROOT_MAX_ROWS: u16 = 1024;
/// Row capacity cap for every other archetype.
const MAX_ROWS: u16 = 512;

/// The index of an archetype in a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    pub(crate) const ROOT: ArchetypeId = ArchetypeId(0);

    pub fn index(self) -> usize { self.0 as usize }
}

impl Index<ArchetypeId> for Vec<Archetype> {
    type Output = Archetype;

    fn index(&self, index: ArchetypeId) -> &Self::Output { &self[index.0 as usize] }
}

impl IndexMut<ArchetypeId> for Vec<Archetype> {
    fn index_mut(&mut self, index: ArchetypeId) -> &mut Self::Output {
        &mut self[index.0 as usize]
    }
}

/// The canonical ordering of component ids within an archetype: pairs
/// after plain ids within each storage kind, generic ids before unique
/// ids, ties broken by raw id bits.
pub(crate) fn sort_component_cond(a: Entity, b: Entity) -> Ordering {
    let rank = |e: Entity| (e.kind() == EntityKind::Unique, e.is_pair());
    rank(a).cmp(&rank(b)).then_with(|| a.raw().cmp(&b.raw()))
}

/// Computes the directory key of an id set. The ids must already be in
/// canonical order.
pub(crate) fn archetype_hash(ids: &[Entity]) -> u64 {
    lookup_hash(ids.iter().map(|e| e.raw()))
}

pub(crate) struct Archetype {
    id: ArchetypeId,
    ids: SmallVec<[Entity; 8]>,
    layout: ChunkLayout,
    hash: u64,
    chunks: Vec<Chunk>,
    edges_add: HashMap<Entity, ArchetypeId, EntityHasher>,
    edges_del: HashMap<Entity, ArchetypeId, EntityHasher>,
    pair_count: u8,
    lifespan: u8,
    dead: bool,
}

impl Archetype {
    /// Builds the archetype for a canonically sorted id set. `descs` are
    /// the storage descriptors resolved by the component cache, one per
    /// id (`None` for pairs of plain entities).
    pub fn new(
        id: ArchetypeId,
        ids: SmallVec<[Entity; 8]>,
        descs: &[Option<crate::registry::ComponentDesc>],
    ) -> Archetype {
        debug_assert!(ids.windows(2).all(|w| sort_component_cond(w[0], w[1]) == Ordering::Less));
        let max_rows = if id == ArchetypeId::ROOT { ROOT_MAX_ROWS } else { MAX_ROWS };
        let layout = ChunkLayout::compute(&ids, descs, max_rows);
        let hash = archetype_hash(&ids);
        let pair_count = ids.iter().filter(|e| e.is_pair()).count() as u8;
        debug!(archetype = id.0, components = ids.len(), capacity = layout.capacity, "created archetype");
        Archetype {
            id,
            ids,
            layout,
            hash,
            chunks: Vec::new(),
            edges_add: HashMap::default(),
            edges_del: HashMap::default(),
            pair_count,
            lifespan: 0,
            dead: false,
        }
    }

    pub fn id(&self) -> ArchetypeId { self.id }

    pub fn ids(&self) -> &[Entity] { &self.ids }

    pub fn hash(&self) -> u64 { self.hash }

    pub(crate) fn layout(&self) -> &ChunkLayout { &self.layout }

    pub fn pair_count(&self) -> u8 { self.pair_count }

    pub fn is_dead(&self) -> bool { self.dead }

    pub fn chunk_count(&self) -> usize { self.chunks.len() }

    pub(crate) fn chunk(&self, index: u32) -> &Chunk { &self.chunks[index as usize] }

    pub(crate) fn chunk_mut(&mut self, index: u32) -> &mut Chunk { &mut self.chunks[index as usize] }

    pub(crate) fn chunks(&self) -> &[Chunk] { &self.chunks }

    /// Total rows across all chunks.
    pub fn entity_count(&self) -> usize {
        self.chunks.iter().map(|c| c.len() as usize).sum()
    }

    /// Returns `true` if the archetype's id set contains exactly `key`.
    pub fn contains(&self, key: Entity) -> bool {
        self.ids.iter().any(|&id| id.raw() == key.raw())
    }

    /// Wildcard-aware containment test used by query matching. A pair
    /// pattern with [Entity::WILDCARD] in either slot matches any id in
    /// that slot.
    pub fn matches(&self, pattern: Entity) -> bool {
        self.first_match(pattern).is_some()
    }

    /// Index of the first id matching `pattern`, if any.
    pub fn first_match(&self, pattern: Entity) -> Option<usize> {
        self.ids.iter().position(|&id| id_matches(id, pattern))
    }

    // ----------------
    // Chunks
    // ----------------

    /// Returns the first non-full chunk, allocating a new one when all are
    /// full. This is the find-or-create step of every row insertion.
    pub fn find_or_create_chunk(
        &mut self,
        allocator: &mut ChunkAllocator,
        world_version: u32,
    ) -> Result<u32, EcsError> {
        self.find_or_create_chunk_from(0, allocator, world_version)
    }

    /// Bulk-insert variant: starts scanning at `start`, so repeated mass
    /// inserts do not rescan chunks they already filled.
    pub fn find_or_create_chunk_from(
        &mut self,
        start: u32,
        allocator: &mut ChunkAllocator,
        world_version: u32,
    ) -> Result<u32, EcsError> {
        let layout = &self.layout;
        if let Some(index) = self
            .chunks
            .iter()
            .enumerate()
            .skip(start as usize)
            .find(|(_, c)| !c.is_full(layout))
            .map(|(i, _)| i)
        {
            return Ok(index as u32);
        }
        let block = allocator.alloc(self.layout.data_bytes as usize)?;
        debug_assert_eq!(block.class(), self.layout.size_class);
        let index = self.chunks.len() as u32;
        self.chunks
            .push(Chunk::new(block, index, &self.layout, world_version));
        debug!(archetype = self.id.0, chunk = index, "allocated chunk");
        Ok(index)
    }

    /// Frees one expired empty chunk, keeping the chunk vector packed.
    /// Records of entities in the chunk swapped into its slot are updated.
    pub fn free_chunk(
        &mut self,
        index: u32,
        allocator: &mut ChunkAllocator,
        directory: &mut EntityDirectory,
    ) {
        let chunk = self.chunks.swap_remove(index as usize);
        debug_assert!(chunk.is_empty());
        allocator.free(chunk.into_block(&self.layout));
        debug!(archetype = self.id.0, chunk = index, "freed chunk");
        if (index as usize) < self.chunks.len() {
            self.chunks[index as usize].set_index(index);
            let moved = &self.chunks[index as usize];
            for row in 0..moved.len() {
                let entity = moved.entity_at(&self.layout, row);
                directory.record_at_mut(entity.id()).chunk = index;
            }
        }
        if self.chunks.is_empty() {
            self.begin_lifespan();
        }
    }

    /// Split-borrows the layout alongside one mutable chunk.
    pub(crate) fn layout_and_chunk_mut(&mut self, index: u32) -> (&ChunkLayout, &mut Chunk) {
        (&self.layout, &mut self.chunks[index as usize])
    }

    // ----------------
    // Row operations (layout-threading wrappers over the chunk)
    // ----------------

    pub(crate) fn alloc_row(&mut self, chunk: u32, entity: Entity, world_version: u32) -> u16 {
        let (layout, chunk) = (&self.layout, &mut self.chunks[chunk as usize]);
        chunk.alloc_row_uninit(entity, layout, world_version)
    }

    pub(crate) fn remove_row(
        &mut self,
        chunk: u32,
        row: u16,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) {
        let (layout, chunk) = (&self.layout, &mut self.chunks[chunk as usize]);
        chunk.remove_row(row, layout, world_version, directory);
    }

    pub(crate) fn release_row(
        &mut self,
        chunk: u32,
        row: u16,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) {
        let (layout, chunk) = (&self.layout, &mut self.chunks[chunk as usize]);
        chunk.release_row(row, layout, world_version, directory);
    }

    pub(crate) fn enable_row(
        &mut self,
        chunk: u32,
        row: u16,
        enable: bool,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) -> u16 {
        let (layout, chunk) = (&self.layout, &mut self.chunks[chunk as usize]);
        chunk.enable_row(row, enable, layout, world_version, directory)
    }

    /// Overwrites one component value, dropping the previous one. Bumps
    /// the column version unless `silent`.
    pub(crate) fn write_value(
        &mut self,
        chunk: u32,
        row: u16,
        key: Entity,
        value: &[u8],
        world_version: u32,
        silent: bool,
    ) {
        let (layout, chunk) = (&self.layout, &mut self.chunks[chunk as usize]);
        let column = layout
            .find_column(key)
            .unwrap_or_else(|| panic!("entity does not have component {key}"));
        let info = layout.column(column);
        assert_eq!(value.len(), info.size as usize, "component size mismatch");
        if info.is_tag() {
            return;
        }
        let row = match info.kind {
            EntityKind::Unique => 0,
            EntityKind::Generic => row,
        };
        let slot = chunk.value_ptr(layout, column, row);
        // safety: the slot holds an initialized value; the new bytes move
        // in after the old value is dropped
        unsafe {
            if let Some(desc) = info.desc.as_ref() {
                desc.drop_in_place(slot);
            }
            std::ptr::copy_nonoverlapping(value.as_ptr(), slot, info.size as usize);
        }
        if !silent {
            chunk.set_version(column, world_version);
        }
    }

    // ----------------
    // Graph edges
    // ----------------

    pub fn set_add_edge(&mut self, key: Entity, target: ArchetypeId) {
        self.edges_add.insert(key, target);
    }

    pub fn set_del_edge(&mut self, key: Entity, target: ArchetypeId) {
        self.edges_del.insert(key, target);
    }

    pub fn add_edge(&self, key: Entity) -> Option<ArchetypeId> {
        self.edges_add.get(&key).copied()
    }

    pub fn del_edge(&self, key: Entity) -> Option<ArchetypeId> {
        self.edges_del.get(&key).copied()
    }

    pub fn clear_add_edge(&mut self, key: Entity) { self.edges_add.remove(&key); }

    pub fn clear_del_edge(&mut self, key: Entity) { self.edges_del.remove(&key); }

    pub(crate) fn add_edges(&self) -> impl Iterator<Item = (Entity, ArchetypeId)> + '_ {
        self.edges_add.iter().map(|(k, v)| (*k, *v))
    }

    pub(crate) fn del_edges(&self) -> impl Iterator<Item = (Entity, ArchetypeId)> + '_ {
        self.edges_del.iter().map(|(k, v)| (*k, *v))
    }

    // ----------------
    // Defragmentation
    // ----------------

    /// Migrates rows from tail chunks into the free space of head chunks,
    /// spending at most `budget` row moves. Chunks whose unique-value
    /// tuples differ are never merged. Returns the number of rows moved.
    pub fn defrag(
        &mut self,
        budget: &mut u32,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) -> u32 {
        let mut moved = 0;
        let mut front = 0usize;
        let mut back = self.chunks.len().saturating_sub(1);

        while front < back && *budget > 0 {
            if self.chunks[front].is_full(&self.layout) {
                front += 1;
                continue;
            }
            if self.chunks[back].is_empty() {
                back -= 1;
                continue;
            }
            if !self.unique_tuples_match(front, back) {
                back -= 1;
                continue;
            }

            let (head, tail) = self.chunks.split_at_mut(back);
            let dst = &mut head[front];
            let src = &mut tail[0];

            let src_row = src.len() - 1;
            let entity = src.entity_at(&self.layout, src_row);
            let was_enabled = src_row >= src.first_enabled();

            let dst_row = dst.alloc_row_uninit(entity, &self.layout, world_version);
            // safety: dst row is uninitialized, src row initialized, same layout
            unsafe {
                for column in 0..self.layout.generic_count {
                    let info = self.layout.column(column);
                    if info.is_tag() {
                        continue;
                    }
                    std::ptr::copy_nonoverlapping(
                        src.value_ptr(&self.layout, column, src_row),
                        dst.value_ptr(&self.layout, column, dst_row),
                        info.size as usize,
                    );
                }
            }
            src.release_row(src_row, &self.layout, world_version, directory);

            let record = directory.record_at_mut(entity.id());
            record.chunk = front as u32;
            record.row = dst_row as u32;
            if !was_enabled {
                let final_row =
                    dst.enable_row(dst_row, false, &self.layout, world_version, directory);
                directory.record_at_mut(entity.id()).row = final_row as u32;
            }

            moved += 1;
            *budget -= 1;
        }
        moved
    }

    fn unique_tuples_match(&self, a: usize, b: usize) -> bool {
        for column in self.layout.generic_count..self.layout.column_count() {
            let info = self.layout.column(column);
            if info.is_tag() {
                continue;
            }
            let desc = info.desc.as_ref().expect("sized column without descriptor");
            // safety: unique slots are always initialized
            let equal = unsafe {
                desc.compare(
                    self.chunks[a].value_ptr(&self.layout, column, 0),
                    self.chunks[b].value_ptr(&self.layout, column, 0),
                )
            };
            if !equal {
                return false;
            }
        }
        true
    }

    // ----------------
    // Lifespan
    // ----------------

    pub fn is_dying(&self) -> bool { self.lifespan > 0 }

    fn begin_lifespan(&mut self) { self.lifespan = MAX_ARCHETYPE_LIFESPAN; }

    pub fn revive(&mut self) { self.lifespan = 0; }

    /// Advances the countdown one gc tick. Returns `true` once expired.
    pub fn progress_lifespan(&mut self) -> bool {
        debug_assert!(self.is_dying());
        self.lifespan -= 1;
        self.lifespan == 0
    }

    /// Marks the archetype dead and releases its remaining chunks.
    pub fn destroy(&mut self, allocator: &mut ChunkAllocator) {
        for chunk in self.chunks.drain(..) {
            allocator.free(chunk.into_block(&self.layout));
        }
        self.edges_add.clear();
        self.edges_del.clear();
        self.dead = true;
    }

    pub(crate) fn diag(&self, sink: &mut dyn fmt::Write) -> fmt::Result {
        use itertools::Itertools;
        writeln!(
            sink,
            "  archetype #{} [{}] chunks:{} rows:{} pairs:{}{}",
            self.id.0,
            self.ids.iter().map(|id| id.to_string()).join(", "),
            self.chunks.len(),
            self.entity_count(),
            self.pair_count(),
            if self.dead { " (dead)" } else { "" },
        )?;
        for chunk in &self.chunks {
            writeln!(
                sink,
                "    chunk #{:04} rows:{}/{} disabled:{}{}",
                chunk.index(),
                chunk.len(),
                self.layout.capacity,
                chunk.first_enabled(),
                if chunk.is_dying() { " (dying)" } else { "" },
            )?;
        }
        Ok(())
    }
}

/// Wildcard-aware id comparison: does the concrete id `id` satisfy the
/// possibly-wildcarded `pattern`?
pub(crate) fn id_matches(id: Entity, pattern: Entity) -> bool {
    if pattern.is_pair() != id.is_pair() {
        return false;
    }
    if !pattern.is_pair() {
        return id.raw() == pattern.raw();
    }
    let relation_ok = pattern.is_wildcard() || id.id() == pattern.id();
    let target_ok = pattern.target_is_wildcard() || id.gen() == pattern.gen();
    relation_ok && target_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComponentDesc;
    use smallvec::smallvec;

    fn value_archetype(id: ArchetypeId) -> Archetype {
        let component = Entity::new(50, 0);
        let desc = Some(ComponentDesc::of::<u64>(component, EntityKind::Generic));
        Archetype::new(id, smallvec![component], &[desc])
    }

    #[test]
    fn defrag_moves_tail_rows_forward_within_budget() {
        let mut allocator = ChunkAllocator::new();
        let mut directory = EntityDirectory::new();
        let mut archetype = value_archetype(ArchetypeId(1));
        let capacity = archetype.layout().capacity;

        // two full chunks and a sparse tail
        let total = capacity as usize * 2 + 3;
        for _ in 0..total {
            let entity = directory.alloc(EntityKind::Generic);
            let chunk = archetype.find_or_create_chunk(&mut allocator, 1).unwrap();
            let row = archetype.alloc_row(chunk, entity, 1);
            {
                let (layout, chunk) = archetype.layout_and_chunk_mut(chunk);
                chunk.construct_value(layout, 0, row);
            }
            let record = directory.record_mut(entity);
            record.arch = archetype.id();
            record.chunk = chunk;
            record.row = row as u32;
        }
        assert_eq!(archetype.chunk_count(), 3);

        // open two holes in the first chunk
        for _ in 0..2 {
            let removed = archetype.chunk(0).entity_at(archetype.layout(), 0);
            archetype.remove_row(0, 0, 1, &mut directory);
            directory.free(removed);
        }

        let mut budget = 1;
        assert_eq!(archetype.defrag(&mut budget, 2, &mut directory), 1);
        assert_eq!(budget, 0);

        let mut budget = 100;
        let moved = archetype.defrag(&mut budget, 3, &mut directory);
        assert_eq!(moved, 1);
        assert_eq!(archetype.chunk(0).len(), capacity);
        assert_eq!(archetype.chunk(2).len(), 1);
        assert_eq!(archetype.entity_count(), total - 2);
        assert!(directory.validate());

        archetype.destroy(&mut allocator);
    }

    #[test]
    fn sort_order_puts_pairs_and_uniques_last() {
        let generic_a = Entity::new(5, 0);
        let generic_b = Entity::new(9, 0);
        let unique = Entity::with_kind(2, 0, EntityKind::Unique);
        let pair = Entity::pair(Entity::new(1, 0), Entity::new(3, 0));

        let mut ids = vec![unique, pair, generic_b, generic_a];
        ids.sort_by(|a, b| sort_component_cond(*a, *b));
        assert_eq!(ids, vec![generic_a, generic_b, pair, unique]);
    }

    #[test]
    fn hash_depends_on_the_full_set() {
        let a = Entity::new(1, 0);
        let b = Entity::new(2, 0);
        assert_ne!(archetype_hash(&[a]), archetype_hash(&[a, b]));
        assert_eq!(archetype_hash(&[a, b]), archetype_hash(&[a, b]));
    }

    #[test]
    fn wildcard_pair_matching() {
        let rel = Entity::new(4, 0);
        let tgt = Entity::new(7, 0);
        let id = Entity::pair(rel, tgt);

        assert!(id_matches(id, Entity::pair(rel, tgt)));
        assert!(id_matches(id, Entity::pair(Entity::WILDCARD, tgt)));
        assert!(id_matches(id, Entity::pair(rel, Entity::WILDCARD)));
        assert!(id_matches(
            id,
            Entity::pair(Entity::WILDCARD, Entity::WILDCARD)
        ));
        assert!(!id_matches(id, Entity::pair(tgt, rel)));
        assert!(!id_matches(id, rel));
    }
}
