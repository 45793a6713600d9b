//! Raw chunk storage and row operations.
//!
//! A chunk is one allocator block addressed through the layout computed by
//! its archetype. Rows are kept packed: removal swaps the last row into the
//! vacated slot, and enabled/disabled entities form a two-sided partition
//! `[disabled | enabled]` split at `first_enabled`.

use std::slice;

use crate::alloc::Block;
use crate::entity::{Entity, EntityDirectory, EntityKind};
use crate::storage::layout::{ChunkLayout, VERSION_SIZE};

/// Ticks an empty chunk survives before gc reclaims it (4-bit countdown).
pub(crate) const MAX_CHUNK_LIFESPAN: u8 = 15;

/// A fixed-capacity slab of rows for one archetype.
pub(crate) struct Chunk {
    block: Block,
    index: u32,
    count: u16,
    count_enabled: u16,
    first_enabled: u16,
    lifespan: u8,
    lock: u16,
}

impl Chunk {
    /// Wraps a freshly allocated block. Version counters start at the
    /// current world version and unique values are default-constructed.
    pub fn new(block: Block, index: u32, layout: &ChunkLayout, world_version: u32) -> Chunk {
        let chunk = Chunk {
            block,
            index,
            count: 0,
            count_enabled: 0,
            first_enabled: 0,
            lifespan: 0,
            lock: 0,
        };
        for column in 0..layout.column_count() {
            chunk.set_version(column, world_version);
        }
        for (column, info) in layout.columns.iter().enumerate() {
            if info.kind == EntityKind::Unique && !info.is_tag() {
                // safety: the slot is uninitialized block memory
                unsafe {
                    info.desc
                        .as_ref()
                        .expect("sized column without descriptor")
                        .construct(chunk.value_ptr(layout, column, 0));
                }
            }
        }
        chunk
    }

    /// Drops every remaining value and returns the backing block.
    pub fn into_block(mut self, layout: &ChunkLayout) -> Block {
        for row in 0..self.count {
            self.drop_row_values(layout, row);
        }
        for (column, info) in layout.columns.iter().enumerate() {
            if info.kind == EntityKind::Unique && !info.is_tag() {
                if let Some(desc) = &info.desc {
                    // safety: unique slots stay initialized for the chunk's lifetime
                    unsafe { desc.drop_in_place(self.value_ptr(layout, column, 0)) };
                }
            }
        }
        self.count = 0;
        self.count_enabled = 0;
        self.first_enabled = 0;
        self.block
    }

    #[inline]
    fn data(&self) -> *mut u8 { self.block.ptr().as_ptr() }

    pub fn index(&self) -> u32 { self.index }

    pub fn set_index(&mut self, index: u32) { self.index = index; }

    pub fn len(&self) -> u16 { self.count }

    pub fn is_empty(&self) -> bool { self.count == 0 }

    pub fn is_full(&self, layout: &ChunkLayout) -> bool { self.count == layout.capacity }

    pub fn first_enabled(&self) -> u16 { self.first_enabled }

    // ----------------
    // Versions
    // ----------------

    #[inline]
    fn version_ptr(&self, column: usize) -> *mut u32 {
        // safety: version counters occupy the head of the block
        unsafe { self.data().add(column * VERSION_SIZE as usize).cast() }
    }

    /// The version of one column, compared by change-filtered queries.
    pub fn column_version(&self, column: usize) -> u32 {
        // safety: in-bounds per layout, u32-aligned
        unsafe { self.version_ptr(column).read() }
    }

    pub fn set_version(&self, column: usize, world_version: u32) {
        // safety: in-bounds per layout, u32-aligned
        unsafe { self.version_ptr(column).write(world_version) };
    }

    fn touch_all(&self, layout: &ChunkLayout, world_version: u32) {
        for column in 0..layout.column_count() {
            self.set_version(column, world_version);
        }
    }

    // ----------------
    // Entity ids
    // ----------------

    #[inline]
    fn entity_ptr(&self, layout: &ChunkLayout, row: u16) -> *mut Entity {
        debug_assert!(row < layout.capacity);
        // safety: the entity column spans `capacity` slots from entities_offset
        unsafe {
            self.data()
                .add(layout.entities_offset as usize + row as usize * std::mem::size_of::<Entity>())
                .cast()
        }
    }

    pub fn entity_at(&self, layout: &ChunkLayout, row: u16) -> Entity {
        debug_assert!(row < self.count);
        // safety: rows below `count` always hold a written id
        unsafe { self.entity_ptr(layout, row).read() }
    }

    /// All occupied rows' entity ids.
    pub fn entities<'a>(&'a self, layout: &ChunkLayout) -> &'a [Entity] {
        // safety: rows 0..count are initialized; the slice cannot outlive self
        unsafe { slice::from_raw_parts(self.entity_ptr(layout, 0), self.count as usize) }
    }

    // ----------------
    // Value columns
    // ----------------

    /// Raw pointer to one value slot.
    #[inline]
    pub fn value_ptr(&self, layout: &ChunkLayout, column: usize, row: u16) -> *mut u8 {
        // safety: value_offset is bounds- and alignment-checked by the layout
        unsafe { self.data().add(layout.value_offset(column, row) as usize) }
    }

    /// Typed view over the generic column `column`, rows `first..last`.
    pub fn column_slice<'a, T>(
        &'a self,
        layout: &ChunkLayout,
        column: usize,
        first: u16,
        last: u16,
    ) -> &'a [T] {
        let info = layout.column(column);
        assert_eq!(info.size as usize, std::mem::size_of::<T>(), "component size mismatch");
        debug_assert!(info.align as usize >= std::mem::align_of::<T>());
        debug_assert!(info.kind == EntityKind::Generic && first <= last && last <= self.count);
        // safety: checked size/alignment; rows below count are initialized
        unsafe {
            slice::from_raw_parts(
                self.value_ptr(layout, column, first).cast(),
                (last - first) as usize,
            )
        }
    }

    /// Mutable typed view over the generic column `column`.
    pub fn column_slice_mut<'a, T>(
        &'a mut self,
        layout: &ChunkLayout,
        column: usize,
        first: u16,
        last: u16,
    ) -> &'a mut [T] {
        let info = layout.column(column);
        assert_eq!(info.size as usize, std::mem::size_of::<T>(), "component size mismatch");
        debug_assert!(info.align as usize >= std::mem::align_of::<T>());
        debug_assert!(info.kind == EntityKind::Generic && first <= last && last <= self.count);
        // safety: as column_slice, and &mut self guarantees exclusivity
        unsafe {
            slice::from_raw_parts_mut(
                self.value_ptr(layout, column, first).cast(),
                (last - first) as usize,
            )
        }
    }

    /// The chunk-wide value of a unique column.
    pub fn unique_value<'a, T>(&'a self, layout: &ChunkLayout, column: usize) -> &'a T {
        let info = layout.column(column);
        assert_eq!(info.size as usize, std::mem::size_of::<T>(), "component size mismatch");
        debug_assert!(info.kind == EntityKind::Unique);
        // safety: unique slots are constructed in Chunk::new
        unsafe { &*self.value_ptr(layout, column, 0).cast() }
    }

    // ----------------
    // Structural lock
    // ----------------

    pub fn lock(&mut self) { self.lock += 1; }

    pub fn unlock(&mut self) {
        debug_assert!(self.lock > 0);
        self.lock -= 1;
    }

    #[inline]
    fn assert_unlocked(&self) {
        assert_eq!(
            self.lock, 0,
            "structural change attempted while the chunk is locked for iteration"
        );
    }

    // ----------------
    // Row operations
    // ----------------

    /// Appends a row for `entity` without initializing its values. The
    /// caller must construct or move a value into every sized generic
    /// column before the row can be dropped or read.
    pub fn alloc_row_uninit(
        &mut self,
        entity: Entity,
        layout: &ChunkLayout,
        world_version: u32,
    ) -> u16 {
        self.assert_unlocked();
        assert!(!self.is_full(layout), "chunk overflow");
        let row = self.count;
        // safety: row < capacity
        unsafe { self.entity_ptr(layout, row).write(entity) };
        self.count += 1;
        self.count_enabled += 1;
        self.touch_all(layout, world_version);
        self.revive();
        row
    }

    /// Default-constructs the value of one column at `row`.
    pub fn construct_value(&mut self, layout: &ChunkLayout, column: usize, row: u16) {
        let info = layout.column(column);
        if info.is_tag() {
            return;
        }
        debug_assert!(info.kind == EntityKind::Generic);
        // safety: the slot is uninitialized per alloc_row_uninit's contract
        unsafe {
            info.desc
                .as_ref()
                .expect("sized column without descriptor")
                .construct(self.value_ptr(layout, column, row));
        }
    }

    fn drop_row_values(&mut self, layout: &ChunkLayout, row: u16) {
        for column in 0..layout.generic_count {
            let info = layout.column(column);
            if info.is_tag() {
                continue;
            }
            if let Some(desc) = &info.desc {
                // safety: occupied rows hold initialized values
                unsafe { desc.drop_in_place(self.value_ptr(layout, column, row)) };
            }
        }
    }

    /// Moves row `from`'s id and generic values over row `to`, whose values
    /// must already have been moved out or dropped, and repoints the moved
    /// entity's directory record.
    fn relocate_row(
        &mut self,
        layout: &ChunkLayout,
        from: u16,
        to: u16,
        directory: &mut EntityDirectory,
    ) {
        debug_assert_ne!(from, to);
        let moved = self.entity_at(layout, from);
        // safety: both rows are in bounds; `to` holds no live values
        unsafe {
            self.entity_ptr(layout, to).write(moved);
            for column in 0..layout.generic_count {
                let info = layout.column(column);
                if info.is_tag() {
                    continue;
                }
                std::ptr::copy_nonoverlapping(
                    self.value_ptr(layout, column, from),
                    self.value_ptr(layout, column, to),
                    info.size as usize,
                );
            }
        }
        directory.record_at_mut(moved.id()).row = to as u32;
    }

    /// Removes `row` after its values have been moved out or dropped by
    /// the caller. Keeps rows packed and the enabled partition intact.
    pub fn release_row(
        &mut self,
        row: u16,
        layout: &ChunkLayout,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) {
        self.assert_unlocked();
        assert!(row < self.count);
        let removed_enabled = row >= self.first_enabled;

        let mut hole = row;
        if !removed_enabled {
            // Close the gap inside the disabled region first, then shrink
            // the region so the final move stays within the enabled range.
            let last_disabled = self.first_enabled - 1;
            if hole != last_disabled {
                self.relocate_row(layout, last_disabled, hole, directory);
            }
            hole = last_disabled;
            self.first_enabled -= 1;
        }

        let last = self.count - 1;
        if hole != last {
            self.relocate_row(layout, last, hole, directory);
        }
        self.count -= 1;
        if removed_enabled {
            self.count_enabled -= 1;
        }
        debug_assert_eq!(self.count_enabled, self.count - self.first_enabled);
        self.touch_all(layout, world_version);

        if self.count == 0 {
            self.begin_lifespan();
        }
    }

    /// Drops the values at `row` and removes it.
    pub fn remove_row(
        &mut self,
        row: u16,
        layout: &ChunkLayout,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) {
        self.assert_unlocked();
        assert!(row < self.count);
        self.drop_row_values(layout, row);
        self.release_row(row, layout, world_version, directory);
    }

    /// Byte-level swap of two rows, repointing both directory records.
    pub fn swap_rows(
        &mut self,
        a: u16,
        b: u16,
        layout: &ChunkLayout,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) {
        self.assert_unlocked();
        assert!(a < self.count && b < self.count);
        if a == b {
            return;
        }
        let entity_a = self.entity_at(layout, a);
        let entity_b = self.entity_at(layout, b);
        // safety: distinct in-bounds rows, so the ranges never overlap
        unsafe {
            self.entity_ptr(layout, a).write(entity_b);
            self.entity_ptr(layout, b).write(entity_a);
            for column in 0..layout.generic_count {
                let info = layout.column(column);
                if info.is_tag() {
                    continue;
                }
                std::ptr::swap_nonoverlapping(
                    self.value_ptr(layout, column, a),
                    self.value_ptr(layout, column, b),
                    info.size as usize,
                );
            }
        }
        directory.record_at_mut(entity_a.id()).row = b as u32;
        directory.record_at_mut(entity_b.id()).row = a as u32;
        self.touch_all(layout, world_version);
    }

    /// Moves `row` across the enabled/disabled partition boundary.
    /// Returns the row the entity occupies afterwards.
    pub fn enable_row(
        &mut self,
        row: u16,
        enable: bool,
        layout: &ChunkLayout,
        world_version: u32,
        directory: &mut EntityDirectory,
    ) -> u16 {
        self.assert_unlocked();
        assert!(row < self.count);
        if enable {
            if row >= self.first_enabled {
                return row;
            }
            let target = self.first_enabled - 1;
            self.swap_rows(row, target, layout, world_version, directory);
            self.first_enabled -= 1;
            self.count_enabled += 1;
            target
        } else {
            if row < self.first_enabled {
                return row;
            }
            let target = self.first_enabled;
            self.swap_rows(row, target, layout, world_version, directory);
            self.first_enabled += 1;
            self.count_enabled -= 1;
            target
        }
    }

    // ----------------
    // Lifespan
    // ----------------

    pub fn is_dying(&self) -> bool { self.lifespan > 0 }

    fn begin_lifespan(&mut self) { self.lifespan = MAX_CHUNK_LIFESPAN; }

    fn revive(&mut self) { self.lifespan = 0; }

    /// Advances the countdown one gc tick. Returns `true` once expired.
    pub fn progress_lifespan(&mut self) -> bool {
        debug_assert!(self.is_dying());
        self.lifespan -= 1;
        self.lifespan == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ChunkAllocator;
    use crate::registry::ComponentDesc;

    struct Fixture {
        allocator: ChunkAllocator,
        layout: ChunkLayout,
        directory: EntityDirectory,
    }

    fn fixture() -> Fixture {
        let id = Entity::new(100, 0);
        let desc = Some(ComponentDesc::of::<u64>(id, EntityKind::Generic));
        Fixture {
            allocator: ChunkAllocator::new(),
            layout: ChunkLayout::compute(&[id], &[desc], 8),
            directory: EntityDirectory::new(),
        }
    }

    fn fill(fx: &mut Fixture, chunk: &mut Chunk, rows: u16) -> Vec<Entity> {
        (0..rows)
            .map(|i| {
                let entity = fx.directory.alloc(EntityKind::Generic);
                let row = chunk.alloc_row_uninit(entity, &fx.layout, 1);
                chunk.construct_value(&fx.layout, 0, row);
                chunk.column_slice_mut::<u64>(&fx.layout, 0, row, row + 1)[0] = i as u64;
                let record = fx.directory.record_mut(entity);
                record.chunk = 0;
                record.row = row as u32;
                entity
            })
            .collect()
    }

    #[test]
    fn remove_swaps_the_last_row_in() {
        let mut fx = fixture();
        let block = fx.allocator.alloc(fx.layout.data_bytes as usize).unwrap();
        let mut chunk = Chunk::new(block, 0, &fx.layout, 1);
        let entities = fill(&mut fx, &mut chunk, 4);

        chunk.remove_row(1, &fx.layout, 2, &mut fx.directory);
        assert_eq!(chunk.len(), 3);
        // the old last row took the vacated slot
        assert_eq!(chunk.entity_at(&fx.layout, 1), entities[3]);
        assert_eq!(fx.directory.record(entities[3]).row, 1);
        assert_eq!(chunk.column_slice::<u64>(&fx.layout, 0, 1, 2)[0], 3);

        fx.allocator.free(chunk.into_block(&fx.layout));
    }

    #[test]
    fn removing_the_last_row_starts_the_countdown() {
        let mut fx = fixture();
        let block = fx.allocator.alloc(fx.layout.data_bytes as usize).unwrap();
        let mut chunk = Chunk::new(block, 0, &fx.layout, 1);
        fill(&mut fx, &mut chunk, 1);

        assert!(!chunk.is_dying());
        chunk.remove_row(0, &fx.layout, 2, &mut fx.directory);
        assert!(chunk.is_empty());
        assert!(chunk.is_dying());

        // a new row cancels it
        let entity = fx.directory.alloc(EntityKind::Generic);
        let row = chunk.alloc_row_uninit(entity, &fx.layout, 3);
        chunk.construct_value(&fx.layout, 0, row);
        assert!(!chunk.is_dying());

        fx.allocator.free(chunk.into_block(&fx.layout));
    }

    #[test]
    fn enable_partition_moves_through_the_boundary() {
        let mut fx = fixture();
        let block = fx.allocator.alloc(fx.layout.data_bytes as usize).unwrap();
        let mut chunk = Chunk::new(block, 0, &fx.layout, 1);
        let entities = fill(&mut fx, &mut chunk, 5);

        let new_row = chunk.enable_row(2, false, &fx.layout, 2, &mut fx.directory);
        assert_eq!(new_row, 0);
        assert_eq!(chunk.first_enabled(), 1);
        assert_eq!(chunk.entity_at(&fx.layout, 0), entities[2]);
        assert_eq!(fx.directory.record(entities[2]).row, 0);
        // the entity that used to sit at the boundary moved up
        assert_eq!(fx.directory.record(entities[0]).row, 2);

        // removing a disabled row keeps the partition intact
        chunk.remove_row(0, &fx.layout, 3, &mut fx.directory);
        assert_eq!(chunk.first_enabled(), 0);
        assert_eq!(chunk.len(), 4);

        fx.allocator.free(chunk.into_block(&fx.layout));
    }

    #[test]
    fn row_mutations_stamp_column_versions() {
        let mut fx = fixture();
        let block = fx.allocator.alloc(fx.layout.data_bytes as usize).unwrap();
        let mut chunk = Chunk::new(block, 0, &fx.layout, 7);
        assert_eq!(chunk.column_version(0), 7);

        let entity = fx.directory.alloc(EntityKind::Generic);
        let row = chunk.alloc_row_uninit(entity, &fx.layout, 9);
        chunk.construct_value(&fx.layout, 0, row);
        assert_eq!(chunk.column_version(0), 9);

        fx.allocator.free(chunk.into_block(&fx.layout));
    }

    #[test]
    #[should_panic(expected = "locked for iteration")]
    fn structural_change_under_lock_panics() {
        let mut fx = fixture();
        let block = fx.allocator.alloc(fx.layout.data_bytes as usize).unwrap();
        let mut chunk = Chunk::new(block, 0, &fx.layout, 1);
        fill(&mut fx, &mut chunk, 1);

        chunk.lock();
        chunk.remove_row(0, &fx.layout, 2, &mut fx.directory);
    }
}
