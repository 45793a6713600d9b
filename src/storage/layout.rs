//! Chunk data-area layout: column offsets and row capacity.
//!
//! The layout is computed once per archetype and shared by all of its
//! chunks. A chunk's block holds, in order: one `u32` version counter per
//! column, the entity-id column, then one value column per component with
//! storage. Every column starts at an address aligned to its component's
//! alignment.

use smallvec::SmallVec;

use crate::alloc::{SizeClass, LARGE_BLOCK, SMALL_BLOCK};
use crate::entity::{Entity, EntityKind};
use crate::registry::ComponentDesc;

/// Hard cap on components per archetype.
pub const MAX_COMPONENTS: usize = 32;

pub(crate) const VERSION_SIZE: u32 = std::mem::size_of::<u32>() as u32;
pub(crate) const ENTITY_SIZE: u32 = std::mem::size_of::<Entity>() as u32;

#[inline]
fn align_up(offset: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// One column of a chunk. Tag columns (`size == 0`) occupy a version slot
/// but no data.
#[derive(Clone)]
pub(crate) struct ColumnInfo {
    /// The component key stored in this column.
    pub id: Entity,
    /// Storage descriptor; `None` for pairs of plain entities.
    pub desc: Option<ComponentDesc>,
    /// Byte offset of the column within the block.
    pub offset: u32,
    pub size: u32,
    pub align: u32,
    /// Row-per-entity or one-per-chunk.
    pub kind: EntityKind,
}

impl ColumnInfo {
    pub fn is_tag(&self) -> bool { self.size == 0 }

    /// Number of value slots the column holds in a chunk of `capacity` rows.
    pub fn slots(&self, capacity: u16) -> u32 {
        match self.kind {
            EntityKind::Generic => capacity as u32,
            EntityKind::Unique => 1,
        }
    }
}

/// The precomputed layout of one archetype's chunks.
pub(crate) struct ChunkLayout {
    pub columns: SmallVec<[ColumnInfo; 8]>,
    /// Offset of the entity-id column. Version counters sit at offset 0.
    pub entities_offset: u32,
    /// Rows one chunk can hold.
    pub capacity: u16,
    /// Columns `0..generic_count` are generic; the rest are unique.
    pub generic_count: usize,
    /// Bytes of the block actually addressed by the layout.
    pub data_bytes: u32,
    pub size_class: SizeClass,
}

impl ChunkLayout {
    /// Computes offsets and capacity for the given sorted id set.
    ///
    /// The capacity guess is made against the large block and walked down
    /// whenever alignment padding overshoots; if the final layout would
    /// leave most of a large block empty, the small block is used instead.
    pub fn compute(ids: &[Entity], descs: &[Option<ComponentDesc>], max_rows: u16) -> ChunkLayout {
        assert!(ids.len() <= MAX_COMPONENTS, "too many components for one archetype");
        assert_eq!(ids.len(), descs.len());

        let mut columns: SmallVec<[ColumnInfo; 8]> = ids
            .iter()
            .zip(descs)
            .map(|(&id, desc)| ColumnInfo {
                id,
                desc: desc.clone(),
                offset: 0,
                size: desc.as_ref().map(|d| d.size()).unwrap_or(0),
                align: desc.as_ref().map(|d| d.align().max(1)).unwrap_or(1),
                kind: id.kind(),
            })
            .collect();
        let generic_count = columns
            .iter()
            .take_while(|c| c.kind == EntityKind::Generic)
            .count();
        debug_assert!(
            columns[generic_count..].iter().all(|c| c.kind == EntityKind::Unique),
            "column order must put generic ids first"
        );

        let fixed = align_up(VERSION_SIZE * columns.len() as u32, ENTITY_SIZE);
        let generic_row_bytes: u32 = columns[..generic_count].iter().map(|c| c.size).sum();
        let unique_bytes: u32 = columns[generic_count..].iter().map(|c| c.size).sum();

        let (capacity, data_bytes, size_class) = Self::fit(
            &columns,
            generic_count,
            fixed,
            generic_row_bytes,
            unique_bytes,
            max_rows,
        );

        // Final offset assignment for the chosen capacity.
        let mut offset = fixed + ENTITY_SIZE * capacity as u32;
        for column in columns.iter_mut() {
            if column.size == 0 {
                continue;
            }
            offset = align_up(offset, column.align);
            column.offset = offset;
            offset += column.size * column.slots(capacity);
        }
        debug_assert_eq!(offset, data_bytes);
        assert!(
            data_bytes as usize <= size_class.block_bytes(),
            "a single row does not fit in the largest chunk block"
        );

        ChunkLayout {
            columns,
            entities_offset: fixed,
            capacity,
            generic_count,
            data_bytes,
            size_class,
        }
    }

    fn fit(
        columns: &[ColumnInfo],
        generic_count: usize,
        fixed: u32,
        generic_row_bytes: u32,
        unique_bytes: u32,
        max_rows: u16,
    ) -> (u16, u32, SizeClass) {
        let walk = |capacity: u16| -> u32 {
            let mut offset = fixed + ENTITY_SIZE * capacity as u32;
            for column in columns {
                if column.size == 0 {
                    continue;
                }
                offset = align_up(offset, column.align);
                offset += column.size * column.slots(capacity);
            }
            offset
        };

        let estimate = |target: u32| -> u16 {
            let row = generic_row_bytes + ENTITY_SIZE;
            let budget = target.saturating_sub(fixed + unique_bytes + 1);
            let mut capacity = (budget / row).min(max_rows as u32).max(1) as u16;
            // The first guess ignores per-column alignment padding; walk it
            // down until the layout fits.
            loop {
                let used = walk(capacity);
                if used <= target || capacity == 1 {
                    break;
                }
                let overshoot = used - target;
                let shrink = (overshoot / row).max(1) as u16;
                capacity = capacity.saturating_sub(shrink).max(1);
            }
            capacity
        };

        let capacity = estimate(LARGE_BLOCK as u32);
        let used = walk(capacity);
        let midpoint = ((SMALL_BLOCK + LARGE_BLOCK) / 2) as u32;
        if used < midpoint {
            // The layout leaves most of a large block idle; repack into
            // the small class, unless a single row is too wide for it.
            let small_capacity = estimate(SMALL_BLOCK as u32);
            let small_used = walk(small_capacity);
            if small_used <= SMALL_BLOCK as u32 {
                return (small_capacity, small_used, SizeClass::Small);
            }
        }
        (capacity, used, SizeClass::Large)
    }

    /// Index of the column storing exactly `key`, if any.
    pub fn find_column(&self, key: Entity) -> Option<usize> {
        self.columns.iter().position(|c| {
            c.id.raw() == key.raw() || (c.id.is_pair() == key.is_pair() && c.id.id() == key.id() && c.id.gen() == key.gen())
        })
    }

    pub fn column(&self, index: usize) -> &ColumnInfo { &self.columns[index] }

    pub fn column_count(&self) -> usize { self.columns.len() }

    /// Byte offset of row `row` in column `index`.
    #[inline]
    pub fn value_offset(&self, index: usize, row: u16) -> u32 {
        let column = &self.columns[index];
        debug_assert!(!column.is_tag());
        debug_assert!(row < self.capacity);
        match column.kind {
            EntityKind::Generic => column.offset + column.size * row as u32,
            EntityKind::Unique => column.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use crate::registry::ComponentDesc;

    #[derive(Clone, Default, PartialEq)]
    struct Pos([f32; 3]);
    #[derive(Clone, PartialEq)]
    struct Big([u8; 4096]);
    #[derive(Clone, Default, PartialEq)]
    struct Tag;

    impl Default for Big {
        fn default() -> Self { Big([0; 4096]) }
    }

    fn desc_of<T: crate::registry::Component>(id: u32, kind: EntityKind) -> Option<ComponentDesc> {
        Some(ComponentDesc::of::<T>(
            Entity::with_kind(id, 0, kind),
            kind,
        ))
    }

    #[test]
    fn columns_are_aligned_and_in_bounds() {
        let ids = [
            Entity::new(1, 0),
            Entity::new(2, 0),
            Entity::with_kind(3, 0, EntityKind::Unique),
        ];
        let descs = [
            desc_of::<Pos>(1, EntityKind::Generic),
            desc_of::<u64>(2, EntityKind::Generic),
            desc_of::<u32>(3, EntityKind::Unique),
        ];
        let layout = ChunkLayout::compute(&ids, &descs, 512);

        assert_eq!(layout.generic_count, 2);
        assert!(layout.capacity > 1);
        for (i, column) in layout.columns.iter().enumerate() {
            if column.is_tag() {
                continue;
            }
            assert_eq!(column.offset % column.align, 0, "column {i} misaligned");
            let end = column.offset + column.size * column.slots(layout.capacity);
            assert!(end <= layout.data_bytes);
        }
        assert!(layout.data_bytes as usize <= layout.size_class.block_bytes());
    }

    #[test]
    fn small_layouts_prefer_small_blocks() {
        let ids = [Entity::new(1, 0)];
        let descs = [desc_of::<Pos>(1, EntityKind::Generic)];
        let layout = ChunkLayout::compute(&ids, &descs, 64);
        assert_eq!(layout.size_class, SizeClass::Small);
        assert_eq!(layout.capacity, 64);
    }

    #[test]
    fn wide_rows_take_the_large_block() {
        let ids = [Entity::new(1, 0)];
        let descs = [desc_of::<Big>(1, EntityKind::Generic)];
        let layout = ChunkLayout::compute(&ids, &descs, 512);
        assert_eq!(layout.size_class, SizeClass::Large);
        assert!(layout.capacity >= 3);
        assert!(layout.capacity as usize * 4096 <= LARGE_BLOCK);
    }

    #[test]
    fn tag_only_layout_holds_ids_only() {
        let ids = [Entity::new(1, 0)];
        let descs = [desc_of::<Tag>(1, EntityKind::Generic)];
        let layout = ChunkLayout::compute(&ids, &descs, 512);
        assert_eq!(layout.capacity, 512);
        assert_eq!(layout.size_class, SizeClass::Small);
        assert_eq!(
            layout.data_bytes,
            layout.entities_offset + 512 * ENTITY_SIZE
        );
    }

    #[test]
    fn empty_layout_is_the_root_shape() {
        let layout = ChunkLayout::compute(&[], &[], 1024);
        assert_eq!(layout.entities_offset, 0);
        assert_eq!(layout.size_class, SizeClass::Small);
        assert!(layout.capacity >= 1000);
        assert_eq!(
            layout.data_bytes,
            layout.capacity as u32 * ENTITY_SIZE
        );
    }
}
