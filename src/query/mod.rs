//! Query construction, incremental archetype matching and chunk iteration.
//!
//! Queries are interned in the world by the canonical hash of their term
//! list and live for the world's lifetime. Each [QueryInfo] caches the
//! archetypes it has matched along with a per-archetype column remapping,
//! and remembers how many world archetypes it has already inspected so a
//! later run only scans archetypes registered since.

pub mod filter;

use bit_set::BitSet;
use fnv::FnvHashMap;
use smallvec::SmallVec;

use crate::entity::Entity;
use crate::hash::hash_combine;
use crate::storage::archetype::{Archetype, ArchetypeId};
use crate::storage::chunk::Chunk;
use crate::storage::layout::ChunkLayout;
use crate::world::World;
use filter::{
    canonicalize, compile, execute, remap_columns, terms_hash, Access, MatchInstr, MatchResult,
    Term, TermOp, MAX_TERMS,
};

/// Chunks staged per callback batch during iteration.
const CHUNK_BATCH: usize = 8;

/// Which side of a chunk's enabled partition a query walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Enabled rows only (the default).
    Enabled,
    /// Disabled rows only.
    Disabled,
    /// Every occupied row.
    All,
}

/// Maps an accepted archetype's id set to a group id. Grouped query caches
/// are maintained as contiguous runs in ascending group order.
pub type GroupFn = fn(ids: &[Entity], group_by: Entity) -> u64;

/// One archetype accepted into a query cache, with the per-term column
/// remapping precomputed against the archetype's id list.
pub(crate) struct MatchedArchetype {
    pub arch: ArchetypeId,
    pub columns: SmallVec<[i8; MAX_TERMS]>,
    pub changed_columns: SmallVec<[u8; 4]>,
    pub group_id: u64,
}

/// The compiled, canonical form of a query plus its match cache.
pub(crate) struct QueryInfo {
    terms: SmallVec<[Term; 8]>,
    instructions: SmallVec<[MatchInstr; 8]>,
    hash: u64,
    changed: SmallVec<[Entity; 4]>,
    group_by: Option<(Entity, GroupFn)>,
    constraint: Constraint,
    write_mask: BitSet,
    cache: Vec<MatchedArchetype>,
    seen_archetypes: u32,
    last_run_version: u32,
}

impl QueryInfo {
    /// Scans archetypes registered since the previous call and appends
    /// the ones the instruction stream accepts.
    fn match_incremental(&mut self, archetypes: &[Archetype]) {
        while (self.seen_archetypes as usize) < archetypes.len() {
            let archetype = &archetypes[self.seen_archetypes as usize];
            self.seen_archetypes += 1;
            if execute(&self.instructions, archetype) != MatchResult::Ok {
                continue;
            }
            self.accept(archetype);
        }
    }

    fn accept(&mut self, archetype: &Archetype) {
        let columns = remap_columns(&self.terms, archetype);
        let changed_columns = self
            .changed
            .iter()
            .map(|&id| {
                archetype
                    .first_match(id)
                    .expect("changed() id missing from a matched archetype") as u8
            })
            .collect();
        let group_id = match &self.group_by {
            Some((group_by, reducer)) => reducer(archetype.ids(), *group_by),
            None => 0,
        };
        let matched = MatchedArchetype {
            arch: archetype.id(),
            columns,
            changed_columns,
            group_id,
        };
        if self.group_by.is_some() {
            // Keep group runs contiguous and ascending; a late insertion
            // lands at the end of its run.
            let at = self.cache.partition_point(|m| m.group_id <= group_id);
            self.cache.insert(at, matched);
        } else {
            self.cache.push(matched);
        }
    }

    fn chunk_changed(&self, chunk: &Chunk, matched: &MatchedArchetype) -> bool {
        matched
            .changed_columns
            .iter()
            .any(|&column| chunk.column_version(column as usize) > self.last_run_version)
    }

    fn has_writes(&self) -> bool { !self.write_mask.is_empty() }
}

fn constraint_range(constraint: Constraint, chunk: &Chunk) -> (u16, u16) {
    match constraint {
        Constraint::Enabled => (chunk.first_enabled(), chunk.len()),
        Constraint::Disabled => (0, chunk.first_enabled()),
        Constraint::All => (0, chunk.len()),
    }
}

/// The world's query intern table.
#[derive(Default)]
pub(crate) struct QueryStore {
    by_hash: FnvHashMap<u64, SmallVec<[u32; 1]>>,
    infos: Vec<QueryInfo>,
}

impl QueryStore {
    fn intern(&mut self, info: QueryInfo) -> Query {
        let candidates = self.by_hash.entry(info.hash).or_default();
        for &index in candidates.iter() {
            let existing = &self.infos[index as usize];
            if existing.terms == info.terms
                && existing.changed == info.changed
                && existing.constraint == info.constraint
                && existing.group_by.map(|(id, f)| (id, f as usize))
                    == info.group_by.map(|(id, f)| (id, f as usize))
            {
                return Query { id: index };
            }
        }
        let index = self.infos.len() as u32;
        candidates.push(index);
        self.infos.push(info);
        Query { id: index }
    }

    pub(crate) fn info(&self, query: Query) -> &QueryInfo { &self.infos[query.id as usize] }

    fn info_mut(&mut self, query: Query) -> &mut QueryInfo { &mut self.infos[query.id as usize] }

    pub(crate) fn len(&self) -> usize { self.infos.len() }
}

/// Accumulates terms for a query before it is interned.
pub struct QueryBuilder<'a> {
    world: &'a mut World,
    terms: SmallVec<[Term; 8]>,
    changed: SmallVec<[Entity; 4]>,
    group_by: Option<(Entity, GroupFn)>,
    constraint: Constraint,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(world: &'a mut World) -> Self {
        QueryBuilder {
            world,
            terms: SmallVec::new(),
            changed: SmallVec::new(),
            group_by: None,
            constraint: Constraint::Enabled,
        }
    }

    fn push(mut self, id: Entity, op: TermOp, access: Access) -> Self {
        assert!(self.terms.len() < MAX_TERMS, "too many query terms");
        self.terms.push(Term { id, op, access });
        self
    }

    /// The id must be present; columns are bound read-only.
    pub fn all(self, id: Entity) -> Self { self.push(id, TermOp::All, Access::Read) }

    /// The id must be present; columns are bound for writing.
    pub fn all_mut(self, id: Entity) -> Self { self.push(id, TermOp::All, Access::Write) }

    /// At least one `any` id must be present.
    pub fn any(self, id: Entity) -> Self { self.push(id, TermOp::Any, Access::Read) }

    /// The id must be absent.
    pub fn no(self, id: Entity) -> Self { self.push(id, TermOp::Not, Access::Read) }

    /// Only yield chunks whose column for `id` changed since the query
    /// last ran. The id must also appear as an `all` term.
    pub fn changed(mut self, id: Entity) -> Self {
        assert!(
            self.terms
                .iter()
                .any(|t| t.op == TermOp::All && t.id.raw() == id.raw()),
            "changed() requires the id to be an all() term"
        );
        self.changed.push(id);
        self
    }

    /// Orders the archetype cache by the group id computed per archetype.
    pub fn group_by(mut self, id: Entity, reducer: GroupFn) -> Self {
        self.group_by = Some((id, reducer));
        self
    }

    /// Selects which side of the enabled partition iteration walks.
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    /// Canonicalizes, hashes and interns the query. Queries with equal
    /// canonical forms share one cache.
    pub fn build(mut self) -> Query {
        canonicalize(&mut self.terms);
        let mut hash = terms_hash(&self.terms);
        for &id in &self.changed {
            hash = hash_combine(hash, id.raw());
        }
        hash = hash_combine(hash, self.constraint as u64);
        if let Some((id, reducer)) = self.group_by {
            hash = hash_combine(hash, id.raw());
            hash = hash_combine(hash, reducer as usize as u64);
        }

        let mut write_mask = BitSet::with_capacity(self.terms.len());
        for (index, term) in self.terms.iter().enumerate() {
            if term.access == Access::Write {
                write_mask.insert(index);
            }
        }
        let instructions = compile(&self.terms);
        let info = QueryInfo {
            terms: self.terms,
            instructions,
            hash,
            changed: self.changed,
            group_by: self.group_by,
            constraint: self.constraint,
            write_mask,
            cache: Vec::new(),
            seen_archetypes: 0,
            last_run_version: 0,
        };
        self.world.queries.intern(info)
    }
}

/// A handle to an interned query. Copyable; all state lives in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    id: u32,
}

impl Query {
    /// Forces incremental matching against archetypes registered since
    /// the last run, without iterating.
    pub fn match_now(self, world: &mut World) {
        let queries = &mut world.queries;
        let archetypes = &world.archetypes;
        queries.info_mut(self).match_incremental(archetypes);
    }

    /// Iterates every matching chunk, yielding a [ChunkView] per chunk.
    ///
    /// The view covers the rows selected by the query's [Constraint] and
    /// honors the change filters; each chunk's structural lock is held for
    /// the duration of its callback.
    pub fn for_each_chunk<F: FnMut(ChunkView)>(self, world: &mut World, mut f: F) {
        self.match_now(world);
        let version = if world.queries.info(self).has_writes() {
            world.bump_version()
        } else {
            world.world_version()
        };

        let queries = &world.queries;
        let archetypes = &mut world.archetypes;
        let info = queries.info(self);

        for matched in &info.cache {
            let archetype = &mut archetypes[matched.arch];
            if archetype.is_dead() {
                continue;
            }
            let mut stage = [0u32; CHUNK_BATCH];
            let mut staged = 0;
            for index in 0..archetype.chunk_count() as u32 {
                let chunk = archetype.chunk(index);
                if chunk.is_empty() {
                    continue;
                }
                let (first, last) = constraint_range(info.constraint, chunk);
                if first >= last {
                    continue;
                }
                if !info.changed.is_empty() && !info.chunk_changed(chunk, matched) {
                    continue;
                }
                stage[staged] = index;
                staged += 1;
                if staged == CHUNK_BATCH {
                    run_batch(archetype, info, matched, &stage[..staged], version, &mut f);
                    staged = 0;
                }
            }
            if staged > 0 {
                run_batch(archetype, info, matched, &stage[..staged], version, &mut f);
            }
        }

        world.queries.info_mut(self).last_run_version = version;
    }

    /// Iterates matching rows, yielding each entity id.
    pub fn for_each_entity<F: FnMut(Entity)>(self, world: &mut World, mut f: F) {
        self.for_each_chunk(world, |view| {
            for &entity in view.entities() {
                f(entity);
            }
        });
    }

    /// Number of rows the query would yield, ignoring change filters.
    pub fn count(self, world: &mut World) -> usize {
        self.match_now(world);
        let queries = &world.queries;
        let archetypes = &world.archetypes;
        let info = queries.info(self);
        let mut total = 0;
        for matched in &info.cache {
            let archetype = &archetypes[matched.arch];
            if archetype.is_dead() {
                continue;
            }
            for chunk in archetype.chunks() {
                let (first, last) = constraint_range(info.constraint, chunk);
                total += (last - first) as usize;
            }
        }
        total
    }

    /// Returns `true` if no row matches, ignoring change filters.
    pub fn is_empty(self, world: &mut World) -> bool { self.count(world) == 0 }
}

fn run_batch<F: FnMut(ChunkView)>(
    archetype: &mut Archetype,
    info: &QueryInfo,
    matched: &MatchedArchetype,
    chunks: &[u32],
    version: u32,
    f: &mut F,
) {
    for &index in chunks {
        // Stamp written columns up front; the callback sees the bound
        // slices as mutated regardless of whether it writes.
        for term in info.write_mask.iter() {
            let column = matched.columns[term];
            if column >= 0 {
                archetype.chunk(index).set_version(column as usize, version);
            }
        }

        let (layout, chunk) = archetype.layout_and_chunk_mut(index);
        let (first, last) = constraint_range(info.constraint, chunk);
        chunk.lock();
        let view = ChunkView {
            chunk,
            layout,
            columns: &matched.columns,
            write_mask: &info.write_mask,
            first,
            last,
        };
        f(view);
        archetype.chunk_mut(index).unlock();
    }
}

/// One chunk's worth of rows bound to a query's terms.
pub struct ChunkView<'a> {
    chunk: &'a mut Chunk,
    layout: &'a ChunkLayout,
    columns: &'a [i8],
    write_mask: &'a BitSet,
    first: u16,
    last: u16,
}

impl<'a> ChunkView<'a> {
    /// Entity ids of the rows in view.
    pub fn entities(&self) -> &[Entity] {
        &self.chunk.entities(self.layout)[self.first as usize..self.last as usize]
    }

    pub fn len(&self) -> usize { (self.last - self.first) as usize }

    pub fn is_empty(&self) -> bool { self.first >= self.last }

    /// Returns `true` if the term resolved to a column in this archetype
    /// (always true for `all` terms, per-archetype for `any`).
    pub fn has(&self, term: usize) -> bool { self.columns[term] >= 0 }

    fn column_index(&self, term: usize) -> usize {
        let column = self.columns[term];
        assert!(column >= 0, "term {term} has no column in this archetype");
        column as usize
    }

    /// The rows of a generic column, typed.
    pub fn column<T>(&self, term: usize) -> &[T] {
        self.chunk
            .column_slice(self.layout, self.column_index(term), self.first, self.last)
    }

    /// The rows of a generic column, mutable. The term must have been
    /// declared with write access.
    pub fn column_mut<T>(&mut self, term: usize) -> &mut [T] {
        assert!(
            self.write_mask.contains(term),
            "term {term} was not declared with write access"
        );
        self.chunk
            .column_slice_mut(self.layout, self.column_index(term), self.first, self.last)
    }

    /// The chunk-wide value of a unique column.
    pub fn unique<T>(&self, term: usize) -> &T {
        self.chunk.unique_value(self.layout, self.column_index(term))
    }
}
