//! Query terms and the archetype-matching instruction stream.
//!
//! A query is compiled once into a compact list of match instructions; the
//! world then executes that list against every archetype it has not yet
//! inspected for the query.

use smallvec::SmallVec;

use crate::entity::Entity;
use crate::hash::{hash_combine, lookup_hash};
use crate::storage::archetype::{id_matches, Archetype};

/// Hard cap on terms per query.
pub const MAX_TERMS: usize = 16;

/// How a term constrains the archetypes a query matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TermOp {
    /// The id must be present.
    All,
    /// At least one of the query's `Any` ids must be present.
    Any,
    /// The id must be absent.
    Not,
}

/// Declared access of a term, recorded in the query's write mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    Read,
    Write,
}

/// One filter term: an id pattern plus its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Term {
    pub id: Entity,
    pub op: TermOp,
    pub access: Access,
}

/// Puts terms into the canonical order queries are interned under:
/// stable by operator, then by raw id bits.
pub(crate) fn canonicalize(terms: &mut [Term]) {
    terms.sort_by(|a, b| a.op.cmp(&b.op).then_with(|| a.id.raw().cmp(&b.id.raw())));
}

/// The canonical 64-bit hash of a term list. Two queries with equal hashes
/// and equal canonical term sequences are the same query.
pub(crate) fn terms_hash(terms: &[Term]) -> u64 {
    let mut hash = lookup_hash(terms.iter().map(|t| t.id.raw()));
    for term in terms {
        hash = hash_combine(hash, term.op as u64 | ((term.access as u64) << 8));
    }
    hash
}

/// One opcode of the matching virtual machine.
#[derive(Debug, Clone)]
pub(crate) enum MatchInstr {
    /// The id pattern must be present in the archetype.
    All(Entity),
    /// At least one of the patterns must be present.
    Any(SmallVec<[Entity; 4]>),
    /// The id pattern must be absent.
    Not(Entity),
}

/// Outcome of running the instruction stream over one archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchResult {
    Ok,
    Fail,
    /// The archetype is not a candidate at all (already deleted).
    Skip,
}

/// Emits the instruction stream for a canonical term list. All `Any`
/// terms collapse into a single set-membership instruction.
pub(crate) fn compile(terms: &[Term]) -> SmallVec<[MatchInstr; 8]> {
    let mut instructions = SmallVec::new();
    let mut any_set: SmallVec<[Entity; 4]> = SmallVec::new();
    for term in terms {
        match term.op {
            TermOp::All => instructions.push(MatchInstr::All(term.id)),
            TermOp::Any => any_set.push(term.id),
            TermOp::Not => instructions.push(MatchInstr::Not(term.id)),
        }
    }
    if !any_set.is_empty() {
        instructions.push(MatchInstr::Any(any_set));
    }
    instructions
}

/// Runs the instruction stream against one archetype.
pub(crate) fn execute(instructions: &[MatchInstr], archetype: &Archetype) -> MatchResult {
    if archetype.is_dead() {
        return MatchResult::Skip;
    }
    for instruction in instructions {
        let passed = match instruction {
            MatchInstr::All(pattern) => archetype.matches(*pattern),
            MatchInstr::Any(patterns) => patterns.iter().any(|p| archetype.matches(*p)),
            MatchInstr::Not(pattern) => !archetype.matches(*pattern),
        };
        if !passed {
            return MatchResult::Fail;
        }
    }
    MatchResult::Ok
}

/// Per-term column remapping against a concrete archetype: the index of
/// the column satisfying the term, or -1 for absent/filter-only terms.
pub(crate) fn remap_columns(terms: &[Term], archetype: &Archetype) -> SmallVec<[i8; MAX_TERMS]> {
    terms
        .iter()
        .map(|term| match term.op {
            TermOp::Not => -1,
            _ => archetype
                .ids()
                .iter()
                .position(|&id| id_matches(id, term.id))
                .map(|i| i as i8)
                .unwrap_or(-1),
        })
        .collect()
}
