//! Structural decomposition of command instances.
//!
//! [`decompose`] walks a command's handle area and parameter tree and
//! returns every independently mutable leaf together with a complexity
//! weight. Derived members (sizes, counts, selectors) are never leaves:
//! they are recomputed from the data they describe when the command is
//! marshaled again, so a mutated tree always reassembles into a
//! self-consistent parameter area.
//!
//! ## Complexity Weights
//!
//! | Leaf                        | Weight                     |
//! |-----------------------------|----------------------------|
//! | enumerated value            | `values / 4 + 4`           |
//! | handle                      | `namespaces / 4 + 12`      |
//! | buffer                      | 16                         |
//! | fixed-width number          | 4                          |
//! | absent buffer/number/struct | 0                          |
//!
//! Every concrete substructure encountered on the way is recorded in the
//! [`ValidStructCache`].

use serde::{Deserialize, Serialize};
use tpmfuzz_types::{HandleType, MemberPath, PathStep, StructKind, Structure, Value};
use tpmfuzz_wire::{Command, Parameters};

// ============================================================================
// Leaves
// ============================================================================

/// Mutation-relevant kind of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LeafKind {
    Enum,
    Handle,
    Buffer,
    EmptyBuffer,
    AbsentBuffer,
    Fixed,
    AbsentFixed,
    AbsentStruct,
}

impl LeafKind {
    /// Complexity weight of a leaf of this kind.
    pub fn weight(self, value: &Value) -> u32 {
        match (self, value) {
            (LeafKind::Enum, Value::Enum { space, .. }) => space.values().len() as u32 / 4 + 4,
            (LeafKind::Handle, _) => HandleType::ALL.len() as u32 / 4 + 12,
            (LeafKind::Buffer | LeafKind::EmptyBuffer, _) => 16,
            (LeafKind::Fixed, _) => 4,
            _ => 0,
        }
    }

    /// Classifies a member value. Returns `None` for containers and
    /// derived metadata.
    pub fn of(value: &Value) -> Option<LeafKind> {
        match value {
            Value::Enum { .. } => Some(LeafKind::Enum),
            Value::Handle(_) => Some(LeafKind::Handle),
            Value::Buffer { bytes: None, .. } => Some(LeafKind::AbsentBuffer),
            Value::Buffer {
                bytes: Some(bytes),
                ..
            } if bytes.is_empty() => Some(LeafKind::EmptyBuffer),
            Value::Buffer { .. } => Some(LeafKind::Buffer),
            Value::Fixed { value: None, .. } => Some(LeafKind::AbsentFixed),
            Value::Fixed { .. } => Some(LeafKind::Fixed),
            Value::Struct { body: None, .. } => Some(LeafKind::AbsentStruct),
            Value::Struct { .. } | Value::Array { .. } | Value::Derived(_) => None,
        }
    }
}

/// Where a leaf lives in a command instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeafTarget {
    /// Index into the handle area.
    Handle(usize),
    /// Member of the parameter tree.
    Member(MemberPath),
}

/// A single mutable leaf of a command instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzableMember {
    pub target: LeafTarget,
    pub kind: LeafKind,
    pub weight: u32,
}

/// Leaves of one command instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decomposition {
    pub leaves: Vec<FuzzableMember>,
    /// Sum of all leaf weights.
    pub complexity: u32,
}

impl Decomposition {
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    fn push(&mut self, target: LeafTarget, kind: LeafKind, weight: u32) {
        self.complexity += weight;
        self.leaves.push(FuzzableMember {
            target,
            kind,
            weight,
        });
    }
}

// ============================================================================
// Valid Structure Cache
// ============================================================================

/// Most recently observed instance of each structure kind.
///
/// Used to resurrect optional substructures that are absent in the command
/// being fuzzed. Entries are replaced by newer observations but never
/// removed.
#[derive(Debug, Clone)]
pub struct ValidStructCache {
    entries: [Option<Structure>; StructKind::COUNT],
}

impl Default for ValidStructCache {
    fn default() -> Self {
        Self {
            entries: std::array::from_fn(|_| None),
        }
    }
}

impl ValidStructCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, structure: &Structure) {
        self.entries[structure.kind.index()] = Some(structure.clone());
    }

    pub fn get(&self, kind: StructKind) -> Option<&Structure> {
        self.entries[kind.index()].as_ref()
    }

    /// Number of kinds with a cached instance.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Decomposition
// ============================================================================

/// Decomposes a command instance into its handle and parameter leaves.
///
/// A command whose parameter area is no longer structured has no tree to
/// decompose and yields an empty decomposition.
pub fn decompose(command: &Command, cache: &mut ValidStructCache) -> Decomposition {
    let Parameters::Structured(params) = &command.params else {
        return Decomposition::default();
    };
    let mut out = Decomposition::default();
    for (index, handle) in command.handles.iter().enumerate() {
        let weight = LeafKind::Handle.weight(&Value::handle(*handle));
        out.push(LeafTarget::Handle(index), LeafKind::Handle, weight);
    }
    walk(params, &MemberPath::root(), cache, &mut out);
    out
}

/// Decomposes a parameter tree on its own.
pub fn decompose_structure(structure: &Structure, cache: &mut ValidStructCache) -> Decomposition {
    let mut out = Decomposition::default();
    walk(structure, &MemberPath::root(), cache, &mut out);
    out
}

fn walk(
    structure: &Structure,
    path: &MemberPath,
    cache: &mut ValidStructCache,
    out: &mut Decomposition,
) {
    for (index, member) in structure.members.iter().enumerate() {
        let member_path = path.child(PathStep::Member(index));
        match &member.value {
            Value::Struct {
                body: Some(body), ..
            } => {
                cache.record(body);
                walk(body, &member_path, cache, out);
            }
            Value::Array { items, .. } => {
                for (item_index, item) in items.iter().enumerate() {
                    cache.record(item);
                    walk(item, &member_path.child(PathStep::Item(item_index)), cache, out);
                }
            }
            value => {
                if let Some(kind) = LeafKind::of(value) {
                    out.push(LeafTarget::Member(member_path), kind, kind.weight(value));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tpmfuzz_types::{EnumSpace, Handle, Member};

    use super::*;

    #[test]
    fn weights_follow_leaf_kinds() {
        let params = Structure::parameters(vec![
            Member::new("alg", Value::enumerated(EnumSpace::HashAlg, 0x000B)),
            Member::new("data", Value::buffer(vec![1, 2])),
            Member::new("count", Value::u32(1)),
            Member::new("empty", Value::buffer(Vec::new())),
        ]);
        let command = Command::new(
            tpmfuzz_types::CommandCode::HASH,
            vec![Handle::OWNER],
            params,
        );
        let out = decompose(&command, &mut ValidStructCache::new());

        let weights: Vec<u32> = out.leaves.iter().map(|leaf| leaf.weight).collect();
        // handle, enum (6 values), buffer, fixed, empty buffer
        assert_eq!(weights, vec![14, 5, 16, 4, 16]);
        assert_eq!(out.complexity, 55);
        assert_eq!(out.leaves[0].target, LeafTarget::Handle(0));
    }

    #[test]
    fn derived_members_and_containers_are_not_leaves() {
        let out = decompose(&Command::pcr_read(0), &mut ValidStructCache::new());
        // count is derived; each selection has an enum and a buffer.
        let kinds: Vec<LeafKind> = out.leaves.iter().map(|leaf| leaf.kind).collect();
        assert_eq!(kinds, vec![LeafKind::Enum, LeafKind::Buffer]);
        assert_eq!(
            out.leaves[1].target,
            LeafTarget::Member(
                MemberPath::root()
                    .child(PathStep::Member(1))
                    .child(PathStep::Item(0))
                    .child(PathStep::Member(1))
            )
        );
    }

    #[test]
    fn absent_leaves_have_zero_weight() {
        let params = Structure::parameters(vec![
            Member::new("scheme", Value::absent(StructKind::AsymScheme)),
            Member::new(
                "buffer",
                Value::Buffer {
                    prefix: tpmfuzz_types::Width::U16,
                    bytes: None,
                },
            ),
            Member::new(
                "number",
                Value::Fixed {
                    width: tpmfuzz_types::Width::U8,
                    value: None,
                },
            ),
        ]);
        let out = decompose_structure(&params, &mut ValidStructCache::new());
        assert_eq!(out.leaves.len(), 3);
        assert_eq!(out.complexity, 0);
        assert_eq!(out.leaves[0].kind, LeafKind::AbsentStruct);
    }

    #[test]
    fn raw_parameters_have_no_leaves() {
        let command = Command::raw(
            tpmfuzz_types::CommandCode::GET_RANDOM,
            vec![Handle::OWNER],
            vec![0, 8],
        );
        assert!(decompose(&command, &mut ValidStructCache::new()).is_empty());
    }

    #[test]
    fn substructures_are_cached() {
        let mut cache = ValidStructCache::new();
        decompose(
            &Command::create_primary(Handle::OWNER, false),
            &mut cache,
        );
        assert!(cache.get(StructKind::Public).is_some());
        assert!(cache.get(StructKind::RsaParms).is_some());
        assert!(cache.get(StructKind::SymDefObject).is_some());
        assert!(cache.get(StructKind::AsymScheme).is_none());
        assert!(cache.get(StructKind::EccParms).is_none());

        decompose(&Command::create_primary(Handle::OWNER, true), &mut cache);
        assert!(cache.get(StructKind::RsaParms).is_some());
        assert!(cache.get(StructKind::EccParms).is_some());
    }
}
