//! Targeted leaf mutation.
//!
//! [`LeafMutator::mutate`] picks a small, weight-biased subset of the leaves
//! produced by [`decompose`](crate::decompose::decompose) and applies a
//! kind-specific mutation to each. The command keeps its structured
//! parameter tree, so marshaling it afterwards recomputes every derived
//! size, count and selector from the mutated data.
//!
//! ## Subset Size
//!
//! The subset size starts at one and grows by one on each successful coin
//! flip, halving the odds of the next flip each time, up to `max_leaves`:
//!
//! ```text
//! P(size >= k) = 2^-(k(k-1)/2)
//! P(1) = 1/2   P(2) = 3/8   P(3) = 7/64   ...
//! ```

use tpmfuzz_types::{
    DIGEST_SIZES, EnumSpace, Handle, HandleType, MAX_TRANSFER_SIZE, Structure, Value, Width,
};
use tpmfuzz_wire::Command;
use tracing::trace;

use crate::decompose::{
    Decomposition, FuzzableMember, LeafKind, LeafTarget, ValidStructCache, decompose_structure,
};
use crate::raw::{RawStrategy, apply_strategy, fuzz_buffer};
use crate::rng::SimRng;
use crate::stats::FuzzStats;

/// Key sizes (bytes) drawn for empty buffers.
const KEY_SIZES: [usize; 7] = [16, 24, 32, 128, 256, 384, 512];

/// Probability of remapping an enumeration to another valid enumerator.
const ENUM_REMAP_PROBABILITY: f64 = 0.75;

/// Leaf mutation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafMutatorConfig {
    /// Most leaves mutated per dispatch.
    pub max_leaves: usize,
    /// Maximum transfer size, used to size fresh buffers.
    pub max_transfer: usize,
}

impl Default for LeafMutatorConfig {
    fn default() -> Self {
        Self {
            max_leaves: 8,
            max_transfer: MAX_TRANSFER_SIZE,
        }
    }
}

/// What happened to one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafMutation {
    pub target: LeafTarget,
    pub kind: LeafKind,
    /// Raw strategy used on the leaf bytes, if any.
    pub strategy: Option<RawStrategy>,
}

/// Applies kind-specific mutations to decomposed leaves.
#[derive(Debug, Clone, Default)]
pub struct LeafMutator {
    config: LeafMutatorConfig,
}

impl LeafMutator {
    pub fn new(config: LeafMutatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LeafMutatorConfig {
        &self.config
    }

    /// Mutates a subset of the command's leaves in place.
    ///
    /// Returns the mutations that took effect; a selected leaf can be left
    /// untouched (an absent substructure with nothing cached, a member
    /// without a setter).
    pub fn mutate(
        &self,
        command: &mut Command,
        decomposition: &Decomposition,
        cache: &ValidStructCache,
        stats: &mut FuzzStats,
        rng: &mut SimRng,
    ) -> Vec<LeafMutation> {
        let mut applied = Vec::new();
        let Command {
            handles, params, ..
        } = command;
        let tpmfuzz_wire::Parameters::Structured(params) = params else {
            return applied;
        };
        for index in self.select(decomposition, rng) {
            let leaf = &decomposition.leaves[index];
            if let Some(mutation) = self.mutate_leaf(handles, params, leaf, cache, stats, rng) {
                stats.record_leaf(mutation.kind);
                applied.push(mutation);
            }
        }
        applied
    }

    /// Draws the subset size.
    pub fn subset_size(&self, rng: &mut SimRng) -> usize {
        let mut size = 0;
        let mut odds = 1.0;
        while size < self.config.max_leaves && rng.next_f64() < odds {
            size += 1;
            odds /= 2.0;
        }
        size
    }

    /// Selects leaf indices to mutate, in decomposition order.
    pub fn select(&self, decomposition: &Decomposition, rng: &mut SimRng) -> Vec<usize> {
        let count = decomposition.leaves.len();
        let mut size = self.subset_size(rng);
        // Only reachable with `max_leaves == 0`, which means every leaf.
        if size == 0 {
            size = count;
        }
        if count <= size {
            return (0..count).collect();
        }

        let total = f64::from(decomposition.complexity);
        let mut chosen = vec![false; count];
        let mut picked = 0;
        for (index, leaf) in decomposition.leaves.iter().enumerate() {
            if picked == size {
                break;
            }
            if rng.next_bool_with_probability(candidate_probability(leaf, total, size)) {
                chosen[index] = true;
                picked += 1;
            }
        }
        for index in (0..count).rev() {
            if picked == size {
                break;
            }
            if !chosen[index] {
                chosen[index] = true;
                picked += 1;
            }
        }
        (0..count).filter(|index| chosen[*index]).collect()
    }

    fn mutate_leaf(
        &self,
        handles: &mut [Handle],
        params: &mut Structure,
        leaf: &FuzzableMember,
        cache: &ValidStructCache,
        stats: &mut FuzzStats,
        rng: &mut SimRng,
    ) -> Option<LeafMutation> {
        let path = match &leaf.target {
            LeafTarget::Handle(index) => {
                let slot = handles.get_mut(*index)?;
                *slot = mutate_handle(*slot, rng);
                return Some(LeafMutation {
                    target: leaf.target.clone(),
                    kind: LeafKind::Handle,
                    strategy: None,
                });
            }
            LeafTarget::Member(path) => path,
        };

        let member = params.at_mut(path)?;
        if !member.writable {
            return None;
        }
        let mut strategy = None;
        match &mut member.value {
            Value::Enum { space, value } => {
                let (mutated, used) = mutate_enum(*space, *value, rng);
                *value = mutated;
                strategy = used;
            }
            Value::Handle(handle) => *handle = mutate_handle(*handle, rng),
            Value::Buffer { prefix, bytes } => {
                let max = prefix.max_value() as usize;
                match bytes {
                    // Absent buffers come back as empty ones.
                    None => *bytes = Some(Vec::new()),
                    Some(data) if data.is_empty() => *data = self.fresh_buffer(max, rng),
                    Some(_) if rng.next_usize(18) == 0 => *bytes = None,
                    Some(data) => {
                        let (mut mutated, used) = fuzz_buffer(data, rng, true);
                        mutated.truncate(max);
                        *data = mutated;
                        strategy = Some(used);
                    }
                }
            }
            Value::Fixed { width, value } => match value {
                None => *value = Some(0),
                Some(number) => {
                    let (mutated, used) = mutate_number(*width, *number, rng);
                    *number = mutated;
                    strategy = Some(used);
                }
            },
            Value::Struct {
                kind,
                body: body @ None,
            } => {
                let mut revived = cache.get(*kind)?.clone();
                let inner = decompose_structure(&revived, &mut ValidStructCache::new());
                for index in self.select(&inner, rng) {
                    let inner_leaf = &inner.leaves[index];
                    if let Some(mutation) =
                        self.mutate_leaf(&mut [], &mut revived, inner_leaf, cache, stats, rng)
                    {
                        stats.record_leaf(mutation.kind);
                    }
                }
                trace!(kind = %kind, "resurrected absent substructure");
                *body = Some(Box::new(revived));
            }
            Value::Struct { .. } | Value::Array { .. } | Value::Derived(_) => return None,
        }

        Some(LeafMutation {
            target: leaf.target.clone(),
            kind: leaf.kind,
            strategy,
        })
    }

    /// Builds a buffer for an empty leaf from one of six size classes.
    fn fresh_buffer(&self, max: usize, rng: &mut SimRng) -> Vec<u8> {
        let transfer = self.config.max_transfer.max(1);
        let len = match rng.next_usize(6) {
            // Shorter than any digest.
            0 => rng.next_usize_inclusive(1, 19),
            // Digest range.
            1 => rng.next_usize_inclusive(20, 64),
            2 => *rng.choose(&DIGEST_SIZES).unwrap_or(&32),
            3 => rng.next_usize_inclusive(1, transfer),
            4 => *rng.choose(&KEY_SIZES).unwrap_or(&256),
            // Oversized.
            _ => rng.next_usize_inclusive(
                transfer.saturating_add(1),
                transfer.saturating_mul(3),
            ),
        }
        .min(max);
        if rng.next_bool() {
            rng.bytes(len)
        } else {
            vec![0; len]
        }
    }
}

/// Probability that a leaf is picked in a subset of `size` draws.
fn candidate_probability(leaf: &FuzzableMember, total: f64, size: usize) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - (1.0 - f64::from(leaf.weight) / total).powi(size as i32)
}

fn mutate_enum(space: EnumSpace, value: u32, rng: &mut SimRng) -> (u32, Option<RawStrategy>) {
    let others: Vec<u32> = space
        .values()
        .iter()
        .copied()
        .filter(|candidate| *candidate != value)
        .collect();
    if !others.is_empty() && rng.next_bool_with_probability(ENUM_REMAP_PROBABILITY) {
        if let Some(remapped) = rng.choose(&others) {
            return (*remapped, None);
        }
    }
    let (mutated, strategy) = mutate_number(space.width(), u64::from(value), rng);
    (mutated as u32, Some(strategy))
}

/// Mutates a number through its big-endian bytes without changing width.
fn mutate_number(width: Width, value: u64, rng: &mut SimRng) -> (u64, RawStrategy) {
    let bytes = &value.to_be_bytes()[8 - width.bytes()..];
    let strategy = RawStrategy::pick(rng, false);
    let mutated = apply_strategy(bytes, strategy, rng);
    let number = mutated
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    (number, strategy)
}

/// Remaps a handle to a reserved, fully random, or namespace-prefixed value.
fn mutate_handle(current: Handle, rng: &mut SimRng) -> Handle {
    match rng.next_usize(8) {
        0 | 1 => *rng.choose(&Handle::RESERVED).unwrap_or(&current),
        2 => Handle::new(rng.next_u32()),
        _ => {
            let ty = *rng.choose(&HandleType::ALL).unwrap_or(&HandleType::Transient);
            let mask = 0x00FF_FFFF >> rng.next_usize(24);
            Handle::new((u32::from(ty.tag()) << 24) | (rng.next_u32() & mask))
        }
    }
}

#[cfg(test)]
mod tests {
    use tpmfuzz_types::{CommandCode, Member, StructKind};

    use super::*;
    use crate::decompose::decompose;

    fn single_buffer_command(bytes: Vec<u8>) -> Command {
        Command::new(
            CommandCode::STIR_RANDOM,
            Vec::new(),
            Structure::parameters(vec![Member::new("inData", Value::buffer(bytes))]),
        )
    }

    fn leaf(weight: u32) -> FuzzableMember {
        FuzzableMember {
            target: LeafTarget::Handle(0),
            kind: LeafKind::Handle,
            weight,
        }
    }

    #[test]
    fn subset_size_is_bounded_and_small_sizes_dominate() {
        let mutator = LeafMutator::default();
        let mut rng = SimRng::new(17);
        let mut histogram = [0usize; 9];
        for _ in 0..4000 {
            let size = mutator.subset_size(&mut rng);
            assert!((1..=8).contains(&size));
            histogram[size] += 1;
        }
        assert!(histogram[1] > histogram[2]);
        assert!(histogram[2] > histogram[3]);
    }

    #[test]
    fn selection_has_exact_size_and_no_duplicates() {
        let mutator = LeafMutator::default();
        let decomposition = Decomposition {
            leaves: (0..20).map(|i| leaf(i + 1)).collect(),
            complexity: (1..=20).sum(),
        };
        let mut rng = SimRng::new(4);
        for _ in 0..200 {
            let mut replay = rng.clone();
            let expected = mutator.subset_size(&mut replay);
            let chosen = mutator.select(&decomposition, &mut rng);
            assert_eq!(chosen.len(), expected);
            assert!(chosen.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn zero_complexity_fills_from_the_tail() {
        let mutator = LeafMutator::new(LeafMutatorConfig {
            max_leaves: 1,
            ..LeafMutatorConfig::default()
        });
        let decomposition = Decomposition {
            leaves: vec![leaf(0), leaf(0), leaf(0)],
            complexity: 0,
        };
        let chosen = mutator.select(&decomposition, &mut SimRng::new(1));
        assert_eq!(chosen, vec![2]);
    }

    #[test]
    fn candidate_probability_matches_formula() {
        let p = candidate_probability(&leaf(1), 4.0, 2);
        assert!((p - (1.0 - 0.75f64 * 0.75)).abs() < 1e-12);
        assert!(candidate_probability(&leaf(3), 0.0, 2).abs() < f64::EPSILON);
    }

    #[test]
    fn single_leaf_is_always_mutated() {
        let mutator = LeafMutator::default();
        for seed in 0..200 {
            let mut rng = SimRng::new(seed);
            let mut command = single_buffer_command(vec![1, 2, 3, 4]);
            let decomposition = decompose(&command, &mut ValidStructCache::new());
            let mut stats = FuzzStats::default();
            let applied = mutator.mutate(
                &mut command,
                &decomposition,
                &ValidStructCache::new(),
                &mut stats,
                &mut rng,
            );
            assert_eq!(applied.len(), 1);
            assert_eq!(applied[0].target, decomposition.leaves[0].target);
            assert_eq!(stats.leaf_mutations[&LeafKind::Buffer], 1);
        }
    }

    #[test]
    fn absent_buffer_becomes_empty_and_empty_gets_sized() {
        let mutator = LeafMutator::default();
        let mut rng = SimRng::new(8);
        let mut command = Command::new(
            CommandCode::STIR_RANDOM,
            Vec::new(),
            Structure::parameters(vec![
                Member::new(
                    "absent",
                    Value::Buffer {
                        prefix: Width::U8,
                        bytes: None,
                    },
                ),
                Member::new("empty", Value::small_buffer(Vec::new())),
            ]),
        );
        let decomposition = decompose(&command, &mut ValidStructCache::new());
        let mutator = LeafMutator::new(LeafMutatorConfig {
            max_leaves: 2,
            ..*mutator.config()
        });
        // Two leaves and a subset of at least one; retry until both are hit.
        loop {
            let mut candidate = command.clone();
            let applied = mutator.mutate(
                &mut candidate,
                &decomposition,
                &ValidStructCache::new(),
                &mut FuzzStats::default(),
                &mut rng,
            );
            if applied.len() == 2 {
                command = candidate;
                break;
            }
        }
        let params = command.params.structure().expect("structured");
        assert_eq!(params.get("absent").and_then(Value::as_bytes), Some(&[][..]));
        let fresh = params.get("empty").and_then(Value::as_bytes).expect("buffer");
        assert!(!fresh.is_empty());
        assert!(fresh.len() <= 255);
    }

    #[test]
    fn unbounded_transfer_limit_still_sizes_fresh_buffers() {
        let mutator = LeafMutator::new(LeafMutatorConfig {
            max_leaves: 1,
            max_transfer: usize::MAX,
        });
        let mut rng = SimRng::new(23);
        for _ in 0..300 {
            let buffer = mutator.fresh_buffer(usize::from(u16::MAX), &mut rng);
            assert!(!buffer.is_empty());
            assert!(buffer.len() <= usize::from(u16::MAX));
        }
    }

    #[test]
    fn absent_fixed_becomes_zero() {
        let mut rng = SimRng::new(2);
        let mut command = Command::new(
            CommandCode::GET_RANDOM,
            Vec::new(),
            Structure::parameters(vec![Member::new(
                "n",
                Value::Fixed {
                    width: Width::U16,
                    value: None,
                },
            )]),
        );
        let decomposition = decompose(&command, &mut ValidStructCache::new());
        LeafMutator::default().mutate(
            &mut command,
            &decomposition,
            &ValidStructCache::new(),
            &mut FuzzStats::default(),
            &mut rng,
        );
        let params = command.params.structure().expect("structured");
        assert_eq!(params.get("n"), Some(&Value::u16(0)));
    }

    #[test]
    fn fixed_width_numbers_stay_in_width() {
        let mut rng = SimRng::new(21);
        for _ in 0..500 {
            let (value, strategy) = mutate_number(Width::U8, 0x80, &mut rng);
            assert!(value <= 0xFF);
            assert_ne!(strategy, RawStrategy::Resize);
            assert_ne!(value, 0x80);
        }
    }

    #[test]
    fn enum_mutation_mostly_remaps_to_valid_values() {
        let mut rng = SimRng::new(5);
        let mut valid = 0;
        for _ in 0..1000 {
            let (value, strategy) = mutate_enum(EnumSpace::HashAlg, 0x000B, &mut rng);
            assert_ne!(value, 0x000B);
            assert!(value <= 0xFFFF);
            if strategy.is_none() {
                assert!(EnumSpace::HashAlg.contains(value));
                valid += 1;
            }
        }
        assert!(valid > 600 && valid < 900, "remapped {valid}");
    }

    #[test]
    fn read_only_members_are_skipped() {
        let mut command = Command::new(
            CommandCode::SELF_TEST,
            Vec::new(),
            Structure::parameters(vec![Member::read_only(
                "fullTest",
                Value::enumerated(EnumSpace::YesNo, 1),
            )]),
        );
        let pristine = command.clone();
        let decomposition = decompose(&command, &mut ValidStructCache::new());
        let applied = LeafMutator::default().mutate(
            &mut command,
            &decomposition,
            &ValidStructCache::new(),
            &mut FuzzStats::default(),
            &mut SimRng::new(0),
        );
        assert!(applied.is_empty());
        assert_eq!(command, pristine);
    }

    #[test]
    fn absent_substructure_is_resurrected_from_cache() {
        let mut cache = ValidStructCache::new();
        let mut params = Structure::parameters(vec![Member::new(
            "scheme",
            Value::absent(StructKind::AsymScheme),
        )]);
        let mut command = Command::new(CommandCode::HASH, Vec::new(), params.clone());
        let decomposition = decompose(&command, &mut cache);

        // Nothing cached: no mutation.
        let applied = LeafMutator::default().mutate(
            &mut command,
            &decomposition,
            &cache,
            &mut FuzzStats::default(),
            &mut SimRng::new(0),
        );
        assert!(applied.is_empty());

        cache.record(&StructKind::AsymScheme.template());
        let applied = LeafMutator::default().mutate(
            &mut command,
            &decomposition,
            &cache,
            &mut FuzzStats::default(),
            &mut SimRng::new(0),
        );
        assert_eq!(applied[0].kind, LeafKind::AbsentStruct);
        params = command.params.structure().expect("structured").clone();
        assert!(matches!(
            params.get("scheme"),
            Some(Value::Struct { body: Some(_), .. })
        ));
    }

    #[test]
    fn handle_mutation_covers_all_branches() {
        let mut rng = SimRng::new(12);
        let mut reserved = 0;
        let mut prefixed = 0;
        for _ in 0..2000 {
            let handle = mutate_handle(Handle::OWNER, &mut rng);
            if Handle::RESERVED.contains(&handle) {
                reserved += 1;
            } else if handle.handle_type().is_some() {
                prefixed += 1;
            }
        }
        assert!(reserved > 300);
        assert!(prefixed > 1000);
    }
}
