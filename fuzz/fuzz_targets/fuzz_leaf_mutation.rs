#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tpmfuzz_device::{SimTpm, SimTpmConfig, Transport};
use tpmfuzz_fuzzer::{FuzzStats, LeafMutator, LeafMutatorConfig, SimRng, ValidStructCache, decompose};
use tpmfuzz_types::Handle;
use tpmfuzz_wire::{Command, catalog};

#[derive(Debug, Arbitrary)]
struct Input {
    command: u8,
    seed: u64,
    rounds: u8,
}

fuzz_target!(|input: Input| {
    let descriptors = catalog::all();
    let descriptor = &descriptors[usize::from(input.command) % descriptors.len()];
    let pristine = Command::new(
        descriptor.code,
        vec![Handle::OWNER; descriptor.handles_in],
        descriptor.template.clone(),
    );

    let mutator = LeafMutator::new(LeafMutatorConfig::default());
    let mut cache = ValidStructCache::new();
    let mut stats = FuzzStats::default();
    let mut rng = SimRng::new(input.seed);
    let mut device = SimTpm::new(SimTpmConfig::default().with_planted_defect(false));
    device
        .execute(&Command::startup(true).marshal())
        .expect("fresh device starts");

    for _ in 0..=input.rounds % 16 {
        let decomposition = decompose(&pristine, &mut cache);
        let mut command = pristine.clone();
        mutator.mutate(&mut command, &decomposition, &cache, &mut stats, &mut rng);
        let _ = device.execute(&command.marshal());
    }
});
