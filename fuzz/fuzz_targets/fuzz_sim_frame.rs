#![no_main]

use libfuzzer_sys::fuzz_target;
use tpmfuzz_device::{SimTpm, SimTpmConfig, Transport};
use tpmfuzz_wire::{Command, Response};

fuzz_target!(|data: &[u8]| {
    let mut device = SimTpm::new(
        SimTpmConfig::default()
            .with_planted_defect(false)
            .with_hang_on_oversized(false),
    );
    device
        .execute(&Command::startup(true).marshal())
        .expect("fresh device starts");

    // With the fault knobs off, every frame gets a well-formed answer.
    let response = device.execute(data).expect("simulated device survives");
    assert!(Response::parse(&response).is_ok());
});
