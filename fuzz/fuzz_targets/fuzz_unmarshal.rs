#![no_main]

use libfuzzer_sys::fuzz_target;
use tpmfuzz_wire::{catalog, structure_bytes, unmarshal_structure};

fuzz_target!(|data: &[u8]| {
    let Some((&selector, params)) = data.split_first() else {
        return;
    };
    let descriptors = catalog::all();
    let descriptor = &descriptors[usize::from(selector) % descriptors.len()];

    // Whatever decodes must encode to bytes that decode again.
    if let Ok(decoded) = unmarshal_structure(&descriptor.template, params) {
        let encoded = structure_bytes(&decoded);
        let again = unmarshal_structure(&descriptor.template, &encoded);
        assert!(again.is_ok(), "{} re-encoding rejected", descriptor.name);
    }
});
