//! Command catalogue listing.

use tpmfuzz_fuzzer::{LeafKind, ValidStructCache, decompose};
use tpmfuzz_types::Handle;
use tpmfuzz_wire::{Command, catalog};

use crate::style::{self, colors::SemanticStyle};

/// Prints every catalogued command with its fuzzable surface.
pub fn list() {
    let mut table = style::styled_table(&[
        "Code", "Command", "Handles", "Leaves", "Buffers", "Complexity",
    ]);
    let descriptors = catalog::all();
    for descriptor in &descriptors {
        let command = Command::new(
            descriptor.code,
            vec![Handle::OWNER; descriptor.handles_in],
            descriptor.template.clone(),
        );
        let decomposition = decompose(&command, &mut ValidStructCache::new());
        let buffers = decomposition
            .leaves
            .iter()
            .filter(|leaf| {
                matches!(
                    leaf.kind,
                    LeafKind::Buffer | LeafKind::EmptyBuffer | LeafKind::AbsentBuffer
                )
            })
            .count();
        table.add_row(vec![
            descriptor.code.to_string(),
            descriptor.name.to_string(),
            descriptor.handles_in.to_string(),
            decomposition.leaves.len().to_string(),
            buffers.to_string(),
            decomposition.complexity.to_string(),
        ]);
    }
    println!("{table}");
    println!("{}", format!("({} commands)", descriptors.len()).muted());
}
