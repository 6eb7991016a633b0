//! Safety filter.
//!
//! Vetoes command instances that could leave the device permanently
//! damaged. The one combination filtered today is `NV_DefineSpace`
//! authorized by anything other than the owner hierarchy: a mutated
//! platform-authorized definition can create an index the fuzzer can never
//! undefine, consuming NV storage for good.
//!
//! Two entry points exist because the filter runs twice per dispatch:
//! [`is_safe`] on the decoded handles before a series starts, and
//! [`is_safe_raw`] on the final frame, where only the header and the first
//! handle are trustworthy.

use tpmfuzz_types::{CommandCode, Handle};
use tpmfuzz_wire::{COMMAND_CODE_RANGE, FIRST_HANDLE_RANGE};

/// Checks a command kind with its decoded handle area.
pub fn is_safe(code: CommandCode, handles: &[Handle]) -> bool {
    match code {
        CommandCode::NV_DEFINE_SPACE => handles.first() == Some(&Handle::OWNER),
        _ => true,
    }
}

/// Checks a marshaled command frame.
///
/// Frames too short to carry a first handle cannot define anything and
/// pass.
pub fn is_safe_raw(frame: &[u8]) -> bool {
    let (Some(code), Some(handle)) = (
        frame.get(COMMAND_CODE_RANGE).and_then(read_u32),
        frame.get(FIRST_HANDLE_RANGE).and_then(read_u32),
    ) else {
        return true;
    };
    is_safe(CommandCode::new(code), &[Handle::new(handle)])
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    bytes.try_into().ok().map(u32::from_be_bytes)
}
