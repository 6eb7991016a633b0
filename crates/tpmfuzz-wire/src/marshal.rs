//! Canonical big-endian encoding of the structural model.
//!
//! Derived members are never stored: a size is the encoded length of the
//! member that follows it, a count is the item count of the array that
//! follows it, and a selector is the variant selector of the next union
//! member. Marshaling therefore always produces a self-consistent encoding,
//! whatever mutations were applied to the tree.

use bytes::{BufMut, BytesMut};
use tpmfuzz_types::model::ALG_NULL;
use tpmfuzz_types::{Derived, Member, Structure, Value, Width};

/// Appends the encoding of `structure` to `buf`.
pub fn marshal_structure(structure: &Structure, buf: &mut BytesMut) {
    for (i, member) in structure.members.iter().enumerate() {
        match &member.value {
            Value::Derived(derived) => put_derived(*derived, &structure.members[i + 1..], buf),
            value => marshal_value(value, buf),
        }
    }
}

/// Encodes `structure` into a fresh buffer.
pub fn structure_bytes(structure: &Structure) -> Vec<u8> {
    let mut buf = BytesMut::new();
    marshal_structure(structure, &mut buf);
    buf.to_vec()
}

/// Appends the encoding of a single non-derived value to `buf`.
pub fn marshal_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Fixed { width, value } => put_uint(*width, value.unwrap_or(0), buf),
        Value::Enum { space, value } => put_uint(space.width(), u64::from(*value), buf),
        Value::Handle(handle) => buf.put_u32(handle.as_u32()),
        Value::Buffer { prefix, bytes } => {
            let data = bytes.as_deref().unwrap_or(&[]);
            let len = data.len().min(prefix.max_value() as usize);
            put_uint(*prefix, len as u64, buf);
            buf.put_slice(&data[..len]);
        }
        Value::Struct { kind, body } => match body {
            Some(body) => marshal_structure(body, buf),
            None if kind.is_optional() => buf.put_u16(ALG_NULL as u16),
            None => {}
        },
        Value::Array { items, .. } => {
            for item in items {
                marshal_structure(item, buf);
            }
        }
        // A derived member with no owning structure has nothing to describe.
        Value::Derived(derived) => put_uint(derived.width(), 0, buf),
    }
}

/// Returns the encoded length of a value.
pub fn encoded_len(value: &Value) -> usize {
    let mut buf = BytesMut::new();
    marshal_value(value, &mut buf);
    buf.len()
}

fn put_derived(derived: Derived, following: &[Member], buf: &mut BytesMut) {
    match derived {
        Derived::Size => {
            let len = following.first().map_or(0, |member| encoded_len(&member.value));
            buf.put_u16(len.min(usize::from(u16::MAX)) as u16);
        }
        Derived::Count => {
            let count = match following.first().map(|member| &member.value) {
                Some(Value::Array { items, .. }) => items.len(),
                _ => 0,
            };
            buf.put_u32(count as u32);
        }
        Derived::Selector => {
            let selector = following
                .iter()
                .find_map(|member| match &member.value {
                    Value::Struct { kind, body } if !kind.union_variants().is_empty() => {
                        let variant = body.as_ref().map_or(*kind, |body| body.kind);
                        Some(variant.selector().unwrap_or(0))
                    }
                    _ => None,
                })
                .unwrap_or(0);
            buf.put_u16(selector);
        }
    }
}

pub(crate) fn put_uint(width: Width, value: u64, buf: &mut BytesMut) {
    match width {
        Width::U8 => buf.put_u8(value as u8),
        Width::U16 => buf.put_u16(value as u16),
        Width::U32 => buf.put_u32(value as u32),
        Width::U64 => buf.put_u64(value),
    }
}
