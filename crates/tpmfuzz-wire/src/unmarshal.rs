//! Template-driven decoding of the structural model.
//!
//! Decoding walks a template instance of the expected kind. The template
//! supplies member names, widths, enumeration spaces and substructure kinds;
//! the input supplies the values. A preceding size bounds the member it
//! describes, a preceding count sizes the array it describes, and a
//! preceding selector chooses the union variant of the next union member.

use bytes::Buf;
use tpmfuzz_types::model::ALG_NULL;
use tpmfuzz_types::{Derived, Handle, Member, Structure, Value, Width};

use crate::WireError;

/// Upper bound on decoded array lengths.
pub const MAX_ARRAY_ITEMS: usize = 16;

/// Decodes `input` as an instance of the template's kind.
///
/// The whole input must be consumed.
pub fn unmarshal_structure(template: &Structure, input: &[u8]) -> Result<Structure, WireError> {
    let mut cursor = input;
    let structure = read_structure(template, &mut cursor)?;
    if !cursor.is_empty() {
        return Err(WireError::TrailingBytes {
            context: "parameters",
            count: cursor.len(),
        });
    }
    Ok(structure)
}

fn read_structure(template: &Structure, cursor: &mut &[u8]) -> Result<Structure, WireError> {
    let mut members = Vec::with_capacity(template.members.len());
    let mut size = None;
    let mut count = None;
    let mut selector = None;

    for member in &template.members {
        let value = match &member.value {
            Value::Derived(derived) => {
                match derived {
                    Derived::Size => size = Some(read_uint(Width::U16, cursor)? as usize),
                    Derived::Count => {
                        let items = read_uint(Width::U32, cursor)? as usize;
                        if items > MAX_ARRAY_ITEMS {
                            return Err(WireError::Oversized {
                                what: "array count",
                                len: items,
                                max: MAX_ARRAY_ITEMS,
                            });
                        }
                        count = Some(items);
                    }
                    Derived::Selector => selector = Some(read_uint(Width::U16, cursor)? as u16),
                }
                member.value.clone()
            }
            expected => match (size.take(), expected) {
                (Some(0), Value::Struct { kind, .. }) => Value::absent(*kind),
                (Some(len), _) => {
                    let mut region = take(cursor, len)?;
                    let value = read_value(expected, &mut region, count.take(), &mut selector)?;
                    if !region.is_empty() {
                        return Err(WireError::TrailingBytes {
                            context: member.name,
                            count: region.len(),
                        });
                    }
                    value
                }
                (None, _) => read_value(expected, cursor, count.take(), &mut selector)?,
            },
        };
        members.push(Member {
            name: member.name,
            value,
            writable: member.writable,
        });
    }

    Ok(Structure::new(template.kind, members))
}

fn read_value(
    expected: &Value,
    cursor: &mut &[u8],
    count: Option<usize>,
    selector: &mut Option<u16>,
) -> Result<Value, WireError> {
    let value = match expected {
        Value::Fixed { width, .. } => Value::Fixed {
            width: *width,
            value: Some(read_uint(*width, cursor)?),
        },
        Value::Enum { space, .. } => {
            let value = read_uint(space.width(), cursor)? as u32;
            if !space.contains(value) {
                return Err(WireError::InvalidEnumerator {
                    space: *space,
                    value,
                });
            }
            Value::Enum {
                space: *space,
                value,
            }
        }
        Value::Handle(_) => Value::handle(Handle::new(read_uint(Width::U32, cursor)? as u32)),
        Value::Buffer { prefix, .. } => {
            let len = read_uint(*prefix, cursor)? as usize;
            Value::Buffer {
                prefix: *prefix,
                bytes: Some(take(cursor, len)?.to_vec()),
            }
        }
        Value::Struct { kind, body } => {
            let variant = match selector.take() {
                Some(raw) if !kind.union_variants().is_empty() => kind
                    .variant_for_selector(raw)
                    .ok_or(WireError::InvalidSelector {
                        kind: *kind,
                        selector: raw,
                    })?,
                _ => body.as_ref().map_or(*kind, |body| body.kind),
            };
            if variant.is_optional() && peek_u16(cursor) == Some(ALG_NULL as u16) {
                cursor.advance(2);
                return Ok(Value::absent(variant));
            }
            let fresh;
            let template = match body {
                Some(body) if body.kind == variant => body.as_ref(),
                _ => {
                    fresh = variant.template();
                    &fresh
                }
            };
            Value::sub(read_structure(template, cursor)?)
        }
        Value::Array { kind, .. } => {
            let template = kind.template();
            let items = (0..count.unwrap_or(0))
                .map(|_| read_structure(&template, cursor))
                .collect::<Result<Vec<_>, _>>()?;
            Value::array(*kind, items)
        }
        Value::Derived(derived) => {
            read_uint(derived.width(), cursor)?;
            Value::Derived(*derived)
        }
    };
    Ok(value)
}

pub(crate) fn read_uint(width: Width, cursor: &mut &[u8]) -> Result<u64, WireError> {
    ensure(cursor, width.bytes())?;
    Ok(match width {
        Width::U8 => u64::from(cursor.get_u8()),
        Width::U16 => u64::from(cursor.get_u16()),
        Width::U32 => u64::from(cursor.get_u32()),
        Width::U64 => cursor.get_u64(),
    })
}

pub(crate) fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], WireError> {
    ensure(cursor, len)?;
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn peek_u16(cursor: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = cursor.get(..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

fn ensure(cursor: &[u8], needed: usize) -> Result<(), WireError> {
    if cursor.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: cursor.len(),
        });
    }
    Ok(())
}
