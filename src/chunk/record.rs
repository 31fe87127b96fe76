//! Record encoding and decoding against a record descriptor.
//!
//! A record's data bytes are the concatenation of its column values, each
//! aligned to its column alignment; variable-length columns carry a u32
//! length prefix. The same bytes are interpreted on the host through
//! [`RecordView`] and on the device through the offset arithmetic in
//! [`super::layout`] -- there is exactly one layout.

use super::layout::{self, align_up, ColumnMeta};
use super::descriptor::{RecordDescriptor, TypeTag};

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Bytes(Vec<u8>),
    /// Only representable in Slot format, which carries per-value null flags.
    Null,
}

impl Value {
    /// The type tag this value encodes as, or `None` for `Null`.
    pub fn type_tag(&self) -> Option<TypeTag> {
        match self {
            Value::Bool(_) => Some(TypeTag::Bool),
            Value::Int32(_) => Some(TypeTag::Int32),
            Value::Int64(_) => Some(TypeTag::Int64),
            Value::Float64(_) => Some(TypeTag::Float64),
            Value::Bytes(_) => Some(TypeTag::Bytes),
            Value::Null => None,
        }
    }

    /// Widen to i64 for integer-family values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Widen to f64 for numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Encode one record's data bytes per the descriptor.
///
/// # Panics
/// Panics when the value count or a value type does not match the
/// descriptor, or on a `Null` value -- row records carry no null flags, so
/// handing one here is a caller bug.
pub fn encode_record(desc: &RecordDescriptor, values: &[Value]) -> Vec<u8> {
    assert_eq!(
        values.len(),
        desc.ncols(),
        "record has {} values but descriptor has {} columns",
        values.len(),
        desc.ncols()
    );
    let mut out = Vec::with_capacity(16 * desc.ncols());
    for (col, value) in desc.columns().iter().zip(values) {
        let tag = value
            .type_tag()
            .unwrap_or_else(|| panic!("null value for column '{}' in a row record", col.name));
        assert_eq!(
            tag, col.type_tag,
            "value type {:?} does not match column '{}' ({:?})",
            tag, col.name, col.type_tag
        );
        let pad = align_up(out.len(), tag.align() as usize) - out.len();
        out.extend(std::iter::repeat(0u8).take(pad));
        match value {
            Value::Bool(b) => out.push(*b as u8),
            Value::Int32(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Value::Int64(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Value::Float64(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Value::Bytes(b) => {
                out.extend_from_slice(&(b.len() as u32).to_ne_bytes());
                out.extend_from_slice(b);
            }
            Value::Null => unreachable!(),
        }
    }
    out
}

// ============================================================================
// RecordView
// ============================================================================

/// Zero-copy view over one stored Row/Hash/Block record.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    data: &'a [u8],
    metas: &'a [ColumnMeta],
    src_id: u32,
}

impl<'a> RecordView<'a> {
    pub(crate) fn new(data: &'a [u8], metas: &'a [ColumnMeta], src_id: u32) -> Self {
        Self { data, metas, src_id }
    }

    /// Raw record data bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Source row identifier stamped at insert time.
    pub fn src_id(&self) -> u32 {
        self.src_id
    }

    /// Number of columns in the record.
    pub fn ncols(&self) -> usize {
        self.metas.len()
    }

    /// Stored bytes of column `idx`, without the length prefix for
    /// variable-length columns.
    pub fn column_bytes(&self, idx: usize) -> Option<&'a [u8]> {
        let meta = self.metas.get(idx)?;
        let off = layout::column_offset(self.metas, self.data, idx)?;
        if meta.byte_len >= 0 {
            self.data.get(off..off + meta.byte_len as usize)
        } else {
            let len = layout::read_u32(self.data, off) as usize;
            self.data.get(off + 4..off + 4 + len)
        }
    }

    /// Decode column `idx` into a [`Value`].
    pub fn value(&self, idx: usize) -> Option<Value> {
        let meta = self.metas.get(idx)?;
        let bytes = self.column_bytes(idx)?;
        Some(match TypeTag::from_code(meta.type_tag)? {
            TypeTag::Bool => Value::Bool(bytes[0] != 0),
            TypeTag::Int32 => Value::Int32(i32::from_ne_bytes(bytes.try_into().ok()?)),
            TypeTag::Int64 => Value::Int64(i64::from_ne_bytes(bytes.try_into().ok()?)),
            TypeTag::Float64 => Value::Float64(f64::from_ne_bytes(bytes.try_into().ok()?)),
            TypeTag::Bytes => Value::Bytes(bytes.to_vec()),
        })
    }

    /// Decode every column, in order.
    pub fn values(&self) -> Vec<Value> {
        (0..self.ncols()).map(|i| self.value(i).expect("column in range")).collect()
    }
}

// ============================================================================
// Slot rows
// ============================================================================

/// One decoded Slot-format record: a value per column, `Value::Null` where
/// the null flag was set.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRow {
    pub values: Vec<Value>,
}

impl SlotRow {
    /// Whether the value at `idx` is null.
    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.values.get(idx), Some(Value::Null))
    }
}

// ============================================================================
// Tests
// ============================================================================
