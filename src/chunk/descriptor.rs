//! Per-column record metadata.
//!
//! A [`RecordDescriptor`] is the host-side schema used to lay out and decode
//! records inside a chunk. The chunk itself carries a compiled form of this
//! (see [`super::layout::ColumnMeta`]) so device code never needs the host
//! descriptor.

/// Column value types understood by the store and the reference kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeTag {
    /// Boolean, stored as one byte.
    Bool = 1,
    /// 32-bit signed integer.
    Int32 = 2,
    /// 64-bit signed integer.
    Int64 = 3,
    /// 64-bit IEEE 754 float.
    Float64 = 4,
    /// Variable-length byte string, stored with a u32 length prefix.
    Bytes = 5,
}

impl TypeTag {
    /// Convert from the on-chunk type code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(TypeTag::Bool),
            2 => Some(TypeTag::Int32),
            3 => Some(TypeTag::Int64),
            4 => Some(TypeTag::Float64),
            5 => Some(TypeTag::Bytes),
            _ => None,
        }
    }

    /// Convert to the on-chunk type code.
    pub fn to_code(self) -> u32 {
        self as u32
    }

    /// Stored width in bytes, or -1 for variable-length types.
    pub fn byte_len(self) -> i16 {
        match self {
            TypeTag::Bool => 1,
            TypeTag::Int32 => 4,
            TypeTag::Int64 => 8,
            TypeTag::Float64 => 8,
            TypeTag::Bytes => -1,
        }
    }

    /// Required alignment of the stored value. Variable-length values align
    /// to their u32 length prefix.
    pub fn align(self) -> u8 {
        match self {
            TypeTag::Bool => 1,
            TypeTag::Int32 => 4,
            TypeTag::Int64 => 8,
            TypeTag::Float64 => 8,
            TypeTag::Bytes => 4,
        }
    }

    /// Whether values are stored inline by value. Variable-length values are
    /// stored by reference (byte offset) in Slot format.
    pub fn by_value(self) -> bool {
        !matches!(self, TypeTag::Bytes)
    }

    /// Whether this is a fixed-width type.
    pub fn is_fixed(self) -> bool {
        self.byte_len() >= 0
    }
}

/// A column descriptor with name and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Value type for this column.
    pub type_tag: TypeTag,
}

/// Host-side schema describing the record layout of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDescriptor {
    columns: Vec<ColumnDef>,
}

impl RecordDescriptor {
    /// Create a new descriptor from (name, type) pairs.
    pub fn new<S: Into<String>>(columns: Vec<(S, TypeTag)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, type_tag)| ColumnDef { name: name.into(), type_tag })
                .collect(),
        }
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Ordered column definitions.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Get column index by name (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Type of the column at `idx`.
    pub fn type_of(&self, idx: usize) -> Option<TypeTag> {
        self.columns.get(idx).map(|c| c.type_tag)
    }

    /// Build a descriptor restricted to the given column subset, in order.
    /// Used to derive the destination schema of a projection.
    pub fn project(&self, columns: &[usize]) -> Option<RecordDescriptor> {
        let mut out = Vec::with_capacity(columns.len());
        for &idx in columns {
            out.push(self.columns.get(idx)?.clone());
        }
        Some(RecordDescriptor { columns: out })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_roundtrip() {
        for code in 1..=5u32 {
            let tag = TypeTag::from_code(code).unwrap();
            assert_eq!(tag.to_code(), code);
        }
        assert!(TypeTag::from_code(0).is_none());
        assert!(TypeTag::from_code(99).is_none());
    }

    #[test]
    fn test_type_widths() {
        assert_eq!(TypeTag::Bool.byte_len(), 1);
        assert_eq!(TypeTag::Int32.byte_len(), 4);
        assert_eq!(TypeTag::Int64.byte_len(), 8);
        assert_eq!(TypeTag::Float64.byte_len(), 8);
        assert_eq!(TypeTag::Bytes.byte_len(), -1, "variable width is -1");
        assert!(!TypeTag::Bytes.is_fixed());
        assert!(!TypeTag::Bytes.by_value());
        assert!(TypeTag::Int64.by_value());
    }

    #[test]
    fn test_descriptor_lookup() {
        let desc = RecordDescriptor::new(vec![
            ("id", TypeTag::Int64),
            ("Score", TypeTag::Float64),
            ("name", TypeTag::Bytes),
        ]);
        assert_eq!(desc.ncols(), 3);
        assert_eq!(desc.column_index("id"), Some(0));
        assert_eq!(desc.column_index("score"), Some(1), "lookup is case-insensitive");
        assert_eq!(desc.column_index("missing"), None);
        assert_eq!(desc.type_of(2), Some(TypeTag::Bytes));
        assert_eq!(desc.type_of(3), None);
    }

    #[test]
    fn test_descriptor_project() {
        let desc = RecordDescriptor::new(vec![
            ("a", TypeTag::Int64),
            ("b", TypeTag::Bool),
            ("c", TypeTag::Bytes),
        ]);
        let sub = desc.project(&[2, 0]).unwrap();
        assert_eq!(sub.ncols(), 2);
        assert_eq!(sub.columns()[0].name, "c");
        assert_eq!(sub.columns()[1].name, "a");
        assert!(desc.project(&[3]).is_none(), "out-of-range column rejected");
    }
}
