//! Filter predicate and projection specification.
//!
//! [`FilterSpec`] and [`Projection`] describe the per-scan work in terms the
//! external planner hands over: which column, which comparison, which output
//! columns. The same specs drive both sides of the split execution model --
//! they are serialized into [`TaskParams`] for the device kernels, and
//! evaluated directly on the host by the fallback path, so both paths see
//! one definition of the predicate.
//!
//! [`ScanKernels`] bundles the specs with the device symbol names resolved
//! from the external kernel source provider.

use crate::chunk::{RecordDescriptor, RecordView, TypeTag, Value};
use crate::device::protocol::{
    self, TaskParams, FILTER_VALUE_FLOAT, FILTER_VALUE_INT, MAX_PROJECTION_COLS,
};

pub use crate::device::protocol::CompareOp;

/// Threshold operand of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterValue {
    /// Integer-family threshold; evaluable on the device.
    Int(i64),
    /// Float threshold; the device reports cpu-recheck and the host decides.
    Float(f64),
}

/// One comparison predicate over a single source column.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    /// Source column index the predicate tests.
    pub column: usize,
    /// Comparison operator.
    pub op: CompareOp,
    /// Threshold operand.
    pub value: FilterValue,
}

impl FilterSpec {
    /// Integer comparison predicate.
    pub fn int(column: usize, op: CompareOp, value: i64) -> Self {
        Self { column, op, value: FilterValue::Int(value) }
    }

    /// Float comparison predicate.
    pub fn float(column: usize, op: CompareOp, value: f64) -> Self {
        Self { column, op, value: FilterValue::Float(value) }
    }

    /// Host-side evaluation over one record. This is the reference
    /// semantics the fallback path recomputes with; non-numeric columns
    /// never match.
    pub fn matches(&self, record: &RecordView<'_>) -> bool {
        let Some(lhs) = record.value(self.column) else {
            return false;
        };
        match self.value {
            FilterValue::Int(rhs) => match lhs {
                Value::Float64(v) => self.op.eval_f64(v, rhs as f64),
                other => match other.as_i64() {
                    Some(v) => self.op.eval_i64(v, rhs),
                    None => false,
                },
            },
            FilterValue::Float(rhs) => match lhs.as_f64() {
                Some(v) => self.op.eval_f64(v, rhs),
                None => false,
            },
        }
    }

    /// Fill the filter fields of a [`TaskParams`].
    pub(crate) fn apply_to(&self, params: &mut TaskParams) {
        params.filter_present = 1;
        params.filter_column = self.column as u32;
        params.filter_op = self.op as u32;
        match self.value {
            FilterValue::Int(v) => {
                params.filter_value_kind = FILTER_VALUE_INT;
                params.filter_value = v;
            }
            FilterValue::Float(v) => {
                params.filter_value_kind = FILTER_VALUE_FLOAT;
                params.filter_value = v.to_bits() as i64;
            }
        }
    }
}

/// Shape of the destination chunk a projection materializes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionOutput {
    /// Variable-length row records (row materialization).
    Row,
    /// Fixed (value, null) slots with a side buffer (columnar output).
    Slot,
}

/// Column subset to materialize for every passing record, in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Source column index per output column.
    pub columns: Vec<usize>,
    /// Destination chunk shape.
    pub output: ProjectionOutput,
}

impl Projection {
    /// Project into a Row-format destination.
    pub fn row(columns: Vec<usize>) -> Self {
        Self { columns, output: ProjectionOutput::Row }
    }

    /// Project into a Slot-format destination.
    pub fn slot(columns: Vec<usize>) -> Self {
        Self { columns, output: ProjectionOutput::Slot }
    }

    /// Descriptor of the destination chunk, or `None` when a column index is
    /// out of range for `src`.
    pub fn output_descriptor(&self, src: &RecordDescriptor) -> Option<RecordDescriptor> {
        src.project(&self.columns)
    }

    /// Decode the projected columns of one source record, in output order.
    /// Used by the host recomputation path.
    pub(crate) fn project_values(&self, record: &RecordView<'_>) -> Vec<Value> {
        self.columns
            .iter()
            .map(|&c| record.value(c).expect("projection column validated at pipeline creation"))
            .collect()
    }

    /// Fill the projection fields of a [`TaskParams`].
    pub(crate) fn apply_to(&self, params: &mut TaskParams) {
        params.proj_present = 1;
        params.proj_ncols = self.columns.len() as u32;
        for (i, &col) in self.columns.iter().enumerate() {
            params.proj_columns[i] = col as u32;
        }
    }
}

// ============================================================================
// ScanKernels
// ============================================================================

/// Filter routine: device symbol plus the predicate it implements.
#[derive(Debug, Clone)]
pub struct FilterKernel {
    /// Symbol name resolved by the device backend's registry.
    pub symbol: String,
    /// The predicate, host-evaluable for the fallback path.
    pub spec: FilterSpec,
}

/// Projection routine: device symbol plus the column mapping.
#[derive(Debug, Clone)]
pub struct ProjectionKernel {
    pub symbol: String,
    pub spec: Projection,
}

/// The device routines of one scan, as delivered by the external kernel
/// source provider: at most one filter and one projection, each known to the
/// pipeline only by symbol name and by the spec needed for destination
/// sizing and host recomputation.
#[derive(Debug, Clone)]
pub struct ScanKernels {
    /// Filter predicate; `None` marks every record implicitly visible.
    pub filter: Option<FilterKernel>,
    /// Projection; `None` means results are offsets into the source chunk.
    pub projection: Option<ProjectionKernel>,
}

impl ScanKernels {
    /// No filter, no projection: every record passes through untouched.
    pub fn passthrough() -> Self {
        Self { filter: None, projection: None }
    }

    /// Filter with the reference filter kernel symbol.
    pub fn with_filter(spec: FilterSpec) -> Self {
        Self {
            filter: Some(FilterKernel { symbol: protocol::KERNEL_FILTER.to_string(), spec }),
            projection: None,
        }
    }

    /// Add a projection, picking the reference kernel symbol for its output
    /// shape.
    pub fn and_projection(mut self, spec: Projection) -> Self {
        let symbol = match spec.output {
            ProjectionOutput::Row => protocol::KERNEL_PROJECT_ROW,
            ProjectionOutput::Slot => protocol::KERNEL_PROJECT_SLOT,
        };
        self.projection = Some(ProjectionKernel { symbol: symbol.to_string(), spec });
        self
    }

    /// Whether the task needs a destination chunk.
    pub fn needs_destination(&self) -> bool {
        self.projection.is_some()
    }

    /// Validate the specs against a source descriptor: every referenced
    /// column in range, projection width within the wire limit. Returns the
    /// first offending column index on failure.
    pub(crate) fn validate(&self, desc: &RecordDescriptor) -> std::result::Result<(), usize> {
        let ncols = desc.ncols();
        if let Some(filter) = &self.filter {
            if filter.spec.column >= ncols {
                return Err(filter.spec.column);
            }
        }
        if let Some(projection) = &self.projection {
            if projection.spec.columns.len() > MAX_PROJECTION_COLS {
                return Err(projection.spec.columns.len());
            }
            for &col in &projection.spec.columns {
                if col >= ncols {
                    return Err(col);
                }
            }
        }
        Ok(())
    }

    /// Serialize both specs into the task parameter block.
    pub(crate) fn task_params(&self) -> TaskParams {
        let mut params = TaskParams::default();
        if let Some(filter) = &self.filter {
            filter.spec.apply_to(&mut params);
        }
        if let Some(projection) = &self.projection {
            projection.spec.apply_to(&mut params);
        }
        params
    }
}

/// Whether a column type can carry a filter threshold without host help.
/// Informational only; the device makes its own call and reports recheck.
pub fn device_filterable(tag: TypeTag) -> bool {
    matches!(tag, TypeTag::Bool | TypeTag::Int32 | TypeTag::Int64)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkStore, RecordDescriptor, TypeTag};

    fn desc() -> RecordDescriptor {
        RecordDescriptor::new(vec![
            ("id", TypeTag::Int64),
            ("score", TypeTag::Float64),
            ("name", TypeTag::Bytes),
        ])
    }

    fn chunk_with_one(id: i64, score: f64) -> ChunkStore {
        let mut chunk = ChunkStore::create_row(&desc(), 4096).unwrap();
        chunk
            .insert_values(
                0,
                &[Value::Int64(id), Value::Float64(score), Value::Bytes(b"x".to_vec())],
            )
            .unwrap();
        chunk
    }

    #[test]
    fn test_int_filter_matches() {
        let chunk = chunk_with_one(10, 0.0);
        let view = chunk.fetch_row(0).unwrap();
        assert!(FilterSpec::int(0, CompareOp::Ge, 10).matches(&view));
        assert!(FilterSpec::int(0, CompareOp::Lt, 11).matches(&view));
        assert!(!FilterSpec::int(0, CompareOp::Gt, 10).matches(&view));
    }

    #[test]
    fn test_float_filter_widens_int_column() {
        let chunk = chunk_with_one(10, 2.5);
        let view = chunk.fetch_row(0).unwrap();
        assert!(FilterSpec::float(0, CompareOp::Gt, 9.5).matches(&view));
        assert!(FilterSpec::float(1, CompareOp::Eq, 2.5).matches(&view));
        // Int threshold against a float column compares as floats.
        assert!(FilterSpec::int(1, CompareOp::Gt, 2).matches(&view));
        assert!(!FilterSpec::int(1, CompareOp::Gt, 3).matches(&view));
    }

    #[test]
    fn test_bytes_column_never_matches() {
        let chunk = chunk_with_one(1, 1.0);
        let view = chunk.fetch_row(0).unwrap();
        assert!(!FilterSpec::int(2, CompareOp::Eq, 0).matches(&view));
        assert!(!FilterSpec::float(2, CompareOp::Ne, 0.0).matches(&view));
    }

    #[test]
    fn test_task_params_serialization() {
        let kernels = ScanKernels::with_filter(FilterSpec::int(1, CompareOp::Le, -4))
            .and_projection(Projection::row(vec![2, 0]));
        let params = kernels.task_params();
        assert_eq!(params.filter_present, 1);
        assert_eq!(params.filter_column, 1);
        assert_eq!(params.filter_op, CompareOp::Le as u32);
        assert_eq!(params.filter_value_kind, FILTER_VALUE_INT);
        assert_eq!(params.filter_value, -4);
        assert_eq!(params.proj_present, 1);
        assert_eq!(params.proj_ncols, 2);
        assert_eq!(&params.proj_columns[..2], &[2, 0]);
    }

    #[test]
    fn test_passthrough_params_empty() {
        let params = ScanKernels::passthrough().task_params();
        assert_eq!(params.filter_present, 0);
        assert_eq!(params.proj_present, 0);
        assert!(!ScanKernels::passthrough().needs_destination());
    }

    #[test]
    fn test_projection_symbol_selection() {
        let row = ScanKernels::passthrough().and_projection(Projection::row(vec![0]));
        assert_eq!(row.projection.unwrap().symbol, protocol::KERNEL_PROJECT_ROW);
        let slot = ScanKernels::passthrough().and_projection(Projection::slot(vec![0]));
        assert_eq!(slot.projection.unwrap().symbol, protocol::KERNEL_PROJECT_SLOT);
    }

    #[test]
    fn test_validation_catches_bad_columns() {
        let d = desc();
        assert!(ScanKernels::with_filter(FilterSpec::int(0, CompareOp::Eq, 1))
            .validate(&d)
            .is_ok());
        assert_eq!(
            ScanKernels::with_filter(FilterSpec::int(7, CompareOp::Eq, 1)).validate(&d),
            Err(7)
        );
        assert_eq!(
            ScanKernels::passthrough()
                .and_projection(Projection::row(vec![0, 9]))
                .validate(&d),
            Err(9)
        );
        let too_wide: Vec<usize> = (0..MAX_PROJECTION_COLS + 1).map(|_| 0).collect();
        assert!(ScanKernels::passthrough()
            .and_projection(Projection::row(too_wide))
            .validate(&d)
            .is_err());
    }

    #[test]
    fn test_projection_values_in_output_order() {
        let chunk = chunk_with_one(42, 0.5);
        let view = chunk.fetch_row(0).unwrap();
        let proj = Projection::row(vec![2, 0]);
        assert_eq!(
            proj.project_values(&view),
            vec![Value::Bytes(b"x".to_vec()), Value::Int64(42)]
        );
    }

    #[test]
    fn test_device_filterable_types() {
        assert!(device_filterable(TypeTag::Int64));
        assert!(device_filterable(TypeTag::Bool));
        assert!(!device_filterable(TypeTag::Float64));
        assert!(!device_filterable(TypeTag::Bytes));
    }
}
