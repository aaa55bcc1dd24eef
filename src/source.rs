//! Scan sources and row-group items
//!
//! A scan collects row groups from several sources: the in-memory indexes of
//! the active and pending blocks, and any number of external sources over
//! persisted files. Every source pushes items through the same `emit`
//! callback; items are a tagged variant so the consuming workers can switch
//! on the kind without dynamic dispatch.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::config::Schema;
use crate::sync::Cancellation;
use crate::{Result, StrataError};

/// An item produced by a scan source.
pub enum ScanItem {
    /// A ready record batch, handed to the callback as is.
    Batch(RecordBatch),
    /// A row group that may carry dynamic columns; accumulated and
    /// converted by the worker before reaching the callback.
    RowGroup(DynamicRowGroup),
}

/// A horizontal slice of rows whose schema may include per-batch dynamic
/// columns. Row groups from different files need not agree on their dynamic
/// columns; the converter unifies them.
#[derive(Clone)]
pub struct DynamicRowGroup {
    schema: SchemaRef,
    columns: Vec<ArrayRef>,
    num_rows: usize,
}

impl DynamicRowGroup {
    pub fn new(schema: SchemaRef, columns: Vec<ArrayRef>) -> Result<Self> {
        if schema.fields().len() != columns.len() {
            return Err(StrataError::SchemaMismatch(format!(
                "schema has {} fields but {} columns given",
                schema.fields().len(),
                columns.len()
            )));
        }
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        for (field, column) in schema.fields().iter().zip(&columns) {
            if column.len() != num_rows {
                return Err(StrataError::SchemaMismatch(format!(
                    "column {} has {} rows, expected {}",
                    field.name(),
                    column.len(),
                    num_rows
                )));
            }
        }
        Ok(Self {
            schema,
            columns,
            num_rows,
        })
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Self {
        Self {
            schema: batch.schema(),
            columns: batch.columns().to_vec(),
            num_rows: batch.num_rows(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn columns(&self) -> &[ArrayRef] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ArrayRef> {
        let idx = self.schema.index_of(name).ok()?;
        self.columns.get(idx)
    }
}

/// Scalar literal usable in a pushdown filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Bool(bool),
}

/// Pushdown predicate handed to scan sources.
///
/// Sources may use it to prune row groups they can prove irrelevant; exact
/// evaluation belongs to the query layer, so ignoring the filter is always
/// correct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(String, Scalar),
    Gt(String, Scalar),
    Lt(String, Scalar),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

/// Emit callback used by sources to hand row groups to the scan pipeline.
pub type Emit<'a> = &'a mut dyn FnMut(ScanItem) -> Result<()>;

/// A provider of row groups for scans.
///
/// `path` identifies the table as `"<dbName>/<tableName>"`. `cutoff_ts` is
/// the minimum creation timestamp (ULID milliseconds) across the in-memory
/// blocks of the scanning table; sources over persisted files must skip any
/// file whose block timestamp is at or above the cutoff, since those rows
/// are still served from memory. A cutoff of 0 means no in-memory blocks
/// exist and nothing is skipped.
pub trait RowGroupSource: Send + Sync {
    fn scan(
        &self,
        ctx: &Cancellation,
        path: &str,
        schema: Option<&Schema>,
        filter: Option<&Filter>,
        cutoff_ts: u64,
        emit: Emit<'_>,
    ) -> Result<()>;
}

/// Blanket impl so `Arc<S>` can be registered directly.
impl<S: RowGroupSource + ?Sized> RowGroupSource for Arc<S> {
    fn scan(
        &self,
        ctx: &Cancellation,
        path: &str,
        schema: Option<&Schema>,
        filter: Option<&Filter>,
        cutoff_ts: u64,
        emit: Emit<'_>,
    ) -> Result<()> {
        (**self).scan(ctx, path, schema, filter, cutoff_ts, emit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};

    #[test]
    fn test_row_group_validation() {
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Int64, false),
        ]));

        let ok = DynamicRowGroup::new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(Int64Array::from(vec![3, 4])),
            ],
        );
        assert_eq!(ok.unwrap().num_rows(), 2);

        let uneven = DynamicRowGroup::new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(Int64Array::from(vec![3])),
            ],
        );
        assert!(uneven.is_err());

        let missing = DynamicRowGroup::new(schema, vec![Arc::new(Int64Array::from(vec![1]))]);
        assert!(missing.is_err());
    }

    #[test]
    fn test_column_by_name() {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "labels.host",
            DataType::Int64,
            true,
        )]));
        let rg = DynamicRowGroup::new(schema, vec![Arc::new(Int64Array::from(vec![7]))]).unwrap();

        assert!(rg.column_by_name("labels.host").is_some());
        assert!(rg.column_by_name("labels.region").is_none());
    }
}
