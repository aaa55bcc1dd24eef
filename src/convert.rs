//! Row group to record batch conversion
//!
//! Scan workers feed dynamic row groups into a converter that accumulates
//! them until a flush produces one output batch. Row groups disagree on
//! their dynamic columns, so the flush builds the union schema (sorted by
//! field name) and pads each row group's missing columns with nulls.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{new_null_array, Array, ArrayRef};
use arrow::compute::concat;
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;

use crate::source::DynamicRowGroup;
use crate::{Result, StrataError};

/// Scalar types the converter knows how to carry across row groups.
fn is_supported_scalar(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Boolean
            | DataType::Binary
            | DataType::LargeBinary
            | DataType::Timestamp(_, _)
            | DataType::Null
    )
}

/// Accumulates dynamic row groups into columnar output.
pub struct Converter {
    buffered: Vec<DynamicRowGroup>,
    fields: BTreeMap<String, DataType>,
    rows: usize,
}

impl Converter {
    pub fn new() -> Self {
        Self {
            buffered: Vec::new(),
            fields: BTreeMap::new(),
            rows: 0,
        }
    }

    /// Buffer one row group, folding its fields into the union schema.
    pub fn convert(&mut self, rg: DynamicRowGroup) -> Result<()> {
        for field in rg.schema().fields() {
            let dt = field.data_type();
            if !is_supported_scalar(dt) {
                return Err(StrataError::SchemaMismatch(format!(
                    "unsupported scalar type {:?} for column {}",
                    dt,
                    field.name()
                )));
            }
            match self.fields.get(field.name().as_str()) {
                Some(existing) if existing != dt => {
                    return Err(StrataError::SchemaMismatch(format!(
                        "column {} seen as {:?} and {:?}",
                        field.name(),
                        existing,
                        dt
                    )));
                }
                Some(_) => {}
                None => {
                    self.fields.insert(field.name().clone(), dt.clone());
                }
            }
        }
        self.rows += rg.num_rows();
        self.buffered.push(rg);
        Ok(())
    }

    /// Rows buffered so far.
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Distinct fields observed so far.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Drain the buffer into a single record batch. Returns `None` when
    /// nothing (or only fieldless row groups) was buffered.
    pub fn flush(&mut self) -> Result<Option<RecordBatch>> {
        if self.buffered.is_empty() || self.fields.is_empty() {
            self.buffered.clear();
            self.fields.clear();
            self.rows = 0;
            return Ok(None);
        }

        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|(name, dt)| Field::new(name.as_str(), dt.clone(), true))
            .collect();

        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(fields.len());
        for field in &fields {
            let parts: Vec<ArrayRef> = self
                .buffered
                .iter()
                .map(|rg| match rg.column_by_name(field.name()) {
                    Some(col) => Arc::clone(col),
                    None => new_null_array(field.data_type(), rg.num_rows()),
                })
                .collect();
            let refs: Vec<&dyn Array> = parts.iter().map(|a| a.as_ref()).collect();
            arrays.push(concat(&refs)?);
        }

        let schema = Arc::new(ArrowSchema::new(fields));
        let batch = RecordBatch::try_new(schema, arrays)?;

        self.buffered.clear();
        self.fields.clear();
        self.rows = 0;
        Ok(Some(batch))
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge record batches with possibly differing dynamic columns into one.
pub fn merge_batches(batches: &[RecordBatch]) -> Result<Option<RecordBatch>> {
    let mut converter = Converter::new();
    for batch in batches {
        converter.convert(DynamicRowGroup::from_record_batch(batch))?;
    }
    converter.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};

    fn rg(fields: Vec<(&str, ArrayRef)>) -> DynamicRowGroup {
        let schema = Arc::new(ArrowSchema::new(
            fields
                .iter()
                .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
                .collect::<Vec<_>>(),
        ));
        let columns = fields.into_iter().map(|(_, a)| a).collect();
        DynamicRowGroup::new(schema, columns).unwrap()
    }

    #[test]
    fn test_unifies_dynamic_columns() {
        let mut converter = Converter::new();
        converter
            .convert(rg(vec![
                ("v", Arc::new(Int64Array::from(vec![1, 2]))),
                ("labels.host", Arc::new(StringArray::from(vec!["a", "b"]))),
            ]))
            .unwrap();
        converter
            .convert(rg(vec![
                ("v", Arc::new(Int64Array::from(vec![3]))),
                ("labels.region", Arc::new(StringArray::from(vec!["eu"]))),
            ]))
            .unwrap();

        assert_eq!(converter.num_rows(), 3);
        assert_eq!(converter.num_fields(), 3);

        let batch = converter.flush().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 3);
        // Union schema in sorted field order
        let names: Vec<_> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["labels.host", "labels.region", "v"]);

        // Missing dynamic columns are null padded
        let hosts = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert!(hosts.is_null(2));
        assert_eq!(hosts.value(0), "a");

        let regions = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert!(regions.is_null(0));
        assert_eq!(regions.value(2), "eu");

        // Flushing resets the converter
        assert_eq!(converter.num_rows(), 0);
        assert!(converter.flush().unwrap().is_none());
    }

    #[test]
    fn test_type_conflict_rejected() {
        let mut converter = Converter::new();
        converter
            .convert(rg(vec![("v", Arc::new(Int64Array::from(vec![1])))]))
            .unwrap();
        let err = converter
            .convert(rg(vec![("v", Arc::new(StringArray::from(vec!["x"])))]))
            .unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch(_)));
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "nested",
            DataType::List(Arc::new(Field::new("item", DataType::Int64, true))),
            true,
        )]));
        let column = new_null_array(schema.field(0).data_type(), 2);
        let rg = DynamicRowGroup::new(schema, vec![column]).unwrap();

        let mut converter = Converter::new();
        let err = converter.convert(rg).unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch(_)));
    }

    #[test]
    fn test_merge_batches_preserves_rows() {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "v",
            DataType::Int64,
            true,
        )]));
        let b1 = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        let b2 =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![4, 5]))]).unwrap();

        let merged = merge_batches(&[b1, b2]).unwrap().unwrap();
        assert_eq!(merged.num_rows(), 5);

        assert!(merge_batches(&[]).unwrap().is_none());
    }
}
