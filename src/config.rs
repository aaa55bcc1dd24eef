//! Table configuration and schema definitions
//!
//! A table is configured with a rotation threshold, scan parallelism, WAL
//! toggle, and an optional schema. A table without a schema is read-only:
//! it serves scans over external sources but rejects writes.
//!
//! Two schema definition shapes are supported: the flat v1 form (a list of
//! columns) and the nested v2 form (groups of nodes). Both flatten to the
//! same runtime `Schema`.

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use serde::{Deserialize, Serialize};

use crate::{Result, StrataError};

/// Default rotation threshold for the active block, in bytes.
pub const DEFAULT_ACTIVE_MEMORY_SIZE: u64 = 512 * 1024 * 1024;

/// Table configuration
///
/// Serializable: a copy is embedded in the WAL entry written when a new
/// block is created, so recovery sees the config the block was built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Rows per row group in persisted files. 0 means unlimited.
    pub row_group_size: u64,
    /// Number of parallel readers over persisted block files.
    pub block_reader_limit: u64,
    /// Disable the write-ahead log for this table.
    pub disable_wal: bool,
    /// Active block size threshold that triggers rotation, in bytes.
    pub active_memory_size: u64,
    /// Table schema. `None` makes the table read-only.
    pub schema: Option<SchemaSpec>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            row_group_size: 0,
            block_reader_limit: std::thread::available_parallelism()
                .map(|n| n.get() as u64)
                .unwrap_or(1),
            disable_wal: false,
            active_memory_size: DEFAULT_ACTIVE_MEMORY_SIZE,
            schema: None,
        }
    }
}

impl TableConfig {
    pub fn new(schema: SchemaSpec) -> Self {
        Self {
            schema: Some(schema),
            ..Default::default()
        }
    }

    /// Set the row group size for persisted files. 0 means no limit.
    pub fn with_row_group_size(mut self, rows: u64) -> Self {
        self.row_group_size = rows;
        self
    }

    /// Limit the number of parallel block file readers.
    pub fn with_block_reader_limit(mut self, n: u64) -> Self {
        self.block_reader_limit = n;
        self
    }

    /// Disable the WAL for this table.
    pub fn without_wal(mut self) -> Self {
        self.disable_wal = true;
        self
    }

    pub fn with_active_memory_size(mut self, bytes: u64) -> Self {
        self.active_memory_size = bytes;
        self
    }
}

/// Scalar types storable in a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalType {
    Int64,
    Float64,
    Utf8,
    Bool,
    Binary,
}

impl LogicalType {
    pub fn to_arrow(self) -> DataType {
        match self {
            LogicalType::Int64 => DataType::Int64,
            LogicalType::Float64 => DataType::Float64,
            LogicalType::Utf8 => DataType::Utf8,
            LogicalType::Bool => DataType::Boolean,
            LogicalType::Binary => DataType::Binary,
        }
    }

    pub fn from_arrow(dt: &DataType) -> Option<Self> {
        match dt {
            DataType::Int64 => Some(LogicalType::Int64),
            DataType::Float64 => Some(LogicalType::Float64),
            DataType::Utf8 => Some(LogicalType::Utf8),
            DataType::Boolean => Some(LogicalType::Bool),
            DataType::Binary => Some(LogicalType::Binary),
            _ => None,
        }
    }
}

/// A column in a schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: LogicalType,
    pub nullable: bool,
    /// Dynamic columns materialize per batch as `<name>.<label>`.
    pub dynamic: bool,
}

impl ColumnDefinition {
    pub fn new(name: &str, data_type: LogicalType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable: false,
            dynamic: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self.nullable = true;
        self
    }
}

/// Sort order hint for persisted data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortingColumn {
    pub name: String,
    pub descending: bool,
    pub nulls_first: bool,
}

/// Flat schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub sorting_columns: Vec<SortingColumn>,
}

/// Nested schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinitionV2 {
    pub root: GroupDefinition,
    pub sorting_columns: Vec<SortingColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub name: String,
    pub nodes: Vec<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaNode {
    Leaf(ColumnDefinition),
    Group(GroupDefinition),
}

/// Either schema definition shape, as stored in the table config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaSpec {
    V1(SchemaDefinition),
    V2(SchemaDefinitionV2),
}

/// Runtime schema flattened from a definition.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    columns: Vec<ColumnDefinition>,
    dynamic_prefixes: BTreeSet<String>,
    sorting_columns: Vec<SortingColumn>,
}

impl Schema {
    pub fn from_spec(spec: &SchemaSpec) -> Result<Self> {
        let (name, columns, sorting_columns) = match spec {
            SchemaSpec::V1(def) => (
                def.name.clone(),
                def.columns.clone(),
                def.sorting_columns.clone(),
            ),
            SchemaSpec::V2(def) => {
                let mut columns = Vec::new();
                flatten_group(&def.root, "", &mut columns);
                (def.root.name.clone(), columns, def.sorting_columns.clone())
            }
        };

        let mut seen = BTreeSet::new();
        for col in &columns {
            if !seen.insert(col.name.clone()) {
                return Err(StrataError::SchemaMismatch(format!(
                    "duplicate column {}",
                    col.name
                )));
            }
        }

        let dynamic_prefixes = columns
            .iter()
            .filter(|c| c.dynamic)
            .map(|c| c.name.clone())
            .collect();

        Ok(Self {
            name,
            columns,
            dynamic_prefixes,
            sorting_columns,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn sorting_columns(&self) -> &[SortingColumn] {
        &self.sorting_columns
    }

    /// Arrow schema of the static (non-dynamic) columns.
    pub fn base_arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .filter(|c| !c.dynamic)
            .map(|c| Field::new(c.name.as_str(), c.data_type.to_arrow(), c.nullable))
            .collect();
        Arc::new(ArrowSchema::new(fields))
    }

    /// Whether `field_name` belongs to this schema, either as a static
    /// column or as a concrete instance of a dynamic column
    /// (`<prefix>.<label>`).
    pub fn contains_field(&self, field_name: &str) -> bool {
        if self.columns.iter().any(|c| !c.dynamic && c.name == field_name) {
            return true;
        }
        match field_name.split_once('.') {
            Some((prefix, label)) => {
                !label.is_empty() && self.dynamic_prefixes.contains(prefix)
            }
            None => false,
        }
    }

    /// The dynamic prefix of a concrete field name, if it has one.
    pub fn dynamic_prefix<'a>(&self, field_name: &'a str) -> Option<&'a str> {
        let (prefix, _) = field_name.split_once('.')?;
        if self.dynamic_prefixes.contains(prefix) {
            Some(prefix)
        } else {
            None
        }
    }
}

fn flatten_group(group: &GroupDefinition, prefix: &str, out: &mut Vec<ColumnDefinition>) {
    for node in &group.nodes {
        match node {
            SchemaNode::Leaf(col) => {
                let mut col = col.clone();
                if !prefix.is_empty() {
                    col.name = format!("{}.{}", prefix, col.name);
                }
                out.push(col);
            }
            SchemaNode::Group(inner) => {
                let nested = if prefix.is_empty() {
                    inner.name.clone()
                } else {
                    format!("{}.{}", prefix, inner.name)
                };
                flatten_group(inner, &nested, out);
            }
        }
    }
}
