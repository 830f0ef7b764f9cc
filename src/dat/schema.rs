use std::path::Path;

use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::info;

/// On-disk shape of the community schema document.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaFile {
    pub version: u32,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    pub tables: Vec<TableDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableDef {
    /// Product bitmask: bit 0 is the first game, bit 1 the second.
    #[serde(rename = "validFor")]
    pub valid_for: u32,
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDef {
    /// Anonymous columns are tolerated.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub array: bool,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub localized: bool,
    #[serde(default)]
    pub references: Option<ColumnReference>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnReference {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    I16,
    I32,
    U16,
    U32,
    F32,
    String,
    Row,
    ForeignRow,
    EnumRow,
    Array,
}

impl ColumnType {
    /// Bytes a value of this type occupies in the fixed region. An array
    /// column always occupies 16 regardless of element type.
    pub fn fixed_size(self) -> usize {
        match self {
            ColumnType::Bool => 1,
            ColumnType::I16 | ColumnType::U16 => 2,
            ColumnType::I32 | ColumnType::U32 | ColumnType::F32 | ColumnType::EnumRow => 4,
            ColumnType::String | ColumnType::Row => 8,
            ColumnType::ForeignRow | ColumnType::Array => 16,
        }
    }
}

impl ColumnDef {
    pub fn fixed_size(&self) -> usize {
        if self.array {
            ColumnType::Array.fixed_size()
        } else {
            self.column_type.fixed_size()
        }
    }
}

impl TableDef {
    /// Row size as the schema believes it to be. The observed size wins
    /// when the two disagree.
    pub fn row_size(&self) -> usize {
        self.columns.iter().map(|c| c.fixed_size()).sum()
    }
}

/// Loaded schema, filtered to one product and indexed by lowercased
/// table name. Immutable once built; share it freely.
#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u32,
    pub created_at: u64,
    tables: FxHashMap<String, TableDef>,
}

impl Schema {
    /// This instance decodes tables for the second product.
    pub const PRODUCT_BIT: u32 = 1 << 1;

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Schema> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .with_context(|| format!("reading schema {}", path.display()))?;
        let file: SchemaFile = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing schema {}", path.display()))?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: SchemaFile) -> Schema {
        let total = file.tables.len();
        let tables: FxHashMap<String, TableDef> = file
            .tables
            .into_iter()
            .filter(|t| t.valid_for & Self::PRODUCT_BIT != 0)
            .map(|t| (t.name.to_lowercase(), t))
            .collect();

        info!(
            "loaded schema v{} with {} tables ({} for this product)",
            file.version,
            total,
            tables.len()
        );

        Schema {
            version: file.version,
            created_at: file.created_at,
            tables,
        }
    }

    /// Case-insensitive table lookup.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}
