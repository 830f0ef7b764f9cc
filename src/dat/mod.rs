pub mod batch;
pub mod decode;
pub mod schema;
pub mod value;

use std::path::Path;

use anyhow::Context;
use serde::Serialize;

pub use schema::Schema;
pub use value::{Row, Value};

/// Result of decoding one table buffer. A fatal condition leaves an
/// error and zero rows; a recoverable one leaves rows plus a warning.
#[derive(Debug, Clone, Serialize)]
pub struct DecodeOutcome {
    pub table_name: String,
    pub row_count: u32,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DecodeOutcome {
    pub(crate) fn fatal(table_name: &str, message: &str) -> DecodeOutcome {
        DecodeOutcome {
            table_name: table_name.to_string(),
            row_count: 0,
            rows: Vec::new(),
            warning: None,
            error: Some(message.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Derives the schema table name from a file name: extension dropped,
/// leading non-alphabetic characters stripped.
pub fn table_name_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let trimmed = stem.trim_start_matches(|c: char| !c.is_ascii_alphabetic());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// True for the on-disk table formats this decoder understands.
pub fn is_table_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(e) if e.eq_ignore_ascii_case("datc64") || e.eq_ignore_ascii_case("dat64")
    )
}

/// Decodes `data` as the named table. An unknown table is fatal here;
/// batch callers check the schema first and skip instead.
pub fn decode_table(schema: &Schema, table_name: &str, data: &[u8]) -> DecodeOutcome {
    match schema.table(table_name) {
        Some(table) => decode::decode(table, table_name, data),
        None => DecodeOutcome::fatal(table_name, "table is not present in the schema"),
    }
}

/// Reads and decodes a single table file.
pub fn decode_file(schema: &Schema, path: &Path) -> anyhow::Result<DecodeOutcome> {
    let table_name = table_name_from_path(path)
        .with_context(|| format!("no table name derivable from {}", path.display()))?;
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(decode_table(schema, &table_name, &data))
}

/// Writes the decoded rows as a JSON array.
pub fn write_rows_json(outcome: &DecodeOutcome, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_vec(&outcome.rows)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
