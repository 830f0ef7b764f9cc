use anyhow::bail;

use super::schema::{ColumnDef, ColumnType, TableDef};
use super::value::{Row, Value};
use super::DecodeOutcome;

/// Eight 0xBB bytes separate the fixed region from the variable region.
pub const VARIABLE_DATA_MAGIC: [u8; 8] = [0xBB; 8];

/// Arrays longer than this decode as empty.
pub const MAX_ARRAY_LENGTH: i64 = 100_000;

/// Alternative null encoding for row references alongside -1.
const ROW_NULL_PATTERN: u64 = 0xFEFE_FEFE_FEFE_FEFE;

struct DatView<'a> {
    data: &'a [u8],
    /// Offset of the magic marker itself; variable-region offsets are
    /// relative to this.
    variable_offset: usize,
}

/// Decodes a `.datc64` buffer against one table definition. Fatal
/// conditions yield an error and zero rows; anything recoverable yields
/// rows plus a warning.
pub fn decode(table: &TableDef, table_name: &str, data: &[u8]) -> DecodeOutcome {
    if data.is_empty() {
        return DecodeOutcome::fatal(table_name, "empty buffer");
    }
    if data.len() < 4 {
        return DecodeOutcome::fatal(table_name, "buffer is shorter than a row count");
    }

    let row_count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let mut warnings: Vec<String> = Vec::new();

    let magic_offset = data[4..]
        .windows(VARIABLE_DATA_MAGIC.len())
        .position(|w| w == VARIABLE_DATA_MAGIC)
        .map(|p| p + 4);

    // The schema's idea of the row size is only a fallback; the size
    // observed in the file wins whenever the magic is present.
    let schema_size = table.row_size();
    let row_size = match magic_offset {
        Some(magic) if row_count > 0 => {
            let fixed = magic - 4;
            if fixed % row_count as usize != 0 {
                warnings.push(format!(
                    "fixed region of {fixed} bytes does not divide evenly into {row_count} rows"
                ));
            }
            fixed / row_count as usize
        }
        Some(_) => 0,
        None => {
            warnings.push("variable data magic not found".to_string());
            schema_size
        }
    };

    if magic_offset.is_some() && row_count > 0 && row_size != schema_size {
        warnings.push(format!(
            "schema row size {schema_size} does not match observed row size {row_size}"
        ));
    }

    let view = DatView {
        data,
        variable_offset: magic_offset.unwrap_or(data.len()),
    };

    // Without the magic the fixed region's extent is unknown; only decode
    // the rows that provably fit.
    let decodable = match magic_offset {
        Some(_) if row_size == 0 && row_count > 0 => {
            warnings.push("observed row size is zero".to_string());
            0
        }
        Some(_) => row_count as usize,
        None => (data.len() - 4) / row_size.max(1),
    };

    let mut rows = Vec::with_capacity(decodable.min(row_count as usize));
    let mut field_failures = 0usize;

    for i in 0..row_count as usize {
        if i >= decodable {
            break;
        }
        let row_start = 4 + i * row_size;
        let mut pos = row_start;
        let mut cells = Vec::with_capacity(table.columns.len());

        for (ci, column) in table.columns.iter().enumerate() {
            let name = column
                .name
                .clone()
                .unwrap_or_else(|| format!("unk{ci}"));
            let value = match decode_column(&view, column, pos) {
                Ok(v) => v,
                Err(_) => {
                    field_failures += 1;
                    Value::Null
                }
            };
            cells.push((name, value));
            // Advance by the nominal size even when the read failed so a
            // single bad field cannot shift the rest of the row.
            pos += column.fixed_size();
        }

        // The next row starts at row_start + row_size no matter how many
        // bytes the columns consumed.
        rows.push(Row(cells));
    }

    if field_failures > 0 {
        warnings.push(format!("{field_failures} field reads failed"));
    }

    DecodeOutcome {
        table_name: table_name.to_string(),
        row_count,
        rows,
        warning: if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("; "))
        },
        error: None,
    }
}

fn decode_column(view: &DatView, column: &ColumnDef, pos: usize) -> anyhow::Result<Value> {
    if column.array {
        decode_array(view, column.column_type, pos)
    } else {
        decode_scalar(view, column.column_type, pos)
    }
}

fn decode_scalar(view: &DatView, ty: ColumnType, pos: usize) -> anyhow::Result<Value> {
    Ok(match ty {
        ColumnType::Bool => Value::Bool(read_bytes::<1>(view, pos)?[0] != 0),
        ColumnType::I16 => Value::I16(i16::from_le_bytes(read_bytes(view, pos)?)),
        ColumnType::U16 => Value::U16(u16::from_le_bytes(read_bytes(view, pos)?)),
        ColumnType::I32 => Value::I32(i32::from_le_bytes(read_bytes(view, pos)?)),
        ColumnType::U32 => Value::U32(u32::from_le_bytes(read_bytes(view, pos)?)),
        ColumnType::F32 => Value::F32(f32::from_le_bytes(read_bytes(view, pos)?)),
        ColumnType::EnumRow => Value::EnumRow(u32::from_le_bytes(read_bytes(view, pos)?)),
        ColumnType::String => decode_string(view, pos)?,
        ColumnType::Row => {
            let raw = u64::from_le_bytes(read_bytes(view, pos)?);
            if raw == u64::MAX || raw == ROW_NULL_PATTERN {
                Value::Null
            } else {
                Value::Row(raw as i64)
            }
        }
        ColumnType::ForeignRow => {
            // Row id in the first 8 bytes; the trailing table tag is
            // consumed by the fixed-size advance and otherwise ignored.
            let raw = u64::from_le_bytes(read_bytes(view, pos)?);
            let id = raw as i64;
            if id == -1 || id == -2 || raw == ROW_NULL_PATTERN {
                Value::Null
            } else {
                Value::ForeignRow(id)
            }
        }
        // An array element type of `array` is a schema error.
        ColumnType::Array => Value::List(Vec::new()),
    })
}

fn decode_array(view: &DatView, element: ColumnType, pos: usize) -> anyhow::Result<Value> {
    let length = i64::from_le_bytes(read_bytes(view, pos)?);
    let offset = i64::from_le_bytes(read_bytes(view, pos + 8)?);

    if length <= 0 || length > MAX_ARRAY_LENGTH || offset < 0 {
        return Ok(Value::List(Vec::new()));
    }
    if element == ColumnType::Array {
        return Ok(Value::List(Vec::new()));
    }

    let element_size = element.fixed_size();
    let Some(base) = view.variable_offset.checked_add(offset as usize) else {
        return Ok(Value::List(Vec::new()));
    };

    let mut out = Vec::with_capacity(length as usize);
    for i in 0..length as usize {
        let p = base + i * element_size;
        // A read past the end of the buffer halts the array; the partial
        // list is the result.
        if p + element_size > view.data.len() {
            break;
        }
        match decode_scalar(view, element, p) {
            Ok(v) => out.push(v),
            Err(_) => break,
        }
    }
    Ok(Value::List(out))
}

fn decode_string(view: &DatView, pos: usize) -> anyhow::Result<Value> {
    let offset = i64::from_le_bytes(read_bytes(view, pos)?);
    if offset < 0 {
        return Ok(Value::Null);
    }

    let Some(start) = view.variable_offset.checked_add(offset as usize) else {
        return Ok(Value::String(String::new()));
    };

    // UTF-16LE until a four-byte run of zeros. The two-unit terminator
    // matters: single zero code units occur inside real strings.
    let mut units = Vec::new();
    let mut p = start;
    loop {
        if p + 4 > view.data.len() {
            // Ran off the end without a terminator.
            return Ok(Value::String(String::new()));
        }
        let u0 = u16::from_le_bytes([view.data[p], view.data[p + 1]]);
        let u1 = u16::from_le_bytes([view.data[p + 2], view.data[p + 3]]);
        if u0 == 0 && u1 == 0 {
            break;
        }
        units.push(u0);
        p += 2;
    }

    Ok(Value::String(String::from_utf16(&units).unwrap_or_default()))
}

fn read_bytes<const N: usize>(view: &DatView, pos: usize) -> anyhow::Result<[u8; N]> {
    let Some(end) = pos.checked_add(N) else {
        bail!("read position overflow");
    };
    if end > view.data.len() {
        bail!("read of {N} bytes at {pos} is out of bounds");
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&view.data[pos..end]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::schema::SchemaFile;
    use super::super::Schema;
    use super::*;

    fn table_of(columns_json: &str) -> TableDef {
        let file: SchemaFile = serde_json::from_str(&format!(
            r#"{{"version":1,"createdAt":0,"tables":[
                {{"validFor":2,"name":"Test","columns":{columns_json}}}]}}"#
        ))
        .unwrap();
        Schema::from_file(file).table("test").unwrap().clone()
    }

    fn push_utf16(buf: &mut Vec<u8>, s: &str) {
        for u in s.encode_utf16() {
            buf.extend_from_slice(&u.to_le_bytes());
        }
        buf.extend_from_slice(&[0, 0, 0, 0]);
    }

    /// Two rows of [i32, string, array<i32>]; the string is "hi" and the
    /// array is [10, 20, 30].
    fn sample_buffer() -> Vec<u8> {
        let row_size = 4 + 8 + 16;
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        for i in 0..2i32 {
            buf.extend_from_slice(&(i + 1).to_le_bytes());
            buf.extend_from_slice(&8i64.to_le_bytes()); // string at magic+8
            buf.extend_from_slice(&3i64.to_le_bytes()); // array length
            buf.extend_from_slice(&16i64.to_le_bytes()); // array at magic+16
        }
        assert_eq!(buf.len(), 4 + 2 * row_size);

        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);
        push_utf16(&mut buf, "hi"); // magic+8, 8 bytes
        for v in [10i32, 20, 30] {
            buf.extend_from_slice(&v.to_le_bytes()); // magic+16
        }
        buf
    }

    #[test]
    fn decodes_scalars_strings_and_arrays() {
        let table = table_of(
            r#"[{"name":"A","type":"i32"},
                {"name":"B","type":"string"},
                {"name":"C","array":true,"type":"i32"}]"#,
        );
        let outcome = decode(&table, "Test", &sample_buffer());

        assert!(outcome.error.is_none());
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.rows.len(), 2);

        let row = &outcome.rows[0];
        assert_eq!(row.get("A"), Some(&Value::I32(1)));
        assert_eq!(row.get("B"), Some(&Value::String("hi".to_string())));
        assert_eq!(
            row.get("C"),
            Some(&Value::List(vec![
                Value::I32(10),
                Value::I32(20),
                Value::I32(30)
            ]))
        );
        assert_eq!(outcome.rows[1].get("A"), Some(&Value::I32(2)));
    }

    #[test]
    fn null_sentinels_decode_to_null() {
        let table = table_of(
            r#"[{"name":"S","type":"string"},
                {"name":"R","type":"row"}]"#,
        );
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(-1i64).to_le_bytes());
        buf.extend_from_slice(&0xFEFE_FEFE_FEFE_FEFEu64.to_le_bytes());
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);

        let outcome = decode(&table, "Test", &buf);
        let row = &outcome.rows[0];
        assert_eq!(row.get("S"), Some(&Value::Null));
        assert_eq!(row.get("R"), Some(&Value::Null));
    }

    #[test]
    fn foreignrow_sentinels() {
        let table = table_of(r#"[{"name":"F","type":"foreignrow"}]"#);

        for (raw, expect_null) in [
            (-1i64, true),
            (-2i64, true),
            (0xFEFE_FEFE_FEFE_FEFEu64 as i64, true),
            (42, false),
        ] {
            let mut buf = Vec::new();
            buf.extend_from_slice(&1u32.to_le_bytes());
            buf.extend_from_slice(&raw.to_le_bytes());
            buf.extend_from_slice(&0xDEAD_BEEFu64.to_le_bytes()); // ignored table tag
            buf.extend_from_slice(&VARIABLE_DATA_MAGIC);

            let outcome = decode(&table, "Test", &buf);
            let value = outcome.rows[0].get("F").unwrap();
            if expect_null {
                assert_eq!(value, &Value::Null, "raw {raw}");
            } else {
                assert_eq!(value, &Value::ForeignRow(42));
            }
        }
    }

    #[test]
    fn observed_row_size_wins_over_schema() {
        // Schema thinks 8 bytes per row, the file uses 12.
        let table = table_of(r#"[{"name":"A","type":"i32"},{"name":"B","type":"i32"}]"#);
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        for pair in [[1i32, 2], [3, 4]] {
            buf.extend_from_slice(&pair[0].to_le_bytes());
            buf.extend_from_slice(&pair[1].to_le_bytes());
            buf.extend_from_slice(&0u32.to_le_bytes()); // trailing bytes the schema missed
        }
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);

        let outcome = decode(&table, "Test", &buf);
        assert_eq!(outcome.rows.len(), 2);
        assert!(outcome
            .warning
            .as_deref()
            .unwrap()
            .contains("schema row size 8 does not match observed row size 12"));

        // No desynchronisation: row 1 still starts on its own bytes.
        assert_eq!(outcome.rows[1].get("A"), Some(&Value::I32(3)));
        assert_eq!(outcome.rows[1].get("B"), Some(&Value::I32(4)));
    }

    #[test]
    fn schema_longer_than_row_does_not_desync() {
        // Schema thinks 12 bytes per row, the file uses 8; the phantom
        // third column reads stale bytes but rows stay aligned.
        let table = table_of(
            r#"[{"name":"A","type":"i32"},{"name":"B","type":"i32"},{"name":"C","type":"i32"}]"#,
        );
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        for pair in [[1i32, 2], [3, 4]] {
            buf.extend_from_slice(&pair[0].to_le_bytes());
            buf.extend_from_slice(&pair[1].to_le_bytes());
        }
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);

        let outcome = decode(&table, "Test", &buf);
        assert_eq!(outcome.rows.len(), 2);
        assert!(outcome.warning.is_some());
        assert_eq!(outcome.rows[1].get("A"), Some(&Value::I32(3)));
        assert_eq!(outcome.rows[1].get("B"), Some(&Value::I32(4)));
    }

    #[test]
    fn oversized_arrays_decode_empty() {
        let table = table_of(r#"[{"name":"C","array":true,"type":"i32"}]"#);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(MAX_ARRAY_LENGTH + 1).to_le_bytes());
        buf.extend_from_slice(&8i64.to_le_bytes());
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);

        let outcome = decode(&table, "Test", &buf);
        assert_eq!(outcome.rows[0].get("C"), Some(&Value::List(Vec::new())));
    }

    #[test]
    fn array_crossing_buffer_end_is_partial() {
        let table = table_of(r#"[{"name":"C","array":true,"type":"i32"}]"#);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&10i64.to_le_bytes()); // claims ten elements
        buf.extend_from_slice(&8i64.to_le_bytes());
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);
        buf.extend_from_slice(&7i32.to_le_bytes()); // only one fits

        let outcome = decode(&table, "Test", &buf);
        assert_eq!(outcome.rows[0].get("C"), Some(&Value::List(vec![Value::I32(7)])));
    }

    #[test]
    fn string_with_embedded_zero_unit() {
        let table = table_of(r#"[{"name":"S","type":"string"}]"#);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&8i64.to_le_bytes());
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);
        // 'a', NUL, 'b', then the two-unit terminator.
        for u in [0x61u16, 0, 0x62, 0, 0] {
            buf.extend_from_slice(&u.to_le_bytes());
        }

        let outcome = decode(&table, "Test", &buf);
        assert_eq!(
            outcome.rows[0].get("S"),
            Some(&Value::String("a\0b".to_string()))
        );
    }

    #[test]
    fn out_of_range_string_is_empty_not_error() {
        let table = table_of(r#"[{"name":"S","type":"string"}]"#);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0x7FFF_FFFFi64.to_le_bytes());
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);

        let outcome = decode(&table, "Test", &buf);
        assert_eq!(outcome.rows[0].get("S"), Some(&Value::String(String::new())));
        assert!(outcome.error.is_none());
    }

    #[test]
    fn missing_magic_is_a_warning() {
        let table = table_of(r#"[{"name":"A","type":"i32"}]"#);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&5i32.to_le_bytes());

        let outcome = decode(&table, "Test", &buf);
        assert!(outcome.warning.as_deref().unwrap().contains("magic"));
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].get("A"), Some(&Value::I32(5)));
    }

    #[test]
    fn fatal_conditions_return_no_rows() {
        let table = table_of(r#"[{"name":"A","type":"i32"}]"#);

        let outcome = decode(&table, "Test", &[]);
        assert!(outcome.error.is_some());
        assert!(outcome.rows.is_empty());

        let outcome = decode(&table, "Test", &[1, 0]);
        assert!(outcome.error.is_some());
        assert!(outcome.rows.is_empty());
    }

    #[test]
    fn strings_inside_arrays_resolve() {
        let table = table_of(r#"[{"name":"S","array":true,"type":"string"}]"#);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1i64.to_le_bytes()); // one element
        buf.extend_from_slice(&8i64.to_le_bytes()); // element slots at magic+8
        buf.extend_from_slice(&VARIABLE_DATA_MAGIC);
        buf.extend_from_slice(&16i64.to_le_bytes()); // the element: string at magic+16
        push_utf16(&mut buf, "ok");

        let outcome = decode(&table, "Test", &buf);
        assert_eq!(
            outcome.rows[0].get("S"),
            Some(&Value::List(vec![Value::String("ok".to_string())]))
        );
    }
}
