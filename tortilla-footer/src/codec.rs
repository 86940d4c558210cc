//! Binary layout of the footer table.
//!
//! The table serializes to a little-endian columnar buffer: row count, column
//! count, then one block per column (name, type tag, validity bitmap, packed
//! non-null values). The whole buffer is Zstandard-compressed at level 22
//! with no dictionary, which keeps footers with many repeated small values
//! compact.

use crate::{
    table::{Column, ColumnType, Table, Value},
    FooterError, ID_COLUMN, LENGTH_COLUMN, OFFSET_COLUMN,
};

/// Maximum zstd level; repeated ids/paths compress well and footers are
/// small enough that encode time does not matter.
const COMPRESSION_LEVEL: i32 = 22;

const TAG_STR: u8 = 0;
const TAG_I64: u8 = 1;
const TAG_F64: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_I64_LIST: u8 = 4;
const TAG_F64_LIST: u8 = 5;

fn type_tag(dtype: ColumnType) -> u8 {
    match dtype {
        ColumnType::Str => TAG_STR,
        ColumnType::I64 => TAG_I64,
        ColumnType::F64 => TAG_F64,
        ColumnType::Bool => TAG_BOOL,
        ColumnType::I64List => TAG_I64_LIST,
        ColumnType::F64List => TAG_F64_LIST,
    }
}

fn tag_type(tag: u8) -> Result<ColumnType, FooterError> {
    match tag {
        TAG_STR => Ok(ColumnType::Str),
        TAG_I64 => Ok(ColumnType::I64),
        TAG_F64 => Ok(ColumnType::F64),
        TAG_BOOL => Ok(ColumnType::Bool),
        TAG_I64_LIST => Ok(ColumnType::I64List),
        TAG_F64_LIST => Ok(ColumnType::F64List),
        _ => Err(FooterError::Framing("unknown column type tag")),
    }
}

/// Serialize and compress a footer table.
///
/// The table must carry the three well-known columns (`tortilla:id`,
/// `tortilla:offset`, `tortilla:length`) with their fixed types.
pub fn encode_footer(table: &Table) -> Result<Vec<u8>, FooterError> {
    check_well_known(table)?;

    let n_rows = table.n_rows();
    let mut buf = Vec::new();
    buf.extend_from_slice(&(n_rows as u64).to_le_bytes());
    buf.extend_from_slice(&(table.n_columns() as u32).to_le_bytes());

    for col in table.columns() {
        let name = col.name().as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(FooterError::Framing("column name too long"));
        }
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name);
        buf.push(type_tag(col.dtype()));

        // Validity bitmap, bit i of byte i/8 set when row i is non-null
        let mut bitmap = vec![0u8; n_rows.div_ceil(8)];
        for row in 0..n_rows {
            if col.get(row).is_some() {
                bitmap[row / 8] |= 1 << (row % 8);
            }
        }
        buf.extend_from_slice(&bitmap);

        for row in 0..n_rows {
            if let Some(value) = col.get(row) {
                encode_value(&mut buf, &value);
            }
        }
    }

    Ok(zstd::encode_all(buf.as_slice(), COMPRESSION_LEVEL)?)
}

/// Decompress and deserialize a footer table, preserving column order and
/// types. All framing and zstd failures come back as [`FooterError`].
pub fn decode_footer(bytes: &[u8]) -> Result<Table, FooterError> {
    let raw = zstd::decode_all(bytes)?;
    let mut cursor = Cursor::new(&raw);

    let n_rows = cursor.read_u64()? as usize;
    let n_columns = cursor.read_u32()? as usize;

    let mut table = Table::new();
    for _ in 0..n_columns {
        let name_len = cursor.read_u16()? as usize;
        let name = std::str::from_utf8(cursor.read_bytes(name_len)?)
            .map_err(|_| FooterError::Framing("column name is not utf-8"))?
            .to_string();
        let dtype = tag_type(cursor.read_u8()?)?;

        let bitmap = cursor.read_bytes(n_rows.div_ceil(8))?.to_vec();
        let mut col = Column::new(name, dtype);
        for row in 0..n_rows {
            if bitmap[row / 8] & (1 << (row % 8)) != 0 {
                let value = decode_value(&mut cursor, dtype)?;
                col.push(Some(value))?;
            } else {
                col.push(None)?;
            }
        }
        table.push_column(col)?;
    }

    if !cursor.is_at_end() {
        return Err(FooterError::Framing("trailing bytes after last column"));
    }
    Ok(table)
}

fn check_well_known(table: &Table) -> Result<(), FooterError> {
    for (name, dtype) in [
        (ID_COLUMN, ColumnType::Str),
        (OFFSET_COLUMN, ColumnType::I64),
        (LENGTH_COLUMN, ColumnType::I64),
    ] {
        match table.column(name) {
            None => return Err(FooterError::Framing("missing well-known column")),
            Some(col) if col.dtype() != dtype => {
                return Err(FooterError::Framing("well-known column has wrong type"));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Str(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Bool(v) => buf.push(u8::from(*v)),
        Value::I64List(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                buf.extend_from_slice(&item.to_le_bytes());
            }
        }
        Value::F64List(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                buf.extend_from_slice(&item.to_le_bytes());
            }
        }
    }
}

fn decode_value(cursor: &mut Cursor<'_>, dtype: ColumnType) -> Result<Value, FooterError> {
    Ok(match dtype {
        ColumnType::Str => {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.read_bytes(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| FooterError::Framing("string cell is not utf-8"))?;
            Value::Str(s.to_string())
        }
        ColumnType::I64 => Value::I64(i64::from_le_bytes(cursor.read_array()?)),
        ColumnType::F64 => Value::F64(f64::from_le_bytes(cursor.read_array()?)),
        ColumnType::Bool => Value::Bool(cursor.read_u8()? != 0),
        ColumnType::I64List => {
            let len = cursor.read_u32()? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(i64::from_le_bytes(cursor.read_array()?));
            }
            Value::I64List(items)
        }
        ColumnType::F64List => {
            let len = cursor.read_u32()? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(f64::from_le_bytes(cursor.read_array()?));
            }
            Value::F64List(items)
        }
    })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FooterError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(FooterError::Framing("unexpected end of footer"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], FooterError> {
        let bytes = self.read_bytes(N)?;
        Ok(bytes.try_into().expect("read_bytes returned N bytes"))
    }

    fn read_u8(&mut self) -> Result<u8, FooterError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16, FooterError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, FooterError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, FooterError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn item_row(id: &str, offset: i64, length: i64) -> Vec<(String, Value)> {
        vec![
            (ID_COLUMN.to_string(), Value::Str(id.to_string())),
            (OFFSET_COLUMN.to_string(), Value::I64(offset)),
            (LENGTH_COLUMN.to_string(), Value::I64(length)),
        ]
    }

    #[test]
    fn test_roundtrip_all_types() -> eyre::Result<()> {
        let mut row0 = item_row("a", 200, 100);
        row0.push(("stac:crs".to_string(), Value::Str("EPSG:4326".to_string())));
        row0.push((
            "stac:geotransform".to_string(),
            Value::F64List(vec![0.0, 1.0, 0.0, 0.0, 0.0, -1.0]),
        ));
        row0.push((
            "stac:raster_shape".to_string(),
            Value::I64List(vec![512, 512]),
        ));
        row0.push(("rai:children".to_string(), Value::F64(0.25)));
        row0.push(("cloudy".to_string(), Value::Bool(false)));

        // Second row leaves the optional columns null
        let row1 = item_row("b", 300, 50);

        let table = Table::from_rows(&[row0, row1])?;
        let encoded = encode_footer(&table)?;
        let decoded = decode_footer(&encoded)?;

        assert_eq!(decoded, table);
        assert_eq!(
            decoded.column_names(),
            vec![
                ID_COLUMN,
                OFFSET_COLUMN,
                LENGTH_COLUMN,
                "stac:crs",
                "stac:geotransform",
                "stac:raster_shape",
                "rai:children",
                "cloudy",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_roundtrip_empty_table() -> eyre::Result<()> {
        let table = Table::from_rows(&[])?;
        // An empty footer still needs the well-known columns
        assert!(encode_footer(&table).is_err());

        let mut table = Table::new();
        table.push_column(Column::new(ID_COLUMN, ColumnType::Str))?;
        table.push_column(Column::new(OFFSET_COLUMN, ColumnType::I64))?;
        table.push_column(Column::new(LENGTH_COLUMN, ColumnType::I64))?;
        let decoded = decode_footer(&encode_footer(&table)?)?;
        assert_eq!(decoded.n_rows(), 0);
        assert_eq!(decoded.n_columns(), 3);
        Ok(())
    }

    #[test]
    fn test_garbage_is_footer_decode_error() {
        assert!(decode_footer(b"definitely not zstd").is_err());
    }

    #[test]
    fn test_truncated_frame() -> eyre::Result<()> {
        let table = Table::from_rows(&[item_row("a", 200, 1)])?;
        let encoded = encode_footer(&table)?;

        // Recompress a truncated inner buffer so zstd succeeds but framing fails
        let raw = zstd::decode_all(encoded.as_slice())?;
        let clipped = zstd::encode_all(&raw[..raw.len() - 4], 3)?;
        assert!(decode_footer(&clipped).is_err());
        Ok(())
    }

    #[test]
    fn test_footer_compresses_repeated_values() -> eyre::Result<()> {
        let rows: Vec<_> = (0..256)
            .map(|i| {
                let mut row = item_row(&format!("sample_{i:04}"), 200 + i, 1);
                row.push(("stac:crs".to_string(), Value::Str("EPSG:32633".into())));
                row
            })
            .collect();
        let table = Table::from_rows(&rows)?;
        let encoded = encode_footer(&table)?;
        let raw = zstd::decode_all(encoded.as_slice())?;
        assert!(encoded.len() < raw.len() / 4);
        Ok(())
    }
}
