//! Loading tortilla metadata.
//!
//! Three entry points cover the access patterns: [`load`] for a local path,
//! URL, or `*.tortilla` snippet; [`load_many`] for an explicit list of
//! parts; [`lazy_load`] for a tortilla nested inside another container at a
//! known byte offset. All of them return a [`TortillaTable`] with the
//! synthetic `internal:*` columns appended and a `geometry` column when the
//! rows carry a `stac:centroid`.

use std::{
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
};

use tortilla_footer::{
    decode_footer, Column, ColumnType, Table, Value, LENGTH_COLUMN, OFFSET_COLUMN,
};

use crate::{
    error::TortillaError,
    header::{Header, HEADER_PREFIX_LEN, PARTITIONS_RANGE},
    source::{open_source, RangeSource},
    utils::{is_snippet, is_valid_url, parse_subfile_locator, parse_wkt_point, subfile_locator},
};

pub const INTERNAL_FILE_FORMAT: &str = "internal:file_format";
pub const INTERNAL_MODE: &str = "internal:mode";
pub const INTERNAL_SUBFILE: &str = "internal:subfile";
pub const CENTROID_COLUMN: &str = "stac:centroid";
pub const GEOMETRY_COLUMN: &str = "geometry";

/// Payload formats with dedicated reader-side handling.
const FORMAT_TORTILLA: &str = "TORTILLA";
const FORMAT_BYTES: &str = "BYTES";

/// A metadata table plus the row-level access that the synthetic columns
/// make possible.
#[derive(Debug, Clone, PartialEq)]
pub struct TortillaTable(pub Table);

impl Deref for TortillaTable {
    type Target = Table;

    fn deref(&self) -> &Table {
        &self.0
    }
}

impl DerefMut for TortillaTable {
    fn deref_mut(&mut self) -> &mut Table {
        &mut self.0
    }
}

/// The payload behind one metadata row.
#[derive(Debug)]
pub enum Item {
    /// A nested tortilla, already descended into.
    Tortilla(TortillaTable),
    /// Raw bytes for `BYTES`-format rows.
    Bytes(Vec<u8>),
    /// The subfile locator for formats an external decoder handles.
    Locator(String),
}

impl TortillaTable {
    /// Materialize row `idx`: descend into nested tortillas, fetch raw
    /// bytes, or hand back the locator for everything else.
    pub fn read(&self, idx: usize) -> Result<Item, TortillaError> {
        if idx >= self.n_rows() {
            return Err(TortillaError::InvalidMetadata(format!(
                "row {idx} out of range ({} rows)",
                self.n_rows()
            )));
        }
        let format = required_str(self, idx, INTERNAL_FILE_FORMAT)?;
        let locator = required_str(self, idx, INTERNAL_SUBFILE)?;
        let (offset, length, source) = parse_subfile_locator(&locator).ok_or_else(|| {
            TortillaError::InvalidMetadata(format!("bad subfile locator: {locator}"))
        })?;

        match format.as_str() {
            FORMAT_TORTILLA => Ok(Item::Tortilla(lazy_load(offset, &source)?)),
            FORMAT_BYTES => {
                let mut src = open_source(&source)?;
                Ok(Item::Bytes(src.read_at(offset, length as usize)?))
            }
            _ => Ok(Item::Locator(locator)),
        }
    }
}

/// Load the metadata of a tortilla file from a local path or URL. A
/// `<stem>*.tortilla` snippet expands to every partition in order.
pub fn load(location: &str) -> Result<TortillaTable, TortillaError> {
    if is_snippet(location) {
        let parts = expand_snippet(location)?;
        return load_many(&parts);
    }
    let mut source = open_source(location)?;
    finish(source_metadata(source.as_mut(), 0)?)
}

/// Load several tortilla files and vertically concatenate their rows.
pub fn load_many<S: AsRef<str>>(locations: &[S]) -> Result<TortillaTable, TortillaError> {
    let mut acc: Option<Table> = None;
    for location in locations {
        let mut source = open_source(location.as_ref())?;
        let table = source_metadata(source.as_mut(), 0)?;
        acc = Some(match acc {
            None => table,
            Some(prev) => prev.vstack(&table)?,
        });
    }
    let table = acc.ok_or_else(|| {
        TortillaError::InvalidMetadata("no locations to load".to_string())
    })?;
    finish(table)
}

/// Load a tortilla stored inside another container, starting at absolute
/// byte `offset`. Returned `tortilla:offset` values are absolute within the
/// outer file.
pub fn lazy_load(offset: u64, location: &str) -> Result<TortillaTable, TortillaError> {
    let mut source = open_source(location)?;
    finish(source_metadata(source.as_mut(), offset)?)
}

/// Read header prefix and footer through a source and build the raw
/// metadata table with the synthetic columns appended.
fn source_metadata(
    source: &mut dyn RangeSource,
    base_offset: u64,
) -> Result<Table, TortillaError> {
    let prefix = source.read_at(base_offset, HEADER_PREFIX_LEN)?;
    let header = Header::decode(&prefix)?;

    let footer = source.read_at(
        base_offset + header.footer_offset,
        header.footer_length as usize,
    )?;
    let mut table = decode_footer(&footer)?;

    if base_offset > 0 {
        // Nested offsets are relative to the child's start; translate them
        // to absolute positions in the outer file
        let offsets = column_u64(&table, OFFSET_COLUMN)?;
        let shifted = Column::from_values(
            OFFSET_COLUMN,
            ColumnType::I64,
            offsets
                .iter()
                .map(|&o| Some(Value::I64((o + base_offset) as i64)))
                .collect(),
        )?;
        table.replace_column(shifted)?;
    }

    let n_rows = table.n_rows();
    let repeat_str =
        |value: &str| -> Vec<Option<Value>> { vec![Some(Value::Str(value.to_string())); n_rows] };

    table.push_column(Column::from_values(
        INTERNAL_FILE_FORMAT,
        ColumnType::Str,
        repeat_str(&header.data_format),
    )?)?;
    table.push_column(Column::from_values(
        INTERNAL_MODE,
        ColumnType::Str,
        repeat_str(source.mode().as_str()),
    )?)?;

    let offsets = column_u64(&table, OFFSET_COLUMN)?;
    let lengths = column_u64(&table, LENGTH_COLUMN)?;
    let locator = source.locator();
    let subfiles: Vec<Option<Value>> = offsets
        .iter()
        .zip(&lengths)
        .map(|(&offset, &length)| {
            Some(Value::Str(subfile_locator(offset, length, &locator)))
        })
        .collect();
    table.push_column(Column::from_values(
        INTERNAL_SUBFILE,
        ColumnType::Str,
        subfiles,
    )?)?;

    Ok(table)
}

/// Column ordering and the synthesized geometry column.
fn finish(mut table: Table) -> Result<TortillaTable, TortillaError> {
    fn group(name: &str) -> u8 {
        if name.starts_with("internal:") {
            0
        } else if name.starts_with("tortilla:") {
            1
        } else if name.starts_with("stac:") {
            2
        } else if name.starts_with("rai:") {
            3
        } else {
            4
        }
    }

    let mut names: Vec<String> = table
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| group(name));
    table.reorder(&names)?;

    if table.column(CENTROID_COLUMN).is_some() && table.column(GEOMETRY_COLUMN).is_none() {
        let centroids = table.column(CENTROID_COLUMN).expect("checked above");
        let points: Vec<Option<Value>> = (0..table.n_rows())
            .map(|row| {
                let wkt = match centroids.get(row) {
                    Some(Value::Str(s)) => s,
                    _ => return None,
                };
                parse_wkt_point(&wkt).map(|(lon, lat)| Value::F64List(vec![lon, lat]))
            })
            .collect();
        table.push_column(Column::from_values(
            GEOMETRY_COLUMN,
            ColumnType::F64List,
            points,
        )?)?;
    }

    Ok(TortillaTable(table))
}

/// Expand a `<stem>*.tortilla` snippet into every expected partition path,
/// reading `data_partitions` from part 0000.
fn expand_snippet(location: &str) -> Result<Vec<String>, TortillaError> {
    let stem = location
        .strip_suffix("*.tortilla")
        .expect("callers check is_snippet first");
    let part0 = format!("{stem}.0000.part.tortilla");

    if !is_valid_url(&part0) && !Path::new(&part0).exists() {
        return Err(TortillaError::MissingPart(PathBuf::from(part0)));
    }
    let mut source = open_source(&part0)?;
    let bytes = source.read_at(PARTITIONS_RANGE.start as u64, PARTITIONS_RANGE.len())?;
    let n_partitions = u64::from_le_bytes(bytes.as_slice().try_into().expect("8 bytes"));
    if n_partitions == 0 {
        return Err(TortillaError::InvalidMetadata(format!(
            "{part0}: data_partitions is zero"
        )));
    }

    let mut parts = Vec::with_capacity(n_partitions as usize);
    for idx in 0..n_partitions {
        let part = format!("{stem}.{idx:04}.part.tortilla");
        if !is_valid_url(&part) && !Path::new(&part).exists() {
            return Err(TortillaError::MissingPart(PathBuf::from(part)));
        }
        parts.push(part);
    }
    Ok(parts)
}

fn required_str(table: &Table, row: usize, column: &str) -> Result<String, TortillaError> {
    table.str_value(row, column).ok_or_else(|| {
        TortillaError::InvalidMetadata(format!("row {row} has no {column}"))
    })
}

/// All values of an i64 column as u64, erroring on nulls; the well-known
/// columns are never null in a well-formed footer.
fn column_u64(table: &Table, column: &str) -> Result<Vec<u64>, TortillaError> {
    let col = table
        .column(column)
        .ok_or_else(|| TortillaError::InvalidMetadata(format!("missing column {column}")))?;
    (0..table.n_rows())
        .map(|row| match col.get(row) {
            Some(Value::I64(v)) if v >= 0 => Ok(v as u64),
            _ => Err(TortillaError::InvalidMetadata(format!(
                "row {row} has no valid {column}"
            ))),
        })
        .collect()
}
