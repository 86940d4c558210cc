//! Materializing a metadata subset as a new tortilla.
//!
//! Local sources are copied through a shared mapping by a worker pool, the
//! same way the writer builds files. Online sources are fetched with one
//! streaming multi-range request whose ranges arrive in ascending offset
//! order, so the response body is the new file's data region verbatim and a
//! killed transfer can resume from the output's current size.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use memmap2::MmapOptions;
use rayon::prelude::*;
use reqwest::{header::RANGE, StatusCode};
use tortilla_footer::{
    encode_footer, Column, ColumnType, Table, Value, LENGTH_COLUMN, OFFSET_COLUMN,
};

use crate::{
    error::TortillaError,
    header::{Header, HEADER_LEN},
    reader::{
        TortillaTable, GEOMETRY_COLUMN, INTERNAL_FILE_FORMAT, INTERNAL_MODE, INTERNAL_SUBFILE,
    },
    source::{range_client, Mode},
    utils::{bytes2human, default_nworkers, extract_url, human2bytes, parse_subfile_locator},
    writer::copy_into,
};

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Worker count for the local copy path.
    pub nworkers: usize,
    /// Streaming granularity for copies and downloads.
    pub chunk_size_iter: String,
    /// Delete a pre-existing output before writing. Turning this off lets
    /// an interrupted online compile resume instead.
    pub overwrite: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            nworkers: default_nworkers(),
            chunk_size_iter: "100MB".to_string(),
            overwrite: true,
        }
    }
}

/// Write the rows of `metadata` (a subset of a loaded table) as a new
/// tortilla at `output`. Rows are sorted by their current offset first, so
/// the data region is copied in source order.
pub fn compile(
    metadata: &TortillaTable,
    output: impl AsRef<Path>,
    options: &CompileOptions,
) -> Result<PathBuf, TortillaError> {
    let output = output.as_ref();
    let chunk_size_iter = human2bytes(&options.chunk_size_iter)? as usize;
    if chunk_size_iter == 0 {
        return Err(TortillaError::InvalidSize(options.chunk_size_iter.clone()));
    }
    if metadata.is_empty() {
        return Err(TortillaError::InvalidMetadata(
            "cannot compile an empty selection".to_string(),
        ));
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if options.overwrite && output.exists() {
        fs::remove_file(output)?;
    }

    let table = metadata.sort_by_i64(OFFSET_COLUMN)?;
    let mode = Mode::parse(&required_str(&table, 0, INTERNAL_MODE)?)?;
    let data_format = required_str(&table, 0, INTERNAL_FILE_FORMAT)?;

    // New contiguous offsets starting right after the header
    let lengths = column_u64(&table, LENGTH_COLUMN)?;
    let mut new_offsets = Vec::with_capacity(lengths.len());
    let mut position = HEADER_LEN as u64;
    for length in &lengths {
        new_offsets.push(position);
        position += length;
    }
    let data_end = position;

    let footer = encode_footer(&new_footer_table(&table, &new_offsets)?)?;
    let header = Header::new(data_end, footer.len() as u64, &data_format, 1);

    match mode {
        Mode::Local => compile_local(
            &table,
            output,
            &header,
            &footer,
            options.nworkers,
            chunk_size_iter,
        )?,
        Mode::Online => compile_online(
            &table,
            output,
            &header,
            &footer,
            chunk_size_iter,
        )?,
    }
    Ok(output.to_path_buf())
}

/// The footer of the compiled file: the selected rows minus everything the
/// reader synthesized, with offsets rebased onto the new data region.
fn new_footer_table(table: &Table, new_offsets: &[u64]) -> Result<Table, TortillaError> {
    let mut footer = table.clone();
    footer.drop_columns(&[GEOMETRY_COLUMN]);
    footer.drop_prefixed("internal:");
    footer.replace_column(Column::from_values(
        OFFSET_COLUMN,
        ColumnType::I64,
        new_offsets
            .iter()
            .map(|&o| Some(Value::I64(o as i64)))
            .collect(),
    )?)?;
    Ok(footer)
}

fn compile_local(
    table: &Table,
    output: &Path,
    header: &Header,
    footer: &[u8],
    nworkers: usize,
    chunk_size_iter: usize,
) -> Result<(), TortillaError> {
    // (source path, source offset, length) per row, resolved up front so
    // the workers only do I/O
    let mut sources = Vec::with_capacity(table.n_rows());
    for row in 0..table.n_rows() {
        let locator = required_str(table, row, INTERNAL_SUBFILE)?;
        let (offset, length, path) = parse_subfile_locator(&locator).ok_or_else(|| {
            TortillaError::InvalidMetadata(format!("bad subfile locator: {locator}"))
        })?;
        sources.push((PathBuf::from(path), offset, length));
    }

    let total_size = header.footer_offset + footer.len() as u64;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)?;
    file.set_len(total_size)?;

    let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    let (header_region, mut rest) = mmap.split_at_mut(HEADER_LEN);
    header_region.copy_from_slice(&header.encode()?);

    // The sequential split assigns each row its new contiguous offset; the
    // slices are disjoint by construction
    let mut tasks = Vec::with_capacity(sources.len());
    for (path, src_offset, length) in &sources {
        let (slice, tail) = rest.split_at_mut(*length as usize);
        tasks.push((path.as_path(), *src_offset, slice));
        rest = tail;
    }
    let footer_region = rest;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(nworkers)
        .build()
        .map_err(|err| TortillaError::Io(std::io::Error::other(err)))?;
    pool.install(|| {
        tasks
            .into_par_iter()
            .try_for_each(|(path, src_offset, dst)| {
                copy_into(path, src_offset, dst, chunk_size_iter)
            })
    })?;

    footer_region.copy_from_slice(footer);
    mmap.flush()?;
    Ok(())
}

fn compile_online(
    table: &Table,
    output: &Path,
    header: &Header,
    footer: &[u8],
    chunk_size_iter: usize,
) -> Result<(), TortillaError> {
    // Every row must point at the same remote file
    let mut url: Option<String> = None;
    for row in 0..table.n_rows() {
        let locator = required_str(table, row, INTERNAL_SUBFILE)?;
        let row_url = extract_url(&locator).ok_or_else(|| {
            TortillaError::InvalidMetadata(format!("no url in subfile locator: {locator}"))
        })?;
        match &url {
            None => url = Some(row_url),
            Some(first) if *first != row_url => {
                return Err(TortillaError::MixedSources(first.clone(), row_url));
            }
            Some(_) => {}
        }
    }
    let url = url.expect("table is non-empty");

    let offsets = column_u64(table, OFFSET_COLUMN)?;
    let lengths = column_u64(table, LENGTH_COLUMN)?;
    let ranges = coalesce_ranges(offsets.into_iter().zip(lengths));

    let expected = header.footer_offset + footer.len() as u64;
    let existing = match fs::metadata(output) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err.into()),
    };
    if existing == expected {
        log::info!("{} already complete, nothing to do", output.display());
        return Ok(());
    }
    if existing > expected {
        // Stale output from a different selection; resuming into it would
        // corrupt the footer
        return Err(TortillaError::InvalidMetadata(format!(
            "{} is larger than the expected {expected} bytes; remove it first",
            output.display()
        )));
    }

    let mut file = OpenOptions::new().create(true).append(true).open(output)?;
    let start = if existing < HEADER_LEN as u64 {
        // Nothing useful on disk yet; restart from a clean header
        file.set_len(0)?;
        file.write_all(&header.encode()?)?;
        HEADER_LEN as u64
    } else {
        existing
    };

    // The stream is the data region in file order, so resuming just means
    // trimming the prefix that is already on disk
    let trimmed = trim_ranges(&ranges, start - HEADER_LEN as u64);
    if !trimmed.is_empty() {
        if start > HEADER_LEN as u64 {
            log::info!(
                "resuming download of {} from byte {} ({})",
                output.display(),
                start,
                bytes2human(start)
            );
        }

        let client = range_client()?;
        let response = client
            .get(&url)
            .header(RANGE, range_header(&trimmed))
            .send()?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TortillaError::Http(format!(
                "{url}: expected 206 Partial Content, got {}",
                response.status()
            )));
        }

        let want: u64 = trimmed.iter().map(|(s, e)| e - s).sum();
        let streamed = stream_body(response, &mut file, chunk_size_iter)
            .map_err(|err| TortillaError::Http(format!("{url}: {err}")))?;
        if streamed != want {
            // Partial file stays behind; the next call picks up from here
            return Err(TortillaError::Http(format!(
                "{url}: stream ended early ({streamed} of {want} bytes)"
            )));
        }
    }

    file.write_all(footer)?;
    Ok(())
}

/// Copy the response body into the output in `chunk` increments. Returns
/// the number of bytes written; short reads surface as the count, transport
/// errors as `Err`.
fn stream_body(
    mut response: reqwest::blocking::Response,
    file: &mut File,
    chunk: usize,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; chunk];
    let mut total = 0u64;
    loop {
        let n = response.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        file.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Merge byte ranges that touch: `[a, b)` followed by `[b, c)` becomes
/// `[a, c)`. Input is `(offset, length)` in ascending offset order;
/// zero-length items contribute nothing. Output is `(start, end)` with the
/// end exclusive.
pub fn coalesce_ranges(items: impl IntoIterator<Item = (u64, u64)>) -> Vec<(u64, u64)> {
    items
        .into_iter()
        .filter(|&(_, length)| length > 0)
        .map(|(offset, length)| (offset, offset + length))
        .coalesce(|a, b| {
            if b.0 == a.1 {
                Ok((a.0, b.1))
            } else {
                Err((a, b))
            }
        })
        .collect()
}

/// The multi-range request header for a set of coalesced ranges, ends
/// inclusive on the wire.
pub fn range_header(ranges: &[(u64, u64)]) -> String {
    ranges
        .iter()
        .map(|(start, end)| format!("bytes={start}-{}", end - 1))
        .join(",")
}

/// Drop the first `skip` bytes from a range list, for resuming a download
/// whose stream covers the ranges in order.
fn trim_ranges(ranges: &[(u64, u64)], mut skip: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges {
        let len = end - start;
        if skip >= len {
            skip -= len;
            continue;
        }
        out.push((start + skip, end));
        skip = 0;
    }
    out
}

fn required_str(table: &Table, row: usize, column: &str) -> Result<String, TortillaError> {
    table.str_value(row, column).ok_or_else(|| {
        TortillaError::InvalidMetadata(format!("row {row} has no {column}"))
    })
}

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

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_coalesce_consecutive() {
        let ranges = coalesce_ranges([(0, 100), (100, 100), (300, 50)]);
        assert_eq!(ranges, vec![(0, 200), (300, 350)]);
    }

    #[test]
    fn test_coalesce_gap_count() {
        // One maximal gap -> two ranges
        let ranges = coalesce_ranges([(200, 10), (210, 5), (250, 5), (255, 1)]);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges, vec![(200, 15), (250, 256)]);
    }

    #[test]
    fn test_coalesce_skips_empty_items() {
        let ranges = coalesce_ranges([(200, 0), (200, 10)]);
        assert_eq!(ranges, vec![(200, 210)]);
    }

    #[test]
    fn test_range_header_wire_form() {
        let ranges = coalesce_ranges([(0, 100), (100, 100), (300, 50)]);
        assert_eq!(range_header(&ranges), "bytes=0-199,bytes=300-349");
    }

    #[test]
    fn test_trim_ranges_for_resume() {
        let ranges = vec![(200, 400), (600, 700)];
        // Nothing downloaded yet
        assert_eq!(trim_ranges(&ranges, 0), ranges);
        // Mid-first-range resume
        assert_eq!(trim_ranges(&ranges, 50), vec![(250, 400), (600, 700)]);
        // First range finished exactly
        assert_eq!(trim_ranges(&ranges, 200), vec![(600, 700)]);
        // Mid-second-range
        assert_eq!(trim_ranges(&ranges, 250), vec![(650, 700)]);
        // Everything downloaded
        assert_eq!(trim_ranges(&ranges, 300), Vec::<(u64, u64)>::new());
    }
}
