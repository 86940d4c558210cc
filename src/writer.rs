//! Building tortilla files from sample sets.
//!
//! The writer truncates the output to its final size up front, maps it
//! read/write, and copies every source file into its pre-assigned slice of
//! the data region from a worker pool. Slices are disjoint by construction
//! (the offset table is computed before any worker starts), so workers need
//! no coordination.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use memmap2::MmapOptions;
use rayon::prelude::*;
use tortilla_footer::{
    encode_footer, Column, ColumnType, Table, Value, ID_COLUMN, LENGTH_COLUMN, OFFSET_COLUMN,
};

use crate::{
    datamodel::Samples,
    error::TortillaError,
    header::{Header, HEADER_LEN},
    utils::{default_nworkers, human2bytes, part_path},
};

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Worker count for the parallel data copy.
    pub nworkers: usize,
    /// Size budget per output file; exceeding it splits the tortilla into
    /// `<stem>.NNNN.part.tortilla` partitions.
    pub chunk_size: String,
    /// Streaming granularity for each worker's copy loop.
    pub chunk_size_iter: String,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            nworkers: default_nworkers(),
            chunk_size: "20GB".to_string(),
            chunk_size_iter: "100MB".to_string(),
        }
    }
}

/// One item scheduled for writing: its source, its size, and its footer row.
struct Item {
    path: PathBuf,
    length: u64,
    row: Vec<(String, Value)>,
}

/// Write `samples` as one tortilla, or several partitions when the summed
/// item sizes exceed the `chunk_size` budget. Returns the written paths in
/// partition order.
pub fn create(
    samples: &Samples,
    output: impl AsRef<Path>,
    options: &CreateOptions,
) -> Result<Vec<PathBuf>, TortillaError> {
    let output = output.as_ref();
    let chunk_size = human2bytes(&options.chunk_size)?;
    let chunk_size_iter = human2bytes(&options.chunk_size_iter)? as usize;
    if chunk_size_iter == 0 {
        return Err(TortillaError::InvalidSize(options.chunk_size_iter.clone()));
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut items = Vec::with_capacity(samples.len());
    for sample in samples.iter() {
        let (row, length) = sample.export_row()?;
        items.push(Item {
            path: sample.path.clone(),
            length,
            row,
        });
    }

    let groups = group_by_size(&items, chunk_size);
    log::info!(
        "writing {} items as {} partition(s) to {}",
        items.len(),
        groups.len(),
        output.display()
    );

    if groups.len() == 1 {
        let members: Vec<&Item> = items.iter().collect();
        build_partition(
            &members,
            output,
            samples.data_format(),
            1,
            options.nworkers,
            chunk_size_iter,
        )?;
        return Ok(vec![output.to_path_buf()]);
    }

    let n_partitions = groups.len() as u64;
    let mut paths = Vec::with_capacity(groups.len());
    for (idx, group) in groups.iter().enumerate() {
        let part = part_path(output, idx as u64);
        let members: Vec<&Item> = group.iter().map(|&i| &items[i]).collect();
        build_partition(
            &members,
            &part,
            samples.data_format(),
            n_partitions,
            options.nworkers,
            chunk_size_iter,
        )?;
        paths.push(part);
    }
    Ok(paths)
}

/// Greedy packing: a group takes items while the summed lengths stay within
/// the budget. Oversized items get a group of their own. Input order is
/// preserved within and across groups.
fn group_by_size(items: &[Item], budget: u64) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_sum = 0u64;

    for (idx, item) in items.iter().enumerate() {
        if current.is_empty() || current_sum + item.length <= budget {
            current.push(idx);
            current_sum += item.length;
        } else {
            groups.push(std::mem::take(&mut current));
            current.push(idx);
            current_sum = item.length;
        }
    }
    if !current.is_empty() || groups.is_empty() {
        groups.push(current);
    }
    groups
}

fn build_partition(
    items: &[&Item],
    output: &Path,
    data_format: &str,
    data_partitions: u64,
    nworkers: usize,
    chunk_size_iter: usize,
) -> Result<(), TortillaError> {
    // Contiguous offsets, data following the header directly
    let mut offsets = Vec::with_capacity(items.len());
    let mut position = HEADER_LEN as u64;
    for item in items {
        offsets.push(position);
        position += item.length;
    }
    let data_end = position;

    let footer = encode_footer(&footer_table(items, &offsets)?)?;
    let total_size = data_end + footer.len() as u64;

    let header = Header::new(data_end, footer.len() as u64, data_format, data_partitions);
    let header_bytes = header.encode()?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)?;
    file.set_len(total_size)?;

    let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

    let (header_region, mut rest) = mmap.split_at_mut(HEADER_LEN);
    header_region.copy_from_slice(&header_bytes);

    // Pre-split the data region into one disjoint slice per item, so the
    // worker pool never needs locks
    let mut tasks: Vec<(&Path, &mut [u8])> = Vec::with_capacity(items.len());
    for item in items {
        let (slice, tail) = rest.split_at_mut(item.length as usize);
        tasks.push((item.path.as_path(), slice));
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
            .try_for_each(|(path, dst)| copy_into(path, 0, dst, chunk_size_iter))
    })?;

    footer_region.copy_from_slice(&footer);
    mmap.flush()?;
    Ok(())
}

fn footer_table(items: &[&Item], offsets: &[u64]) -> Result<Table, TortillaError> {
    if items.is_empty() {
        // A zero-item tortilla still carries the well-known columns
        let mut table = Table::new();
        table.push_column(Column::new(ID_COLUMN, ColumnType::Str))?;
        table.push_column(Column::new(OFFSET_COLUMN, ColumnType::I64))?;
        table.push_column(Column::new(LENGTH_COLUMN, ColumnType::I64))?;
        return Ok(table);
    }
    let rows: Vec<Vec<(String, Value)>> = items.iter().map(|i| i.row.clone()).collect();
    let mut table = Table::from_rows(&rows)?;
    let offset_col = Column::from_values(
        OFFSET_COLUMN,
        ColumnType::I64,
        offsets.iter().map(|&o| Some(Value::I64(o as i64))).collect(),
    )?;
    table.replace_column(offset_col)?;
    Ok(table)
}

/// Chunked copy of `dst.len()` bytes from `path` (starting at `src_offset`)
/// into the mapped slice. Source and destination positions advance together,
/// `chunk` bytes at a time.
pub(crate) fn copy_into(
    path: &Path,
    src_offset: u64,
    dst: &mut [u8],
    chunk: usize,
) -> Result<(), TortillaError> {
    let mut file = File::open(path)?;
    if src_offset > 0 {
        file.seek(SeekFrom::Start(src_offset))?;
    }
    let mut written = 0;
    while written < dst.len() {
        let end = (written + chunk).min(dst.len());
        file.read_exact(&mut dst[written..end])?;
        written = end;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn sized_item(length: u64) -> Item {
        Item {
            path: PathBuf::from("unused"),
            length,
            row: Vec::new(),
        }
    }

    #[test]
    fn test_group_by_size_packs_greedily() {
        let items: Vec<Item> = [3, 3, 3, 3].into_iter().map(sized_item).collect();
        let groups = group_by_size(&items, 7);
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_group_by_size_oversized_item_alone() {
        let items: Vec<Item> = [10, 2, 2].into_iter().map(sized_item).collect();
        let groups = group_by_size(&items, 5);
        assert_eq!(groups, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn test_group_by_size_empty() {
        let groups = group_by_size(&[], 5);
        assert_eq!(groups, vec![Vec::<usize>::new()]);
    }

    #[test]
    fn test_copy_into_chunks_smaller_than_item() -> eyre::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        let payload: Vec<u8> = (0..=255).collect();
        std::io::Write::write_all(&mut tmp, &payload)?;

        // A chunk smaller than the item must still copy every byte once
        let mut dst = vec![0u8; 256];
        copy_into(tmp.path(), 0, &mut dst, 10)?;
        assert_eq!(dst, payload);

        // And an offset read copies the tail
        let mut dst = vec![0u8; 56];
        copy_into(tmp.path(), 200, &mut dst, 9)?;
        assert_eq!(dst, &payload[200..]);
        Ok(())
    }
}
