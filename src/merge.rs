//! Merge Worker (C7): concatenates a completed download's `.partN` files
//! into the final file, in order.
//!
//! Runs on `tokio::task::spawn_blocking` rather than the fetcher's
//! async-stream style (`net::fetcher::HttpFetcher::fetch_range`): merging is
//! a purely CPU/IO-bound sequential copy with no network waiting, so it
//! reads and writes through `std::io::{BufReader, BufWriter}` the way a
//! blocking worker thread would, instead of holding an async task on a
//! runtime thread for the whole copy.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::aggregator::ProgressAggregator;
use crate::error::EngineError;

/// One chunk's part-file path and expected size, in merge order.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub part_path: PathBuf,
    pub expected_size: u64,
}

/// Bytes moved per read/write cycle while copying a part file.
const MERGE_BUFFER_SIZE: usize = 256 * 1024;

/// Concatenates `parts` (already in chunk order) into `dest_path`, then
/// deletes the part files. On any failure the partially-written destination
/// file is removed and all part files are left in place for a later retry.
///
/// Reports `merge_progress` to `aggregator` as the copy proceeds: §4.7 treats
/// the merge step the same as a chunk transfer for progress purposes, so a
/// download no longer sits at its pre-merge fraction for the whole copy.
///
/// # Errors
///
/// Returns [`EngineError::Merge`] if a part file cannot be read, is shorter
/// than its expected size, or the destination cannot be written.
#[instrument(skip(parts, aggregator), fields(download_id, dest = %dest_path.display(), num_parts = parts.len()))]
pub async fn merge_parts(
    download_id: String,
    parts: Vec<MergeInput>,
    dest_path: PathBuf,
    aggregator: ProgressAggregator,
) -> Result<u64, EngineError> {
    tokio::task::spawn_blocking(move || {
        merge_parts_blocking(&download_id, &parts, &dest_path, &aggregator)
    })
    .await
    .unwrap_or_else(|join_err| {
        Err(EngineError::Merge {
            id: "unknown".to_string(),
            source: io::Error::other(join_err),
        })
    })
}

fn merge_parts_blocking(
    download_id: &str,
    parts: &[MergeInput],
    dest_path: &Path,
    aggregator: &ProgressAggregator,
) -> Result<u64, EngineError> {
    let merge_err = |source: io::Error| EngineError::Merge {
        id: download_id.to_string(),
        source,
    };

    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent).map_err(merge_err)?;
    }

    let dest_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest_path)
        .map_err(merge_err)?;
    let mut writer = BufWriter::new(dest_file);
    let mut total_written = 0u64;
    let total_expected: u64 = parts.iter().map(|p| p.expected_size).sum();
    aggregator.begin_merge(download_id, total_expected);

    for part in parts {
        let result = copy_part(part, &mut writer, download_id, aggregator);
        if let Err(e) = result {
            warn!(
                download_id,
                part = %part.part_path.display(),
                error = %e,
                "merge failed, removing partial destination file"
            );
            drop(writer);
            let _ = std::fs::remove_file(dest_path);
            return Err(merge_err(e));
        }
        total_written += part.expected_size;
    }

    writer.flush().map_err(merge_err)?;
    drop(writer);

    for part in parts {
        if let Err(e) = std::fs::remove_file(&part.part_path) {
            warn!(
                download_id,
                part = %part.part_path.display(),
                error = %e,
                "failed to remove part file after successful merge"
            );
        }
    }

    info!(download_id, total_written, "merge complete");
    Ok(total_written)
}

fn copy_part(
    part: &MergeInput,
    writer: &mut BufWriter<File>,
    download_id: &str,
    aggregator: &ProgressAggregator,
) -> io::Result<()> {
    let file = File::open(&part.part_path)?;
    let metadata = file.metadata()?;
    if metadata.len() < part.expected_size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "part {} is {} bytes, expected at least {}",
                part.part_path.display(),
                metadata.len(),
                part.expected_size
            ),
        ));
    }

    let mut reader = BufReader::new(file);
    let mut buffer = vec![0u8; MERGE_BUFFER_SIZE];
    let mut remaining = part.expected_size;
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = reader.read(&mut buffer[..to_read])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("part {} ended early", part.part_path.display()),
            ));
        }
        writer.write_all(&buffer[..read])?;
        remaining -= read as u64;
        aggregator.add_merge_bytes(download_id, read as u64);
    }
    Ok(())
}
