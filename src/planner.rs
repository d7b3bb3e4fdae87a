//! Chunk Planner (C5): decide serial vs. chunked, compute chunk ranges.
//!
//! Split-evenly-with-remainder-on-last-chunk arithmetic, expressed as a
//! pure function with no I/O, in the same small-independently-unit-testable
//! style as `net::retry::RetryPolicy::calculate_delay`.

/// One planned chunk: an inclusive byte range `[byte_start, byte_end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: u32,
    pub byte_start: u64,
    pub byte_end: u64,
}

impl ChunkPlan {
    /// Size of this chunk in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.byte_end - self.byte_start + 1
    }
}

/// Outcome of planning a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPlan {
    /// Single unranged (or whole-range) stream; no `.partN` files.
    Single,
    /// Multiple ranged chunks, each with its own `.partN` file.
    Chunked(Vec<ChunkPlan>),
}

impl DownloadPlan {
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        matches!(self, Self::Chunked(_))
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Chunked(chunks) => chunks.len(),
        }
    }
}

/// Policy parameters controlling chunk sizing, sourced from
/// [`crate::config::EngineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkingPolicy {
    pub target_chunk_size: u64,
    pub min_chunk_threshold: u64,
    pub max_chunks: u32,
}

/// Plans a download given the probed `total_bytes` and `accept_ranges`.
///
/// Falls back to [`DownloadPlan::Single`] when the total size is unknown,
/// the server does not advertise range support, or the file is smaller than
/// `min_chunk_threshold`. Otherwise splits `[0, total_bytes)` into
/// `clamp(ceil(total_bytes / target_chunk_size), 2, max_chunks)` chunks of
/// as-even-as-possible size, with the last chunk absorbing any remainder.
#[must_use]
pub fn plan_download(
    total_bytes: Option<u64>,
    accept_ranges: bool,
    policy: &ChunkingPolicy,
) -> DownloadPlan {
    let Some(total_bytes) = total_bytes else {
        return DownloadPlan::Single;
    };
    if !accept_ranges || total_bytes < policy.min_chunk_threshold || total_bytes == 0 {
        return DownloadPlan::Single;
    }

    let ideal = total_bytes.div_ceil(policy.target_chunk_size.max(1));
    let num_chunks = ideal.clamp(2, u64::from(policy.max_chunks));
    let num_chunks = u32::try_from(num_chunks).unwrap_or(policy.max_chunks);

    let chunk_size = total_bytes / u64::from(num_chunks);
    let mut chunks = Vec::with_capacity(num_chunks as usize);
    let mut start = 0u64;
    for index in 0..num_chunks {
        let is_last = index == num_chunks - 1;
        let end = if is_last {
            total_bytes - 1
        } else {
            start + chunk_size - 1
        };
        chunks.push(ChunkPlan {
            index,
            byte_start: start,
            byte_end: end,
        });
        start = end + 1;
    }
    DownloadPlan::Chunked(chunks)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy() -> ChunkingPolicy {
        ChunkingPolicy {
            target_chunk_size: 10,
            min_chunk_threshold: 20,
            max_chunks: 8,
        }
    }

    #[test]
    fn test_unknown_size_is_single() {
        assert_eq!(plan_download(None, true, &policy()), DownloadPlan::Single);
    }

    #[test]
    fn test_no_range_support_is_single() {
        assert_eq!(plan_download(Some(1000), false, &policy()), DownloadPlan::Single);
    }

    #[test]
    fn test_below_threshold_is_single() {
        assert_eq!(plan_download(Some(10), true, &policy()), DownloadPlan::Single);
    }

    #[test]
    fn test_zero_bytes_is_single() {
        assert_eq!(plan_download(Some(0), true, &policy()), DownloadPlan::Single);
    }

    #[test]
    fn test_chunks_cover_range_contiguously_with_even_split() {
        let plan = plan_download(Some(100), true, &policy());
        let DownloadPlan::Chunked(chunks) = plan else {
            panic!("expected chunked plan");
        };
        assert_eq!(chunks.len(), 8);
        assert_eq!(chunks[0].byte_start, 0);
        let mut expected_start = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.byte_start, expected_start);
            expected_start = chunk.byte_end + 1;
        }
        assert_eq!(chunks.last().unwrap().byte_end, 99);
    }

    #[test]
    fn test_last_chunk_absorbs_remainder() {
        let plan = plan_download(Some(103), true, &policy());
        let DownloadPlan::Chunked(chunks) = plan else {
            panic!("expected chunked plan");
        };
        // 103 / 8 = 12 (integer division), so all but the last chunk are 12
        // bytes and the last absorbs the remaining 7.
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.size(), 12);
        }
        assert_eq!(chunks.last().unwrap().size(), 103 - 12 * 7);
    }

    #[test]
    fn test_num_chunks_clamped_to_max() {
        let policy = ChunkingPolicy {
            target_chunk_size: 1,
            min_chunk_threshold: 1,
            max_chunks: 4,
        };
        let plan = plan_download(Some(1000), true, &policy);
        assert_eq!(plan.num_chunks(), 4);
    }

    #[test]
    fn test_num_chunks_clamped_to_minimum_two() {
        let policy = ChunkingPolicy {
            target_chunk_size: 1000,
            min_chunk_threshold: 1,
            max_chunks: 8,
        };
        let plan = plan_download(Some(30), true, &policy);
        assert_eq!(plan.num_chunks(), 2);
    }
}
