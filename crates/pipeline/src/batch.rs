//! Batch planning
//!
//! A job's frames are processed in fixed-size contiguous batches so that at
//! most one batch worth of PNG frames exists on disk at a time.

/// A contiguous frame range `[start, start + count)` within one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// 0-based position in the job's batch order
    pub index: u32,
    /// First source frame index
    pub start: u64,
    /// Number of frames in the batch
    pub count: u64,
}

impl Batch {
    /// 1-based batch number used for progress and logging
    pub fn number(&self) -> u32 {
        self.index + 1
    }

    /// One past the last frame index
    pub fn end(&self) -> u64 {
        self.start + self.count
    }
}

/// `ceil(total_frames / batch_size)`
pub fn batch_count(total_frames: u64, batch_size: u64) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    total_frames.div_ceil(batch_size)
}

/// Split `[0, total_frames)` into ordered batches of `batch_size`
///
/// Every batch is full except possibly the last one. A zero batch size
/// yields no batches.
pub fn plan_batches(total_frames: u64, batch_size: u64) -> Vec<Batch> {
    if batch_size == 0 {
        return Vec::new();
    }

    (0..batch_count(total_frames, batch_size))
        .map(|index| {
            let start = index * batch_size;
            Batch {
                index: index as u32,
                start,
                count: batch_size.min(total_frames - start),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Batches partition [0, T) exactly, in order, with only the last one short.
        #[test]
        fn prop_batches_partition_frames(
            total in 0u64..100_000,
            batch_size in 1u64..1000,
        ) {
            let batches = plan_batches(total, batch_size);
            let count = batch_count(total, batch_size);

            prop_assert_eq!(batches.len() as u64, count);
            prop_assert_eq!(count, (total + batch_size - 1) / batch_size);

            let mut next = 0u64;
            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.index as usize, i);
                prop_assert_eq!(batch.start, next);
                prop_assert!(batch.count >= 1);
                if i + 1 < batches.len() {
                    prop_assert_eq!(batch.count, batch_size);
                }
                next = batch.end();
            }
            prop_assert_eq!(next, total);

            if let Some(last) = batches.last() {
                prop_assert_eq!(last.count, total - batch_size * (count - 1));
            }
        }
    }

    #[test]
    fn test_ten_frames_in_batches_of_four() {
        let batches = plan_batches(10, 4);
        let counts: Vec<u64> = batches.iter().map(|b| b.count).collect();
        let starts: Vec<u64> = batches.iter().map(|b| b.start).collect();

        assert_eq!(counts, vec![4, 4, 2]);
        assert_eq!(starts, vec![0, 4, 8]);
        assert_eq!(batches[2].number(), 3);
    }

    #[test]
    fn test_empty_and_degenerate_inputs() {
        assert!(plan_batches(0, 150).is_empty());
        assert!(plan_batches(10, 0).is_empty());
        assert_eq!(batch_count(150, 150), 1);
        assert_eq!(batch_count(151, 150), 2);
    }
}
