//! Allocation planning and changed/allocated intersection
//!
//! Dumping only saves sectors that are both allocated on the disk and
//! listed as changed in the work file. The planner builds the sorted
//! allocated list (either by querying the library in chunks or by declaring
//! the whole capacity allocated), the intersector merges it with the sorted
//! changed list from the work file.

use anyhow::Error;
use log::debug;

use vadp_vixdisklib::{
    BlockExtent, DiskRead, VIXDISKLIB_MAX_CHUNK_NUMBER, VIXDISKLIB_MIN_CHUNK_SIZE,
    VIXDISKLIB_SECTOR_SIZE,
};

use crate::work_file::ChangedArea;

/// A byte interval scheduled for saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub length: u64,
}

/// Walk the disk capacity in chunks of `chunk_size` sectors and collect the
/// allocated extents. A capacity that is not a multiple of the chunk size
/// leaves an unaligned tail the library cannot be asked about; it is
/// reported as one trailing allocated extent so nothing is lost.
pub fn plan_allocated(disk: &mut dyn DiskRead, chunk_size: u64) -> Result<Vec<BlockExtent>, Error> {
    let capacity = disk.info().capacity;

    let mut chunk_size = chunk_size;
    if chunk_size > capacity {
        chunk_size = capacity;
    }
    if chunk_size < VIXDISKLIB_MIN_CHUNK_SIZE {
        chunk_size = VIXDISKLIB_MIN_CHUNK_SIZE;
    }

    let mut num_chunks = capacity / chunk_size;
    debug!("ChunkSize: {}, NumChunks: {}", chunk_size, num_chunks);

    let mut blocks = Vec::new();
    let mut offset = 0u64;
    let mut allocated_sectors = 0u64;

    while num_chunks > 0 {
        let chunks_to_query = VIXDISKLIB_MAX_CHUNK_NUMBER.min(num_chunks);

        let list =
            disk.query_allocated_blocks(offset, chunks_to_query * chunk_size, chunk_size)?;
        for block in list {
            allocated_sectors += block.length;
            blocks.push(block);
        }

        offset += chunks_to_query * chunk_size;
        num_chunks -= chunks_to_query;
    }

    let unaligned = capacity % chunk_size;
    if unaligned > 0 {
        debug!("Unaligned: {} sectors", unaligned);
        blocks.push(BlockExtent {
            offset,
            length: unaligned,
        });
    }

    debug!("Allocated sectors: {}", allocated_sectors + unaligned);

    Ok(blocks)
}

/// The allocated list for the case where allocation queries are disabled:
/// everything is considered allocated.
pub fn whole_disk(capacity: u64) -> Vec<BlockExtent> {
    vec![BlockExtent {
        offset: 0,
        length: capacity,
    }]
}

/// Merge the sorted changed list (bytes) with the sorted allocated list
/// (sectors) into the minimal sorted list of byte intervals present in
/// both.
///
/// This proceeds like the merge step of merge sort: both lists are sorted
/// and disjoint, so whenever two intervals overlap, the one ending first
/// cannot overlap anything further and is popped. Changed areas are popped
/// by the outer loop, allocated extents by advancing `k`. Changed but
/// unallocated regions are dropped; a future format extension could mark
/// them with a dedicated record type to let restores punch holes.
pub fn intersect(changed: &[ChangedArea], allocated: &[BlockExtent]) -> Vec<Interval> {
    let mut saved = Vec::new();
    let mut k = 0;

    let mut changed_len = 0u64;
    let mut saved_len = 0u64;

    'changed: for area in changed {
        if area.length == 0 {
            continue;
        }
        let changed_start = area.start;
        let changed_end = area.start + area.length;
        changed_len += area.length;

        if k == allocated.len() {
            // All further sectors are unallocated.
            break;
        }

        loop {
            let block = allocated[k];
            let block_start = block.offset * VIXDISKLIB_SECTOR_SIZE;
            let block_end = block_start + block.length * VIXDISKLIB_SECTOR_SIZE;

            if changed_end <= block_start {
                // The rest of this allocated extent lies past the current
                // changed area.
                break;
            }

            if block_start < changed_end && block_end > changed_start {
                let start = changed_start.max(block_start);
                let end = changed_end.min(block_end);
                if end > start {
                    saved_len += end - start;
                    saved.push(Interval {
                        start,
                        length: end - start,
                    });
                }
            }

            if block_end <= changed_end {
                k += 1;
                if k == allocated.len() {
                    break 'changed;
                }
            }
            if changed_end <= block_end {
                break;
            }
        }
    }

    debug!("Changed len: {}, Saved len: {}", changed_len, saved_len);

    saved
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::bail;
    use vadp_vixdisklib::DiskInfo;

    fn area(start: u64, length: u64) -> ChangedArea {
        ChangedArea { start, length }
    }

    fn block(offset: u64, length: u64) -> BlockExtent {
        BlockExtent { offset, length }
    }

    /// Reports a configurable capacity and treats every queried range as
    /// fully allocated.
    struct FullyAllocatedDisk {
        info: DiskInfo,
        queries: Vec<(u64, u64, u64)>,
    }

    impl FullyAllocatedDisk {
        fn with_capacity(capacity: u64) -> Self {
            Self {
                info: DiskInfo {
                    capacity,
                    ..Default::default()
                },
                queries: Vec::new(),
            }
        }
    }

    impl DiskRead for FullyAllocatedDisk {
        fn info(&self) -> &DiskInfo {
            &self.info
        }

        fn transport_mode(&self) -> String {
            String::from("fake")
        }

        fn read_sectors(&mut self, _sector_offset: u64, _buf: &mut [u8]) -> Result<(), Error> {
            bail!("not a data disk");
        }

        fn metadata_keys(&mut self) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }

        fn read_metadata(&mut self, _key: &str) -> Result<Vec<u8>, Error> {
            bail!("not a data disk");
        }

        fn query_allocated_blocks(
            &mut self,
            start_sector: u64,
            num_sectors: u64,
            chunk_size: u64,
        ) -> Result<Vec<BlockExtent>, Error> {
            self.queries.push((start_sector, num_sectors, chunk_size));
            Ok(vec![block(start_sector, num_sectors)])
        }
    }

    #[test]
    fn planner_appends_unaligned_tail() -> Result<(), Error> {
        let mut disk = FullyAllocatedDisk::with_capacity(1025);

        let blocks = plan_allocated(&mut disk, 512)?;
        assert_eq!(blocks, vec![block(0, 1024), block(1024, 1)]);
        assert_eq!(disk.queries, vec![(0, 1024, 512)]);
        Ok(())
    }

    #[test]
    fn planner_clamps_chunk_size() -> Result<(), Error> {
        // Chunk size larger than the capacity, capacity below the library
        // minimum: the whole disk ends up in the tail extent, no query is
        // issued.
        let mut disk = FullyAllocatedDisk::with_capacity(100);
        let blocks = plan_allocated(&mut disk, 4096)?;
        assert_eq!(blocks, vec![block(0, 100)]);
        assert!(disk.queries.is_empty());

        // Chunk size below the minimum is raised to it.
        let mut disk = FullyAllocatedDisk::with_capacity(VIXDISKLIB_MIN_CHUNK_SIZE * 2);
        let blocks = plan_allocated(&mut disk, 1)?;
        assert_eq!(blocks, vec![block(0, VIXDISKLIB_MIN_CHUNK_SIZE * 2)]);
        assert_eq!(
            disk.queries,
            vec![(
                0,
                VIXDISKLIB_MIN_CHUNK_SIZE * 2,
                VIXDISKLIB_MIN_CHUNK_SIZE
            )]
        );
        Ok(())
    }

    #[test]
    fn whole_disk_covers_capacity() {
        assert_eq!(whole_disk(4096), vec![block(0, 4096)]);
    }

    #[test]
    fn intersect_merge_example() {
        // sectors    0 1 2 3 4 5 6 7 8 9
        // changed      [. . .]   [. .]
        // allocated  [. .]   [. . . . .]
        // saved        [.]   [.] [. .]
        let changed = [area(512, 3 * 512), area(5 * 512, 2 * 512)];
        let allocated = [block(0, 2), block(3, 5)];

        assert_eq!(
            intersect(&changed, &allocated),
            vec![
                Interval {
                    start: 512,
                    length: 512
                },
                Interval {
                    start: 3 * 512,
                    length: 512
                },
                Interval {
                    start: 5 * 512,
                    length: 2 * 512
                },
            ]
        );
    }

    #[test]
    fn intersect_masks_unallocated_changes() {
        // A change in a hole is dropped entirely.
        let changed = [area(0, 1024), area(2560, 1024), area(4096, 512)];
        let allocated = [block(0, 1), block(3, 5)];

        assert_eq!(
            intersect(&changed, &allocated),
            vec![
                Interval {
                    start: 0,
                    length: 512
                },
                Interval {
                    start: 2560,
                    length: 1024
                },
            ]
        );
    }

    #[test]
    fn intersect_edge_cases() {
        // Empty inputs.
        assert!(intersect(&[], &[block(0, 4)]).is_empty());
        assert!(intersect(&[area(0, 512)], &[]).is_empty());

        // Zero length changed areas are skipped.
        assert!(intersect(&[area(0, 0)], &[block(0, 4)]).is_empty());

        // Touching intervals do not overlap.
        assert!(intersect(&[area(0, 512)], &[block(1, 1)]).is_empty());

        // A changed area spanning several allocated extents is split.
        let result = intersect(&[area(0, 8 * 512)], &[block(0, 1), block(2, 1), block(4, 1)]);
        assert_eq!(
            result,
            vec![
                Interval {
                    start: 0,
                    length: 512
                },
                Interval {
                    start: 1024,
                    length: 512
                },
                Interval {
                    start: 2048,
                    length: 512
                },
            ]
        );
    }

    #[test]
    fn intersect_output_is_sorted_and_disjoint() {
        let changed = [area(100, 1000), area(2000, 5000), area(9000, 100)];
        let allocated = [block(0, 2), block(3, 4), block(10, 10)];

        let result = intersect(&changed, &allocated);
        for pair in result.windows(2) {
            assert!(pair[0].start + pair[0].length <= pair[1].start);
        }
        for interval in &result {
            assert!(interval.length > 0);
        }
    }
}
