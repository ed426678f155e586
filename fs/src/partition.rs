// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

/// Partition type byte for a FAT16 volume.
pub const PART_TYPE_FAT16: u8 = 0x06;
/// Partition type byte for a FAT32 volume.
pub const PART_TYPE_FAT32: u8 = 0x0B;
/// Partition type byte for a Linux native (EXT2) volume.
pub const PART_TYPE_EXT2: u8 = 0x83;

/// Byte offset of the first partition entry in the MBR; the remaining three
/// follow at 16-byte strides (0x1CE, 0x1DE, 0x1EE).
const PARTITION0_OFFSET: usize = 0x1BE;

/// One Master Boot Record partition table entry. The cylinder/head/sector
/// fields are dead weight on LBA-addressed media but keep the on-disk
/// stride.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MbrEntry {
    /// 0x80 means bootable, 0x00 not bootable, anything else is invalid.
    pub bootable: u8,
    /// Cylinder/head/sector address of the first sector (unused with LBA).
    pub chs_start: [u8; 3],
    /// Partition type byte, e.g. 0x06 (FAT16), 0x0B (FAT32), 0x83 (Linux).
    pub partition_type: u8,
    /// Cylinder/head/sector address of the last sector (unused with LBA).
    pub chs_end: [u8; 3],
    /// Logical block address of the partition's first sector.
    pub lba_start: U32,
    /// Number of blocks in the partition.
    pub length: U32,
}

/// The essentials of one valid partition, lifted out of the MBR layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: u32,
    pub length: u32,
    pub partition_type: u8,
}

/// Reads the partition table from an in-memory copy of the MBR.
///
/// `volume_size` is the size of the whole medium in blocks; entries with a
/// zero start or length, or whose extent runs past the medium, are skipped.
/// No overlap checking is attempted.
pub fn read_partition_table(mbr: &[u8; 512], volume_size: u32) -> Vec<Partition> {
    let mut partitions = Vec::new();
    for slot in 0..4 {
        let offset = PARTITION0_OFFSET + slot * size_of::<MbrEntry>();
        let Ok(entry) = MbrEntry::read_from_bytes(&mbr[offset..offset + size_of::<MbrEntry>()])
        else {
            continue;
        };
        let start = entry.lba_start.get();
        let length = entry.length.get();
        if start == 0 || length == 0 {
            continue;
        }
        if start >= volume_size || start as u64 + length as u64 > volume_size as u64 {
            continue;
        }
        partitions.push(Partition {
            start,
            length,
            partition_type: entry.partition_type,
        });
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr_with(entries: &[(u32, u32, u8)]) -> [u8; 512] {
        let mut mbr = [0; 512];
        for (slot, &(start, length, partition_type)) in entries.iter().enumerate() {
            let entry = MbrEntry {
                bootable: 0,
                chs_start: [0; 3],
                partition_type,
                chs_end: [0; 3],
                lba_start: start.into(),
                length: length.into(),
            };
            let offset = PARTITION0_OFFSET + slot * 16;
            mbr[offset..offset + 16].copy_from_slice(entry.as_bytes());
        }
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        mbr
    }

    #[test]
    fn accepts_valid_entries_in_slot_order() {
        let mbr = mbr_with(&[(2048, 10000, PART_TYPE_FAT32), (12048, 4000, PART_TYPE_FAT16)]);
        let partitions = read_partition_table(&mbr, 20000);
        assert_eq!(
            partitions,
            vec![
                Partition {
                    start: 2048,
                    length: 10000,
                    partition_type: PART_TYPE_FAT32
                },
                Partition {
                    start: 12048,
                    length: 4000,
                    partition_type: PART_TYPE_FAT16
                },
            ]
        );
    }

    #[test]
    fn skips_empty_and_oversized_entries() {
        let mbr = mbr_with(&[
            (0, 10000, PART_TYPE_FAT32),
            (2048, 0, PART_TYPE_FAT32),
            (2048, 30000, PART_TYPE_FAT32),
            (2048, 1000, PART_TYPE_EXT2),
        ]);
        let partitions = read_partition_table(&mbr, 20000);
        assert_eq!(
            partitions,
            vec![Partition {
                start: 2048,
                length: 1000,
                partition_type: PART_TYPE_EXT2
            }]
        );
    }

    #[test]
    fn extent_may_end_exactly_at_the_volume_end() {
        let mbr = mbr_with(&[(1000, 19000, PART_TYPE_FAT16)]);
        assert_eq!(read_partition_table(&mbr, 20000).len(), 1);
    }
}
