#![allow(dead_code)]

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

//! Builds small freshly formatted FAT16/FAT32 volumes on a RAM device.

use tapir_bd_std::MemBlockDevice;
use tapir_fs::partition::{Partition, PART_TYPE_FAT16, PART_TYPE_FAT32};
use tapir_fs_fat::{BootSectorFat16, BootSectorFat32, FatKind, Volume};
use zerocopy::IntoBytes;

pub const TOTAL_SECTORS: u32 = 16_384;
pub const SECTORS_PER_CLUSTER: u8 = 8;

const FAT32_RESERVED: u32 = 32;
const FAT32_SECTORS_PER_FAT: u32 = 32;
const FAT16_RESERVED: u32 = 1;
const FAT16_SECTORS_PER_FAT: u32 = 16;
const FAT16_ROOT_ENTRIES: u16 = 512;

/// A freshly formatted FAT32 volume: reserved area, two FATs with the
/// reserved entries and the root cluster chain, root directory at cluster 2.
pub fn mkfs_fat32() -> MemBlockDevice {
    let mut image = vec![0u8; TOTAL_SECTORS as usize * 512];
    let boot = BootSectorFat32 {
        jump: [0xEB, 0x58, 0x90],
        name: *b"mkfs.fat",
        sector_size: 512.into(),
        cluster_size: SECTORS_PER_CLUSTER,
        reserved_sectors: (FAT32_RESERVED as u16).into(),
        num_fats: 2,
        root_entries: 0.into(),
        total_sectors: 0.into(),
        media_descriptor: 0xF8,
        short_sectors_per_fat: 0.into(),
        sectors_per_track: 32.into(),
        number_of_heads: 64.into(),
        partition_start: 0.into(),
        big_total_sectors: TOTAL_SECTORS.into(),
        sectors_per_fat: FAT32_SECTORS_PER_FAT.into(),
        fat_flags: 0.into(),
        version: 0.into(),
        root_start: 2.into(),
        fs_info_start: 1.into(),
        boot_copy: 6.into(),
        reserved: [0; 12],
        drive_number: 0x80,
        current_head: 0,
        boot_sig: 0x29,
        volume_id: 0x1234_5678.into(),
        volume_label: *b"NO NAME    ",
        fs_label: *b"FAT32   ",
    };
    image[..size_of::<BootSectorFat32>()].copy_from_slice(boot.as_bytes());
    image[510] = 0x55;
    image[511] = 0xAA;
    for fat in 0..2u32 {
        let base = ((FAT32_RESERVED + fat * FAT32_SECTORS_PER_FAT) * 512) as usize;
        image[base..base + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        image[base + 4..base + 8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        // the root directory chain, one cluster
        image[base + 8..base + 12].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    }
    MemBlockDevice::from_bytes(image)
}

pub fn fat32_partition() -> Partition {
    Partition {
        start: 0,
        length: TOTAL_SECTORS,
        partition_type: PART_TYPE_FAT32,
    }
}

/// A freshly formatted FAT16 volume at `part_start`, with its fixed root
/// directory. The image covers `part_start + TOTAL_SECTORS` blocks.
pub fn mkfs_fat16_at(part_start: u32) -> MemBlockDevice {
    let mut image = vec![0u8; (part_start + TOTAL_SECTORS) as usize * 512];
    let boot = BootSectorFat16 {
        jump: [0xEB, 0x3C, 0x90],
        name: *b"mkfs.fat",
        sector_size: 512.into(),
        cluster_size: SECTORS_PER_CLUSTER,
        reserved_sectors: (FAT16_RESERVED as u16).into(),
        num_fats: 2,
        root_entries: FAT16_ROOT_ENTRIES.into(),
        total_sectors: (TOTAL_SECTORS as u16).into(),
        media_descriptor: 0xF8,
        sectors_per_fat: (FAT16_SECTORS_PER_FAT as u16).into(),
        sectors_per_track: 32.into(),
        number_of_heads: 64.into(),
        partition_start: part_start.into(),
        big_total_sectors: 0.into(),
        drive_number: 0x80,
        current_head: 0,
        boot_sig: 0x29,
        volume_id: 0x8765_4321.into(),
        volume_label: *b"NO NAME    ",
        fs_label: *b"FAT16   ",
    };
    let base = part_start as usize * 512;
    image[base..base + size_of::<BootSectorFat16>()].copy_from_slice(boot.as_bytes());
    image[base + 510] = 0x55;
    image[base + 511] = 0xAA;
    for fat in 0..2u32 {
        let offset = base + ((FAT16_RESERVED + fat * FAT16_SECTORS_PER_FAT) * 512) as usize;
        image[offset..offset + 2].copy_from_slice(&0xFFF8u16.to_le_bytes());
        image[offset + 2..offset + 4].copy_from_slice(&0xFFFFu16.to_le_bytes());
    }
    MemBlockDevice::from_bytes(image)
}

pub fn mkfs_fat16() -> MemBlockDevice {
    mkfs_fat16_at(0)
}

pub fn fat16_partition_at(part_start: u32) -> Partition {
    Partition {
        start: part_start,
        length: TOTAL_SECTORS,
        partition_type: PART_TYPE_FAT16,
    }
}

pub fn fat16_partition() -> Partition {
    fat16_partition_at(0)
}

/// Counts zero entries in the active FAT of a raw image.
pub fn free_clusters(image: &[u8], volume: &Volume) -> usize {
    let entries = volume.sectors_per_fat as usize * 512 / volume.fat_entry_len as usize;
    let base = volume.active_fat_start as usize * 512;
    (0..entries)
        .filter(|&index| {
            let offset = base + index * volume.fat_entry_len as usize;
            match volume.kind {
                FatKind::Fat16 => u16::from_le_bytes([image[offset], image[offset + 1]]) == 0,
                FatKind::Fat32 => {
                    u32::from_le_bytes([
                        image[offset],
                        image[offset + 1],
                        image[offset + 2],
                        image[offset + 3],
                    ]) == 0
                }
            }
        })
        .count()
}

/// A raw 32-byte directory entry, for planting fixtures straight into an
/// image.
pub fn raw_entry(name: &[u8; 11], attributes: u8, first_cluster: u16, size: u32) -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[..11].copy_from_slice(name);
    entry[11] = attributes;
    entry[26..28].copy_from_slice(&first_cluster.to_le_bytes());
    entry[28..32].copy_from_slice(&size.to_le_bytes());
    entry
}
