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

//! Volume boot records and the geometry derived from them.

use log::error;
use tapir_bd::BLOCK_SIZE;
use tapir_fs::{Error, Result};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::dirent::DIR_ENTRY_SIZE;

/// The two FAT variants this driver mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat16,
    Fat32,
}

/// FAT16 volume boot record, through the extended BPB fields.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat16 {
    /// x86 jump to the boot code.
    pub jump: [u8; 3],
    /// OEM name of whatever formatted the volume.
    pub name: [u8; 8],
    /// Bytes per sector; this driver requires 512.
    pub sector_size: U16,
    /// Sectors per cluster, a power of two up to 128.
    pub cluster_size: u8,
    /// Sectors before the first FAT, at least 1 (the boot record itself).
    pub reserved_sectors: U16,
    /// Number of FAT copies, typically 2.
    pub num_fats: u8,
    /// Entries in the fixed root directory; non-zero is what makes this a
    /// FAT16 record.
    pub root_entries: U16,
    /// Total sectors when they fit 16 bits, else 0.
    pub total_sectors: U16,
    /// Media descriptor, 0xF8 for fixed media.
    pub media_descriptor: u8,
    /// Sectors per FAT.
    pub sectors_per_fat: U16,
    /// CHS geometry leftovers, unused with LBA addressing.
    pub sectors_per_track: U16,
    pub number_of_heads: U16,
    /// Sectors hidden before this volume.
    pub partition_start: U32,
    /// Total sectors when `total_sectors` is 0.
    pub big_total_sectors: U32,
    /// INT 13h drive number.
    pub drive_number: u8,
    pub current_head: u8,
    /// 0x29 when the id/label fields that follow are present.
    pub boot_sig: u8,
    pub volume_id: U32,
    pub volume_label: [u8; 11],
    /// Informational "FAT16   " tag; never used to pick the variant.
    pub fs_label: [u8; 8],
}

/// FAT32 volume boot record, through the extended BPB fields.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat32 {
    /// x86 jump to the boot code.
    pub jump: [u8; 3],
    /// OEM name of whatever formatted the volume.
    pub name: [u8; 8],
    /// Bytes per sector; this driver requires 512.
    pub sector_size: U16,
    /// Sectors per cluster, a power of two up to 128.
    pub cluster_size: u8,
    /// Sectors before the first FAT.
    pub reserved_sectors: U16,
    /// Number of FAT copies.
    pub num_fats: u8,
    /// Must be 0 on FAT32; the root directory is cluster chained.
    pub root_entries: U16,
    /// Total sectors when they fit 16 bits, else 0.
    pub total_sectors: U16,
    /// Media descriptor, 0xF8 for fixed media.
    pub media_descriptor: u8,
    /// FAT16-era sectors per FAT, 0 on FAT32.
    pub short_sectors_per_fat: U16,
    /// CHS geometry leftovers, unused with LBA addressing.
    pub sectors_per_track: U16,
    pub number_of_heads: U16,
    /// Sectors hidden before this volume.
    pub partition_start: U32,
    /// Total sectors when `total_sectors` is 0.
    pub big_total_sectors: U32,
    /// Sectors per FAT.
    pub sectors_per_fat: U32,
    /// Bit 7 set means only the FAT named in bits 0..4 is active.
    pub fat_flags: U16,
    /// Format version, 0.0.
    pub version: U16,
    /// First cluster of the root directory, typically 2.
    pub root_start: U32,
    /// Sector of the FS information sector, typically 1.
    pub fs_info_start: U16,
    /// Sector of the boot record backup, typically 6.
    pub boot_copy: U16,
    pub reserved: [u8; 12],
    /// INT 13h drive number.
    pub drive_number: u8,
    pub current_head: u8,
    /// 0x29 when the id/label fields that follow are present.
    pub boot_sig: u8,
    pub volume_id: U32,
    pub volume_label: [u8; 11],
    /// Informational "FAT32   " tag; never used to pick the variant.
    pub fs_label: [u8; 8],
}

/// Everything the engine needs to know about a mounted volume. Immutable
/// after mount.
#[derive(Debug, Clone)]
pub struct Volume {
    pub kind: FatKind,
    /// 2 on FAT16, 4 on FAT32.
    pub fat_entry_len: u32,
    /// FAT values at or above this mean end of chain.
    pub end_cluster_marker: u32,
    pub sectors_per_cluster: u32,
    /// Bias such that cluster N starts at sector
    /// `N * sectors_per_cluster + cluster0` (wrapping).
    pub cluster0: u32,
    /// First sector of the active FAT.
    pub active_fat_start: u32,
    pub sectors_per_fat: u32,
    /// FAT16 fixed root directory region; 0 on FAT32.
    pub root_start: u32,
    pub root_len: u32,
    /// First cluster of the root directory; the sentinel 1 on FAT16.
    pub root_cluster: u32,
    /// LBA of the volume's first sector.
    pub part_start: u32,
    pub total_sectors: u32,
    pub read_only: bool,
}

impl Volume {
    /// First sector of a cluster. Wrapping because `cluster0` is a bias
    /// that may sit "before" the volume numerically.
    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        cluster
            .wrapping_mul(self.sectors_per_cluster)
            .wrapping_add(self.cluster0)
    }

    /// The value written to terminate a chain.
    pub fn end_of_chain(&self) -> u32 {
        match self.kind {
            FatKind::Fat16 => 0xFFF8,
            FatKind::Fat32 => 0x0FFF_FFF8,
        }
    }
}

fn validate_common(
    sector_size: u16,
    cluster_size: u8,
    reserved_sectors: u16,
    num_fats: u8,
    volume_size: u32,
) -> Result<()> {
    if sector_size as usize != BLOCK_SIZE {
        error!("Sector size ({sector_size}) shall be {BLOCK_SIZE}");
        return Err(Error::Inconsistent);
    }
    if !cluster_size.is_power_of_two() {
        error!("Cluster size ({cluster_size}) shall be a power of two up to 128");
        return Err(Error::Inconsistent);
    }
    if reserved_sectors < 1 || reserved_sectors as u32 >= volume_size {
        error!("Reserved sector count ({reserved_sectors}) shall be at least 1 and inside the volume");
        return Err(Error::Inconsistent);
    }
    if num_fats < 1 || num_fats >= 15 {
        error!("Number of FATs ({num_fats}) shall be within [1, 15)");
        return Err(Error::Inconsistent);
    }
    Ok(())
}

fn effective_total_sectors(total_sectors: u16, big_total_sectors: u32, volume_size: u32) -> Result<u32> {
    let total = if total_sectors == 0 {
        big_total_sectors
    } else {
        total_sectors as u32
    };
    if total > volume_size {
        error!("Total sectors ({total}) shall not exceed the volume ({volume_size})");
        return Err(Error::Inconsistent);
    }
    Ok(total)
}

/// Validates a FAT16 boot record and derives the volume geometry.
pub(crate) fn parse_fat16(
    sector: &[u8; BLOCK_SIZE],
    part_start: u32,
    volume_size: u32,
    read_only: bool,
) -> Result<Volume> {
    let Ok((boot, _)) = BootSectorFat16::read_from_prefix(sector) else {
        return Err(Error::Inconsistent);
    };
    validate_common(
        boot.sector_size.get(),
        boot.cluster_size,
        boot.reserved_sectors.get(),
        boot.num_fats,
        volume_size,
    )?;
    let root_entries = boot.root_entries.get();
    if root_entries == 0 {
        error!("Root entry count shall be non-zero; this looks like a FAT32 record");
        return Err(Error::Inconsistent);
    }
    if root_entries & (BLOCK_SIZE / DIR_ENTRY_SIZE - 1) as u16 != 0 {
        error!("Root entry count ({root_entries}) shall fill whole sectors");
        return Err(Error::Inconsistent);
    }
    let total_sectors =
        effective_total_sectors(boot.total_sectors.get(), boot.big_total_sectors.get(), volume_size)?;

    let sectors_per_cluster = boot.cluster_size as u32;
    let root_len = root_entries as u32 * DIR_ENTRY_SIZE as u32 / BLOCK_SIZE as u32;
    let active_fat_start = part_start + boot.reserved_sectors.get() as u32;
    let sectors_per_fat = boot.sectors_per_fat.get() as u32;
    let root_start = active_fat_start + sectors_per_fat * boot.num_fats as u32;
    let cluster0 = (root_start + root_len).wrapping_sub(sectors_per_cluster * 2);
    if root_start > part_start + volume_size {
        error!("Root directory ({root_start}) shall start inside the volume");
        return Err(Error::Inconsistent);
    }

    Ok(Volume {
        kind: FatKind::Fat16,
        fat_entry_len: 2,
        end_cluster_marker: 0xFFF0,
        sectors_per_cluster,
        cluster0,
        active_fat_start,
        sectors_per_fat,
        root_start,
        root_len,
        root_cluster: 1,
        part_start,
        total_sectors,
        read_only,
    })
}

/// Validates a FAT32 boot record and derives the volume geometry.
pub(crate) fn parse_fat32(
    sector: &[u8; BLOCK_SIZE],
    part_start: u32,
    volume_size: u32,
    read_only: bool,
) -> Result<Volume> {
    let Ok((boot, _)) = BootSectorFat32::read_from_prefix(sector) else {
        return Err(Error::Inconsistent);
    };
    validate_common(
        boot.sector_size.get(),
        boot.cluster_size,
        boot.reserved_sectors.get(),
        boot.num_fats,
        volume_size,
    )?;
    if boot.root_entries.get() != 0 {
        error!("Root entry count shall be zero; this looks like a FAT16 record");
        return Err(Error::Inconsistent);
    }
    let total_sectors =
        effective_total_sectors(boot.total_sectors.get(), boot.big_total_sectors.get(), volume_size)?;

    let sectors_per_cluster = boot.cluster_size as u32;
    let active_fat_start = part_start + boot.reserved_sectors.get() as u32;
    let sectors_per_fat = boot.sectors_per_fat.get();
    let cluster0 =
        (active_fat_start + sectors_per_fat * boot.num_fats as u32).wrapping_sub(sectors_per_cluster * 2);

    Ok(Volume {
        kind: FatKind::Fat32,
        fat_entry_len: 4,
        end_cluster_marker: 0x0FFF_FFF0,
        sectors_per_cluster,
        cluster0,
        active_fat_start,
        sectors_per_fat,
        root_start: 0,
        root_len: 0,
        root_cluster: boot.root_start.get(),
        part_start,
        total_sectors,
        read_only,
    })
}
