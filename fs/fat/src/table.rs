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

//! The file allocation table: packed little-endian entries of 2 (FAT16) or
//! 4 (FAT32) bytes, one per cluster, each holding the number of the next
//! cluster in its chain. Only the active FAT is touched; backup FATs are
//! not synchronized.
//!
//! These are free functions over the device, the volume geometry, and a
//! caller-supplied scratch sector so the driver can lend out its context
//! buffer without borrowing itself whole.

use log::trace;
use tapir_bd::{BlockDevice, BLOCK_SIZE};
use tapir_fs::{Error, Result};

use crate::boot_sector::{FatKind, Volume};

fn entry_location(volume: &Volume, cluster: u32) -> (u32, usize) {
    let byte = cluster * volume.fat_entry_len;
    (
        volume.active_fat_start + byte / BLOCK_SIZE as u32,
        byte as usize & (BLOCK_SIZE - 1),
    )
}

fn entry_at(volume: &Volume, scratch: &[u8; BLOCK_SIZE], offset: usize) -> u32 {
    match volume.kind {
        FatKind::Fat16 => u16::from_le_bytes([scratch[offset], scratch[offset + 1]]) as u32,
        FatKind::Fat32 => u32::from_le_bytes([
            scratch[offset],
            scratch[offset + 1],
            scratch[offset + 2],
            scratch[offset + 3],
        ]),
    }
}

fn set_entry_at(volume: &Volume, scratch: &mut [u8; BLOCK_SIZE], offset: usize, value: u32) {
    match volume.kind {
        FatKind::Fat16 => {
            scratch[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes())
        }
        FatKind::Fat32 => scratch[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

/// Reads the FAT entry for `cluster`.
pub(crate) fn read_entry<BD: BlockDevice>(
    device: &mut BD,
    volume: &Volume,
    scratch: &mut [u8; BLOCK_SIZE],
    cluster: u32,
) -> Result<u32> {
    let (sector, offset) = entry_location(volume, cluster);
    device.read(sector, scratch)?;
    Ok(entry_at(volume, scratch, offset))
}

/// Points the FAT entry for `cluster` at `value`, writing the sector
/// through.
pub(crate) fn write_entry<BD: BlockDevice>(
    device: &mut BD,
    volume: &Volume,
    scratch: &mut [u8; BLOCK_SIZE],
    cluster: u32,
    value: u32,
) -> Result<()> {
    let (sector, offset) = entry_location(volume, cluster);
    device.read(sector, scratch)?;
    set_entry_at(volume, scratch, offset, value);
    device.write(sector, scratch)
}

/// Claims the first free cluster: scans the active FAT linearly, writes an
/// end-of-chain marker into the first zero entry, and flushes that FAT
/// sector before returning the cluster number. The entry is on disk before
/// any data or directory sector refers to it.
pub(crate) fn find_free_cluster<BD: BlockDevice>(
    device: &mut BD,
    volume: &Volume,
    scratch: &mut [u8; BLOCK_SIZE],
) -> Result<u32> {
    let entries_per_sector = BLOCK_SIZE as u32 / volume.fat_entry_len;
    for index in 0..volume.sectors_per_fat {
        let sector = volume.active_fat_start + index;
        device.read(sector, scratch)?;
        for slot in 0..entries_per_sector {
            let offset = (slot * volume.fat_entry_len) as usize;
            if entry_at(volume, scratch, offset) == 0 {
                set_entry_at(volume, scratch, offset, volume.end_of_chain());
                device.write(sector, scratch)?;
                let cluster = index * entries_per_sector + slot;
                trace!("allocated cluster {cluster}");
                return Ok(cluster);
            }
        }
    }
    Err(Error::NoSpace)
}

/// Frees a whole chain: zeroes each entry while following the pointer it
/// held, until an end-of-chain value turns up. Writes are batched so a FAT
/// sector only goes out when the walk leaves it. Clusters below 2 and the
/// root cluster are never freed (cluster 0 in a directory entry means "no
/// data", and the root-alias of `..` entries must not tear down the root).
pub(crate) fn free_chain<BD: BlockDevice>(
    device: &mut BD,
    volume: &Volume,
    scratch: &mut [u8; BLOCK_SIZE],
    first_cluster: u32,
) -> Result<()> {
    let mut cluster = first_cluster;
    if cluster < 2 || cluster == volume.root_cluster {
        return Ok(());
    }
    trace!("freeing chain from cluster {cluster}");
    let mut loaded: Option<u32> = None;
    loop {
        let (sector, offset) = entry_location(volume, cluster);
        if loaded != Some(sector) {
            if let Some(previous) = loaded {
                device.write(previous, scratch)?;
            }
            device.read(sector, scratch)?;
            loaded = Some(sector);
        }
        let next = entry_at(volume, scratch, offset);
        set_entry_at(volume, scratch, offset, 0);
        cluster = next;
        if cluster >= volume.end_cluster_marker || cluster < 2 {
            break;
        }
    }
    if let Some(sector) = loaded {
        device.write(sector, scratch)?;
    }
    Ok(())
}
