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

//! FAT16/FAT32 driver over a block device.
//!
//! One `FileSystemServer` per mounted volume, with a fixed table of open
//! handles. Each handle owns a single 512-byte buffer and its position as
//! (cluster, sector, cursor); sequential access advances sector by sector
//! and follows the FAT chain across cluster boundaries, extending it when
//! the handle is writable. Data writes are buffered per sector and
//! directory-entry updates are deferred until close, ordered so a fresh
//! cluster's FAT entry reaches the disk before its data sector, and the
//! data sector before the directory entry that publishes it.
//!
//! The caller serializes all operations; nothing here is re-entrant.

mod boot_sector;
mod dirent;
mod table;
mod time;

pub use boot_sector::{BootSectorFat16, BootSectorFat32, FatKind, Volume};
pub use dirent::{
    fatname_to_str, DirEntry, ATTR_ARCHIVE, ATTR_DEVICE, ATTR_DIRECTORY, ATTR_HIDDEN,
    ATTR_LONG_NAME, ATTR_READ_ONLY, ATTR_SYSTEM, ATTR_VOLUME_ID, DIR_ENTRY_SIZE, ENTRY_DELETED,
};

use log::trace;
use tapir_bd::{BlockDevice, BLOCK_SIZE};
use tapir_fs::partition::{Partition, PART_TYPE_FAT16};
use tapir_fs::{
    DirRecord, Error, Fd, FileSystem, NodeKind, OpenFlags, Result, Stat, Whence, MAX_PATH_LEN,
    MAX_PATH_LEVELS, S_IWUSR,
};
use zerocopy::{FromBytes, IntoBytes};

const FLAG_OPEN: u8 = 0x01;
const FLAG_READ: u8 = 0x02;
const FLAG_WRITE: u8 = 0x04;
const FLAG_APPEND: u8 = 0x08;
/// The buffer diverges from the sector on disk.
const FLAG_DIRTY: u8 = 0x10;
/// The cached metadata diverges from the directory entry on disk.
const FLAG_FS_DIRTY: u8 = 0x20;

/// Why a path failed to resolve. Collapsed to the public taxonomy at the
/// `open` boundary; the difference between a missing leaf and a missing
/// parent decides whether create-on-open may proceed.
enum LookupMiss {
    /// Terminal component not present. The encoded name is already in the
    /// handle so `open` can create it.
    NotFound,
    /// A non-terminal component is missing; never a create.
    BadPath,
    /// A component is not expressible as a short name; never a create.
    InvalidName,
    /// A non-terminal component is a regular file.
    NotADirectory,
    NameTooLong,
    Device(Error),
}

/// Per-handle positional state. Whenever `cursor < BLOCK_SIZE` and DIRTY is
/// clear, `buffer` mirrors the sector at `sector`; at `cursor ==
/// BLOCK_SIZE` the next access rolls into the following sector first.
struct Handle {
    flags: u8,
    buffer: [u8; BLOCK_SIZE],
    /// LBA mirrored by `buffer`; 0 for a fresh file with no cluster yet.
    sector: u32,
    cluster: u32,
    /// Sectors after `sector` still in the current cluster (or in the
    /// FAT16 fixed root region).
    sectors_left: u32,
    /// Byte position in `buffer`, 0..=BLOCK_SIZE.
    cursor: usize,
    filename: [u8; 8],
    extension: [u8; 3],
    attributes: u8,
    size: u32,
    /// First cluster of the file; 0 while nothing is materialized.
    full_first_cluster: u32,
    /// Where the directory entry lives; 0 means not yet published.
    entry_sector: u32,
    entry_index: usize,
    parent_cluster: u32,
    /// 0-based sector index within the file's byte stream.
    file_sector: u32,
    created: i64,
    modified: i64,
    accessed: i64,
}

impl Handle {
    const fn new() -> Self {
        Self {
            flags: 0,
            buffer: [0; BLOCK_SIZE],
            sector: 0,
            cluster: 0,
            sectors_left: 0,
            cursor: 0,
            filename: [b' '; 8],
            extension: [b' '; 3],
            attributes: 0,
            size: 0,
            full_first_cluster: 0,
            entry_sector: 0,
            entry_index: 0,
            parent_cluster: 0,
            file_sector: 0,
            created: 0,
            modified: 0,
            accessed: 0,
        }
    }

    /// The byte offset the next read or write will touch.
    fn position(&self) -> u64 {
        self.file_sector as u64 * BLOCK_SIZE as u64 + self.cursor as u64
    }

    fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }
}

pub struct FileSystemServer<BD: BlockDevice, const MAX_OPEN_FILES: usize = 4> {
    device: BD,
    volume: Volume,
    /// Scratch sector for FAT and directory walks that do not belong to a
    /// handle. Shared within a call, never across calls.
    sysbuf: [u8; BLOCK_SIZE],
    handles: [Handle; MAX_OPEN_FILES],
}

impl<BD: BlockDevice, const MAX_OPEN_FILES: usize> FileSystemServer<BD, MAX_OPEN_FILES> {
    /// Mounts the FAT volume inside `partition`. The partition type byte is
    /// a hint: the hinted variant is validated first and the other tried as
    /// a fallback, so a mislabeled partition still mounts.
    pub fn mount(mut device: BD, partition: &Partition) -> Result<Self> {
        let mut sysbuf = [0; BLOCK_SIZE];
        device.read(partition.start, &mut sysbuf)?;
        let read_only = device.read_only();
        let volume = if partition.partition_type == PART_TYPE_FAT16 {
            boot_sector::parse_fat16(&sysbuf, partition.start, partition.length, read_only)
                .or_else(|_| {
                    boot_sector::parse_fat32(&sysbuf, partition.start, partition.length, read_only)
                })?
        } else {
            boot_sector::parse_fat32(&sysbuf, partition.start, partition.length, read_only)
                .or_else(|_| {
                    boot_sector::parse_fat16(&sysbuf, partition.start, partition.length, read_only)
                })?
        };
        Ok(Self {
            device,
            volume,
            sysbuf,
            handles: core::array::from_fn(|_| Handle::new()),
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Gives the device back. Open handles are dropped as-is; close them
    /// first if they carry unflushed writes.
    pub fn unmount(self) -> BD {
        self.device
    }

    fn check_open(&self, fd: Fd) -> Result<()> {
        if fd >= MAX_OPEN_FILES || self.handles[fd].flags & FLAG_OPEN == 0 {
            return Err(Error::BadHandle);
        }
        Ok(())
    }

    fn check_mode(&self, fd: Fd, mode: u8) -> Result<()> {
        self.check_open(fd)?;
        if self.handles[fd].flags & mode == 0 {
            return Err(Error::BadHandle);
        }
        Ok(())
    }

    fn allocate_handle(&mut self) -> Result<Fd> {
        for fd in 0..MAX_OPEN_FILES {
            if self.handles[fd].flags & FLAG_OPEN == 0 {
                self.handles[fd] = Handle::new();
                self.handles[fd].flags = FLAG_OPEN;
                return Ok(fd);
            }
        }
        Err(Error::TooManyOpenFiles)
    }

    /// Points the handle at the first sector of `cluster` and loads it.
    /// Cluster 1 is the FAT16 sentinel for the fixed root region outside
    /// the cluster space.
    fn select_cluster(&mut self, fd: Fd, cluster: u32) -> Result<()> {
        let (sector, sectors_left) = if cluster == 1 {
            (self.volume.root_start, self.volume.root_len - 1)
        } else {
            (
                self.volume.cluster_to_sector(cluster),
                self.volume.sectors_per_cluster - 1,
            )
        };
        let handle = &mut self.handles[fd];
        handle.sector = sector;
        handle.sectors_left = sectors_left;
        handle.cluster = cluster;
        handle.cursor = 0;
        self.device.read(sector, &mut self.handles[fd].buffer)
    }

    /// Follows the FAT to the cluster after the handle's current one.
    /// `None` is a clean end of chain; a writable handle extends the chain
    /// instead of ending.
    fn next_cluster(&mut self, fd: Fd) -> Result<Option<u32>> {
        self.flush_buffer(fd)?;
        if self.handles[fd].cluster == 1 {
            // the fixed root is not chained, there is nothing after it
            return Ok(None);
        }
        let current = self.handles[fd].cluster;
        let next = table::read_entry(&mut self.device, &self.volume, &mut self.sysbuf, current)?;
        if next < 2 {
            // a live chain can never point at a free or reserved cluster
            return Err(Error::Io);
        }
        if next < self.volume.end_cluster_marker {
            return Ok(Some(next));
        }
        if self.handles[fd].flags & FLAG_WRITE == 0 {
            return Ok(None);
        }
        let fresh = table::find_free_cluster(&mut self.device, &self.volume, &mut self.sysbuf)?;
        table::write_entry(&mut self.device, &self.volume, &mut self.sysbuf, current, fresh)?;
        trace!("extended chain {current} -> {fresh}");
        Ok(Some(fresh))
    }

    /// Advances the handle one sector, flushing first. `Ok(false)` is a
    /// clean end of chain.
    fn next_sector(&mut self, fd: Fd) -> Result<bool> {
        self.flush_buffer(fd)?;
        if self.handles[fd].sectors_left > 0 {
            let handle = &mut self.handles[fd];
            handle.sectors_left -= 1;
            handle.file_sector += 1;
            handle.cursor = 0;
            handle.sector += 1;
            let sector = handle.sector;
            self.device.read(sector, &mut self.handles[fd].buffer)?;
            return Ok(true);
        }
        match self.next_cluster(fd)? {
            Some(cluster) => {
                self.handles[fd].file_sector += 1;
                self.select_cluster(fd, cluster)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes the buffer back if it diverges from disk. A fresh file gets
    /// its first cluster here, and its directory entry right after the
    /// data, never before.
    fn flush_buffer(&mut self, fd: Fd) -> Result<()> {
        if cfg!(feature = "read-only") {
            return Ok(());
        }
        if self.handles[fd].flags & FLAG_DIRTY == 0 {
            return Ok(());
        }
        if self.handles[fd].sector == 0 {
            let cluster =
                table::find_free_cluster(&mut self.device, &self.volume, &mut self.sysbuf)?;
            let sector = self.volume.cluster_to_sector(cluster);
            let handle = &mut self.handles[fd];
            handle.full_first_cluster = cluster;
            handle.cluster = cluster;
            handle.sector = sector;
            handle.sectors_left = self.volume.sectors_per_cluster - 1;
            handle.flags |= FLAG_FS_DIRTY;
            self.device.write(sector, &self.handles[fd].buffer)?;
            self.handles[fd].flags &= !FLAG_DIRTY;
            self.flush_entry(fd)?;
        } else {
            let sector = self.handles[fd].sector;
            self.device.write(sector, &self.handles[fd].buffer)?;
            self.handles[fd].flags &= !FLAG_DIRTY;
        }
        Ok(())
    }

    /// Writes the cached metadata into the directory entry. A file that has
    /// never been published first claims the terminator slot of its parent
    /// directory (deleted slots are not reused).
    fn flush_entry(&mut self, fd: Fd) -> Result<()> {
        if cfg!(feature = "read-only") {
            self.handles[fd].flags &= !FLAG_FS_DIRTY;
            return Ok(());
        }
        // the root directory has no entry of its own
        if self.handles[fd].full_first_cluster == self.volume.root_cluster {
            return Ok(());
        }
        // a missing file opened for reading: flushing would create it
        if self.handles[fd].entry_sector == 0 && self.handles[fd].flags & FLAG_WRITE == 0 {
            return Ok(());
        }
        // created but never written: there is nothing to record yet
        if self.handles[fd].full_first_cluster == 0 && self.handles[fd].entry_sector == 0 {
            return Ok(());
        }
        let entry = {
            let handle = &self.handles[fd];
            DirEntry {
                filename: handle.filename,
                extension: handle.extension,
                attributes: handle.attributes,
                reserved: 0,
                create_time_fine: time::fine_from_epoch(handle.created),
                create_time: time::time_from_epoch(handle.created).into(),
                create_date: time::date_from_epoch(handle.created).into(),
                access_date: time::date_from_epoch(handle.accessed).into(),
                high_first_cluster: ((handle.full_first_cluster >> 16) as u16).into(),
                modified_time: time::time_from_epoch(handle.modified).into(),
                modified_date: time::date_from_epoch(handle.modified).into(),
                first_cluster: (handle.full_first_cluster as u16).into(),
                size: handle.size.into(),
            }
        };
        self.flush_buffer(fd)?;
        if self.handles[fd].entry_sector == 0 {
            // first publication: borrow this handle to scan the parent for
            // its terminator slot, then put the position back
            let saved = {
                let handle = &self.handles[fd];
                (
                    handle.sectors_left,
                    handle.file_sector,
                    handle.cursor,
                    handle.sector,
                    handle.cluster,
                )
            };
            let parent = self.handles[fd].parent_cluster;
            self.select_cluster(fd, parent)?;
            let entry_index = 'scan: loop {
                for index in 0..BLOCK_SIZE / DIR_ENTRY_SIZE {
                    if self.handles[fd].buffer[index * DIR_ENTRY_SIZE] == 0 {
                        break 'scan index;
                    }
                }
                if !self.next_sector(fd)? {
                    return Err(Error::NoSpace);
                }
            };
            let handle = &mut self.handles[fd];
            handle.entry_sector = handle.sector;
            handle.entry_index = entry_index;
            (
                handle.sectors_left,
                handle.file_sector,
                handle.cursor,
                handle.sector,
                handle.cluster,
            ) = saved;
        } else {
            let entry_sector = self.handles[fd].entry_sector;
            self.device
                .read(entry_sector, &mut self.handles[fd].buffer)?;
        }
        let entry_sector = self.handles[fd].entry_sector;
        let offset = self.handles[fd].entry_index * DIR_ENTRY_SIZE;
        self.handles[fd].buffer[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        self.device.write(entry_sector, &self.handles[fd].buffer)?;
        // bring the sector the position arithmetic expects back in
        let sector = self.handles[fd].sector;
        if sector != 0 {
            self.device.read(sector, &mut self.handles[fd].buffer)?;
        }
        self.handles[fd].flags &= !FLAG_FS_DIRTY;
        Ok(())
    }

    /// Access stamps have one-day resolution; skip the metadata flush when
    /// the encoded day has not changed.
    fn update_atime(&mut self, fd: Fd) {
        if cfg!(feature = "read-only") || self.volume.read_only {
            return;
        }
        let now = time::now();
        let handle = &mut self.handles[fd];
        if time::date_from_epoch(handle.accessed) != time::date_from_epoch(now) {
            handle.accessed = now;
            handle.flags |= FLAG_FS_DIRTY;
        }
    }

    fn update_mtime(&mut self, fd: Fd) {
        if cfg!(feature = "read-only") || self.volume.read_only {
            return;
        }
        let handle = &mut self.handles[fd];
        handle.modified = time::now();
        handle.flags |= FLAG_FS_DIRTY;
    }

    /// Walks `path` from the root and loads the terminal entry into the
    /// handle. Empty components collapse, so a path without a leading `/`
    /// resolves as if it were absolute.
    fn lookup_path(&mut self, fd: Fd, path: &str) -> core::result::Result<(), LookupMiss> {
        if path.len() > MAX_PATH_LEN {
            return Err(LookupMiss::NameTooLong);
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.len() > MAX_PATH_LEVELS {
            return Err(LookupMiss::NameTooLong);
        }
        let root = self.volume.root_cluster;
        self.select_cluster(fd, root).map_err(LookupMiss::Device)?;
        if components.is_empty() {
            let handle = &mut self.handles[fd];
            handle.full_first_cluster = root;
            handle.entry_sector = 0;
            handle.entry_index = 0;
            handle.file_sector = 0;
            handle.attributes = ATTR_DIRECTORY;
            handle.size = 0;
            handle.created = 0;
            handle.modified = 0;
            handle.accessed = 0;
            self.select_cluster(fd, root).map_err(LookupMiss::Device)?;
            return Ok(());
        }
        self.handles[fd].parent_cluster = root;
        for (depth, component) in components.iter().enumerate() {
            let terminal = depth + 1 == components.len();
            let dotted =
                dirent::str_to_fatname(component.as_bytes()).map_err(|_| LookupMiss::InvalidName)?;
            let dos = dirent::make_dos_name(&dotted, &mut 0).map_err(|_| LookupMiss::InvalidName)?;
            let miss = |terminal| {
                if terminal {
                    LookupMiss::NotFound
                } else {
                    LookupMiss::BadPath
                }
            };
            let slot = 'scan: loop {
                for index in 0..BLOCK_SIZE / DIR_ENTRY_SIZE {
                    let offset = index * DIR_ENTRY_SIZE;
                    if self.handles[fd].buffer[offset] == 0 {
                        let handle = &mut self.handles[fd];
                        handle.filename.copy_from_slice(&dos[..8]);
                        handle.extension.copy_from_slice(&dos[8..]);
                        return Err(miss(terminal));
                    }
                    if self.handles[fd].buffer[offset..offset + 11] == dos {
                        break 'scan index;
                    }
                }
                match self.next_sector(fd) {
                    Ok(true) => {}
                    Ok(false) => {
                        let handle = &mut self.handles[fd];
                        handle.filename.copy_from_slice(&dos[..8]);
                        handle.extension.copy_from_slice(&dos[8..]);
                        return Err(miss(terminal));
                    }
                    Err(error) => return Err(LookupMiss::Device(error)),
                }
            };
            let offset = slot * DIR_ENTRY_SIZE;
            let Ok(entry) =
                DirEntry::read_from_bytes(&self.handles[fd].buffer[offset..offset + DIR_ENTRY_SIZE])
            else {
                return Err(LookupMiss::Device(Error::Io));
            };
            if entry.is_directory() && !terminal {
                let mut cluster = entry.full_first_cluster(self.volume.kind);
                if cluster == 0 {
                    // a ".." pointing at the root stores cluster 0
                    cluster = root;
                }
                self.handles[fd].parent_cluster = cluster;
                self.select_cluster(fd, cluster)
                    .map_err(LookupMiss::Device)?;
            } else if !terminal {
                return Err(LookupMiss::NotADirectory);
            } else {
                let first = entry.full_first_cluster(self.volume.kind);
                let is_directory = entry.is_directory();
                {
                    let handle = &mut self.handles[fd];
                    handle.flags = FLAG_OPEN;
                    handle.filename = entry.filename;
                    handle.extension = entry.extension;
                    handle.attributes = entry.attributes;
                    handle.size = entry.size.get();
                    handle.entry_sector = handle.sector;
                    handle.entry_index = slot;
                    handle.file_sector = 0;
                    handle.created = time::date_to_epoch(entry.create_date.get())
                        + time::time_to_epoch(entry.create_time.get())
                        + entry.create_time_fine as i64 / 100;
                    handle.modified = time::date_to_epoch(entry.modified_date.get())
                        + time::time_to_epoch(entry.modified_time.get());
                    handle.accessed = time::date_to_epoch(entry.access_date.get());
                }
                if first == 0 {
                    if is_directory {
                        // opened through a ".." entry of a first-level
                        // subdirectory: that is the root
                        self.handles[fd].full_first_cluster = root;
                        self.select_cluster(fd, root).map_err(LookupMiss::Device)?;
                    } else {
                        // an empty file has no cluster; leave the handle
                        // unmaterialized so the first write allocates
                        let handle = &mut self.handles[fd];
                        handle.full_first_cluster = 0;
                        handle.sector = 0;
                        handle.cluster = 0;
                        handle.sectors_left = 0;
                        handle.cursor = 0;
                        handle.buffer.fill(0);
                    }
                } else {
                    self.handles[fd].full_first_cluster = first;
                    self.select_cluster(fd, first).map_err(LookupMiss::Device)?;
                }
            }
        }
        Ok(())
    }

    /// `open` with the internal escape used by `mkdir`, which must write
    /// the `.`/`..` entries through a directory handle.
    fn open_internal(&mut self, path: &str, flags: OpenFlags, mode: u32, internal: bool) -> Result<Fd> {
        if cfg!(feature = "read-only") && flags.write_access() {
            return Err(Error::ReadOnlyFs);
        }
        let fd = self.allocate_handle()?;
        let looked_up = self.lookup_path(fd, path);
        {
            let handle = &mut self.handles[fd];
            if flags.read_access() {
                handle.flags |= FLAG_READ;
            }
            if flags.write_access() {
                handle.flags |= FLAG_WRITE;
            }
            if flags.contains(OpenFlags::APPEND) {
                handle.flags |= FLAG_APPEND;
            }
        }
        let fail = |this: &mut Self, error| {
            this.handles[fd].flags = 0;
            Err(error)
        };
        match looked_up {
            Err(LookupMiss::NotFound) => {
                if !flags.contains(OpenFlags::CREAT) {
                    return fail(self, Error::NotFound);
                }
                if self.volume.read_only {
                    return fail(self, Error::ReadOnlyFs);
                }
                // set up an empty handle; nothing reaches the disk until
                // the first write
                let handle = &mut self.handles[fd];
                handle.sector = 0;
                handle.cluster = 0;
                handle.sectors_left = 0;
                handle.cursor = 0;
                handle.attributes = if mode & S_IWUSR != 0 {
                    ATTR_ARCHIVE
                } else {
                    ATTR_ARCHIVE | ATTR_READ_ONLY
                };
                handle.size = 0;
                handle.full_first_cluster = 0;
                handle.entry_sector = 0;
                handle.entry_index = 0;
                handle.file_sector = 0;
                handle.created = time::now();
                handle.modified = 0;
                handle.accessed = 0;
                handle.buffer.fill(0);
                Ok(fd)
            }
            // a missing parent is still "no such entry" to the caller, but
            // creation must not happen
            Err(LookupMiss::BadPath) => fail(self, Error::NotFound),
            // an unencodable component must not surface as a missing entry
            // or create-on-open would try to create it
            Err(LookupMiss::InvalidName) => fail(self, Error::Io),
            Err(LookupMiss::NotADirectory) => fail(self, Error::NotADirectory),
            Err(LookupMiss::NameTooLong) => fail(self, Error::NameTooLong),
            Err(LookupMiss::Device(error)) => fail(self, error),
            Ok(()) => {
                if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                    return fail(self, Error::Exists);
                }
                if !flags.write_access() {
                    self.handles[fd].file_sector = 0;
                    return Ok(fd);
                }
                if self.volume.read_only {
                    return fail(self, Error::ReadOnlyFs);
                }
                if self.handles[fd].attributes & ATTR_READ_ONLY != 0 {
                    return fail(self, Error::AccessDenied);
                }
                if self.handles[fd].is_directory() {
                    if internal {
                        self.handles[fd].file_sector = 0;
                        return Ok(fd);
                    }
                    return fail(self, Error::IsDirectory);
                }
                if flags.contains(OpenFlags::TRUNC) {
                    let first = self.handles[fd].full_first_cluster;
                    if let Err(error) =
                        table::free_chain(&mut self.device, &self.volume, &mut self.sysbuf, first)
                    {
                        return fail(self, error);
                    }
                    let now = time::now();
                    let handle = &mut self.handles[fd];
                    handle.size = 0;
                    handle.full_first_cluster = 0;
                    handle.sector = 0;
                    handle.cluster = 0;
                    handle.sectors_left = 0;
                    handle.cursor = 0;
                    handle.file_sector = 0;
                    handle.created = now;
                    handle.modified = now;
                    handle.flags |= FLAG_FS_DIRTY;
                }
                self.handles[fd].file_sector = 0;
                Ok(fd)
            }
        }
    }

    /// Marks the parent slot deleted and releases the chain, clearing the
    /// dirty flags so the caller's close cannot write the entry back:
    /// delete and close form one compound.
    fn delete_open_handle(&mut self, fd: Fd) -> Result<()> {
        let entry_sector = self.handles[fd].entry_sector;
        let offset = self.handles[fd].entry_index * DIR_ENTRY_SIZE;
        self.device
            .read(entry_sector, &mut self.handles[fd].buffer)?;
        self.handles[fd].buffer[offset] = ENTRY_DELETED;
        self.device.write(entry_sector, &self.handles[fd].buffer)?;
        let first = self.handles[fd].full_first_cluster;
        table::free_chain(&mut self.device, &self.volume, &mut self.sysbuf, first)?;
        self.handles[fd].flags = FLAG_OPEN;
        Ok(())
    }

    /// Reads directory records up to and including the terminator, then
    /// steps back onto it.
    fn seek_to_free_entry(&mut self, fd: Fd) -> Result<()> {
        loop {
            let mut raw = [0; DIR_ENTRY_SIZE];
            if self.read(fd, &mut raw)? < DIR_ENTRY_SIZE {
                return Err(Error::NoSpace);
            }
            if raw[0] == 0 {
                break;
            }
        }
        self.lseek(fd, -(DIR_ENTRY_SIZE as i64), Whence::Cur)?;
        Ok(())
    }

    fn write_record(&mut self, fd: Fd, record: &[u8]) -> Result<()> {
        if self.write(fd, record)? < record.len() {
            return Err(Error::NoSpace);
        }
        Ok(())
    }
}

impl<BD: BlockDevice, const MAX_OPEN_FILES: usize> FileSystem
    for FileSystemServer<BD, MAX_OPEN_FILES>
{
    fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> Result<Fd> {
        self.open_internal(path, flags, mode, false)
    }

    fn close(&mut self, fd: Fd) -> Result<()> {
        self.check_open(fd)?;
        if self.handles[fd].flags & FLAG_DIRTY != 0 {
            self.flush_buffer(fd)?;
        }
        if self.handles[fd].flags & FLAG_FS_DIRTY != 0 {
            self.flush_entry(fd)?;
        }
        self.handles[fd].flags = 0;
        Ok(())
    }

    fn read(&mut self, fd: Fd, buffer: &mut [u8]) -> Result<usize> {
        self.check_mode(fd, FLAG_READ)?;
        let mut count = 0;
        while count < buffer.len() {
            {
                let handle = &self.handles[fd];
                // directories have no recorded size and read to the end of
                // their chain
                if !handle.is_directory() && handle.position() >= handle.size as u64 {
                    break;
                }
            }
            if self.handles[fd].cursor == BLOCK_SIZE {
                match self.next_sector(fd) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) if count == 0 => return Err(error),
                    Err(_) => break,
                }
            }
            let handle = &mut self.handles[fd];
            buffer[count] = handle.buffer[handle.cursor];
            handle.cursor += 1;
            count += 1;
        }
        if count > 0 {
            self.update_atime(fd);
        }
        Ok(count)
    }

    fn write(&mut self, fd: Fd, buffer: &[u8]) -> Result<usize> {
        if cfg!(feature = "read-only") {
            return Err(Error::ReadOnlyFs);
        }
        self.check_mode(fd, FLAG_WRITE)?;
        if self.handles[fd].flags & FLAG_APPEND != 0 {
            self.lseek(fd, 0, Whence::End)?;
        }
        let mut count = 0;
        while count < buffer.len() {
            if self.handles[fd].cursor == BLOCK_SIZE {
                match self.next_sector(fd) {
                    Ok(true) => {}
                    // only the FAT16 fixed root ever runs out of sectors on
                    // a writable handle
                    Ok(false) if count == 0 => return Err(Error::NoSpace),
                    Ok(false) => break,
                    Err(error) if count == 0 => return Err(error),
                    Err(_) => break,
                }
            }
            let handle = &mut self.handles[fd];
            if !handle.is_directory() && handle.position() == handle.size as u64 {
                handle.size += 1;
                handle.flags |= FLAG_FS_DIRTY;
            }
            handle.buffer[handle.cursor] = buffer[count];
            handle.cursor += 1;
            handle.flags |= FLAG_DIRTY;
            count += 1;
        }
        if count > 0 {
            self.update_mtime(fd);
        }
        Ok(count)
    }

    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
        self.check_open(fd)?;
        self.flush_buffer(fd)?;
        let old_pos = self.handles[fd].position();
        let new_pos = match whence {
            Whence::Set => offset,
            Whence::Cur => old_pos as i64 + offset,
            Whence::End => self.handles[fd].size as i64 + offset,
        };
        if new_pos < 0 {
            return Err(Error::InvalidArgument);
        }
        let new_pos = new_pos as u64;
        {
            let handle = &self.handles[fd];
            if !handle.is_directory() && new_pos > handle.size as u64 {
                return Err(Error::InvalidArgument);
            }
        }
        // the cursor may have rolled off the sector without the next one
        // being loaded yet
        if self.handles[fd].cursor == BLOCK_SIZE {
            self.next_sector(fd)?;
        }
        let block = BLOCK_SIZE as u64;
        if old_pos / block == new_pos / block {
            // same sector: move the cursor
            self.handles[fd].cursor = (new_pos % block) as usize;
            return Ok(new_pos);
        }
        let cluster_bytes = self.volume.sectors_per_cluster as u64 * block;
        if old_pos / cluster_bytes == new_pos / cluster_bytes {
            // same cluster: shift the sector without re-walking the FAT
            let delta = (new_pos / block) as i64 - (old_pos / block) as i64;
            let handle = &mut self.handles[fd];
            handle.file_sector = (new_pos / block) as u32;
            handle.sector = (handle.sector as i64 + delta) as u32;
            handle.sectors_left = (handle.sectors_left as i64 - delta) as u32;
            handle.cursor = (new_pos % block) as usize;
            let sector = handle.sector;
            self.device.read(sector, &mut self.handles[fd].buffer)?;
            return Ok(new_pos);
        }
        if self.handles[fd].full_first_cluster == 1 {
            // the fixed FAT16 root region is contiguous, no chain to walk
            let sector_index = (new_pos / block) as u32;
            if sector_index >= self.volume.root_len {
                return Err(Error::Io);
            }
            let handle = &mut self.handles[fd];
            handle.cluster = 1;
            handle.file_sector = sector_index;
            handle.cursor = (new_pos % block) as usize;
            handle.sector = self.volume.root_start + sector_index;
            handle.sectors_left = self.volume.root_len - 1 - sector_index;
            let sector = handle.sector;
            self.device.read(sector, &mut self.handles[fd].buffer)?;
            return Ok(new_pos);
        }
        // different cluster: restart from the first cluster and walk
        let target_cluster = new_pos / cluster_bytes;
        self.handles[fd].cluster = self.handles[fd].full_first_cluster;
        for _ in 0..target_cluster {
            match self.next_cluster(fd)? {
                Some(cluster) => self.handles[fd].cluster = cluster,
                None => return Err(Error::Io),
            }
        }
        let sector_in_cluster = ((new_pos % cluster_bytes) / block) as u32;
        let handle = &mut self.handles[fd];
        handle.file_sector = (new_pos / block) as u32;
        handle.cursor = (new_pos % block) as usize;
        handle.sector = self.volume.cluster_to_sector(handle.cluster) + sector_in_cluster;
        handle.sectors_left = self.volume.sectors_per_cluster - sector_in_cluster - 1;
        let sector = handle.sector;
        self.device.read(sector, &mut self.handles[fd].buffer)?;
        Ok(new_pos)
    }

    fn fstat(&self, fd: Fd) -> Result<Stat> {
        self.check_open(fd)?;
        let handle = &self.handles[fd];
        Ok(Stat {
            kind: if handle.is_directory() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            size: handle.size as u64,
            nlink: 1,
            accessed: handle.accessed,
            modified: handle.modified,
            created: handle.created,
            block_size: BLOCK_SIZE as u32,
            blocks: 1,
        })
    }

    fn readdir_next(&mut self, fd: Fd) -> Result<Option<DirRecord>> {
        loop {
            let mut raw = [0; DIR_ENTRY_SIZE];
            if self.read(fd, &mut raw)? < DIR_ENTRY_SIZE {
                return Ok(None);
            }
            let Ok(entry) = DirEntry::read_from_bytes(&raw) else {
                return Err(Error::Io);
            };
            if entry.filename[0] == 0 {
                return Ok(None);
            }
            if entry.attributes == ATTR_LONG_NAME
                || entry.attributes & ATTR_VOLUME_ID != 0
                || entry.filename[0] == ENTRY_DELETED
            {
                continue;
            }
            return Ok(Some(DirRecord {
                name: dirent::fatname_to_str(&entry.filename, &entry.extension),
                ino: entry.full_first_cluster(self.volume.kind),
            }));
        }
    }

    fn mkdir(&mut self, path: &str, _mode: u32) -> Result<()> {
        if cfg!(feature = "read-only") || self.volume.read_only {
            return Err(Error::ReadOnlyFs);
        }
        if path.len() + 1 > MAX_PATH_LEN {
            return Err(Error::NameTooLong);
        }
        if !path.starts_with('/') {
            return Err(Error::NameTooLong);
        }
        let trimmed = path.strip_suffix('/').unwrap_or(path);
        let Some(split_at) = trimmed.rfind('/') else {
            return Err(Error::InvalidArgument);
        };
        let (parent_path, leaf) = (&trimmed[..split_at], &trimmed[split_at + 1..]);
        if leaf.is_empty() {
            return Err(Error::InvalidArgument);
        }

        // the directory's cluster comes first so the parent entry never
        // points at nothing
        let cluster = table::find_free_cluster(&mut self.device, &self.volume, &mut self.sysbuf)?;

        let parent_fd = match self.open_internal(
            if parent_path.is_empty() { "/" } else { parent_path },
            OpenFlags::RDWR,
            0o777,
            true,
        ) {
            Ok(fd) => fd,
            Err(error) => {
                let _ = table::free_chain(&mut self.device, &self.volume, &mut self.sysbuf, cluster);
                return Err(error);
            }
        };
        let parent_cluster = self.handles[parent_fd].full_first_cluster;

        let result = (|| {
            self.seek_to_free_entry(parent_fd)?;
            let name = dirent::str_to_fatname(leaf.as_bytes())
                .and_then(|dotted| dirent::make_dos_name(&dotted, &mut 0))
                .map_err(|()| Error::NameTooLong)?;
            let now = time::now();
            let entry = DirEntry::new(&name, ATTR_DIRECTORY | ATTR_ARCHIVE, cluster, 0, now);
            self.write_record(parent_fd, entry.as_bytes())?;
            // the terminator moves one slot later
            self.write_record(parent_fd, &[0; DIR_ENTRY_SIZE])?;
            Ok(now)
        })();
        let now = match result {
            Ok(now) => now,
            Err(error) => {
                let _ = self.close(parent_fd);
                let _ = table::free_chain(&mut self.device, &self.volume, &mut self.sysbuf, cluster);
                return Err(error);
            }
        };
        self.close(parent_fd)?;

        // populate the new cluster through the directory itself
        let dir_fd = self.open_internal(path, OpenFlags::RDWR, 0o777, true)?;
        let result = (|| {
            let dot = DirEntry::new(b".          ", ATTR_DIRECTORY | ATTR_ARCHIVE, cluster, 0, now);
            self.write_record(dir_fd, dot.as_bytes())?;
            let dotdot =
                DirEntry::new(b"..         ", ATTR_DIRECTORY | ATTR_ARCHIVE, parent_cluster, 0, now);
            self.write_record(dir_fd, dotdot.as_bytes())?;
            let fill =
                self.volume.sectors_per_cluster as usize * BLOCK_SIZE / DIR_ENTRY_SIZE - 2;
            for _ in 0..fill {
                self.write_record(dir_fd, &[0; DIR_ENTRY_SIZE])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => self.close(dir_fd),
            Err(error) => {
                let _ = self.close(dir_fd);
                Err(error)
            }
        }
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        if cfg!(feature = "read-only") || self.volume.read_only {
            return Err(Error::ReadOnlyFs);
        }
        let fd = self.open(path, OpenFlags::RDONLY, 0o777)?;
        if !self.handles[fd].is_directory() {
            let _ = self.close(fd);
            return Err(Error::NotADirectory);
        }
        if self.handles[fd].full_first_cluster == self.volume.root_cluster {
            let _ = self.close(fd);
            return Err(Error::NotPermitted);
        }
        loop {
            match self.readdir_next(fd) {
                Ok(Some(record)) => {
                    if record.name != "." && record.name != ".." {
                        let _ = self.close(fd);
                        return Err(Error::NotEmpty);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let _ = self.close(fd);
                    return Err(error);
                }
            }
        }
        let deleted = self.delete_open_handle(fd);
        let closed = self.close(fd);
        deleted.and(closed)
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        if cfg!(feature = "read-only") || self.volume.read_only {
            return Err(Error::ReadOnlyFs);
        }
        let fd = self.open(path, OpenFlags::RDONLY, 0o777)?;
        if self.handles[fd].is_directory() {
            // removing a directory through unlink would leak its contents'
            // clusters; POSIX wants EPERM here
            self.handles[fd].flags = FLAG_OPEN;
            let _ = self.close(fd);
            return Err(Error::NotPermitted);
        }
        let deleted = self.delete_open_handle(fd);
        let closed = self.close(fd);
        deleted.and(closed)
    }
}
