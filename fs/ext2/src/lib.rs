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

//! Experimental EXT2 mount. Read-only: files are served from their twelve
//! direct blocks, every mutating operation answers `ReadOnlyFs`, and
//! indirect blocks answer `Unimplemented`.

use log::error;
use tapir_bd::{BlockDevice, BLOCK_SIZE};
use tapir_fs::{
    DirRecord, Error, Fd, FileSystem, NodeKind, OpenFlags, Result, Stat, Whence, MAX_PATH_LEN,
    MAX_PATH_LEVELS,
};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const EXT2_MAGIC: u16 = 0xEF53;
const EXT2_ROOT_INO: u32 = 2;
const EXT2_DIRECT_BLOCKS: usize = 12;
const EXT2_S_IFDIR: u16 = 0x4000;

const FLAG_OPEN: u8 = 0x01;

/// The EXT2 superblock, 1024 bytes into the volume.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Superblock {
    inodes_count: U32,
    blocks_count: U32,
    r_blocks_count: U32,
    free_blocks_count: U32,
    free_inodes_count: U32,
    first_data_block: U32,
    /// Block size is `1024 << log_block_size`.
    log_block_size: U32,
    log_frag_size: U32,
    blocks_per_group: U32,
    frags_per_group: U32,
    inodes_per_group: U32,
    mtime: U32,
    wtime: U32,
    mnt_count: U16,
    max_mnt_count: U16,
    magic: U16,
    state: U16,
    errors: U16,
    minor_rev_level: U16,
    lastcheck: U32,
    checkinterval: U32,
    creator_os: U32,
    rev_level: U32,
    def_resuid: U16,
    def_resgid: U16,
    first_ino: U32,
    inode_size: U16,
    block_group_nr: U16,
    feature_compat: U32,
    feature_incompat: U32,
    feature_ro_compat: U32,
}

/// One block group descriptor, 32 bytes.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct GroupDescriptor {
    block_bitmap: U32,
    inode_bitmap: U32,
    inode_table: U32,
    free_blocks_count: U16,
    free_inodes_count: U16,
    used_dirs_count: U16,
    pad: U16,
    reserved: [u8; 12],
}

/// The fixed 128-byte head of an on-disk inode.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Inode {
    mode: U16,
    uid: U16,
    size: U32,
    atime: U32,
    ctime: U32,
    mtime: U32,
    dtime: U32,
    gid: U16,
    links_count: U16,
    blocks: U32,
    flags: U32,
    osd1: U32,
    /// Twelve direct blocks, then single/double/triple indirection which
    /// this driver does not walk.
    block: [U32; 15],
    generation: U32,
    file_acl: U32,
    dir_acl: U32,
    faddr: U32,
    osd2: [u8; 12],
}

impl Inode {
    fn is_directory(&self) -> bool {
        self.mode.get() & 0xF000 == EXT2_S_IFDIR
    }
}

/// The fixed head of a directory record; the name follows it.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct DirEntryHead {
    inode: U32,
    rec_len: U16,
    name_len: u8,
    file_type: u8,
}

struct Handle {
    flags: u8,
    inode: Inode,
    position: u64,
}

pub struct FileSystemServer<BD: BlockDevice, const MAX_OPEN_FILES: usize = 4> {
    device: BD,
    part_start: u32,
    block_size: u32,
    inodes_per_group: u32,
    inode_size: u32,
    first_data_block: u32,
    handles: [Option<Handle>; MAX_OPEN_FILES],
}

impl<BD: BlockDevice, const MAX_OPEN_FILES: usize> FileSystemServer<BD, MAX_OPEN_FILES> {
    /// Mounts the volume starting at `part_start` sectors.
    pub fn mount(mut device: BD, part_start: u32) -> Result<Self> {
        // the superblock always sits 1024 bytes in, whatever the block size
        let mut sector = [0; BLOCK_SIZE];
        device.read(part_start + 2, &mut sector)?;
        let Ok((superblock, _)) = Superblock::read_from_prefix(&sector) else {
            return Err(Error::Inconsistent);
        };
        if superblock.magic.get() != EXT2_MAGIC {
            error!("Superblock magic ({:#06x}) shall be {EXT2_MAGIC:#06x}", superblock.magic.get());
            return Err(Error::Inconsistent);
        }
        let log_block_size = superblock.log_block_size.get();
        if log_block_size > 6 {
            error!("Block size exponent ({log_block_size}) shall be within [0, 6]");
            return Err(Error::Inconsistent);
        }
        if superblock.inodes_per_group.get() == 0 {
            error!("Inodes per group shall be non-zero");
            return Err(Error::Inconsistent);
        }
        let inode_size = if superblock.rev_level.get() == 0 {
            128
        } else {
            superblock.inode_size.get() as u32
        };
        Ok(Self {
            device,
            part_start,
            block_size: 1024 << log_block_size,
            inodes_per_group: superblock.inodes_per_group.get(),
            inode_size,
            first_data_block: superblock.first_data_block.get(),
            handles: [const { None }; MAX_OPEN_FILES],
        })
    }

    pub fn unmount(self) -> BD {
        self.device
    }

    fn sectors_per_block(&self) -> u32 {
        self.block_size / BLOCK_SIZE as u32
    }

    /// Reads `length` bytes starting `offset` bytes into file-system block
    /// `block`.
    fn read_block_bytes(&mut self, block: u32, offset: u32, out: &mut [u8]) -> Result<()> {
        let mut sector_buf = [0; BLOCK_SIZE];
        let mut done = 0;
        while done < out.len() {
            let byte = offset as usize + done;
            let sector =
                self.part_start + block * self.sectors_per_block() + (byte / BLOCK_SIZE) as u32;
            self.device.read(sector, &mut sector_buf)?;
            let within = byte % BLOCK_SIZE;
            let take = (BLOCK_SIZE - within).min(out.len() - done);
            out[done..done + take].copy_from_slice(&sector_buf[within..within + take]);
            done += take;
        }
        Ok(())
    }

    fn read_inode(&mut self, inode_number: u32) -> Result<Inode> {
        if inode_number == 0 {
            return Err(Error::Inconsistent);
        }
        let index = inode_number - 1;
        let group = index / self.inodes_per_group;
        let within_group = index % self.inodes_per_group;
        // the group descriptor table starts in the block after the
        // superblock
        let table_block = self.first_data_block + 1;
        let mut descriptor_raw = [0; size_of::<GroupDescriptor>()];
        self.read_block_bytes(
            table_block,
            group * size_of::<GroupDescriptor>() as u32,
            &mut descriptor_raw,
        )?;
        let Ok(descriptor) = GroupDescriptor::read_from_bytes(&descriptor_raw) else {
            return Err(Error::Inconsistent);
        };
        let byte = within_group as u64 * self.inode_size as u64;
        let mut inode_raw = [0; size_of::<Inode>()];
        self.read_block_bytes(
            descriptor.inode_table.get() + (byte / self.block_size as u64) as u32,
            (byte % self.block_size as u64) as u32,
            &mut inode_raw,
        )?;
        match Inode::read_from_bytes(&inode_raw) {
            Ok(inode) => Ok(inode),
            Err(_) => Err(Error::Inconsistent),
        }
    }

    /// Copies file content at `position` into `out`. Only the direct
    /// blocks are reachable; holes read as zeros.
    fn read_at(&mut self, inode: &Inode, position: u64, out: &mut [u8]) -> Result<usize> {
        let size = inode.size.get() as u64;
        if position >= size {
            return Ok(0);
        }
        let want = out.len().min((size - position) as usize);
        let mut done = 0;
        while done < want {
            let at = position + done as u64;
            let block_index = (at / self.block_size as u64) as usize;
            if block_index >= EXT2_DIRECT_BLOCKS {
                // indirect blocks are not walked
                if done > 0 {
                    break;
                }
                return Err(Error::Unimplemented);
            }
            let within = (at % self.block_size as u64) as u32;
            let take = (self.block_size - within).min((want - done) as u32) as usize;
            let block = inode.block[block_index].get();
            if block == 0 {
                out[done..done + take].fill(0);
            } else {
                let mut chunk = vec![0; take];
                self.read_block_bytes(block, within, &mut chunk)?;
                out[done..done + take].copy_from_slice(&chunk);
            }
            done += take;
        }
        Ok(done)
    }

    /// Finds `name` in the directory described by `inode`.
    fn find_in_directory(&mut self, inode: &Inode, name: &str) -> Result<Option<u32>> {
        let size = inode.size.get() as u64;
        let mut position = 0;
        let mut head_raw = [0; size_of::<DirEntryHead>()];
        while position + size_of::<DirEntryHead>() as u64 <= size {
            if self.read_at(inode, position, &mut head_raw)? < head_raw.len() {
                break;
            }
            let Ok(head) = DirEntryHead::read_from_bytes(&head_raw) else {
                return Err(Error::Inconsistent);
            };
            let rec_len = head.rec_len.get() as u64;
            if rec_len < size_of::<DirEntryHead>() as u64 {
                return Err(Error::Inconsistent);
            }
            if head.inode.get() != 0 && head.name_len as usize == name.len() {
                let mut entry_name = vec![0; head.name_len as usize];
                self.read_at(
                    inode,
                    position + size_of::<DirEntryHead>() as u64,
                    &mut entry_name,
                )?;
                if entry_name == name.as_bytes() {
                    return Ok(Some(head.inode.get()));
                }
            }
            position += rec_len;
        }
        Ok(None)
    }

    fn check_open(&self, fd: Fd) -> Result<&Handle> {
        if fd >= MAX_OPEN_FILES {
            return Err(Error::BadHandle);
        }
        match &self.handles[fd] {
            Some(handle) if handle.flags & FLAG_OPEN != 0 => Ok(handle),
            _ => Err(Error::BadHandle),
        }
    }
}

impl<BD: BlockDevice, const MAX_OPEN_FILES: usize> FileSystem
    for FileSystemServer<BD, MAX_OPEN_FILES>
{
    fn open(&mut self, path: &str, flags: OpenFlags, _mode: u32) -> Result<Fd> {
        if flags.write_access() || flags.contains(OpenFlags::CREAT) {
            return Err(Error::ReadOnlyFs);
        }
        if path.len() > MAX_PATH_LEN {
            return Err(Error::NameTooLong);
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.len() > MAX_PATH_LEVELS {
            return Err(Error::NameTooLong);
        }
        let fd = self
            .handles
            .iter()
            .position(|handle| handle.is_none())
            .ok_or(Error::TooManyOpenFiles)?;

        let mut inode = self.read_inode(EXT2_ROOT_INO)?;
        for &component in &components {
            if !inode.is_directory() {
                return Err(Error::NotADirectory);
            }
            match self.find_in_directory(&inode, component)? {
                Some(found) => inode = self.read_inode(found)?,
                None => return Err(Error::NotFound),
            }
        }
        self.handles[fd] = Some(Handle {
            flags: FLAG_OPEN,
            inode,
            position: 0,
        });
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> Result<()> {
        self.check_open(fd)?;
        self.handles[fd] = None;
        Ok(())
    }

    fn read(&mut self, fd: Fd, buffer: &mut [u8]) -> Result<usize> {
        let handle = self.check_open(fd)?;
        let inode = handle.inode.clone();
        let position = handle.position;
        let count = self.read_at(&inode, position, buffer)?;
        if let Some(handle) = &mut self.handles[fd] {
            handle.position += count as u64;
        }
        Ok(count)
    }

    fn write(&mut self, fd: Fd, _buffer: &[u8]) -> Result<usize> {
        self.check_open(fd)?;
        Err(Error::ReadOnlyFs)
    }

    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
        let handle = self.check_open(fd)?;
        let size = handle.inode.size.get() as i64;
        let new_position = match whence {
            Whence::Set => offset,
            Whence::Cur => handle.position as i64 + offset,
            Whence::End => size + offset,
        };
        if new_position < 0 || new_position > size {
            return Err(Error::InvalidArgument);
        }
        if let Some(handle) = &mut self.handles[fd] {
            handle.position = new_position as u64;
        }
        Ok(new_position as u64)
    }

    fn fstat(&self, fd: Fd) -> Result<Stat> {
        let handle = self.check_open(fd)?;
        let inode = &handle.inode;
        Ok(Stat {
            kind: if inode.is_directory() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            size: inode.size.get() as u64,
            nlink: inode.links_count.get() as u32,
            accessed: inode.atime.get() as i64,
            modified: inode.mtime.get() as i64,
            created: inode.ctime.get() as i64,
            block_size: BLOCK_SIZE as u32,
            blocks: inode.blocks.get() as u64,
        })
    }

    fn readdir_next(&mut self, fd: Fd) -> Result<Option<DirRecord>> {
        let handle = self.check_open(fd)?;
        if !handle.inode.is_directory() {
            return Err(Error::NotADirectory);
        }
        let inode = handle.inode.clone();
        let size = inode.size.get() as u64;
        let mut position = handle.position;
        let mut head_raw = [0; size_of::<DirEntryHead>()];
        let record = loop {
            if position + size_of::<DirEntryHead>() as u64 > size {
                break None;
            }
            if self.read_at(&inode, position, &mut head_raw)? < head_raw.len() {
                break None;
            }
            let Ok(head) = DirEntryHead::read_from_bytes(&head_raw) else {
                return Err(Error::Inconsistent);
            };
            let rec_len = head.rec_len.get() as u64;
            if rec_len < size_of::<DirEntryHead>() as u64 {
                return Err(Error::Inconsistent);
            }
            if head.inode.get() != 0 {
                let mut name = vec![0; head.name_len as usize];
                self.read_at(&inode, position + size_of::<DirEntryHead>() as u64, &mut name)?;
                position += rec_len;
                break Some(DirRecord {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    ino: head.inode.get(),
                });
            }
            position += rec_len;
        };
        if let Some(handle) = &mut self.handles[fd] {
            handle.position = position;
        }
        Ok(record)
    }

    fn mkdir(&mut self, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    fn rmdir(&mut self, _path: &str) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    fn unlink(&mut self, _path: &str) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }
}
