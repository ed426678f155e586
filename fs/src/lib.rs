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

pub use tapir_err::*;

pub mod partition;

/// Longest accepted path, in bytes.
pub const MAX_PATH_LEN: usize = 256;

/// Deepest accepted path, in components.
pub const MAX_PATH_LEVELS: usize = 20;

/// Owner-write permission bit of the `mode` argument. On FAT this is the
/// only mode bit with an on-disk representation (cleared means the entry is
/// created with the read-only attribute).
pub const S_IWUSR: u32 = 0o200;

/// Open flags, POSIX encoded: the low two bits are the access mode, the
/// rest are independent bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(0o0);
    pub const WRONLY: OpenFlags = OpenFlags(0o1);
    pub const RDWR: OpenFlags = OpenFlags(0o2);
    pub const CREAT: OpenFlags = OpenFlags(0o100);
    pub const EXCL: OpenFlags = OpenFlags(0o200);
    pub const TRUNC: OpenFlags = OpenFlags(0o1000);
    pub const APPEND: OpenFlags = OpenFlags(0o2000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The handle may read: any access mode except write-only.
    pub const fn read_access(self) -> bool {
        self.0 & 0o3 != Self::WRONLY.0
    }

    /// The handle may write: any access mode except read-only.
    pub const fn write_access(self) -> bool {
        self.0 & 0o3 != Self::RDONLY.0
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// The subset of `struct stat` a FAT-like file system can populate.
/// Timestamps are epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub kind: NodeKind,
    pub size: u64,
    pub nlink: u32,
    pub accessed: i64,
    pub modified: i64,
    pub created: i64,
    pub block_size: u32,
    pub blocks: u64,
}

/// One directory listing record. `ino` is the entry's first cluster (or
/// inode number), the closest thing to a stable identity these file systems
/// have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub name: String,
    pub ino: u32,
}

/// Index into a file system's handle table.
pub type Fd = usize;

/// POSIX-style file operations over integer handles. One implementation per
/// file system driver crate.
pub trait FileSystem {
    fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> Result<Fd>;

    fn close(&mut self, fd: Fd) -> Result<()>;

    fn read(&mut self, fd: Fd, buffer: &mut [u8]) -> Result<usize>;

    fn write(&mut self, fd: Fd, buffer: &[u8]) -> Result<usize>;

    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<u64>;

    fn fstat(&self, fd: Fd) -> Result<Stat>;

    /// Next live entry of a directory handle, `None` at the end.
    fn readdir_next(&mut self, fd: Fd) -> Result<Option<DirRecord>>;

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<()>;

    fn rmdir(&mut self, path: &str) -> Result<()>;

    fn unlink(&mut self, path: &str) -> Result<()>;
}
