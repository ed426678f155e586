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

use std::fs;
use std::path::Path;

use log::error;
use tapir_bd::{BlockDevice, BlockNo, Error, Result, BLOCK_SIZE};

/// A block device over an in-memory copy of a disk image file.
///
/// The whole image is held in memory so a crashed run never leaves a
/// half-written image behind; `save` writes the medium back out.
pub struct FileBlockDevice {
    blocks: Vec<u8>,
    read_only: bool,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let blocks = fs::read(path).map_err(|_| Error::Io)?;
        if blocks.len() >= 2 * 1024 * 1024 * 1024 {
            error!("Image size ({}) shall be below 2 GiB", blocks.len());
            return Err(Error::Inconsistent);
        }
        if blocks.len() % BLOCK_SIZE != 0 {
            error!(
                "Image size ({}) shall be a multiple of the block size ({BLOCK_SIZE})",
                blocks.len()
            );
            return Err(Error::Inconsistent);
        }
        Ok(Self { blocks, read_only })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, &self.blocks).map_err(|_| Error::Io)
    }

    /// The raw medium, for inspection.
    pub fn snapshot(&self) -> &[u8] {
        &self.blocks
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&mut self, block: BlockNo, buffer: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let offset = block as usize * BLOCK_SIZE;
        if offset + BLOCK_SIZE > self.blocks.len() {
            return Err(Error::Io);
        }
        buffer.copy_from_slice(&self.blocks[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write(&mut self, block: BlockNo, buffer: &[u8; BLOCK_SIZE]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyFs);
        }
        let offset = block as usize * BLOCK_SIZE;
        if offset + BLOCK_SIZE > self.blocks.len() {
            return Err(Error::Io);
        }
        self.blocks[offset..offset + BLOCK_SIZE].copy_from_slice(buffer);
        Ok(())
    }

    fn volume_size(&self) -> BlockNo {
        (self.blocks.len() / BLOCK_SIZE) as BlockNo
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// A RAM-backed block device, mainly for tests.
pub struct MemBlockDevice {
    blocks: Vec<u8>,
    read_only: bool,
}

impl MemBlockDevice {
    pub fn new(num_blocks: BlockNo) -> Self {
        Self {
            blocks: vec![0; num_blocks as usize * BLOCK_SIZE],
            read_only: false,
        }
    }

    pub fn from_bytes(blocks: Vec<u8>) -> Self {
        debug_assert!(blocks.len() % BLOCK_SIZE == 0);
        Self {
            blocks,
            read_only: false,
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn snapshot(&self) -> &[u8] {
        &self.blocks
    }

    pub fn snapshot_mut(&mut self) -> &mut [u8] {
        &mut self.blocks
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&mut self, block: BlockNo, buffer: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let offset = block as usize * BLOCK_SIZE;
        if offset + BLOCK_SIZE > self.blocks.len() {
            return Err(Error::Io);
        }
        buffer.copy_from_slice(&self.blocks[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write(&mut self, block: BlockNo, buffer: &[u8; BLOCK_SIZE]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyFs);
        }
        let offset = block as usize * BLOCK_SIZE;
        if offset + BLOCK_SIZE > self.blocks.len() {
            return Err(Error::Io);
        }
        self.blocks[offset..offset + BLOCK_SIZE].copy_from_slice(buffer);
        Ok(())
    }

    fn volume_size(&self) -> BlockNo {
        (self.blocks.len() / BLOCK_SIZE) as BlockNo
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
