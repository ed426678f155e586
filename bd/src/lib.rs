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

pub use tapir_err::{Error, Result};

/// Number of bytes per logical block. Block N starts N * BLOCK_SIZE bytes
/// into the volume. Only 512 has been exercised.
pub const BLOCK_SIZE: usize = 512;

/// Logical block address. 32 bits covers 2 TiB at 512-byte blocks.
pub type BlockNo = u32;

/// A synchronous, blocking block device such as an SD card or a disk image.
///
/// Calls are serialized by the caller; the device is the only place an
/// operation may suspend.
pub trait BlockDevice {
    /// Prepare the device for use. Must be called before any transfer; may
    /// power up hardware and read the medium geometry.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop the device. Any further transfer requires another `init`.
    fn halt(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read block `block` into `buffer`.
    fn read(&mut self, block: BlockNo, buffer: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Write `buffer` to block `block`.
    fn write(&mut self, block: BlockNo, buffer: &[u8; BLOCK_SIZE]) -> Result<()>;

    /// Total number of blocks on the device (the whole medium, not a
    /// partition).
    fn volume_size(&self) -> BlockNo;

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Whether the medium is write protected (e.g. the SD card lock switch).
    fn read_only(&self) -> bool;
}
