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

mod common;

use common::*;
use tapir_bd::BlockDevice;
use tapir_bd_std::MemBlockDevice;
use tapir_fs::partition::read_partition_table;
use tapir_fs::{Error, FileSystem, NodeKind, OpenFlags, Whence};
use tapir_fs_fat::{FatKind, FileSystemServer};

type Server = FileSystemServer<MemBlockDevice>;

fn mounted() -> Server {
    Server::mount(mkfs_fat16(), &fat16_partition()).unwrap()
}

#[test]
fn mounts_with_the_fixed_root_sentinel() {
    let server = mounted();
    let volume = server.volume();
    assert_eq!(volume.kind, FatKind::Fat16);
    assert_eq!(volume.fat_entry_len, 2);
    // cluster 1 stands in for the fixed root region
    assert_eq!(volume.root_cluster, 1);
    assert_eq!(volume.root_start, 33);
    assert_eq!(volume.root_len, 32);
    // the first data cluster follows the root region
    assert_eq!(volume.cluster_to_sector(2), 65);
}

#[test]
fn mounts_with_the_wrong_hint() {
    let mut partition = fat16_partition();
    partition.partition_type = 0x0B;
    let server = Server::mount(mkfs_fat16(), &partition).unwrap();
    assert_eq!(server.volume().kind, FatKind::Fat16);
}

#[test]
fn root_directory_lives_outside_the_cluster_space() {
    let mut server = mounted();
    let fd = server
        .open("/HELLO.TXT", OpenFlags::WRONLY | OpenFlags::CREAT, 0o666)
        .unwrap();
    server.write(fd, b"fixed root").unwrap();
    server.close(fd).unwrap();

    // the entry landed in the fixed root region, not in a cluster
    let device = server.unmount();
    let root = 33 * 512;
    assert_eq!(&device.snapshot()[root..root + 8], b"HELLO   ");
    // FAT16 entries keep the high cluster half zero
    assert_eq!(&device.snapshot()[root + 20..root + 22], &[0, 0]);
    let first_cluster =
        u16::from_le_bytes([device.snapshot()[root + 26], device.snapshot()[root + 27]]);
    assert_eq!(first_cluster, 2);

    let mut server = Server::mount(device, &fat16_partition()).unwrap();
    let fd = server.open("/HELLO.TXT", OpenFlags::RDONLY, 0).unwrap();
    let mut buffer = [0u8; 16];
    assert_eq!(server.read(fd, &mut buffer).unwrap(), 10);
    assert_eq!(&buffer[..10], b"fixed root");
    server.close(fd).unwrap();
}

#[test]
fn stat_of_the_root_is_a_directory() {
    let mut server = mounted();
    let fd = server.open("/", OpenFlags::RDONLY, 0).unwrap();
    let stat = server.fstat(fd).unwrap();
    assert_eq!(stat.kind, NodeKind::Directory);
    assert_eq!(stat.size, 0);
    assert_eq!(server.readdir_next(fd).unwrap(), None);
    server.close(fd).unwrap();
}

#[test]
fn lists_root_entries_in_insertion_order() {
    let mut server = mounted();
    for name in ["/A.TXT", "/B.TXT", "/C.TXT"] {
        let fd = server
            .open(name, OpenFlags::WRONLY | OpenFlags::CREAT, 0o666)
            .unwrap();
        server.write(fd, b"x").unwrap();
        server.close(fd).unwrap();
    }
    let fd = server.open("/", OpenFlags::RDONLY, 0).unwrap();
    let names: Vec<String> = std::iter::from_fn(|| server.readdir_next(fd).unwrap())
        .map(|record| record.name)
        .collect();
    assert_eq!(names, ["A.TXT", "B.TXT", "C.TXT"]);
    server.close(fd).unwrap();
}

#[test]
fn files_span_clusters_on_fat16_too() {
    let mut server = mounted();
    let volume = server.volume().clone();
    let pattern: Vec<u8> = (0..10_000).map(|i| (i * 7 & 0xFF) as u8).collect();
    let fd = server
        .open("/SPAN.BIN", OpenFlags::RDWR | OpenFlags::CREAT, 0o666)
        .unwrap();
    assert_eq!(server.write(fd, &pattern).unwrap(), 10_000);
    assert_eq!(server.lseek(fd, 5_000, Whence::Set).unwrap(), 5_000);
    let mut buffer = [0u8; 4];
    assert_eq!(server.read(fd, &mut buffer).unwrap(), 4);
    assert_eq!(buffer[..], pattern[5_000..5_004]);
    server.close(fd).unwrap();

    // 10,000 bytes at 8 sectors per cluster is three clusters
    let device = server.unmount();
    let fresh = Server::mount(mkfs_fat16(), &fat16_partition()).unwrap();
    let volume_fresh = fresh.volume().clone();
    let baseline = free_clusters(fresh.unmount().snapshot(), &volume_fresh);
    assert_eq!(free_clusters(device.snapshot(), &volume), baseline - 3);
}

#[test]
fn subdirectories_chain_back_to_the_root() {
    let mut server = mounted();
    server.mkdir("/A", 0o777).unwrap();
    server.mkdir("/A/B", 0o777).unwrap();

    let fd = server.open("/A/B/..", OpenFlags::RDONLY, 0).unwrap();
    let stat = server.fstat(fd).unwrap();
    assert_eq!(stat.kind, NodeKind::Directory);
    server.close(fd).unwrap();

    assert_eq!(server.rmdir("/A"), Err(Error::NotEmpty));
    server.rmdir("/A/B").unwrap();
    server.rmdir("/A").unwrap();
}

#[test]
fn mounts_from_a_partition_table() {
    let device = mkfs_fat16_at(2_048);
    let mut mbr = [0u8; 512];
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr[0x1BE + 4] = 0x06;
    mbr[0x1BE + 8..0x1BE + 12].copy_from_slice(&2_048u32.to_le_bytes());
    mbr[0x1BE + 12..0x1BE + 16].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
    let mut device = device;
    device.snapshot_mut()[..512].copy_from_slice(&mbr);

    let volume_size = device.volume_size();
    let partitions = read_partition_table(&mbr, volume_size);
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].start, 2_048);

    let mut server = Server::mount(device, &partitions[0]).unwrap();
    assert_eq!(server.volume().part_start, 2_048);

    let fd = server
        .open("/OFF.TXT", OpenFlags::WRONLY | OpenFlags::CREAT, 0o666)
        .unwrap();
    server.write(fd, b"offset volume").unwrap();
    server.close(fd).unwrap();

    let fd = server.open("/OFF.TXT", OpenFlags::RDONLY, 0).unwrap();
    let mut buffer = [0u8; 16];
    assert_eq!(server.read(fd, &mut buffer).unwrap(), 13);
    assert_eq!(&buffer[..13], b"offset volume");
    server.close(fd).unwrap();

    // everything landed inside the partition, nothing below it (bar the MBR
    // we wrote ourselves)
    let device = server.unmount();
    assert!(device.snapshot()[512..2_048 * 512].iter().all(|&b| b == 0));
}
