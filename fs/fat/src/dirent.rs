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

//! Directory entries and the short (8.3) name codec.

use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::boot_sector::FatKind;
use crate::time;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_DEVICE: u8 = 0x40;
/// Attribute value (not mask) marking one fragment of a long file name.
/// This driver only ever skips such entries.
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// First name byte of a deleted, reusable slot.
pub const ENTRY_DELETED: u8 = 0xE5;
/// Stored stand-in for a name genuinely starting with 0xE5.
pub const ENTRY_KANJI_E5: u8 = 0x05;

pub const DIR_ENTRY_SIZE: usize = 32;

/// One 32-byte directory entry as it sits on disk.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DirEntry {
    /// Name part of the 8.3 short name, space padded. A leading 0x00
    /// terminates the directory, a leading 0xE5 marks a deleted slot.
    pub filename: [u8; 8],
    /// Extension part of the 8.3 short name, space padded.
    pub extension: [u8; 3],
    /// Attribute bits; 0x0F as a whole marks a long-name fragment.
    pub attributes: u8,
    /// Reserved for Windows NT, 0 on create.
    pub reserved: u8,
    /// Creation stamp, count of 10 ms units in 0..200, on top of the
    /// two-second `create_time`.
    pub create_time_fine: u8,
    /// Creation time word, two-second granularity.
    pub create_time: U16,
    /// Creation date word.
    pub create_date: U16,
    /// Last access date word; there is no access time.
    pub access_date: U16,
    /// High half of the first cluster number. Always 0 on FAT16.
    pub high_first_cluster: U16,
    /// Last modification time word.
    pub modified_time: U16,
    /// Last modification date word.
    pub modified_date: U16,
    /// Low half of the first cluster number. 0 means no data has ever been
    /// allocated (or, in a `..` entry, the root directory).
    pub first_cluster: U16,
    /// File size in bytes; 0 for directories by definition.
    pub size: U32,
}

impl DirEntry {
    /// A fresh entry with all three stamps set to `timestamp`.
    pub fn new(name: &[u8; 11], attributes: u8, first_cluster: u32, size: u32, timestamp: i64) -> Self {
        let mut filename = [0; 8];
        let mut extension = [0; 3];
        filename.copy_from_slice(&name[..8]);
        extension.copy_from_slice(&name[8..]);
        Self {
            filename,
            extension,
            attributes,
            reserved: 0,
            create_time_fine: time::fine_from_epoch(timestamp),
            create_time: time::time_from_epoch(timestamp).into(),
            create_date: time::date_from_epoch(timestamp).into(),
            access_date: time::date_from_epoch(timestamp).into(),
            high_first_cluster: ((first_cluster >> 16) as u16).into(),
            modified_time: time::time_from_epoch(timestamp).into(),
            modified_date: time::date_from_epoch(timestamp).into(),
            first_cluster: (first_cluster as u16).into(),
            size: size.into(),
        }
    }

    /// First cluster with the high half applied on FAT32 (FAT16 reuses the
    /// field for other purposes, so only the low half counts there).
    pub fn full_first_cluster(&self, kind: FatKind) -> u32 {
        match kind {
            FatKind::Fat16 => self.first_cluster.get() as u32,
            FatKind::Fat32 => {
                self.first_cluster.get() as u32 | (self.high_first_cluster.get() as u32) << 16
            }
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }
}

/// Classification of one input byte for the 8.3 codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DosChar {
    /// End of input.
    End,
    /// Byte that can never appear in a short name.
    Illegal,
    /// Path separator, either `/` or `\`.
    Separator,
    /// A literal `.`.
    Dot,
    /// A valid name byte, already upper-cased and 0xE5-remapped.
    Byte(u8),
}

pub(crate) fn dos_char(c: u8) -> DosChar {
    match c {
        0 => DosChar::End,
        b'/' | b'\\' => DosChar::Separator,
        b'.' => DosChar::Dot,
        b'A'..=b'Z' | b'0'..=b'9' => DosChar::Byte(c),
        b'a'..=b'z' => DosChar::Byte(c - b'a' + b'A'),
        0xE5 => DosChar::Byte(ENTRY_KANJI_E5),
        c if c > 127 => DosChar::Byte(c),
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'-' | b'@' | b'^' | b'_'
        | b'`' | b'{' | b'}' | b'~' | b' ' => DosChar::Byte(c),
        _ => DosChar::Illegal,
    }
}

/// Encodes one path component starting at `pos` into the 11-byte padded
/// on-disk form. On success `pos` is left on the terminating separator or
/// end of input. Fails on an illegal byte or a name or extension that
/// overflows its field.
pub(crate) fn make_dos_name(path: &[u8], pos: &mut usize) -> Result<[u8; 11], ()> {
    fn next(path: &[u8], pos: &mut usize) -> DosChar {
        let c = if *pos < path.len() { path[*pos] } else { 0 };
        *pos += 1;
        dos_char(c)
    }

    let mut name = [b' '; 11];
    let mut c = next(path, pos);
    for i in 0..8 {
        match c {
            DosChar::Separator | DosChar::End => name[i] = b' ',
            DosChar::Dot => {
                if i == 0 {
                    name[i] = b'.';
                    c = next(path, pos);
                } else if i == 1 {
                    // "..": only if the second dot ends the component
                    let peek = if *pos < path.len() { path[*pos] } else { 0 };
                    if matches!(dos_char(peek), DosChar::End | DosChar::Separator) {
                        name[i] = b'.';
                        c = next(path, pos);
                    } else {
                        name[i] = b' ';
                    }
                } else {
                    name[i] = b' ';
                }
            }
            DosChar::Illegal => return Err(()),
            DosChar::Byte(b) => {
                name[i] = b;
                c = next(path, pos);
            }
        }
    }
    let ext_follows = match c {
        DosChar::Dot => {
            c = next(path, pos);
            true
        }
        DosChar::Separator | DosChar::End => false,
        _ => {
            c = next(path, pos);
            match c {
                DosChar::Dot => {
                    c = next(path, pos);
                    true
                }
                DosChar::Separator | DosChar::End => false,
                // illegal byte or a name longer than eight characters
                _ => return Err(()),
            }
        }
    };
    for i in 0..3 {
        if ext_follows {
            match c {
                DosChar::Separator | DosChar::End => name[8 + i] = b' ',
                DosChar::Illegal | DosChar::Dot => return Err(()),
                DosChar::Byte(b) => {
                    name[8 + i] = b;
                    c = next(path, pos);
                }
            }
        } else {
            name[8 + i] = b' ';
        }
    }
    // every branch above post-increments, leave pos on the separator
    *pos -= 1;
    match c {
        DosChar::Separator | DosChar::End => Ok(name),
        // the extension runs past three characters
        _ => Err(()),
    }
}

/// Intermediate dotted form of a user name, shortening anything that
/// overflows 8.3 to a `XXXXXX~1` tilde name. The output is re-encoded with
/// `make_dos_name` by the callers.
pub(crate) fn str_to_fatname(name: &[u8]) -> Result<Vec<u8>, ()> {
    // "." and ".." go through verbatim; the strict encoder knows them
    if name == b"." || name == b".." {
        return Ok(name.to_vec());
    }
    let capped = &name[..name.len().min(31)];
    let mut parts = capped.split(|&b| b == b'.');
    let base_len = parts.next().map_or(0, |p| p.len());
    let extension = parts.next().unwrap_or(&[]);

    // six base characters plus "~1" when either field overflows
    let base_budget = if base_len > 8 || extension.len() > 3 { 6 } else { 8 };
    let mut dosname = Vec::new();
    let mut saw_dot = false;
    for &b in name.iter().take(base_budget) {
        match dos_char(b) {
            DosChar::End | DosChar::Separator => return Ok(dosname),
            DosChar::Illegal => return Err(()),
            DosChar::Dot => {
                saw_dot = true;
                break;
            }
            DosChar::Byte(v) => dosname.push(v),
        }
    }
    if base_budget == 6 {
        dosname.push(b'~');
        dosname.push(b'1');
    } else if !saw_dot && dosname.len() == name.len() {
        // dotless name consumed whole
        return Ok(dosname);
    }
    dosname.push(b'.');
    for &b in extension.iter().take(3) {
        match dos_char(b) {
            DosChar::End | DosChar::Separator | DosChar::Dot => break,
            DosChar::Illegal => return Err(()),
            DosChar::Byte(v) => dosname.push(v),
        }
    }
    Ok(dosname)
}

/// Renders an on-disk name pair for the user: spaces stripped, a dot only
/// when the extension is non-empty. Lossy for bytes above ASCII.
pub fn fatname_to_str(filename: &[u8; 8], extension: &[u8; 3]) -> String {
    let mut out = Vec::with_capacity(12);
    out.extend(filename.iter().copied().filter(|&b| b != b' '));
    if extension[0] != b' ' {
        out.push(b'.');
        out.extend(extension.iter().copied().take_while(|&b| b != b' '));
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dos(component: &str) -> Result<[u8; 11], ()> {
        let mut pos = 0;
        make_dos_name(component.as_bytes(), &mut pos)
    }

    #[test]
    fn encodes_plain_names() {
        assert_eq!(dos("hello.txt"), Ok(*b"HELLO   TXT"));
        assert_eq!(dos("A.B"), Ok(*b"A       B  "));
        assert_eq!(dos("NOEXT"), Ok(*b"NOEXT      "));
        assert_eq!(dos("EIGHTCHR.EXT"), Ok(*b"EIGHTCHREXT"));
    }

    #[test]
    fn encodes_dot_and_dotdot() {
        assert_eq!(dos("."), Ok(*b".          "));
        assert_eq!(dos(".."), Ok(*b"..         "));
    }

    #[test]
    fn stops_at_a_separator() {
        let path = b"dir1/file.txt";
        let mut pos = 0;
        assert_eq!(make_dos_name(path, &mut pos), Ok(*b"DIR1       "));
        assert_eq!(path[pos], b'/');
    }

    #[test]
    fn rejects_illegal_and_oversized_components() {
        assert!(dos("bad*name").is_err());
        assert!(dos("name.toolong").is_err());
        assert!(dos("waytoolongname").is_err());
        assert!(dos("two.dots.txt").is_err());
    }

    #[test]
    fn remaps_the_deleted_marker_byte() {
        let mut pos = 0;
        let name = make_dos_name(&[0xE5, b'X'], &mut pos).unwrap();
        assert_eq!(name[0], ENTRY_KANJI_E5);
        assert_eq!(name[1], b'X');
    }

    #[test]
    fn shortens_long_names_with_a_tilde() {
        assert_eq!(str_to_fatname(b"longfilename.txt"), Ok(b"LONGFI~1.TXT".to_vec()));
        assert_eq!(str_to_fatname(b"verybigextension.html"), Ok(b"VERYBI~1.HTM".to_vec()));
        assert_eq!(str_to_fatname(b"short.txt"), Ok(b"SHORT.TXT".to_vec()));
        assert_eq!(str_to_fatname(b"plaindir"), Ok(b"PLAINDIR".to_vec()));
        assert_eq!(str_to_fatname(b"."), Ok(b".".to_vec()));
        assert_eq!(str_to_fatname(b".."), Ok(b"..".to_vec()));
    }

    #[test]
    fn renders_entries_for_listings() {
        assert_eq!(fatname_to_str(b"HELLO   ", b"TXT"), "HELLO.TXT");
        assert_eq!(fatname_to_str(b"NOEXT   ", b"   "), "NOEXT");
        assert_eq!(fatname_to_str(b".       ", b"   "), ".");
        assert_eq!(fatname_to_str(b"..      ", b"   "), "..");
        assert_eq!(fatname_to_str(b"A       ", b"B  "), "A.B");
    }

    #[test]
    fn round_trips_the_lossy_direction() {
        let mut pos = 0;
        let name = make_dos_name(b"hello.txt", &mut pos).unwrap();
        let mut filename = [0; 8];
        let mut extension = [0; 3];
        filename.copy_from_slice(&name[..8]);
        extension.copy_from_slice(&name[8..]);
        assert_eq!(fatname_to_str(&filename, &extension), "HELLO.TXT");
    }

    #[test]
    fn entry_layout_is_32_bytes() {
        assert_eq!(size_of::<DirEntry>(), DIR_ENTRY_SIZE);
        let entry = DirEntry::new(b"FILE    BIN", ATTR_ARCHIVE, 0x0001_0002, 42, 0);
        assert_eq!(entry.first_cluster.get(), 0x0002);
        assert_eq!(entry.high_first_cluster.get(), 0x0001);
        assert_eq!(entry.full_first_cluster(FatKind::Fat32), 0x0001_0002);
        assert_eq!(entry.full_first_cluster(FatKind::Fat16), 0x0002);
    }
}
