use binrw::BinRead;

pub const TAG_GGPK: [u8; 4] = *b"GGPK";
pub const TAG_PDIR: [u8; 4] = *b"PDIR";
pub const TAG_FILE: [u8; 4] = *b"FILE";
pub const TAG_FREE: [u8; 4] = *b"FREE";

/// Every record starts with `(length, tag)`. `length` covers the header
/// itself, so it is never below 8.
pub const RECORD_HEADER_SIZE: u64 = 8;

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub tag: [u8; 4],
}

/// Payload of the `GGPK` identity record: archive version and the offset
/// of the first real record (customarily the directory root).
#[derive(BinRead, Debug, Clone, Copy)]
pub struct ArchiveHeader {
    pub version: u32,
    pub first_record_offset: u64,
}

/// One child slot of a directory record.
#[derive(BinRead, Debug, Clone, Copy)]
pub struct DirectoryEntry {
    pub name_hash: u32,
    pub offset: i64,
}

/// Payload of a `PDIR` record. `name_length` counts UTF-16 code units
/// including the terminator.
#[derive(BinRead, Debug, Clone)]
pub struct DirectoryRecord {
    pub name_length: u32,
    pub child_count: u32,
    pub hash: [u8; 32],
    #[br(count = name_length)]
    pub name_units: Vec<u16>,
    #[br(count = child_count)]
    pub children: Vec<DirectoryEntry>,
}

impl DirectoryRecord {
    pub fn name(&self) -> String {
        decode_utf16_name(&self.name_units)
    }
}

/// Payload of a `FILE` record, excluding the file bytes themselves. The
/// payload spans the remainder of the record and is only ever touched by
/// an explicit extract.
#[derive(BinRead, Debug, Clone)]
pub struct FileRecordHeader {
    pub name_length: u32,
    pub hash: [u8; 32],
    #[br(count = name_length)]
    pub name_units: Vec<u16>,
}

impl FileRecordHeader {
    pub fn name(&self) -> String {
        decode_utf16_name(&self.name_units)
    }
}

/// Payload of a `FREE` record. The remainder of the record is unused.
#[derive(BinRead, Debug, Clone, Copy)]
pub struct FreeRecord {
    pub next_free: u64,
}

/// The four record kinds, keyed by the 4-byte tag.
#[derive(Debug, Clone)]
pub enum Record {
    Archive(ArchiveHeader),
    Directory(DirectoryRecord),
    File(FileRecordHeader),
    Free(FreeRecord),
}

/// Offset of a file record's payload relative to the record start:
/// record header, name length field, hash, then the UTF-16 name.
pub fn file_payload_offset(name_length: u32) -> u64 {
    RECORD_HEADER_SIZE + 4 + 32 + 2 * name_length as u64
}

fn decode_utf16_name(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use binrw::BinReaderExt;

    use super::*;

    #[test]
    fn archive_header_layout() {
        let bytes: Vec<u8> = [
            0x20u32.to_le_bytes().as_slice(),
            b"GGPK",
            &3u32.to_le_bytes(),
            &0x40u64.to_le_bytes(),
        ]
        .concat();

        let mut cur = Cursor::new(bytes);
        let header: RecordHeader = cur.read_le().unwrap();
        assert_eq!(header.length, 0x20);
        assert_eq!(header.tag, TAG_GGPK);

        let archive: ArchiveHeader = cur.read_le().unwrap();
        assert_eq!(archive.version, 3);
        assert_eq!(archive.first_record_offset, 0x40);
    }

    #[test]
    fn file_payload_offset_arithmetic() {
        // record header + name length field + hash + 2 bytes per name unit
        assert_eq!(file_payload_offset(6), 8 + 4 + 32 + 12);
        assert_eq!(file_payload_offset(0), 44);
    }

    #[test]
    fn directory_name_stops_at_terminator() {
        let units: Vec<u16> = "sub\0".encode_utf16().collect();
        let mut raw = Vec::new();
        raw.extend_from_slice(&(units.len() as u32).to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 32]);
        for u in &units {
            raw.extend_from_slice(&u.to_le_bytes());
        }

        let dir: DirectoryRecord = Cursor::new(raw).read_le().unwrap();
        assert_eq!(dir.name(), "sub");
        assert!(dir.children.is_empty());
    }
}
