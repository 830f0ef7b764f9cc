pub mod structs;

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use binrw::BinReaderExt;
use itertools::Itertools;
use nohash_hasher::IntSet;
use parking_lot::{Mutex, RwLock};
use regex::RegexBuilder;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::error::ToolError;
use self::structs::{
    file_payload_offset, ArchiveHeader, FileRecordHeader, Record, RecordHeader, TAG_FILE, TAG_FREE,
    TAG_GGPK, TAG_PDIR, RECORD_HEADER_SIZE,
};

/// Payloads above this are copied in positioned-read chunks instead of a
/// single read.
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Everything needed to extract a file later without touching its payload
/// now.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Slash-delimited logical path inside the archive.
    pub path: String,
    pub name: String,
    /// Offset of the owning record in the archive.
    pub offset: u64,
    /// Absolute offset of the first payload byte.
    pub payload_offset: u64,
    pub payload_length: u64,
    pub hash: [u8; 32],
}

#[derive(Debug, Default)]
pub struct GgpkIndex {
    pub files: FxHashMap<String, FileDescriptor>,
}

impl GgpkIndex {
    pub fn get(&self, path: &str) -> Option<&FileDescriptor> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Logical paths matching `pattern` (case-insensitive), sorted. With no
    /// pattern, every path.
    pub fn list(&self, pattern: Option<&str>) -> anyhow::Result<Vec<String>> {
        Ok(match pattern {
            Some(p) => {
                let re = RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid path pattern '{p}'"))?;
                self.files
                    .keys()
                    .filter(|k| re.is_match(k))
                    .cloned()
                    .sorted()
                    .collect()
            }
            None => self.files.keys().cloned().sorted().collect(),
        })
    }
}

/// Read-only handle over a GGPK archive. All reads are positioned; the
/// handle exposes no seek cursor.
#[derive(Debug)]
pub struct GgpkReader {
    file: Mutex<Option<File>>,
    file_size: u64,
    pub header: ArchiveHeader,
    chunk_size: u64,
    index: RwLock<Option<Arc<GgpkIndex>>>,
}

impl GgpkReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<GgpkReader, ToolError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut head = [0u8; 24];
        if file_size < head.len() as u64 {
            return Err(ToolError::MalformedArchive(format!(
                "{} is too small to hold an archive header",
                path.display()
            )));
        }
        read_at(&file, 0, &mut head)?;

        let mut cur = Cursor::new(head.as_slice());
        let record: RecordHeader = cur
            .read_le()
            .map_err(|e| ToolError::MalformedArchive(e.to_string()))?;
        if record.tag != TAG_GGPK {
            return Err(ToolError::MalformedArchive(format!(
                "bad magic {:02x?} in {}",
                record.tag,
                path.display()
            )));
        }
        if record.length < RECORD_HEADER_SIZE as u32 {
            return Err(ToolError::MalformedArchive(format!(
                "identity record length {} is impossible",
                record.length
            )));
        }
        let header: ArchiveHeader = cur
            .read_le()
            .map_err(|e| ToolError::MalformedArchive(e.to_string()))?;
        if header.first_record_offset >= file_size {
            return Err(ToolError::MalformedArchive(format!(
                "first record offset {:#x} is past the end of the archive",
                header.first_record_offset
            )));
        }

        Ok(GgpkReader {
            file: Mutex::new(Some(file)),
            file_size,
            header,
            chunk_size: DEFAULT_CHUNK_SIZE,
            index: RwLock::new(None),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Idempotent release of the underlying file. Any read after this
    /// fails with an io error.
    pub fn close(&self) {
        self.file.lock().take();
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        if offset + buf.len() as u64 > self.file_size {
            bail!(
                "read of {} bytes at {:#x} is out of bounds (archive is {} bytes)",
                buf.len(),
                offset,
                self.file_size
            );
        }
        let mut guard = self.file.lock();
        let file = guard.as_mut().context("archive handle is closed")?;
        read_at(file, offset, buf)?;
        Ok(())
    }

    /// Decodes the record at `offset`. File records are decoded as
    /// metadata only; the payload is never read here.
    pub fn read_record(&self, offset: u64) -> anyhow::Result<Record> {
        let mut head = [0u8; 8];
        self.read_at(offset, &mut head)
            .with_context(|| format!("record header at {offset:#x}"))?;
        let record: RecordHeader = Cursor::new(head.as_slice()).read_le()?;

        if (record.length as u64) < RECORD_HEADER_SIZE {
            bail!("record at {offset:#x} has impossible length {}", record.length);
        }
        if offset + record.length as u64 > self.file_size {
            bail!(
                "record at {offset:#x} (length {}) runs past the end of the archive",
                record.length
            );
        }

        match record.tag {
            TAG_GGPK => {
                let mut buf = [0u8; 12];
                self.read_at(offset + RECORD_HEADER_SIZE, &mut buf)?;
                Ok(Record::Archive(Cursor::new(buf.as_slice()).read_le()?))
            }
            TAG_PDIR => {
                let mut buf = vec![0u8; record.length as usize - RECORD_HEADER_SIZE as usize];
                self.read_at(offset + RECORD_HEADER_SIZE, &mut buf)?;
                Ok(Record::Directory(Cursor::new(buf).read_le()?))
            }
            TAG_FILE => {
                // Two-step decode: a small read discovers the name length,
                // a follow-up read covers the header without the payload.
                let mut len_buf = [0u8; 4];
                self.read_at(offset + RECORD_HEADER_SIZE, &mut len_buf)?;
                let name_length = u32::from_le_bytes(len_buf);

                let header_len = file_payload_offset(name_length);
                if header_len > record.length as u64 {
                    bail!(
                        "file record at {offset:#x} declares a {name_length}-unit name that \
                         does not fit in a {}-byte record",
                        record.length
                    );
                }
                let mut buf = vec![0u8; (header_len - RECORD_HEADER_SIZE) as usize];
                self.read_at(offset + RECORD_HEADER_SIZE, &mut buf)?;
                Ok(Record::File(Cursor::new(buf).read_le()?))
            }
            TAG_FREE => {
                let mut buf = [0u8; 8];
                self.read_at(offset + RECORD_HEADER_SIZE, &mut buf)?;
                Ok(Record::Free(Cursor::new(buf.as_slice()).read_le()?))
            }
            tag => bail!("unrecognised record tag {tag:02x?} at {offset:#x}"),
        }
    }

    /// Walks the record graph from the root and returns the logical path
    /// map. A record that fails to decode loses its subtree only; the rest
    /// of the walk continues.
    pub fn build_index(&self) -> anyhow::Result<Arc<GgpkIndex>> {
        let mut files = FxHashMap::default();
        let mut visited: IntSet<u64> = IntSet::default();
        let mut stack: Vec<(u64, String)> = vec![(self.header.first_record_offset, String::new())];

        while let Some((offset, prefix)) = stack.pop() {
            if !visited.insert(offset) {
                warn!("record at {offset:#x} referenced more than once, skipping");
                continue;
            }

            let record = match self.read_record(offset) {
                Ok(r) => r,
                Err(e) => {
                    warn!("abandoning subtree at {offset:#x}: {e:#}");
                    continue;
                }
            };

            match record {
                Record::Directory(dir) => {
                    let name = dir.name();
                    // The conventional root directory adds no path segment.
                    let prefix = if name == "ROOT" {
                        prefix
                    } else if prefix.is_empty() {
                        name
                    } else {
                        format!("{prefix}/{name}")
                    };

                    // Children are pushed in reverse so the stack visits
                    // them in stored order.
                    for entry in dir.children.iter().rev() {
                        if entry.offset < 0 || entry.offset as u64 >= self.file_size {
                            warn!(
                                "child offset {:#x} in '{prefix}' is out of bounds, skipping",
                                entry.offset
                            );
                            continue;
                        }
                        stack.push((entry.offset as u64, prefix.clone()));
                    }
                }
                Record::File(file) => {
                    match self.file_descriptor(offset, &prefix, &file) {
                        Ok(desc) => {
                            files.insert(desc.path.clone(), desc);
                        }
                        Err(e) => warn!("skipping file record at {offset:#x}: {e:#}"),
                    };
                }
                Record::Archive(_) | Record::Free(_) => {
                    warn!("unexpected record kind at {offset:#x} in directory tree");
                }
            }
        }

        info!("indexed {} files", files.len());
        let index = Arc::new(GgpkIndex { files });
        *self.index.write() = Some(Arc::clone(&index));
        Ok(index)
    }

    fn file_descriptor(
        &self,
        offset: u64,
        prefix: &str,
        file: &FileRecordHeader,
    ) -> anyhow::Result<FileDescriptor> {
        let mut head = [0u8; 4];
        self.read_at(offset, &mut head)?;
        let record_length = u32::from_le_bytes(head) as u64;

        let payload_within = file_payload_offset(file.name_length);
        if payload_within > record_length {
            bail!("name overruns the record");
        }

        let name = file.name();
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };

        Ok(FileDescriptor {
            path,
            name,
            offset,
            payload_offset: offset + payload_within,
            payload_length: record_length - payload_within,
            hash: file.hash,
        })
    }

    fn index(&self) -> anyhow::Result<Arc<GgpkIndex>> {
        if let Some(index) = self.index.read().as_ref() {
            return Ok(Arc::clone(index));
        }
        self.build_index()
    }

    /// Sorted logical paths matching `pattern`, building the index on
    /// first use.
    pub fn list(&self, pattern: Option<&str>) -> anyhow::Result<Vec<String>> {
        self.index()?.list(pattern)
    }

    /// Writes the payload of `desc` to `destination`, creating parent
    /// directories. Large payloads are copied chunk by chunk.
    pub fn extract(&self, desc: &FileDescriptor, destination: &Path) -> anyhow::Result<()> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut out = File::create(destination)
            .with_context(|| format!("creating {}", destination.display()))?;

        if desc.payload_length <= self.chunk_size {
            let mut buf = vec![0u8; desc.payload_length as usize];
            self.read_at(desc.payload_offset, &mut buf)?;
            out.write_all(&buf)?;
        } else {
            let mut remaining = desc.payload_length;
            let mut offset = desc.payload_offset;
            let mut buf = vec![0u8; self.chunk_size as usize];
            while remaining > 0 {
                let n = remaining.min(self.chunk_size) as usize;
                self.read_at(offset, &mut buf[..n])?;
                out.write_all(&buf[..n])?;
                offset += n as u64;
                remaining -= n as u64;
            }
        }

        Ok(())
    }
}

fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
}
