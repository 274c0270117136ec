//! Per-site write-ahead log.
//!
//! Records are framed `[u32 len][bincode event][u32 crc32]`, little endian,
//! where `len` covers only the bincode payload. Replay walks the file from
//! the start and stops at the first frame that is short or fails its
//! checksum — a torn tail from a crash loses only entries that were never
//! acknowledged to a caller.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Serialize one event into a complete frame.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

/// Read one frame. `Ok(None)` means clean end of file, a torn tail, or a
/// failed checksum — in every case nothing past this point can be trusted
/// and replay must stop here.
fn next_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    match reader.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(word) as usize;

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    match reader.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

/// The compaction scratch file, swapped over the live log on success.
fn scratch_path(path: &Path) -> PathBuf {
    path.with_extension("compact")
}

/// Append-only log of [`Event`] frames, owned by the engine's writer task.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    dirty_appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            dirty_appends: 0,
        })
    }

    /// Append one event and fsync. Tests only; the live path batches via
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.out.write_all(&frame(event)?)?;
        self.dirty_appends += 1;
        Ok(())
    }

    /// Push buffered frames to the OS and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a compacted event stream to the scratch file and fsync it.
    /// This is the slow I/O half; run it before taking over the live log.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(scratch_path(path))?);
        for event in events {
            writer.write_all(&frame(event)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the scratch file over the live log and reopen for appending.
    /// Fast; the writer task does this between batches.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(scratch_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.out = BufWriter::new(file);
        self.dirty_appends = 0;
        Ok(())
    }

    /// Both compaction halves in one call. Tests only.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Appends written since the log was last compacted (or opened).
    pub fn appends_since_compact(&self) -> u64 {
        self.dirty_appends
    }

    /// Read every intact frame from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = next_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
