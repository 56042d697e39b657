use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes around each payload: a `u32` length before and a `u32` CRC32 after.
const FRAME_OVERHEAD: usize = 8;

/// Largest payload replay will allocate for; anything bigger is a torn length.
const MAX_PAYLOAD: usize = 16 << 20;

/// Serialize one event into a complete frame `[len][payload][crc]`.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(ErrorKind::InvalidData, "event too large for the log"));
    }
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

/// What the reader found at the current offset.
enum Frame {
    /// An intact event and the bytes its frame occupies.
    Event(Box<Event>, u64),
    /// Clean end of file.
    End,
    /// Partial or damaged frame; nothing after it can be trusted.
    Torn(&'static str),
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    match fill(reader, &mut word)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Torn("partial length")),
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_PAYLOAD {
        return Ok(Frame::Torn("implausible length"));
    }

    let mut payload = vec![0u8; len];
    if fill(reader, &mut payload)? < len {
        return Ok(Frame::Torn("partial payload"));
    }
    if fill(reader, &mut word)? < 4 {
        return Ok(Frame::Torn("partial checksum"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    Ok(match bincode::deserialize(&payload) {
        Ok(event) => Frame::Event(Box::new(event), (len + FRAME_OVERHEAD) as u64),
        Err(_) => Frame::Torn("undecodable payload"),
    })
}

/// Read until `buf` is full or EOF; returns the byte count read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Result of reading a log from the start.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the prefix made of intact frames.
    pub intact_len: u64,
}

/// Append-only log of store events, one checksummed frame per event.
///
/// Opening cuts off any torn tail left by a crash mid-write, so new frames
/// always follow the last intact one.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Bytes known to be intact and synced.
    committed: u64,
    /// Set when a failed batch could not be cut back off the file.
    poisoned: bool,
}

impl Wal {
    /// Replay `path`, truncate it to its intact prefix and open it for appends.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let Replay { events, intact_len } = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > intact_len {
            file.set_len(intact_len)?;
            file.sync_data()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            committed: intact_len,
            poisoned: false,
        };
        Ok((wal, events))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch([event])
    }

    /// Write and fsync a group of events as one unit. Either every frame is
    /// durable or the file is cut back to where the batch started.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL has an unrecoverable tail, refusing to append"));
        }
        let mut buf = Vec::new();
        for event in events {
            buf.extend_from_slice(&frame(event)?);
        }
        match self.write_synced(&buf) {
            Ok(()) => {
                self.committed += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.file.sync_data()
    }

    fn rollback(&mut self) {
        let restored = self
            .file
            .set_len(self.committed)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = restored {
            tracing::error!(path = %self.path.display(), committed = self.committed, "WAL rollback failed: {e}");
            self.poisoned = true;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every intact event in write order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let mut reader = match File::open(path) {
            Ok(file) => BufReader::new(file),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut replay = Replay::default();
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    replay.events.push(*event);
                    replay.intact_len += size;
                }
                Frame::End => break,
                Frame::Torn(why) => {
                    tracing::warn!(
                        path = %path.display(),
                        kept = replay.events.len(),
                        offset = replay.intact_len,
                        "WAL tail discarded: {why}"
                    );
                    break;
                }
            }
        }
        Ok(replay)
    }
}
