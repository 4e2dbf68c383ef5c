//! Append-only log of JSON records.
//!
//! Frame layout: `crc32 (u32 LE) | len (u32 LE) | payload | '\n'`.
//! Replay yields every intact frame in order and stops at the first torn or
//! corrupt one; [`Wal::recover`] also trims that tail before appending. Generic over the record type: versioned entries, hints and
//! reconciliation jobs are all framed the same way.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// When appended frames are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// `sync_all` after each append.
    Always,
    /// Only on an explicit [`Wal::sync`].
    Batch,
    /// Left to the OS page cache.
    None,
}

impl FsyncPolicy {
    /// Parse the config spelling. Unknown values fall back to `Batch`.
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

#[derive(Debug)]
pub struct Wal {
    out: BufWriter<File>,
    policy: FsyncPolicy,
    appended: u64,
}

impl Wal {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: &Path, policy: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            policy,
            appended: 0,
        })
    }

    /// Append one record. The frame is flushed before returning.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), WalError> {
        let payload = serde_json::to_vec(record)?;
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(payload.len() + 9);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.push(b'\n');

        self.out.write_all(&frame)?;
        self.out.flush()?;
        if self.policy == FsyncPolicy::Always {
            self.out.get_ref().sync_all()?;
        }
        self.appended += 1;
        Ok(())
    }

    /// Flush and `sync_all` regardless of policy.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }

    /// Records appended through this handle.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Replay all valid entries from a WAL file, in append order.
    /// Stops at the first truncated or CRC-mismatched frame.
    pub fn replay<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, WalError> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay `path`, cut off anything after the last intact frame and open
    /// it for appending. New frames never land behind a torn tail.
    pub fn recover<T: DeserializeOwned>(
        path: &Path,
        policy: FsyncPolicy,
    ) -> Result<(Self, Vec<T>), WalError> {
        let (records, good_len) = Self::scan(path)?;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > good_len {
                tracing::warn!(
                    "truncating {:?} from {} to {} bytes",
                    path,
                    meta.len(),
                    good_len
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(good_len)?;
                file.sync_all()?;
            }
        }
        Ok((Self::open(path, policy)?, records))
    }

    /// Intact records plus the byte length they occupy.
    fn scan<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, u64), WalError> {
        let mut reader = match File::open(path) {
            Ok(file) => BufReader::new(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        let mut good_len = 0u64;

        loop {
            let mut header = [0u8; 8];
            match read_frame_part(&mut reader, &mut header, records.len())? {
                FrameRead::Complete => {}
                FrameRead::Eof => break,
            }
            let expected_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

            // payload plus trailing newline
            let mut body = vec![0u8; len + 1];
            if let FrameRead::Eof = read_frame_part(&mut reader, &mut body, records.len())? {
                tracing::warn!("{:?} ends in a torn record after {} records", path, records.len());
                break;
            }
            let payload = &body[..len];

            let actual_crc = crc32fast::hash(payload);
            if actual_crc != expected_crc {
                tracing::warn!(
                    "checksum mismatch in {:?} at record {} ({:#010x} != {:#010x}); ignoring the rest",
                    path,
                    records.len(),
                    actual_crc,
                    expected_crc
                );
                break;
            }

            records.push(serde_json::from_slice(payload)?);
            good_len += (header.len() + body.len()) as u64;
        }

        Ok((records, good_len))
    }
}

enum FrameRead {
    Complete,
    Eof,
}

fn read_frame_part(
    reader: &mut impl Read,
    buf: &mut [u8],
    entry: usize,
) -> Result<FrameRead, WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(FrameRead::Complete),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            tracing::debug!("log ends after {} records", entry);
            Ok(FrameRead::Eof)
        }
        Err(e) => Err(WalError::Io(e)),
    }
}
