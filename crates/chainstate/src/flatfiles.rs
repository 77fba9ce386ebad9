//! Append-only numbered data files holding raw block and undo payloads.
//! Records are length-prefixed; whole files are the unit of deletion when
//! pruning.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flat file location"),
            FlatFileError::LengthMismatch => write!(f, "flat file length mismatch"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    state: Mutex<AppendCursor>,
}

#[derive(Debug)]
struct AppendCursor {
    current_file: u32,
    current_len: u64,
}

impl FlatFileStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            state: Mutex::new(AppendCursor {
                current_file,
                current_len,
            }),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let mut state = self.state.lock().expect("flat file cursor lock");
        let needed = 4u64 + bytes.len() as u64;
        if state.current_len > 0 && state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = bytes.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let stored_len = u32::from_le_bytes(len_bytes);
        if stored_len != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Removes a whole numbered file. Already-absent files are not an error
    /// so a retried prune converges.
    pub fn delete_file(&self, file_id: u32) -> Result<(), FlatFileError> {
        match std::fs::remove_file(self.file_path(file_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn file_size(&self, file_id: u32) -> Option<u64> {
        std::fs::metadata(self.file_path(file_id))
            .ok()
            .map(|metadata| metadata.len())
    }

    /// Numbered files currently on disk, ascending. Pruning leaves holes,
    /// so the list is not necessarily contiguous.
    pub fn existing_files(&self) -> Result<Vec<u32>, FlatFileError> {
        let mut ids = scan_file_ids(&self.dir, &self.prefix)?;
        ids.sort_unstable();
        Ok(ids)
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(file_name(&self.prefix, file_id))
    }
}

fn file_name(prefix: &str, file_id: u32) -> String {
    format!("{prefix}{file_id:05}.dat")
}

fn scan_file_ids(dir: &Path, prefix: &str) -> Result<Vec<u32>, FlatFileError> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let digits = match name.strip_prefix(prefix).and_then(|s| s.strip_suffix(".dat")) {
            Some(digits) => digits,
            None => continue,
        };
        if let Ok(file_id) = digits.parse::<u32>() {
            ids.push(file_id);
        }
    }
    Ok(ids)
}

fn locate_active_file(
    dir: &Path,
    prefix: &str,
    max_file_size: u64,
) -> Result<(u32, u64), FlatFileError> {
    let ids = scan_file_ids(dir, prefix)?;
    let last = match ids.into_iter().max() {
        Some(last) => last,
        None => return Ok((0, 0)),
    };
    let len = std::fs::metadata(dir.join(file_name(prefix, last)))?.len();
    if len >= max_file_size {
        Ok((last + 1, 0))
    } else {
        Ok((last, len))
    }
}
