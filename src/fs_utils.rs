use crate::error::{Result, SfiError};
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Bytes requested from the source per read call
pub const READ_UNIT: usize = 8192;

/// Capacity a fresh buffer starts with
pub const INITIAL_CAPACITY: usize = 2 * READ_UNIT;

/// Capacity added whenever the headroom drops below one read unit
pub const GROWTH_STEP: usize = READ_UNIT;

/// Where a document is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The process' standard input
    Stdin,
    /// A file on disk
    Path(PathBuf),
}

impl Source {
    /// Builds a source from an optional name; `None` and `-` mean standard input.
    pub fn from_name(name: Option<&Path>) -> Self {
        match name {
            Some(path) if path != Path::new("-") => Self::Path(path.to_path_buf()),
            _ => Self::Stdin,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("<stdin>"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Contents of one whole source, followed by a NUL sentinel.
///
/// The backing storage always holds at least `len() + 1` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// The document bytes, without the sentinel
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    pub fn len(&self) -> usize {
        self.data.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes allocated for the buffer, sentinel included
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

/// Reads everything `reader` yields into a single [`Buffer`].
///
/// Storage starts at [`INITIAL_CAPACITY`] and grows by [`GROWTH_STEP`] as soon
/// as fewer than [`READ_UNIT`] + 1 bytes of headroom remain, so every read
/// has a full unit to land in and the sentinel always fits.
///
/// # Errors
///
/// Returns the first read error other than `Interrupted`.
pub fn read_to_buffer<R: Read>(mut reader: R) -> io::Result<Buffer> {
    let mut data = vec![0u8; INITIAL_CAPACITY];
    let mut len = 0;

    loop {
        let read = match reader.read(&mut data[len..len + READ_UNIT]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        len += read;
        if len + READ_UNIT + 1 > data.len() {
            data.resize(data.len() + GROWTH_STEP, 0);
            trace!(len, capacity = data.len(), "grew read buffer");
        }
    }

    data[len] = 0;
    data.truncate(len + 1);
    Ok(Buffer { data })
}

/// Reads a whole source into memory
///
/// # Errors
///
/// - `SfiError::Open` if the file cannot be opened.
/// - `SfiError::Read` if reading fails after the source was opened.
pub fn read_source(source: &Source) -> Result<Buffer> {
    let result = match source {
        Source::Stdin => read_to_buffer(io::stdin().lock()),
        Source::Path(path) => {
            let file = File::open(path).map_err(|e| SfiError::Open {
                path: path.clone(),
                source: e,
            })?;
            read_to_buffer(file)
        }
    };

    result.map_err(|e| SfiError::Read {
        name: source.to_string(),
        source: e,
    })
}

/// Copies the half-open range `start..end` of `buffer`.
///
/// Returns `None` when the range is empty.
pub fn copy_chunk(buffer: &[u8], start: usize, end: usize) -> Option<Vec<u8>> {
    if end > start {
        Some(buffer[start..end].to_vec())
    } else {
        None
    }
}

/// Turns the raw text of a directive into the source it names.
///
/// The text is used verbatim. An empty directive names standard input. When
/// `base_dir` is set, relative names are resolved against it instead of the
/// working directory.
pub fn resolve_import(name: Option<Vec<u8>>, base_dir: Option<&Path>) -> Source {
    let Some(bytes) = name else {
        return Source::Stdin;
    };
    let path = path_from_bytes(bytes);
    match base_dir {
        Some(base) => Source::Path(base.join(path)),
        None => Source::Path(path),
    }
}

#[cfg(unix)]
fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from(String::from_utf8_lossy(&bytes).into_owned()))
}
