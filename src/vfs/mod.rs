//! Minimal virtual filesystem surface consumed by the read/write
//! operators.
//!
//! The engine core only needs globbing with size prefix sums (so a byte
//! range of the whole input maps to file offsets), seekable read streams
//! and sequential write streams. This module implements the surface over
//! the local filesystem; remote stores and compression codecs are
//! external collaborators implementing the same shapes. Files whose
//! format forbids seeking (detected by extension) are flagged, and
//! readers must treat them as one indivisible range.

use crate::error::{Error, Result};
use std::fs;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One globbed input file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    /// Exclusive prefix sum of sizes over the file list: the global byte
    /// offset at which this file starts.
    pub size_prefix: u64,
    /// False for compressed files, which cannot be split at byte
    /// granularity.
    pub can_seek: bool,
}

/// The globbed input set, ordered by path.
#[derive(Clone, Debug, Default)]
pub struct FileList {
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

fn is_compressed(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("gz" | "bz2" | "xz" | "zst")
    )
}

/// Expand a glob pattern into a sorted file list with size prefix sums.
pub fn glob_files(pattern: &str) -> Result<FileList> {
    let paths = glob::glob(pattern)
        .map_err(|e| Error::Config(format!("bad glob pattern {pattern:?}: {e}")))?;
    let mut files = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| Error::Io(e.into_error()))?;
        if !path.is_file() {
            continue;
        }
        let size = fs::metadata(&path)?.len();
        files.push(FileInfo {
            can_seek: !is_compressed(&path),
            path,
            size,
            size_prefix: 0,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    let mut prefix = 0u64;
    for f in &mut files {
        f.size_prefix = prefix;
        prefix += f.size;
    }
    Ok(FileList {
        files,
        total_size: prefix,
    })
}

/// Seekable byte stream over one input file.
pub struct ReadStream {
    file: fs::File,
}

impl ReadStream {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(ReadStream {
            file: fs::File::open(path)?,
        })
    }

    pub fn lseek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl Read for ReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// Buffered sequential write stream.
pub struct WriteStream {
    inner: BufWriter<fs::File>,
}

impl WriteStream {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(WriteStream {
            inner: BufWriter::new(fs::File::create(path)?),
        })
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Derive a per-worker output path: a run of `#` in the file name is
/// replaced by the zero-padded worker rank, otherwise the rank is
/// appended before the extension.
pub fn fill_file_pattern(pattern: &str, rank: usize) -> PathBuf {
    if let Some(start) = pattern.find('#') {
        let end = pattern[start..]
            .find(|c| c != '#')
            .map_or(pattern.len(), |off| start + off);
        let width = end - start;
        return PathBuf::from(format!(
            "{}{:0width$}{}",
            &pattern[..start],
            rank,
            &pattern[end..]
        ));
    }
    let path = Path::new(pattern);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension()) {
        (Some(stem), Some(ext)) => {
            path.with_file_name(format!("{stem}-{rank}.{}", ext.to_string_lossy()))
        }
        _ => PathBuf::from(format!("{pattern}-{rank}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_filling() {
        assert_eq!(
            fill_file_pattern("out-####.txt", 7),
            PathBuf::from("out-0007.txt")
        );
        assert_eq!(
            fill_file_pattern("out.txt", 3),
            PathBuf::from("out-3.txt")
        );
    }
}
