//! Streamed file I/O for transfers.
//!
//! Receive side: `FileWriter` appends DTF payloads, flushes to durable
//! storage at sync points, and keeps a running SHA-256 over everything
//! written. Resume re-hashes the kept prefix so the final checksum covers
//! the whole file.
//!
//! Send side: `FileReader` yields chunks bounded by the negotiated max
//! entity size.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file already exists: {0}")]
    Collision(PathBuf),
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("directory not usable: {0}")]
    BadDirectory(String),
    #[error("resume offset {offset} is beyond the {len}-byte file")]
    BadResumeOffset { offset: u64, len: u64 },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Ensure a directory exists and is writable (probe file round-trip).
pub async fn validate_directory(path: &Path) -> Result<(), FileError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| FileError::BadDirectory(format!("{}: {}", path.display(), e)))?;
    let probe = path.join(".pesit-probe");
    tokio::fs::write(&probe, b"probe")
        .await
        .map_err(|e| FileError::BadDirectory(format!("{} not writable: {}", path.display(), e)))?;
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// FileWriter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FileWriter {
    file: File,
    path: PathBuf,
    bytes_written: u64,
    hasher: Sha256,
}

impl FileWriter {
    /// Create a fresh output file. An existing file at the path is a
    /// collision, not an overwrite.
    pub async fn create(path: &Path) -> Result<Self, FileError> {
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(FileError::Collision(path.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(FileWriter {
            file,
            path: path.to_owned(),
            bytes_written: 0,
            hasher: Sha256::new(),
        })
    }

    /// Reopen an existing file for resumption: bytes past `start_byte` are
    /// discarded, the kept prefix is re-hashed.
    pub async fn resume(path: &Path, start_byte: u64) -> Result<Self, FileError> {
        let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The previous attempt never got data to disk; start fresh
                // only when resuming from byte zero.
                if start_byte == 0 {
                    return Self::create(path).await;
                }
                return Err(FileError::NotFound(path.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        if start_byte > len {
            return Err(FileError::BadResumeOffset {
                offset: start_byte,
                len,
            });
        }

        file.set_len(start_byte).await?;
        file.seek(SeekFrom::Start(0)).await?;
        let hasher = hash_prefix(&mut file, start_byte).await?;
        file.seek(SeekFrom::Start(start_byte)).await?;

        Ok(FileWriter {
            file,
            path: path.to_owned(),
            bytes_written: start_byte,
            hasher,
        })
    }

    pub async fn append(&mut self, chunk: &[u8]) -> Result<(), FileError> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Flush to durable storage; called at every sync point.
    pub async fn sync(&mut self) -> Result<(), FileError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    /// Discard everything past `position` (peer-requested resync).
    pub async fn truncate_to(&mut self, position: u64) -> Result<(), FileError> {
        if position > self.bytes_written {
            return Err(FileError::BadResumeOffset {
                offset: position,
                len: self.bytes_written,
            });
        }
        self.file.flush().await?;
        self.file.set_len(position).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.hasher = hash_prefix(&mut self.file, position).await?;
        self.file.seek(SeekFrom::Start(position)).await?;
        self.bytes_written = position;
        Ok(())
    }

    /// Flush, sync, and return (total bytes, hex SHA-256).
    pub async fn finish(mut self) -> Result<(u64, String), FileError> {
        self.sync().await?;
        Ok((self.bytes_written, hex::encode(self.hasher.finalize())))
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn hash_prefix(file: &mut File, limit: u64) -> Result<Sha256, FileError> {
    let mut hasher = Sha256::new();
    let mut remaining = limit;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hasher)
}

// ---------------------------------------------------------------------------
// FileReader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FileReader {
    file: File,
    chunk_size: usize,
    file_size: u64,
    bytes_read: u64,
}

impl FileReader {
    pub async fn open(path: &Path, chunk_size: usize, start_byte: u64) -> Result<Self, FileError> {
        let mut file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileError::NotFound(path.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        let file_size = file.metadata().await?.len();
        if start_byte > file_size {
            return Err(FileError::BadResumeOffset {
                offset: start_byte,
                len: file_size,
            });
        }
        file.seek(SeekFrom::Start(start_byte)).await?;
        Ok(FileReader {
            file,
            chunk_size,
            file_size,
            bytes_read: start_byte,
        })
    }

    /// Next chunk of at most `chunk_size` bytes; `None` at end of file.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FileError> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        self.bytes_read += n as u64;
        Ok(Some(buf))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_finish_hashes_whole_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut w = FileWriter::create(&path).await.unwrap();
        w.append(b"hello ").await.unwrap();
        w.append(b"world").await.unwrap();
        let (bytes, checksum) = w.finish().await.unwrap();

        assert_eq!(bytes, 11);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");
        assert_eq!(checksum, hex::encode(Sha256::digest(b"hello world")));
    }

    #[tokio::test]
    async fn create_detects_collision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.bin");
        let _first = FileWriter::create(&path).await.unwrap();
        assert!(matches!(
            FileWriter::create(&path).await.unwrap_err(),
            FileError::Collision(_)
        ));
    }

    #[tokio::test]
    async fn resume_truncates_past_sync_point_and_rehashes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.bin");
        tokio::fs::write(&path, b"0123456789ABCDEF").await.unwrap();

        // Resume from byte 10: the tail "ABCDEF" is discarded.
        let mut w = FileWriter::resume(&path, 10).await.unwrap();
        assert_eq!(w.bytes_written(), 10);
        w.append(b"XY").await.unwrap();
        let (bytes, checksum) = w.finish().await.unwrap();

        assert_eq!(bytes, 12);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123456789XY");
        assert_eq!(checksum, hex::encode(Sha256::digest(b"0123456789XY")));
    }

    #[tokio::test]
    async fn resume_beyond_eof_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();
        assert!(matches!(
            FileWriter::resume(&path, 10).await.unwrap_err(),
            FileError::BadResumeOffset { .. }
        ));
    }

    #[tokio::test]
    async fn resume_from_zero_on_missing_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.bin");
        let mut w = FileWriter::resume(&path, 0).await.unwrap();
        w.append(b"x").await.unwrap();
        let (bytes, _) = w.finish().await.unwrap();
        assert_eq!(bytes, 1);
    }

    #[tokio::test]
    async fn truncate_to_discards_unsynced_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunc.bin");
        let mut w = FileWriter::create(&path).await.unwrap();
        w.append(b"0123456789").await.unwrap();
        w.truncate_to(4).await.unwrap();
        w.append(b"zz").await.unwrap();
        let (bytes, checksum) = w.finish().await.unwrap();
        assert_eq!(bytes, 6);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123zz");
        assert_eq!(checksum, hex::encode(Sha256::digest(b"0123zz")));
    }

    #[tokio::test]
    async fn reader_chunks_respect_bound_and_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("src.bin");
        tokio::fs::write(&path, vec![7u8; 2500]).await.unwrap();

        let mut r = FileReader::open(&path, 1024, 0).await.unwrap();
        assert_eq!(r.file_size(), 2500);
        let mut sizes = Vec::new();
        while let Some(chunk) = r.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 1024);
            sizes.push(chunk.len());
        }
        assert_eq!(sizes.iter().sum::<usize>(), 2500);

        let mut r = FileReader::open(&path, 1024, 2000).await.unwrap();
        let mut total = 0;
        while let Some(chunk) = r.next_chunk().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 500);
    }

    #[tokio::test]
    async fn reader_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FileReader::open(&dir.path().join("nope"), 1024, 0).await.unwrap_err(),
            FileError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn validate_directory_creates_and_probes() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("a/b");
        validate_directory(&sub).await.unwrap();
        assert!(sub.is_dir());
    }
}
