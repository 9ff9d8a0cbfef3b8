//! Atomic file replacement: write a temporary, fsync, rename over the
//! final path.
//!
//! The final path transitions atomically from its pre-commit content to
//! the post-commit content with no observable intermediate state. If the
//! writer is dropped without [`AtomicFileWriter::commit`], the temporary
//! is deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::Result;

/// Three-step durable file writer: temp → fsync → rename.
pub struct AtomicFileWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<BufWriter<File>>,
    committed: bool,
}

impl AtomicFileWriter {
    /// Opens a temporary file next to `final_path` for binary writing.
    ///
    /// Parent directories are created if missing. The temporary is named
    /// `<stem>.tmp.<6-digit-random><ext>` in the same directory, so the
    /// final rename never crosses a filesystem boundary.
    pub fn new(final_path: impl Into<PathBuf>) -> Result<Self> {
        let final_path = final_path.into();
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = Self::temp_path_for(&final_path);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path,
            final_path,
            file: Some(BufWriter::new(file)),
            committed: false,
        })
    }

    fn temp_path_for(final_path: &Path) -> PathBuf {
        let stem = final_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let extension = final_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let suffix: u32 = rand::rng().random_range(100_000..1_000_000);
        let name = format!("{stem}.tmp.{suffix}{extension}");
        match final_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
            _ => PathBuf::from(name),
        }
    }

    /// Path of the in-flight temporary file.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Path the content lands at on commit.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Flushes userspace buffers, fsyncs, and renames the temporary over
    /// the final path. Consumes the writer.
    pub fn commit(mut self) -> Result<()> {
        let writer = self
            .file
            .take()
            .expect("writer present until commit or abort");
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path)?;
        self.committed = true;
        Ok(())
    }

    /// Discards the temporary without touching the final path.
    pub fn abort(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        self.file = None;
        if !self.committed && self.temp_path.exists() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

impl Write for AtomicFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(io::Error::other("write after commit or abort")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use tempfile::tempdir;

    #[test]
    fn test_commit_replaces_final() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");
        fs::write(&target, b"old").unwrap();

        let mut writer = AtomicFileWriter::new(&target).unwrap();
        writer.write_all(b"new content").unwrap();
        writer.commit().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new content");
    }

    #[test]
    fn test_no_intermediate_state_before_commit() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");
        fs::write(&target, b"old").unwrap();

        let mut writer = AtomicFileWriter::new(&target).unwrap();
        writer.write_all(b"half-written").unwrap();
        writer.flush().unwrap();

        // Final path still holds the pre-commit content.
        assert_eq!(fs::read(&target).unwrap(), b"old");
        writer.abort();
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn test_drop_removes_temp() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.bin");

        let temp = {
            let mut writer = AtomicFileWriter::new(&target).unwrap();
            writer.write_all(b"doomed").unwrap();
            writer.temp_path().to_path_buf()
        };

        assert!(!temp.exists());
        assert!(!target.exists());
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c/out.bin");

        let mut writer = AtomicFileWriter::new(&target).unwrap();
        writer.write_u32::<LittleEndian>(0xDEAD_BEEF).unwrap();
        writer.commit().unwrap();

        assert!(target.exists());
    }

    #[test]
    fn test_temp_in_same_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("main.db");
        let writer = AtomicFileWriter::new(&target).unwrap();
        assert_eq!(writer.temp_path().parent(), target.parent());
        let name = writer.temp_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("main.tmp."), "{name}");
        writer.abort();
    }
}
