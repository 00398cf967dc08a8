//! Pool of reusable temporary files for spooled bodies.
//!
//! Files are unlinked right after creation so that only the open descriptor
//! keeps them alive; nothing is left on disk if the process dies.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// An anonymous temporary file and the number of bytes written to it.
#[derive(Debug)]
pub struct TempFile {
    file: File,
    len: u64,
}

impl TempFile {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `data`. Spool files live on local disk; the write is blocking.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }
}

#[derive(Debug)]
pub struct TempFiles {
    dir: PathBuf,
    max_spare: usize,
    spare: Vec<File>,
    counter: u64,
}

impl TempFiles {
    pub fn new(dir: impl Into<PathBuf>, max_spare: usize) -> Self {
        Self {
            dir: dir.into(),
            max_spare,
            spare: Vec::new(),
            counter: 0,
        }
    }

    pub fn spare_count(&self) -> usize {
        self.spare.len()
    }

    /// Hands out a spare file, or creates a new one.
    pub fn open(&mut self) -> io::Result<TempFile> {
        if let Some(file) = self.spare.pop() {
            tracing::debug!(spare = self.spare.len(), "Reusing temporary file");
            return Ok(TempFile { file, len: 0 });
        }

        let path = self
            .dir
            .join(format!("sentinel-{}-{:06}", std::process::id(), self.counter));
        self.counter += 1;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        std::fs::remove_file(&path)?;

        tracing::debug!(path = %path.display(), "Created temporary file");
        Ok(TempFile { file, len: 0 })
    }

    /// Takes a file back; it is emptied and kept unless the pool is full.
    pub fn release(&mut self, tmp: TempFile) {
        if self.spare.len() >= self.max_spare {
            return;
        }

        let mut file = tmp.file;
        let reset = file.set_len(0).and_then(|_| file.seek(SeekFrom::Start(0)));
        match reset {
            Ok(_) => self.spare.push(file),
            Err(e) => tracing::debug!(error = %e, "Dropping temporary file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_files_are_reused_up_to_the_limit() {
        let mut pool = TempFiles::new(std::env::temp_dir(), 1);

        let mut a = pool.open().unwrap();
        a.write(b"hello").unwrap();
        assert_eq!(a.len(), 5);
        let b = pool.open().unwrap();

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.spare_count(), 1);

        let reused = pool.open().unwrap();
        assert!(reused.is_empty());
        assert_eq!(reused.file().metadata().unwrap().len(), 0);
        assert_eq!(pool.spare_count(), 0);
    }
}
