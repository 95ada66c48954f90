//! Atomic output files and path-tagged file opening.
//!
//! A failed run must never leave a half-written file at its final path.
//! All writers in this crate go through [`AtomicFile`]: content is written
//! to a sibling temporary path and renamed over the destination only on
//! commit. Dropping an uncommitted `AtomicFile` removes the temporary.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Open a file for buffered reading, tagging errors with the path.
pub fn open_read(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;
    Ok(BufReader::new(file))
}

/// Copy `src` to `dst` through a temporary file.
///
/// An interrupted copy must never leave a partial file at `dst`.
pub fn atomic_copy(src: &Path, dst: &Path) -> Result<()> {
    let mut reader = open_read(src)?;
    let mut out = AtomicFile::create(dst)?;
    io::copy(&mut reader, out.writer())?;
    out.commit()
}

/// An output file that only reaches its final path on [`commit`]
/// (AtomicFile::commit).
pub struct AtomicFile {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    /// Start writing the file that will become `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        let file = File::create(&tmp_path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", tmp_path.display())))?;
        Ok(Self {
            final_path: path.to_path_buf(),
            tmp_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// The buffered writer for the temporary file.
    pub fn writer(&mut self) -> &mut BufWriter<File> {
        self.writer.as_mut().expect("AtomicFile already committed")
    }

    /// Flush, sync and rename into place.
    pub fn commit(mut self) -> Result<()> {
        let mut writer = self.writer.take().expect("AtomicFile already committed");
        writer.flush()?;
        writer.get_mut().sync_all()?;
        drop(writer);
        fs::rename(&self.tmp_path, &self.final_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "rename {} -> {}: {e}",
                    self.tmp_path.display(),
                    self.final_path.display()
                ),
            )
        })?;
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.writer.is_some() {
            // Uncommitted: the temporary must not survive.
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
