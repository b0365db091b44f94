//! File-backed recording store.
//!
//! Every recording owns exactly one log file in the data directory, named after the
//! recording. Motion logs are append-only CSV with a `timestamp,x,y,z` header; heart
//! rate logs hold one comma-joined line and are replaced wholesale.
//!
//! The store is not synchronized. It is owned by the writer task, which serializes
//! every append, write, and rewrite (see [`crate::writer`]).

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::types::{MOTION_LOG_HEADER, MotionRow, heart_rate_line, validate_recording_name};

/// Prefix of the scratch file a log is staged in before an atomic replace.
const TEMP_PREFIX: &str = ".tmp-";

/// Storage engine for recording logs, rooted at one directory.
#[derive(Debug)]
pub struct RecordingStore {
    root: PathBuf,
}

impl RecordingStore {
    /// Open the store rooted at `root`, creating the directory if needed.
    ///
    /// Leftover scratch files from an interrupted rewrite are removed; the log they
    /// were meant to replace is still intact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be created or listed.
    pub fn open(root: &Path) -> Result<RecordingStore, Error> {
        std::fs::create_dir_all(root)?;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                tracing::warn!(path = %entry.path().display(), "Removing stale scratch file");
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(RecordingStore {
            root: root.to_path_buf(),
        })
    }

    /// Directory the store writes into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the log file for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordingName`] if `name` cannot be used as a file name.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, Error> {
        validate_recording_name(name)?;
        Ok(self.root.join(name))
    }

    /// Append motion rows to the log of `name`, creating it with a header if absent.
    ///
    /// All rows are written with one `write_all` and made durable with `sync_data`
    /// before returning, so a batch is never partially acknowledged. A trailing
    /// partial line left by an earlier crash is cut off before writing, and a failed
    /// write or sync is rolled back to the previous length, so the log only ever
    /// holds whole lines.
    ///
    /// # Returns
    ///
    /// The number of bytes appended, header included.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordingName`] for an unusable name and
    /// [`Error::Storage`] if the file cannot be opened, written, or synced.
    pub fn append_motion(&mut self, name: &str, rows: &[MotionRow]) -> Result<usize, Error> {
        let path = self.path_for(name)?;
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let good_len = complete_len(&mut file, len)?;
        if good_len < len {
            tracing::warn!(
                recording = %name,
                offset = good_len,
                dropped = len - good_len,
                "Truncating partial trailing line"
            );
            file.set_len(good_len)?;
        }
        let created = good_len == 0;

        let mut buf = String::new();
        if created {
            buf.push_str(MOTION_LOG_HEADER);
            buf.push('\n');
        }
        for row in rows {
            buf.push_str(&row.to_line());
            buf.push('\n');
        }

        if let Err(e) = file.write_all(buf.as_bytes()).and_then(|()| file.sync_data()) {
            if let Err(rollback) = file.set_len(good_len) {
                tracing::warn!(
                    recording = %name,
                    offset = good_len,
                    error = %rollback,
                    "Failed to roll back partial append"
                );
            }
            return Err(e.into());
        }
        if created {
            self.sync_dir()?;
        }
        Ok(buf.len())
    }

    /// Write the heart-rate log of `name` as a single comma-joined line.
    ///
    /// An existing log is replaced atomically: readers see either the old or the new
    /// contents, never a mix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordingName`] for an unusable name and
    /// [`Error::Storage`] on any I/O failure.
    pub fn write_heart_rate(&mut self, name: &str, samples: &[u8]) -> Result<usize, Error> {
        let mut line = heart_rate_line(samples);
        line.push('\n');
        self.rewrite(name, &line)?;
        Ok(line.len())
    }

    /// Read the whole log of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the log does not exist or is not valid UTF-8.
    pub fn read_log(&self, name: &str) -> Result<String, Error> {
        let path = self.path_for(name)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Atomically replace the log of `name` with `contents`.
    ///
    /// The contents are staged in a scratch file in the same directory, synced, and
    /// renamed over the log; the directory is then synced so the rename is durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on any I/O failure. The scratch file is removed on
    /// a failed write; the original log is left untouched.
    pub fn rewrite(&mut self, name: &str, contents: &str) -> Result<(), Error> {
        let path = self.path_for(name)?;
        let temp = self.root.join(format!("{TEMP_PREFIX}{name}"));

        let staged = (|| -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        })();
        if let Err(e) = staged {
            match std::fs::remove_file(&temp) {
                Ok(()) => {}
                Err(rm) if rm.kind() == ErrorKind::NotFound => {}
                Err(rm) => tracing::warn!(path = %temp.display(), error = %rm, "Failed to remove scratch file"),
            }
            return Err(e.into());
        }

        std::fs::rename(&temp, &path)?;
        self.sync_dir()
    }

    fn sync_dir(&self) -> Result<(), Error> {
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

/// Length of `file` up to and including its last newline.
///
/// Scans backwards from `len` in fixed-size chunks; returns `len` when the file
/// already ends on a line boundary and 0 when it holds no newline at all.
fn complete_len(file: &mut File, len: u64) -> std::io::Result<u64> {
    let mut buf = [0u8; 4096];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}
