//! Article writer: persists decoded bytes and assembles completed files
//!
//! Two modes:
//! - **Temp mode**: each article writes sequentially to
//!   `<temp_dir>/<file-id>.<part>.tmp`; on file completion the fragments are
//!   concatenated in part order into the destination.
//! - **Direct-write mode**: a sparse output file
//!   `<dest_dir>/<file-id>.out.tmp` of the full declared size is created once
//!   per file (serialised by the file's output lock); each article writes at
//!   its declared segment offset. Segments are disjoint, so write order
//!   across articles is irrelevant.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::decoder::crc32_combine;
use crate::queue::{ArticleState, CompletedFile, CompletedFileStatus, FileInfo};
use crate::types::FileId;

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(unix)]
fn write_all_at(file: &fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(windows)]
fn write_all_at(file: &fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

/// Temp fragment path for one article
pub fn fragment_path(temp_dir: &Path, file_id: FileId, part_number: u32) -> PathBuf {
    temp_dir.join(format!("{file_id}.{part_number}.tmp"))
}

/// Direct-write output path for one file
pub fn output_path(dest_dir: &Path, file_id: FileId) -> PathBuf {
    dest_dir.join(format!("{file_id}.out.tmp"))
}

enum WriterDest {
    Temp {
        file: fs::File,
        path: PathBuf,
    },
    Direct {
        file: fs::File,
        /// Next write position within the output file
        cursor: u64,
    },
}

/// Writes one article's decoded bytes to disk
pub struct ArticleWriter {
    temp_dir: PathBuf,
    dest_dir: PathBuf,
    direct_write: bool,
    file_id: FileId,
    part_number: u32,
    /// Serialises first-time sparse-file creation (cloned from the FileInfo)
    output_lock: Arc<Mutex<()>>,
    dest: Option<WriterDest>,
}

impl ArticleWriter {
    /// Prepare a writer for one article; nothing touches disk until
    /// [`ArticleWriter::start`].
    pub fn new(
        temp_dir: PathBuf,
        dest_dir: PathBuf,
        direct_write: bool,
        file_id: FileId,
        part_number: u32,
        output_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            temp_dir,
            dest_dir,
            direct_write,
            file_id,
            part_number,
            output_lock,
            dest: None,
        }
    }

    /// Open the destination. In direct-write mode the sparse output file is
    /// allocated to `file_size` bytes on first use (under the file's output
    /// lock) and the write cursor seeks to `offset`.
    pub fn start(&mut self, file_size: u64, offset: u64) -> std::io::Result<()> {
        if self.dest.is_some() {
            return Ok(());
        }
        if self.direct_write {
            let path = output_path(&self.dest_dir, self.file_id);
            let file = {
                let _guard = self.output_lock.lock().expect("output lock poisoned");
                let created = !path.exists();
                let file = fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&path)?;
                if created && file_size > 0 {
                    file.set_len(file_size)?;
                }
                file
            };
            self.dest = Some(WriterDest::Direct {
                file,
                cursor: offset,
            });
        } else {
            let path = fragment_path(&self.temp_dir, self.file_id, self.part_number);
            let file = fs::File::create(&path)?;
            self.dest = Some(WriterDest::Temp { file, path });
        }
        Ok(())
    }

    /// Append decoded bytes
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.dest.as_mut() {
            Some(WriterDest::Temp { file, .. }) => {
                use std::io::Write;
                file.write_all(data)
            }
            Some(WriterDest::Direct { file, cursor }) => {
                write_all_at(file, data, *cursor)?;
                *cursor += data.len() as u64;
                Ok(())
            }
            None => Err(std::io::Error::other("writer not started")),
        }
    }

    /// Close the fragment/output. On success in temp mode, returns the
    /// fragment path to record on the ArticleInfo; a failed fragment is
    /// deleted.
    pub fn finish(&mut self, ok: bool) -> Option<PathBuf> {
        match self.dest.take() {
            Some(WriterDest::Temp { file, path }) => {
                drop(file);
                if ok {
                    Some(path)
                } else {
                    let _ = fs::remove_file(&path);
                    None
                }
            }
            Some(WriterDest::Direct { .. }) | None => None,
        }
    }

    /// Whether [`ArticleWriter::start`] already ran
    pub fn started(&self) -> bool {
        self.dest.is_some()
    }
}

/// Outcome of assembling one file
pub struct AssembledFile {
    /// The recorded completion entry
    pub completed: CompletedFile,
    /// Where the assembled file ended up
    pub path: PathBuf,
}

/// Assemble a file whose articles are all terminal.
///
/// In temp mode the successful fragments are concatenated in part order; in
/// direct-write mode the sparse output file is renamed into place. The file
/// CRC is combined from per-part CRCs. Leftover fragments are deleted.
pub fn complete_file_parts(
    file: &FileInfo,
    dest_dir: &Path,
    temp_dir: &Path,
    direct_write: bool,
) -> std::io::Result<AssembledFile> {
    fs::create_dir_all(dest_dir)?;
    let final_path = unique_dest_path(dest_dir, &file.filename);

    let success = file.success_articles;
    let status = if success == file.total_articles {
        CompletedFileStatus::Success
    } else if success > 0 {
        CompletedFileStatus::Partial
    } else {
        CompletedFileStatus::Failure
    };

    // Combine per-part CRCs in part order. Holes (failed articles) poison the
    // combination, so a partial file reports the CRC of what was written up
    // to the first hole.
    let mut crc = 0u32;
    let mut combined_len = 0u64;
    let mut hole_seen = false;
    for article in &file.articles {
        if article.state != ArticleState::Finished || hole_seen {
            if article.state != ArticleState::Finished {
                hole_seen = true;
            }
            continue;
        }
        if combined_len == 0 {
            crc = article.crc;
        } else {
            crc = crc32_combine(crc, article.crc, article.segment_size);
        }
        combined_len += article.segment_size;
    }

    if direct_write {
        let tmp = file
            .output_filename
            .clone()
            .unwrap_or_else(|| output_path(dest_dir, file.id));
        if status == CompletedFileStatus::Failure {
            let _ = fs::remove_file(&tmp);
        } else if tmp.exists() {
            fs::rename(&tmp, &final_path)?;
        } else {
            // A zero-byte file never opened its output
            fs::File::create(&final_path)?;
        }
    } else {
        if status != CompletedFileStatus::Failure {
            let mut out = fs::File::create(&final_path)?;
            for article in &file.articles {
                let Some(result_path) = &article.result_path else {
                    continue;
                };
                let mut fragment = fs::File::open(result_path)?;
                std::io::copy(&mut fragment, &mut out)?;
            }
            use std::io::Write;
            out.flush()?;
        }
        // Fragments are consumed (or worthless) either way
        for article in &file.articles {
            if let Some(result_path) = &article.result_path {
                let _ = fs::remove_file(result_path);
            }
            let _ = fs::remove_file(fragment_path(temp_dir, file.id, article.part_number));
        }
    }

    tracing::info!(
        file_id = %file.id,
        filename = %file.filename,
        ?status,
        crc = format_args!("{crc:08x}"),
        "file assembled"
    );

    Ok(AssembledFile {
        completed: CompletedFile {
            filename: final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.filename.clone()),
            status,
            crc,
        },
        path: final_path,
    })
}

/// Relocate already-completed files after the destination directory changed.
/// Renames when possible, falls back to copy+unlink across filesystems.
pub fn move_completed_files(
    completed: &[CompletedFile],
    old_dest_dir: &Path,
    new_dest_dir: &Path,
) -> std::io::Result<()> {
    if old_dest_dir == new_dest_dir {
        return Ok(());
    }
    fs::create_dir_all(new_dest_dir)?;
    for entry in completed {
        let from = old_dest_dir.join(&entry.filename);
        let to = new_dest_dir.join(&entry.filename);
        if !from.exists() {
            tracing::warn!(file = %entry.filename, "completed file missing during move");
            continue;
        }
        match fs::rename(&from, &to) {
            Ok(()) => {}
            Err(_) => {
                // Cross-device: copy then unlink
                fs::copy(&from, &to)?;
                fs::remove_file(&from)?;
            }
        }
    }
    Ok(())
}

/// Append a line to the human-readable broken-log in the destination
/// directory, recording a file that completed damaged.
pub fn append_broken_log(dest_dir: &Path, filename: &str, status: CompletedFileStatus) {
    let line = format!(
        "{}\t{}\t{:?}\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
        filename,
        status
    );
    let path = dest_dir.join("_brokenlog.txt");
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut log| {
            use std::io::Write;
            log.write_all(line.as_bytes())
        });
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "could not append broken-log");
    }
}

/// Delete every on-disk trace of one file: fragments, direct-write output,
/// per-file state.
pub fn discard_file_data(file: &FileInfo, dest_dir: &Path, temp_dir: &Path) {
    for article in &file.articles {
        if let Some(result_path) = &article.result_path {
            let _ = fs::remove_file(result_path);
        }
        let _ = fs::remove_file(fragment_path(temp_dir, file.id, article.part_number));
    }
    if let Some(output) = &file.output_filename {
        let _ = fs::remove_file(output);
    }
    let _ = fs::remove_file(output_path(dest_dir, file.id));
}

/// Pick a destination path that does not clobber an existing file
fn unique_dest_path(dest_dir: &Path, filename: &str) -> PathBuf {
    let candidate = dest_dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    for n in 1.. {
        let candidate = dest_dir.join(format!("{filename}.duplicate{n}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("duplicate counter exhausted")
}
