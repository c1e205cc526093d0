//! Whole-tree archive container.
//!
//! Bundles every file under a directory into one stream. All integers are
//! little-endian:
//!
//! ```text
//! i64  total payload bytes
//! i32  file count
//! repeated file count times:
//!     i32  path length
//!     u8[] UTF-8 path, '/' separated, relative to the root
//!     i64  file length
//!     u8[] file bytes
//! u8[64]   SHA-512 of every preceding byte
//! ```
//!
//! Extraction is all-or-nothing: on any failure or cancellation everything
//! extracted so far is removed and the destination is left as it was found.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::UpdateError;
use crate::integrity::{digests_match, DigestReader, DigestWriter, HASH_BUFFER_SIZE};
use crate::progress::{Outcome, ProgressReporter};
use crate::relpath::{self, MAX_RELATIVE_PATH_LEN};
use crate::trust::DIGEST_LEN;

/// Counts describing a written or extracted archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Sum of all file lengths
    pub total_bytes: u64,
    /// Number of file entries
    pub file_count: u32,
}

struct SourceFile {
    relative_path: String,
    path: PathBuf,
    length: u64,
}

/// Write every file under `root` into `writer`.
///
/// Progress is reported as cumulative file bytes against the total.
/// Cancellation is checked before each file; a canceled write leaves a
/// truncated stream that must be discarded.
pub fn write_archive<W: Write>(
    root: &Path,
    writer: W,
    progress: &dyn ProgressReporter,
) -> Result<Outcome<ArchiveSummary>, UpdateError> {
    if !root.is_dir() {
        return Err(UpdateError::DirectoryNotFound(root.to_path_buf()));
    }

    let files = collect_files(root)?;
    let total_bytes: u64 = files.iter().map(|file| file.length).sum();
    let file_count = i32::try_from(files.len())
        .map_err(|_| UpdateError::InvalidOperation("too many files for one archive".to_string()))?;
    let declared_total = i64::try_from(total_bytes)
        .map_err(|_| UpdateError::InvalidOperation("archive too large".to_string()))?;

    progress.set_maximum(declared_total);
    progress.set_progress(0);

    let mut out = DigestWriter::new(BufWriter::new(writer));
    out.write_all(&declared_total.to_le_bytes())?;
    out.write_all(&file_count.to_le_bytes())?;

    let mut written = 0u64;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    for file in &files {
        if progress.was_canceled() {
            debug!("Archive write canceled");
            return Ok(Outcome::Cancelled);
        }
        progress.set_caption(&file.relative_path);

        let path_bytes = file.relative_path.as_bytes();
        out.write_all(&(path_bytes.len() as i32).to_le_bytes())?;
        out.write_all(path_bytes)?;
        out.write_all(&(file.length as i64).to_le_bytes())?;

        let mut input = File::open(&file.path)?.take(file.length);
        let mut copied = 0u64;
        loop {
            let n = input.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
            copied += n as u64;
            progress.set_progress((written + copied) as i64);
        }
        if copied != file.length {
            return Err(UpdateError::SizeMismatch {
                expected: file.length,
                actual: copied,
            });
        }
        written += copied;
    }

    let (mut inner, _, digest) = out.finish();
    inner.write_all(&digest)?;
    inner.flush()?;

    info!(files = files.len(), bytes = total_bytes, "Archive written");
    Ok(Outcome::Completed(ArchiveSummary {
        total_bytes,
        file_count: file_count as u32,
    }))
}

/// Convenience wrapper writing the archive to a file.
pub fn write_archive_file(
    root: &Path,
    target: &Path,
    progress: &dyn ProgressReporter,
) -> Result<Outcome<ArchiveSummary>, UpdateError> {
    let file = File::create(target)?;
    let outcome = write_archive(root, file, progress);
    if !matches!(outcome, Ok(Outcome::Completed(_))) {
        let _ = fs::remove_file(target);
    }
    outcome
}

fn collect_files(root: &Path) -> Result<Vec<SourceFile>, UpdateError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            UpdateError::IoError(e.into_io_error().unwrap_or_else(|| {
                io::Error::new(ErrorKind::Other, "directory walk failed")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative_path = relpath::from_native(root, entry.path()).ok_or_else(|| {
            UpdateError::InvalidOperation(format!(
                "cannot archive {}: path is not valid UTF-8",
                entry.path().display()
            ))
        })?;
        relpath::validate(&relative_path).map_err(UpdateError::InvalidOperation)?;

        let length = entry
            .metadata()
            .map_err(|e| UpdateError::InvalidOperation(e.to_string()))?
            .len();
        files.push(SourceFile {
            relative_path,
            path: entry.into_path(),
            length,
        });
    }
    Ok(files)
}

/// Extract an archive from `reader` into `destination`.
///
/// `destination` must be absent or an empty directory. Every entry path is
/// validated before anything is written. The cumulative payload must equal
/// the declared total and the trailing digest must match.
pub fn extract_archive<R: Read>(
    reader: R,
    destination: &Path,
    progress: &dyn ProgressReporter,
) -> Result<Outcome<ArchiveSummary>, UpdateError> {
    let created = prepare_destination(destination)?;
    let guard = ExtractionGuard {
        destination: destination.to_path_buf(),
        created,
        done: false,
    };

    let mut input = DigestReader::new(BufReader::new(reader));
    let outcome = extract_entries(&mut input, destination, progress)?;
    let summary = match outcome {
        Outcome::Completed(summary) => summary,
        Outcome::Cancelled => {
            debug!(path = %destination.display(), "Extraction canceled");
            return Ok(Outcome::Cancelled);
        }
    };

    let computed = input.digest();
    let mut trailer = [0u8; DIGEST_LEN];
    read_exact_or_truncated(input.inner_mut(), &mut trailer, summary.total_bytes, summary.total_bytes)?;
    if !digests_match(&computed, &trailer) {
        return Err(UpdateError::ArchiveCorrupt("archive digest mismatch".to_string()));
    }
    let mut probe = [0u8; 1];
    if input.inner_mut().read(&mut probe)? != 0 {
        return Err(UpdateError::ArchiveCorrupt("trailing data after digest".to_string()));
    }

    guard.disarm();
    info!(
        path = %destination.display(),
        files = summary.file_count,
        bytes = summary.total_bytes,
        "Archive extracted"
    );
    Ok(Outcome::Completed(summary))
}

/// Convenience wrapper extracting from a file.
pub fn extract_archive_file(
    source: &Path,
    destination: &Path,
    progress: &dyn ProgressReporter,
) -> Result<Outcome<ArchiveSummary>, UpdateError> {
    extract_archive(File::open(source)?, destination, progress)
}

fn extract_entries<R: Read>(
    input: &mut DigestReader<R>,
    destination: &Path,
    progress: &dyn ProgressReporter,
) -> Result<Outcome<ArchiveSummary>, UpdateError> {
    let mut total_field = [0u8; 8];
    read_exact_or_truncated(input, &mut total_field, 0, 0)?;
    let declared_total = i64::from_le_bytes(total_field);
    let mut count_field = [0u8; 4];
    read_exact_or_truncated(input, &mut count_field, 0, 0)?;
    let file_count = i32::from_le_bytes(count_field);
    if declared_total < 0 || file_count < 0 {
        return Err(UpdateError::ArchiveCorrupt("negative header value".to_string()));
    }
    let total_bytes = declared_total as u64;

    progress.set_maximum(declared_total);
    progress.set_progress(0);

    let mut seen = HashSet::new();
    let mut read = 0u64;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    for _ in 0..file_count {
        if progress.was_canceled() {
            return Ok(Outcome::Cancelled);
        }

        let mut len_bytes = [0u8; 4];
        read_exact_or_truncated(input, &mut len_bytes, total_bytes, read)?;
        let path_len = i32::from_le_bytes(len_bytes);
        if path_len <= 0 || path_len as usize > MAX_RELATIVE_PATH_LEN {
            return Err(UpdateError::ArchiveCorrupt(format!("invalid path length {}", path_len)));
        }

        let mut path_bytes = vec![0u8; path_len as usize];
        read_exact_or_truncated(input, &mut path_bytes, total_bytes, read)?;
        let relative_path = String::from_utf8(path_bytes)
            .map_err(|_| UpdateError::ArchiveCorrupt("entry path is not UTF-8".to_string()))?;
        relpath::validate(&relative_path).map_err(UpdateError::ArchiveCorrupt)?;
        if !seen.insert(relative_path.clone()) {
            return Err(UpdateError::ArchiveCorrupt(format!("duplicate entry {}", relative_path)));
        }

        let mut len_bytes = [0u8; 8];
        read_exact_or_truncated(input, &mut len_bytes, total_bytes, read)?;
        let file_len = i64::from_le_bytes(len_bytes);
        if file_len < 0 || read + file_len as u64 > total_bytes {
            return Err(UpdateError::ArchiveTruncated {
                expected: total_bytes,
                actual: read.saturating_add(file_len.max(0) as u64),
            });
        }

        progress.set_caption(&relative_path);
        let target = relpath::to_native(destination, &relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = BufWriter::new(
            OpenOptions::new().write(true).create_new(true).open(&target)?,
        );

        let mut remaining = file_len as u64;
        while remaining > 0 {
            if progress.was_canceled() {
                return Ok(Outcome::Cancelled);
            }
            let want = remaining.min(buffer.len() as u64) as usize;
            let n = input.read(&mut buffer[..want])?;
            if n == 0 {
                return Err(UpdateError::ArchiveTruncated {
                    expected: total_bytes,
                    actual: read,
                });
            }
            output.write_all(&buffer[..n])?;
            remaining -= n as u64;
            read += n as u64;
            progress.set_progress(read as i64);
        }
        output.flush()?;
    }

    if read != total_bytes {
        return Err(UpdateError::ArchiveTruncated {
            expected: total_bytes,
            actual: read,
        });
    }

    Ok(Outcome::Completed(ArchiveSummary {
        total_bytes,
        file_count: file_count as u32,
    }))
}

fn read_exact_or_truncated<R: Read>(
    input: &mut R,
    buf: &mut [u8],
    expected: u64,
    actual: u64,
) -> Result<(), UpdateError> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            UpdateError::ArchiveTruncated { expected, actual }
        } else {
            UpdateError::IoError(e)
        }
    })
}

/// Returns whether the destination had to be created.
fn prepare_destination(destination: &Path) -> Result<bool, UpdateError> {
    match fs::symlink_metadata(destination) {
        Ok(metadata) => {
            if !metadata.is_dir() || fs::read_dir(destination)?.next().is_some() {
                return Err(UpdateError::DestinationNotEmpty(destination.to_path_buf()));
            }
            Ok(false)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(destination)?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Restores the destination unless extraction completed.
struct ExtractionGuard {
    destination: PathBuf,
    created: bool,
    done: bool,
}

impl ExtractionGuard {
    fn disarm(mut self) {
        self.done = true;
    }
}

impl Drop for ExtractionGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let result = if self.created {
            fs::remove_dir_all(&self.destination)
        } else {
            clear_directory(&self.destination)
        };
        if let Err(e) = result {
            warn!(path = %self.destination.display(), error = %e, "Could not clean up extraction");
        }
    }
}

fn clear_directory(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
