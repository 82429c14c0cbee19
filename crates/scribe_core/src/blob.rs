use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::ScribeError;

/// Filesystem store for uploaded audio, one file per job id under a single
/// root. Writes land in a `.part` sibling and are renamed into place, so a
/// reader never observes a half-written blob.
#[derive(Clone, Debug)]
pub struct BlobStore {
	root: PathBuf,
	max_bytes: u64,
}

impl BlobStore {
	pub async fn open_root(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, ScribeError> {
		let root = root.into();
		fs::create_dir_all(&root).await?;
		Ok(Self { root, max_bytes })
	}

	pub fn max_bytes(&self) -> u64 {
		self.max_bytes
	}

	/// Begin streaming a new blob. The returned writer enforces the size cap.
	pub async fn writer(&self, job_id: &str) -> Result<BlobWriter, ScribeError> {
		let id = sanitize_id(job_id)?;
		let final_path = self.root.join(&id);
		let part_path = self.root.join(format!("{id}.part"));
		let file = OpenOptions::new().create(true).truncate(true).write(true).open(&part_path).await?;
		Ok(BlobWriter {
			file,
			part_path,
			final_path,
			written: 0,
			max_bytes: self.max_bytes,
		})
	}

	/// Read a whole blob back. `BlobMissing` when the file is gone.
	pub async fn open(&self, job_id: &str) -> Result<Vec<u8>, ScribeError> {
		let id = sanitize_id(job_id)?;
		match fs::read(self.root.join(&id)).await {
			Ok(bytes) => Ok(bytes),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ScribeError::BlobMissing),
			Err(e) => Err(e.into()),
		}
	}

	/// Remove a blob if present. Missing files are not an error: deletion is
	/// invoked from both the worker and the janitor and they may race.
	pub async fn delete(&self, job_id: &str) -> Result<(), ScribeError> {
		let id = sanitize_id(job_id)?;
		for name in [id.clone(), format!("{id}.part")] {
			match fs::remove_file(self.root.join(&name)).await {
				Ok(()) => debug!(job_id = %id, "blob deleted"),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}

	/// Delete every blob whose mtime is older than `older_than`, returning
	/// the number removed. Covers `.part` leftovers from aborted uploads.
	pub async fn sweep(&self, older_than: Duration) -> Result<usize, ScribeError> {
		let cutoff = SystemTime::now().checked_sub(older_than);
		let mut removed = 0usize;
		let mut entries = fs::read_dir(&self.root).await?;
		while let Some(entry) = entries.next_entry().await? {
			let meta = match entry.metadata().await {
				Ok(m) => m,
				Err(_) => continue,
			};
			if !meta.is_file() {
				continue;
			}
			let stale = match (meta.modified().ok(), cutoff) {
				(Some(mtime), Some(cut)) => mtime < cut,
				_ => false,
			};
			if stale {
				if fs::remove_file(entry.path()).await.is_ok() {
					removed += 1;
				} else {
					warn!(path = %entry.path().display(), "failed to sweep blob");
				}
			}
		}
		Ok(removed)
	}

	pub fn path_for(&self, job_id: &str) -> Result<PathBuf, ScribeError> {
		Ok(self.root.join(sanitize_id(job_id)?))
	}

	pub fn root(&self) -> &Path {
		&self.root
	}
}

/// In-flight upload handle. Call `finish` to publish or `abort` to discard.
pub struct BlobWriter {
	file: File,
	part_path: PathBuf,
	final_path: PathBuf,
	written: u64,
	max_bytes: u64,
}

impl BlobWriter {
	pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ScribeError> {
		let next = self.written + chunk.len() as u64;
		if next > self.max_bytes {
			return Err(ScribeError::PayloadTooLarge {
				limit_mb: self.max_bytes / (1024 * 1024),
			});
		}
		self.file.write_all(chunk).await?;
		self.written = next;
		Ok(())
	}

	pub fn written(&self) -> u64 {
		self.written
	}

	/// Flush and atomically rename the part file into place.
	pub async fn finish(mut self) -> Result<u64, ScribeError> {
		self.file.flush().await?;
		self.file.sync_all().await?;
		fs::rename(&self.part_path, &self.final_path).await?;
		Ok(self.written)
	}

	/// Drop the partial upload.
	pub async fn abort(self) -> Result<(), ScribeError> {
		drop(self.file);
		match fs::remove_file(&self.part_path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

/// Blob names are job ids; reject anything that could escape the root.
fn sanitize_id(id: &str) -> Result<String, ScribeError> {
	if id.is_empty() || id.len() > 100 {
		return Err(ScribeError::BadRequest("invalid job id".into()));
	}
	if id.contains("..") || id.contains('/') || id.contains('\\') || id.chars().any(|c| c.is_control()) {
		return Err(ScribeError::BadRequest("invalid job id".into()));
	}
	Ok(id.to_string())
}
