use sha2::{Digest, Sha256};

use crate::job::SubmitOptions;

/// Incremental content fingerprint: sha-256 over the exact uploaded bytes
/// followed by a canonical encoding of the options that affect output.
///
/// Filename and caller identity never enter the hash, so byte-identical
/// uploads from different clients deduplicate to the same cache entry.
pub struct Fingerprinter {
	hasher: Sha256,
}

impl Fingerprinter {
	pub fn new() -> Self {
		Self { hasher: Sha256::new() }
	}

	/// Feed the next chunk of the raw upload.
	pub fn update(&mut self, chunk: &[u8]) {
		self.hasher.update(chunk);
	}

	/// Finish with the normalized option set and return the hex digest.
	pub fn finalize(mut self, options: &SubmitOptions) -> String {
		self.hasher.update(b"\0language=");
		self.hasher.update(options.language.trim().to_ascii_lowercase().as_bytes());
		self.hasher.update(b"\0vad_filter=");
		self.hasher.update(if options.vad_filter { b"1" } else { b"0" });
		self.hasher.update(b"\0initial_prompt=");
		self.hasher.update(options.initial_prompt.as_bytes());
		format!("{:x}", self.hasher.finalize())
	}
}

impl Default for Fingerprinter {
	fn default() -> Self {
		Self::new()
	}
}

/// One-shot convenience over a full buffer.
pub fn fingerprint(bytes: &[u8], options: &SubmitOptions) -> String {
	let mut fp = Fingerprinter::new();
	fp.update(bytes);
	fp.finalize(options)
}
