use std::path::Path;

use anyhow::{Context, Result, bail};
use log::info;
use rand::RngCore;

/// Size of the AES-256 key material in bytes.
pub const KEY_LEN: usize = 32;

/// Load the AES key from `path`, generating and persisting a fresh one from
/// OS randomness if the file does not exist yet. A key file of the wrong
/// length is rejected rather than silently truncated.
pub fn load_or_generate(path: &Path) -> Result<[u8; KEY_LEN]> {
	if path.exists() {
		let bytes = std::fs::read(path)
			.with_context(|| format!("reading AES key from {}", path.display()))?;
		if bytes.len() != KEY_LEN {
			bail!(
				"AES key at {} has {} bytes, expected {}",
				path.display(),
				bytes.len(),
				KEY_LEN
			);
		}
		let mut key = [0u8; KEY_LEN];
		key.copy_from_slice(&bytes);
		return Ok(key);
	}

	let mut key = [0u8; KEY_LEN];
	rand::thread_rng().fill_bytes(&mut key);

	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)
			.with_context(|| format!("creating key directory {}", parent.display()))?;
	}
	std::fs::write(path, key)
		.with_context(|| format!("writing AES key to {}", path.display()))?;
	info!("generated new AES key at {}", path.display());

	Ok(key)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_then_reloads_same_key() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("key/key.bin");

		let first = load_or_generate(&path).unwrap();
		let second = load_or_generate(&path).unwrap();
		assert_eq!(first, second);
		assert_eq!(std::fs::read(&path).unwrap().len(), KEY_LEN);
	}

	#[test]
	fn rejects_wrong_length_key_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("key.bin");
		std::fs::write(&path, b"short").unwrap();
		assert!(load_or_generate(&path).is_err());
	}
}
