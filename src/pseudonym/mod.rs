//! Field-level pseudonymisation: deterministic AES-CBC encryption plus a
//! short, stable handle that replaces the plaintext in staging columns.
//!
//! Deterministic mode derives the IV from the plaintext (SHA-256 prefix), so
//! equal plaintexts produce equal ciphertexts and encrypted columns stay
//! queryable by equality. Random mode prepends the IV to the ciphertext.

pub mod key;

use std::collections::HashMap;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{FieldRule, Pseudonymization};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Upper bound on the short handle, prefix included.
pub const MAX_HANDLE_LEN: usize = 64;

const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum PseudonymError {
	#[error("invalid key or IV length")]
	InvalidLength,

	#[error("ciphertext is not valid base64: {0}")]
	Decode(#[from] base64::DecodeError),

	#[error("decryption failed (bad padding or truncated ciphertext)")]
	Unpad,

	#[error("deterministic decryption requires the plaintext hint")]
	MissingHint,

	#[error("decrypted bytes are not valid UTF-8")]
	NotUtf8,
}

/// Result of transforming one field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedField {
	/// Short handle that replaces the plaintext in the staging column.
	pub handle: String,
	/// Full base64 ciphertext, written to the `<field>_ciphertext` column.
	pub ciphertext: String,
}

/// Applies the configured pseudonymisation rules to staging row fields.
#[derive(Debug, Clone)]
pub struct FieldTransformer {
	enabled: bool,
	deterministic: bool,
	key: [u8; key::KEY_LEN],
	rules: HashMap<String, FieldRule>,
}

impl FieldTransformer {
	pub fn new(cfg: &Pseudonymization, key: [u8; key::KEY_LEN]) -> Self {
		Self {
			enabled: cfg.enabled,
			deterministic: cfg.use_deterministic_aes,
			key,
			rules: cfg.elements_to_pseudonymize.clone(),
		}
	}

	/// A transformer that passes every field through untouched.
	pub fn disabled() -> Self {
		Self {
			enabled: false,
			deterministic: true,
			key: [0u8; key::KEY_LEN],
			rules: HashMap::new(),
		}
	}

	/// Transform a single field value. Returns `None` when pseudonymisation
	/// is globally off or the field has no enabled rule, in which case the
	/// caller keeps the plaintext.
	pub fn transform(&self, field: &str, plaintext: &str) -> Option<TransformedField> {
		if !self.enabled {
			return None;
		}
		let rule = self.rules.get(field)?;
		if !rule.enabled {
			return None;
		}

		let ciphertext = self.encrypt(plaintext);
		let handle = short_handle(&rule.prefix, &ciphertext);
		Some(TransformedField { handle, ciphertext })
	}

	/// AES-256-CBC with PKCS#7 padding, base64-encoded. In deterministic
	/// mode the IV is derivable from the plaintext and therefore omitted
	/// from the output; in random mode it is prepended.
	pub fn encrypt(&self, plaintext: &str) -> String {
		let iv = if self.deterministic {
			derive_iv(plaintext)
		} else {
			let mut iv = [0u8; IV_LEN];
			rand::thread_rng().fill_bytes(&mut iv);
			iv
		};

		// Key and IV lengths are fixed by construction.
		let cipher = Aes256CbcEnc::new_from_slices(&self.key, &iv)
			.expect("AES-256-CBC accepts 32-byte key and 16-byte IV");
		let ct = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

		if self.deterministic {
			BASE64.encode(ct)
		} else {
			let mut combined = Vec::with_capacity(IV_LEN + ct.len());
			combined.extend_from_slice(&iv);
			combined.extend_from_slice(&ct);
			BASE64.encode(combined)
		}
	}

	/// Invert [`encrypt`]. Deterministic ciphertexts need the plaintext hint
	/// to re-derive the IV; random-IV ciphertexts carry their IV inline.
	pub fn decrypt(
		&self,
		ciphertext_b64: &str,
		plaintext_hint: Option<&str>,
	) -> Result<String, PseudonymError> {
		let data = BASE64.decode(ciphertext_b64)?;

		let (iv, ct): ([u8; IV_LEN], &[u8]) = if self.deterministic {
			let hint = plaintext_hint.ok_or(PseudonymError::MissingHint)?;
			(derive_iv(hint), data.as_slice())
		} else {
			if data.len() < IV_LEN {
				return Err(PseudonymError::Unpad);
			}
			let mut iv = [0u8; IV_LEN];
			iv.copy_from_slice(&data[..IV_LEN]);
			(iv, &data[IV_LEN..])
		};

		let cipher = Aes256CbcDec::new_from_slices(&self.key, &iv)
			.map_err(|_| PseudonymError::InvalidLength)?;
		let pt = cipher
			.decrypt_padded_vec_mut::<Pkcs7>(ct)
			.map_err(|_| PseudonymError::Unpad)?;

		String::from_utf8(pt).map_err(|_| PseudonymError::NotUtf8)
	}
}

/// IV for deterministic mode: the first 16 bytes of SHA-256(plaintext).
fn derive_iv(plaintext: &str) -> [u8; IV_LEN] {
	let digest = Sha256::digest(plaintext.as_bytes());
	let mut iv = [0u8; IV_LEN];
	iv.copy_from_slice(&digest[..IV_LEN]);
	iv
}

/// `prefix || hex(SHA256(ciphertext_b64))`, truncated so the whole handle
/// fits in [`MAX_HANDLE_LEN`].
fn short_handle(prefix: &str, ciphertext_b64: &str) -> String {
	let digest = hex::encode(Sha256::digest(ciphertext_b64.as_bytes()));
	let budget = MAX_HANDLE_LEN.saturating_sub(prefix.len());
	format!("{}{}", prefix, &digest[..budget.min(digest.len())])
}
