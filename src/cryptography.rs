use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::debug;
use rand::RngCore;

use crate::error::{DecryptionError, KeyError};
use crate::{IV_SIZE, KEY_SIZE};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const BLOCK_SIZE: usize = 16;

/// A whole file encrypted under one key.
///
/// On disk and on the wire this is simply `iv || ciphertext`: the first
/// `IV_SIZE` bytes are the IV, everything after is AES-256-CBC output with
/// PKCS#7 padding. There is no length field and no authentication tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(IV_SIZE + self.ciphertext.len());
        blob.extend_from_slice(&self.iv);
        blob.extend_from_slice(&self.ciphertext);
        blob
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self, DecryptionError> {
        if blob.len() < IV_SIZE {
            return Err(DecryptionError::Truncated);
        }
        let (iv, ciphertext) = blob.split_at(IV_SIZE);
        let mut iv_bytes = [0u8; IV_SIZE];
        iv_bytes.copy_from_slice(iv);

        Ok(EncryptedPayload {
            iv: iv_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Generate a fresh random 256-bit file key.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Text form of a key, for sharing out of band.
pub fn encode_key(key: &[u8; KEY_SIZE]) -> String {
    STANDARD.encode(key)
}

pub fn decode_key(text: &str) -> Result<[u8; KEY_SIZE], KeyError> {
    let bytes = STANDARD.decode(text.trim())?;
    let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| KeyError::Length {
        expected: KEY_SIZE,
        actual: bytes.len(),
    })?;
    Ok(key)
}

/// Encrypt a whole file. Every call draws a new random IV.
pub fn encrypt_file(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    encrypt_with_iv(key, &iv, plaintext).to_bytes()
}

pub(crate) fn encrypt_with_iv(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> EncryptedPayload {
    let ciphertext =
        Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    debug!("Encrypted {} bytes into {} bytes", plaintext.len(), ciphertext.len());

    EncryptedPayload { iv: *iv, ciphertext }
}

/// Decrypt a blob produced by [`encrypt_file`].
///
/// A wrong key shows up as a padding failure. CBC without a tag cannot
/// detect every wrong key: roughly one wrong key in 256 still produces valid
/// padding, so this check is probabilistic.
pub fn decrypt_file(key: &[u8; KEY_SIZE], blob: &[u8]) -> Result<Vec<u8>, DecryptionError> {
    let payload = EncryptedPayload::from_bytes(blob)?;
    decrypt_payload(key, &payload)
}

pub fn decrypt_payload(
    key: &[u8; KEY_SIZE],
    payload: &EncryptedPayload,
) -> Result<Vec<u8>, DecryptionError> {
    if payload.ciphertext.is_empty() || payload.ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(DecryptionError::Invalid);
    }

    Aes256CbcDec::new(key.into(), (&payload.iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&payload.ciphertext)
        .map_err(|_| DecryptionError::Invalid)
}
