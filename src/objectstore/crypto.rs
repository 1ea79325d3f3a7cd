//! Envelope encryption for object-store uploads/downloads (§6).
//!
//! Upload format (current): magic `3NCR0PTD` + 32-byte SHA-256 of
//! `(salt|iv|ciphertext)` + 8-byte big-endian length + salt(16) + iv(16) +
//! AES-256-CBC ciphertext with PKCS7 padding. Key derived by PBKDF2-SHA-256
//! with 100 000 iterations from the caller-supplied password.
//!
//! Downloads additionally accept `GCM3NCR0` (AES-256-GCM, same KDF
//! parameters, a 12-byte nonce in place of the 16-byte IV) and a legacy
//! no-magic GCM variant (`salt(16) | nonce(12) | ciphertext`, no magic
//! prefix, no integrity digest) for backward compatibility with documents
//! written by an older envelope version.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

const MAGIC_CBC: &[u8; 8] = b"3NCR0PTD";
const MAGIC_GCM: &[u8; 8] = b"GCM3NCR0";
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;
const DIGEST_LEN: usize = 32;
const LEN_FIELD: usize = 8;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt `plaintext` under `password`, producing the current (`3NCR0PTD`) envelope.
pub fn encrypt(password: &str, plaintext: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut digest_input = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    digest_input.extend_from_slice(&salt);
    digest_input.extend_from_slice(&iv);
    digest_input.extend_from_slice(&ciphertext);
    let digest: [u8; DIGEST_LEN] = Sha256::digest(&digest_input).into();

    let mut out = Vec::with_capacity(8 + DIGEST_LEN + LEN_FIELD + SALT_LEN + IV_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC_CBC);
    out.extend_from_slice(&digest);
    out.extend_from_slice(&(ciphertext.len() as u64).to_be_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt an envelope produced by [`encrypt`], or one of the two accepted
/// legacy GCM variants, returning the plaintext.
pub fn decrypt(password: &str, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() >= 8 && &envelope[..8] == MAGIC_CBC {
        decrypt_cbc(password, envelope)
    } else if envelope.len() >= 8 && &envelope[..8] == MAGIC_GCM {
        decrypt_gcm(password, &envelope[8..], true)
    } else {
        decrypt_gcm(password, envelope, false)
    }
}

fn decrypt_cbc(password: &str, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let header_len = 8 + DIGEST_LEN + LEN_FIELD;
    if envelope.len() < header_len + SALT_LEN + IV_LEN {
        return Err(CryptoError::Malformed("envelope too short for CBC header"));
    }
    let digest = &envelope[8..8 + DIGEST_LEN];
    let len_bytes = &envelope[8 + DIGEST_LEN..header_len];
    let ct_len = u64::from_be_bytes(len_bytes.try_into().unwrap()) as usize;

    let salt = &envelope[header_len..header_len + SALT_LEN];
    let iv = &envelope[header_len + SALT_LEN..header_len + SALT_LEN + IV_LEN];
    let ct_start = header_len + SALT_LEN + IV_LEN;
    if envelope.len() < ct_start + ct_len {
        return Err(CryptoError::Malformed("ciphertext shorter than declared length"));
    }
    let ciphertext = &envelope[ct_start..ct_start + ct_len];

    let mut digest_input = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    digest_input.extend_from_slice(salt);
    digest_input.extend_from_slice(iv);
    digest_input.extend_from_slice(ciphertext);
    let actual: [u8; DIGEST_LEN] = Sha256::digest(&digest_input).into();
    if actual != digest {
        return Err(CryptoError::IntegrityCheckFailed);
    }

    let key = derive_key(password, salt);
    let mut buf = ciphertext.to_vec();
    let plaintext = Aes256CbcDec::new(&key.into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(plaintext.to_vec())
}

fn decrypt_gcm(password: &str, body: &[u8], has_magic: bool) -> Result<Vec<u8>, CryptoError> {
    if body.len() < SALT_LEN + GCM_NONCE_LEN {
        return Err(CryptoError::Malformed("envelope too short for GCM header"));
    }
    let salt = &body[..SALT_LEN];
    let nonce_bytes = &body[SALT_LEN..SALT_LEN + GCM_NONCE_LEN];
    let ciphertext = &body[SALT_LEN + GCM_NONCE_LEN..];

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let _ = has_magic; // both variants share the same body layout once the magic is stripped
    Ok(plaintext)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
    #[error("envelope integrity check failed")]
    IntegrityCheckFailed,
    #[error("decryption failed (wrong password or corrupt data)")]
    DecryptionFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_round_trip() {
        let plaintext = b"=== Page 1 ===\nhello world";
        let envelope = encrypt("correct horse battery staple", plaintext);
        assert_eq!(&envelope[..8], MAGIC_CBC);
        let decrypted = decrypt("correct horse battery staple", &envelope).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn cbc_wrong_password_fails() {
        let envelope = encrypt("right-password", b"secret text");
        let err = decrypt("wrong-password", &envelope).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed | CryptoError::IntegrityCheckFailed));
    }

    #[test]
    fn gcm_with_magic_round_trip() {
        let salt = [7u8; SALT_LEN];
        let nonce_bytes = [3u8; GCM_NONCE_LEN];
        let key = derive_key("pw", &salt);
        let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, &b"legacy data"[..]).unwrap();

        let mut envelope = Vec::new();
        envelope.extend_from_slice(MAGIC_GCM);
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);

        let decrypted = decrypt("pw", &envelope).unwrap();
        assert_eq!(decrypted, b"legacy data");
    }
}
