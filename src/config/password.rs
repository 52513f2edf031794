//! Encrypted password format (section 6): `encrypted:<base64(nonce||ciphertext)>`,
//! AES-256-GCM keyed by MD5(hex) of a 256-random-byte key file, auto-created
//! at mode 0600 if missing. Grounded on `password.go`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest, Md5};
use rand::RngCore;
use std::path::Path;

pub const ENCRYPTED_PREFIX: &str = "encrypted:";

fn create_key() -> [u8; 256] {
    let mut key = [0u8; 256];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn read_key(key_file: &Path) -> std::io::Result<Vec<u8>> {
    match std::fs::read(key_file) {
        Ok(bytes) => Ok(bytes),
        Err(_) => {
            let key = create_key();
            std::fs::write(key_file, key)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                std::fs::set_permissions(key_file, perms)?;
            }
            Ok(key.to_vec())
        }
    }
}

fn derive_cipher(key_file: &Path) -> anyhow::Result<Aes256Gcm> {
    let key_bytes = read_key(key_file)?;
    let mut hasher = Md5::new();
    hasher.update(&key_bytes);
    let digest = hasher.finalize();
    let hex_digest = hex::encode(digest);
    // AES-256 wants exactly 32 key bytes; the hex-encoded MD5 digest is 32
    // ASCII bytes, matching `password.go`'s use of the hex string itself
    // (not the raw digest) as the AES key material.
    Ok(Aes256Gcm::new_from_slice(hex_digest.as_bytes())?)
}

pub fn encrypt(key_file: &Path, plaintext: &str) -> anyhow::Result<String> {
    let cipher = derive_cipher(key_file)?;
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;
    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
}

pub fn decrypt(key_file: &Path, encoded: &str) -> anyhow::Result<String> {
    let cipher = derive_cipher(key_file)?;
    let raw = STANDARD.decode(encoded)?;
    if raw.len() < 12 {
        anyhow::bail!("encrypted payload too short");
    }
    let (nonce_bytes, ciphertext) = raw.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;
    Ok(String::from_utf8(plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("authrelay.key");
        let encrypted = encrypt(&key_file, "hunter2").unwrap();
        assert!(!encrypted.is_empty());
        let decrypted = decrypt(&key_file, &encrypted).unwrap();
        assert_eq!(decrypted, "hunter2");
    }

    #[test]
    fn key_file_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("authrelay.key");
        let a = encrypt(&key_file, "first").unwrap();
        let b = encrypt(&key_file, "first").unwrap();
        // different nonces, but both must decrypt back under the same key file
        assert_ne!(a, b);
        assert_eq!(decrypt(&key_file, &a).unwrap(), "first");
        assert_eq!(decrypt(&key_file, &b).unwrap(), "first");
    }
}
