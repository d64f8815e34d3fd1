// Pinseal — ECIES over P-256
//
// Wire-compatible with Security.framework's
// `eciesEncryptionCofactorVariableIVX963SHA256AESGCM`:
//   ephemeral public key (65, uncompressed) || AES-128-GCM ciphertext || tag (16)
// Key and IV come from the ANSI X9.63 KDF (SHA-256) over the ECDH shared
// secret, with the ephemeral public key as shared info.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, Nonce};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::hsm::HsmError;

type Aes128Gcm16 = AesGcm<Aes128, U16>;

pub const EPHEMERAL_KEY_LEN: usize = 65;
const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Generate a random P-256 private key from the OS RNG.
pub fn random_secret_key() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

/// ANSI X9.63 KDF with SHA-256.
fn x963_kdf(shared: &[u8], shared_info: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut output = Zeroizing::new(Vec::with_capacity(len + 32));
    let mut counter: u32 = 1;
    while output.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(shared);
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_info);
        output.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    output.truncate(len);
    output
}

fn cipher_for(
    private: &SecretKey,
    peer: &PublicKey,
    ephemeral_bytes: &[u8],
) -> Result<(Aes128Gcm16, Zeroizing<Vec<u8>>), HsmError> {
    let shared = diffie_hellman(private.to_nonzero_scalar(), peer.as_affine());
    let material = x963_kdf(
        shared.raw_secret_bytes().as_slice(),
        ephemeral_bytes,
        KEY_LEN + IV_LEN,
    );
    let cipher = Aes128Gcm16::new_from_slice(&material[..KEY_LEN])
        .map_err(|e| HsmError::Internal(format!("invalid ECIES key: {}", e)))?;
    let iv = Zeroizing::new(material[KEY_LEN..].to_vec());
    Ok((cipher, iv))
}

/// Encrypt `plaintext` to `recipient`.
pub fn encrypt(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, HsmError> {
    let ephemeral = random_secret_key();
    let ephemeral_point = ephemeral.public_key().to_encoded_point(false);
    let ephemeral_bytes = ephemeral_point.as_bytes();

    let (cipher, iv) = cipher_for(&ephemeral, recipient, ephemeral_bytes)?;
    let sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext)
        .map_err(|_| HsmError::SealFailed("ECIES encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(EPHEMERAL_KEY_LEN + sealed.len());
    out.extend_from_slice(ephemeral_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a message addressed to `recipient`.
pub fn decrypt(recipient: &SecretKey, message: &[u8]) -> Result<Zeroizing<Vec<u8>>, HsmError> {
    if message.len() < EPHEMERAL_KEY_LEN + TAG_LEN {
        return Err(HsmError::UnsealFailed("ECIES message is truncated".to_string()));
    }
    let (ephemeral_bytes, body) = message.split_at(EPHEMERAL_KEY_LEN);
    let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| HsmError::UnsealFailed("invalid ephemeral public key".to_string()))?;

    let (cipher, iv) = cipher_for(recipient, &ephemeral, ephemeral_bytes)?;
    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(&iv), body)
        .map_err(|_| {
            HsmError::UnsealFailed("ciphertext failed authentication with the enclave key".to_string())
        })?;
    Ok(Zeroizing::new(plaintext))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
