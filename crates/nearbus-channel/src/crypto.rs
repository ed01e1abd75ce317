/// Negotiation payload sealing.
///
/// XChaCha20-Poly1305 under the per-connection symmetric key handed out by
/// the auth link. Wire form: 24-byte random nonce followed by the
/// ciphertext (which carries the 16-byte auth tag). Negotiation payloads
/// never leave the process unsealed.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};

use crate::error::ChannelError;

/// XChaCha20 extended nonce length. Safe to generate randomly.
const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
const TAG_LEN: usize = 16;

/// Seal `plaintext` under `key`. Output is `nonce || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let cipher = XChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| ChannelError::Crypto(format!("seal failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed payload produced by [`seal`] with the same key.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, ChannelError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(ChannelError::Crypto(format!(
            "sealed payload too short: {} bytes",
            sealed.len()
        )));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| ChannelError::Crypto("open failed: authentication error".into()))
}
