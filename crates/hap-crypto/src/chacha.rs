//! ChaCha20-Poly1305 AEAD for pairing sub-TLVs and the session channel.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hap_core::error::CryptoError;
use zeroize::ZeroizeOnDrop;

/// Largest plaintext carried by one encrypted frame.
pub const MAX_FRAME_PLAINTEXT: usize = 0x400;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Session cipher with a per-direction frame counter.
///
/// Frames are `[u16_le len][ciphertext][16-byte tag]` with AAD = len and the
/// counter little-endian in nonce bytes 4..12.
#[derive(ZeroizeOnDrop)]
pub struct ControlCipher {
    write_key: [u8; 32],
    read_key: [u8; 32],
    #[zeroize(skip)]
    write_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    read_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    encrypt_counter: u64,
    #[zeroize(skip)]
    decrypt_counter: u64,
}

impl ControlCipher {
    /// Create cipher with separate write/read keys.
    pub fn new(write_key: [u8; 32], read_key: [u8; 32]) -> Self {
        let write_cipher = ChaCha20Poly1305::new(&write_key.into());
        let read_cipher = ChaCha20Poly1305::new(&read_key.into());
        Self {
            write_key,
            read_key,
            write_cipher,
            read_cipher,
            encrypt_counter: 0,
            decrypt_counter: 0,
        }
    }

    /// Create cipher with a single key for both directions.
    pub fn new_unidirectional(key: [u8; 32]) -> Self {
        Self::new(key, key)
    }

    /// Encrypt plaintext into one or more frames.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::Encryption("Empty plaintext".to_string()));
        }

        let frames = plaintext.len().div_ceil(MAX_FRAME_PLAINTEXT);
        let mut out = Vec::with_capacity(plaintext.len() + frames * (2 + TAG_LEN));
        for block in plaintext.chunks(MAX_FRAME_PLAINTEXT) {
            let aad = (block.len() as u16).to_le_bytes();
            let nonce = build_nonce_from_counter(self.encrypt_counter);
            let payload = Payload { msg: block, aad: &aad };

            let ciphertext_with_tag = self
                .write_cipher
                .encrypt(Nonce::from_slice(&nonce), payload)
                .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))?;

            out.extend_from_slice(&aad);
            out.extend_from_slice(&ciphertext_with_tag);
            self.encrypt_counter += 1;
        }

        Ok(out)
    }

    /// Decrypt a single frame body (ciphertext + tag) whose length prefix was `block_len`.
    pub fn decrypt_block(
        &mut self,
        ciphertext_with_tag: &[u8],
        block_len: u16,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_with_tag.len() != block_len as usize + TAG_LEN {
            return Err(CryptoError::Decryption(
                "Ciphertext block length does not match prefix".to_string(),
            ));
        }

        let aad = block_len.to_le_bytes();
        let nonce = build_nonce_from_counter(self.decrypt_counter);
        let payload = Payload {
            msg: ciphertext_with_tag,
            aad: &aad,
        };

        let plaintext = self
            .read_cipher
            .decrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| CryptoError::AuthTagMismatch)?;

        self.decrypt_counter += 1;
        Ok(plaintext)
    }

    /// Decrypt a buffer made entirely of complete frames.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = data.to_vec();
        let plaintext = self.decrypt_available(&mut buffer)?;
        if !buffer.is_empty() {
            return Err(CryptoError::Decryption(
                "Incomplete ciphertext frame".to_string(),
            ));
        }
        Ok(plaintext)
    }

    /// Decrypt every complete frame at the front of `buffer`, draining them.
    ///
    /// A trailing partial frame is left in place for the next read.
    pub fn decrypt_available(&mut self, buffer: &mut Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        let mut offset = 0;

        while buffer.len() >= offset + 2 {
            let block_len = u16::from_le_bytes([buffer[offset], buffer[offset + 1]]);
            if block_len as usize > MAX_FRAME_PLAINTEXT {
                return Err(CryptoError::Decryption(format!(
                    "Frame length {} exceeds maximum",
                    block_len
                )));
            }
            let block_end = offset + 2 + block_len as usize + TAG_LEN;
            if block_end > buffer.len() {
                break;
            }

            let plaintext = self.decrypt_block(&buffer[offset + 2..block_end], block_len)?;
            out.extend_from_slice(&plaintext);
            offset = block_end;
        }

        buffer.drain(..offset);
        Ok(out)
    }

    /// Get current encryption nonce counter.
    pub fn encrypt_counter(&self) -> u64 {
        self.encrypt_counter
    }

    /// Get current decryption nonce counter.
    pub fn decrypt_counter(&self) -> u64 {
        self.decrypt_counter
    }
}

/// Build 12-byte nonce from counter.
fn build_nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt with explicit 12-byte nonce (pairing sub-TLVs).
///
/// Returns ciphertext with 16-byte auth tag appended.
pub fn encrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(&(*key).into());
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))
}

/// Decrypt with explicit 12-byte nonce (pairing sub-TLVs).
///
/// Expects ciphertext with 16-byte auth tag appended.
pub fn decrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption(
            "Ciphertext too short (missing tag)".to_string(),
        ));
    }

    let cipher = ChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthTagMismatch)
}

/// Create a 12-byte nonce from a label such as `PS-Msg05`, right-aligned.
pub fn nonce_from_string(s: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    let len = s.len().min(12);
    nonce[12 - len..].copy_from_slice(&s[..len]);
    nonce
}
