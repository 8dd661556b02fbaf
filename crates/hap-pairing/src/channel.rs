//! Encrypted transport installed after pair-verify.
//!
//! ```text
//! +---------------+------------------+----------+
//! | Length (2 LE) | Ciphertext (N)   | Tag (16) |
//! +---------------+------------------+----------+
//! ```
//!
//! The length is the plaintext size (at most 1024) and doubles as the AAD.
//! Each direction has its own key and 64-bit frame counter.

use hap_core::error::CryptoError;
use hap_crypto::chacha::{ControlCipher, TAG_LEN};
use hap_crypto::keys::SessionKeys;

/// Framing cipher for one connection.
pub struct EncryptedChannel {
    cipher: ControlCipher,
    pending: Vec<u8>,
}

impl EncryptedChannel {
    /// Channel using `keys.write_key` outbound and `keys.read_key` inbound.
    pub fn new(keys: &SessionKeys) -> Self {
        Self::with_keys(*keys.write_key.as_bytes(), *keys.read_key.as_bytes())
    }

    pub fn with_keys(write_key: [u8; 32], read_key: [u8; 32]) -> Self {
        Self {
            cipher: ControlCipher::new(write_key, read_key),
            pending: Vec::new(),
        }
    }

    /// Encrypt `plaintext` into as many frames as needed.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.encrypt(plaintext)
    }

    /// Feed received bytes; returns the plaintext of every complete frame.
    ///
    /// Partial frames are kept until the rest arrives. A tag mismatch is
    /// fatal for the connection.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.pending.extend_from_slice(data);
        self.cipher.decrypt_available(&mut self.pending)
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn write_counter(&self) -> u64 {
        self.cipher.encrypt_counter()
    }

    pub fn read_counter(&self) -> u64 {
        self.cipher.decrypt_counter()
    }

    /// Size on the wire of a frame carrying `plaintext_len` bytes.
    pub fn frame_len(plaintext_len: usize) -> usize {
        2 + plaintext_len + TAG_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (EncryptedChannel, EncryptedChannel) {
        let a = [0x11; 32];
        let b = [0x22; 32];
        (
            EncryptedChannel::with_keys(a, b),
            EncryptedChannel::with_keys(b, a),
        )
    }

    #[test]
    fn frame_layout() {
        let (mut accessory, _) = pair();
        let framed = accessory.encrypt(b"test").unwrap();
        assert_eq!(framed.len(), EncryptedChannel::frame_len(4));
        assert_eq!(&framed[..2], &[4, 0]);
    }

    #[test]
    fn partial_frames_are_buffered() {
        let (mut accessory, mut controller) = pair();
        let framed = controller.encrypt(b"GET /accessories HTTP/1.1\r\n\r\n").unwrap();

        let (head, tail) = framed.split_at(10);
        assert!(accessory.decrypt(head).unwrap().is_empty());
        assert_eq!(accessory.pending_len(), 10);
        assert_eq!(
            accessory.decrypt(tail).unwrap(),
            b"GET /accessories HTTP/1.1\r\n\r\n"
        );
        assert_eq!(accessory.pending_len(), 0);
        assert_eq!(accessory.read_counter(), 1);
    }

    #[test]
    fn large_payload_spans_frames() {
        let (mut accessory, mut controller) = pair();
        let body = vec![0x5a; 2500];
        let framed = accessory.encrypt(&body).unwrap();
        assert_eq!(accessory.write_counter(), 3);
        assert_eq!(controller.decrypt(&framed).unwrap(), body);
    }

    #[test]
    fn tampered_frame_is_rejected() {
        let (mut accessory, mut controller) = pair();
        let mut framed = controller.encrypt(b"hello").unwrap();
        framed[4] ^= 0xff;
        assert!(matches!(
            accessory.decrypt(&framed),
            Err(CryptoError::AuthTagMismatch)
        ));
    }
}
