//! Packet encryption for inline segmentation.
//!
//! The segmentation pass only needs two primitives, both keyed by opaque
//! indexes the runtime put in the chunk metadata: authenticated in-place
//! encryption of a chunk body, and header protection of the chunk header
//! using a sample of the encrypted body. `ChaChaCiphers` implements them
//! the way QUIC does for ChaCha20-Poly1305.

use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Tag};
use std::collections::HashMap;
use thiserror::Error;

/// Authentication tag appended to every encrypted body.
pub const CIPHER_OVERHEAD: usize = 16;

/// Bytes of encrypted body sampled for header protection.
const SAMPLE_LEN: usize = 16;

/// The sample starts this many bytes after the packet number's first byte.
const SAMPLE_PN_OFFSET: usize = 4;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown key index {0}")]
    UnknownKey(u64),

    #[error("body of {len} bytes has no room for the tag")]
    ShortBody { len: usize },

    #[error("header protection needs {need} body bytes, got {got}")]
    ShortSample { need: usize, got: usize },

    #[error("header of {len} bytes is too short")]
    ShortHeader { len: usize },

    #[error("packet number length {0} does not match the header")]
    PacketNumberLength(usize),

    #[error("AEAD operation failed")]
    Aead,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Cipher operations used by the TX segmentation pass.
///
/// `body` always includes the trailing `CIPHER_OVERHEAD` bytes reserved
/// for the tag.
pub trait CipherEngine {
    fn encrypt_in_place(&self, key: u64, packet_num: u64, header: &[u8], body: &mut [u8])
    -> Result<()>;

    fn apply_header_protection(
        &self,
        key: u64,
        header_form: u8,
        header: &mut [u8],
        body: &[u8],
    ) -> Result<()>;
}

/// Header form tag from the chunk metadata. Long headers protect four bits
/// of the first byte, short headers five.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    Short,
    Long,
}

impl From<u8> for HeaderForm {
    fn from(v: u8) -> Self {
        if v == 0 {
            HeaderForm::Short
        } else {
            HeaderForm::Long
        }
    }
}

impl HeaderForm {
    fn first_byte_mask(self) -> u8 {
        match self {
            HeaderForm::Short => 0x1f,
            HeaderForm::Long => 0x0f,
        }
    }
}

struct AeadKey {
    aead: ChaCha20Poly1305,
    iv: [u8; 12],
}

/// Key table for ChaCha20-Poly1305 packet protection.
#[derive(Default)]
pub struct ChaChaCiphers {
    aead: HashMap<u64, AeadKey>,
    header: HashMap<u64, [u8; 32]>,
}

impl ChaChaCiphers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_aead_key(&mut self, index: u64, key: &[u8; 32], iv: [u8; 12]) {
        let aead = ChaCha20Poly1305::new(Key::from_slice(key));
        self.aead.insert(index, AeadKey { aead, iv });
    }

    pub fn install_header_key(&mut self, index: u64, key: [u8; 32]) {
        self.header.insert(index, key);
    }

    fn aead_key(&self, index: u64) -> Result<&AeadKey> {
        self.aead.get(&index).ok_or(CryptoError::UnknownKey(index))
    }

    /// Per-packet nonce: the IV with the packet number XORed into its tail.
    fn nonce(iv: &[u8; 12], packet_num: u64) -> [u8; 12] {
        let mut nonce = *iv;
        for (n, p) in nonce[4..].iter_mut().zip(packet_num.to_be_bytes()) {
            *n ^= p;
        }
        nonce
    }

    fn header_mask(&self, index: u64, sample: &[u8]) -> Result<[u8; 5]> {
        let key = self
            .header
            .get(&index)
            .ok_or(CryptoError::UnknownKey(index))?;
        let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
        let nonce: [u8; 12] = sample[4..SAMPLE_LEN]
            .try_into()
            .map_err(|_| CryptoError::ShortSample {
                need: SAMPLE_LEN,
                got: sample.len(),
            })?;

        let mut stream = ChaCha20::new(key.into(), (&nonce).into());
        stream.seek(u64::from(counter) * 64);
        let mut mask = [0u8; 5];
        stream.apply_keystream(&mut mask);
        Ok(mask)
    }

    /// XOR the header protection mask into `header`. The packet number
    /// length is read from the unprotected first byte, which the caller
    /// supplies since it differs between protect and unprotect.
    fn xor_header(
        &self,
        key: u64,
        form: HeaderForm,
        header: &mut [u8],
        body: &[u8],
        pn_len: usize,
    ) -> Result<()> {
        if header.len() < pn_len + 1 {
            return Err(CryptoError::ShortHeader { len: header.len() });
        }
        let start = SAMPLE_PN_OFFSET - pn_len;
        let sample = body
            .get(start..start + SAMPLE_LEN)
            .ok_or(CryptoError::ShortSample {
                need: start + SAMPLE_LEN,
                got: body.len(),
            })?;
        let mask = self.header_mask(key, sample)?;

        header[0] ^= mask[0] & form.first_byte_mask();
        let pn_start = header.len() - pn_len;
        for (h, m) in header[pn_start..].iter_mut().zip(&mask[1..]) {
            *h ^= m;
        }
        Ok(())
    }

    /// Reverse `apply_header_protection`.
    ///
    /// The receiver locates the packet number from its own header layout,
    /// so it passes the packet number length in. The unmasked first byte
    /// must agree with it.
    pub fn remove_header_protection(
        &self,
        key: u64,
        header_form: u8,
        header: &mut [u8],
        body: &[u8],
        pn_len: usize,
    ) -> Result<()> {
        if !(1..=4).contains(&pn_len) {
            return Err(CryptoError::PacketNumberLength(pn_len));
        }
        self.xor_header(key, HeaderForm::from(header_form), header, body, pn_len)?;
        if usize::from(header[0] & 0x03) + 1 != pn_len {
            return Err(CryptoError::PacketNumberLength(pn_len));
        }
        Ok(())
    }

    /// Verify and decrypt a body produced by `encrypt_in_place`, returning
    /// the plaintext length.
    pub fn decrypt_in_place(
        &self,
        key: u64,
        packet_num: u64,
        header: &[u8],
        body: &mut [u8],
    ) -> Result<usize> {
        let k = self.aead_key(key)?;
        let pt_len = body
            .len()
            .checked_sub(CIPHER_OVERHEAD)
            .ok_or(CryptoError::ShortBody { len: body.len() })?;
        let (data, tag) = body.split_at_mut(pt_len);
        let tag = Tag::clone_from_slice(tag);
        let nonce = Self::nonce(&k.iv, packet_num);
        k.aead
            .decrypt_in_place_detached((&nonce).into(), header, data, &tag)
            .map_err(|_| CryptoError::Aead)?;
        Ok(pt_len)
    }
}

impl CipherEngine for ChaChaCiphers {
    fn encrypt_in_place(
        &self,
        key: u64,
        packet_num: u64,
        header: &[u8],
        body: &mut [u8],
    ) -> Result<()> {
        let k = self.aead_key(key)?;
        let pt_len = body
            .len()
            .checked_sub(CIPHER_OVERHEAD)
            .ok_or(CryptoError::ShortBody { len: body.len() })?;
        let (data, tag_space) = body.split_at_mut(pt_len);
        let nonce = Self::nonce(&k.iv, packet_num);
        let tag = k
            .aead
            .encrypt_in_place_detached((&nonce).into(), header, data)
            .map_err(|_| CryptoError::Aead)?;
        tag_space.copy_from_slice(tag.as_slice());
        Ok(())
    }

    fn apply_header_protection(
        &self,
        key: u64,
        header_form: u8,
        header: &mut [u8],
        body: &[u8],
    ) -> Result<()> {
        let first = *header.first().ok_or(CryptoError::ShortHeader { len: 0 })?;
        let pn_len = usize::from(first & 0x03) + 1;
        self.xor_header(key, HeaderForm::from(header_form), header, body, pn_len)
    }
}
