//! In-place segmentation of encrypted datagrams.
//!
//! A runtime may submit one oversized datagram that carries several
//! transport packets back to back. The buffer it hands over looks like
//!
//! ```text
//! | tx_net_hdr | eth/ip/udp | meta 0 .. meta K-1 | chunk 0 .. chunk K-1 | spare |
//!      18           42          41 * K               data_len
//! ```
//!
//! and is sized so that K self-contained sub-packets fit exactly:
//! `len + 18 == K * (60 + 41 + 16) + data_len`. Each chunk is encrypted
//! where it lies, then moved to its final slot and given its own copy of
//! the outer headers. Chunks are handled last to first: every sub-packet
//! grows by 76 bytes of headers and tag, so moving a later chunk never
//! touches bytes of an earlier one that has not been processed yet.

use smoltcp::wire::{Ipv4Packet, UdpPacket};
use thiserror::Error;

use crate::cipher::{CIPHER_OVERHEAD, CipherEngine, CryptoError};
use crate::mbuf::OLFLAG_IP_CHKSUM;

/// `tx_net_hdr` preceding every outgoing packet.
pub const TX_NET_HDR_LEN: usize = 18;
/// Ethernet + IPv4 + UDP.
pub const OUTER_HDR_LEN: usize = 42;
/// Everything copied in front of each sub-packet.
pub const FULL_HDR_LEN: usize = TX_NET_HDR_LEN + OUTER_HDR_LEN;
/// Size of one packed chunk metadata entry.
pub const CIPHER_META_LEN: usize = 41;
/// Fixed cost of one chunk in the submitted buffer.
pub const PER_CHUNK_OVERHEAD: usize = FULL_HDR_LEN + CIPHER_META_LEN + CIPHER_OVERHEAD;
/// How much each emitted sub-packet grows over its chunk.
pub const SUBPACKET_GROWTH: usize = FULL_HDR_LEN + CIPHER_OVERHEAD;

const ETH_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

/// Payload-relative offsets of the lengths rewritten per sub-packet.
const IP_OFFSET: usize = ETH_HDR_LEN;
const UDP_OFFSET: usize = ETH_HDR_LEN + IPV4_HDR_LEN;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("packet of {len} bytes is too short to segment")]
    TooShort { len: usize },

    #[error("udp length {udp_len} is inconsistent with packet length {len}")]
    BadUdpLength { udp_len: usize, len: usize },

    #[error("chunk {chunk} lengths are empty or overflow")]
    BadChunk { chunk: usize },

    #[error("chunk {chunk}: {source}")]
    Crypto {
        chunk: usize,
        #[source]
        source: CryptoError,
    },
}

pub type Result<T> = std::result::Result<T, SegmentError>;

/// Decoded `tx_net_hdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxNetHdr {
    pub completion_data: u64,
    pub len: u16,
    pub olflags: u16,
    pub cipher: u16,
}

impl TxNetHdr {
    pub fn parse(b: &[u8; TX_NET_HDR_LEN]) -> Self {
        let mut token = [0u8; 8];
        token.copy_from_slice(&b[0..8]);
        Self {
            completion_data: u64::from_le_bytes(token),
            len: u16::from_le_bytes([b[8], b[9]]),
            olflags: u16::from_le_bytes([b[10], b[11]]),
            cipher: u16::from_le_bytes([b[12], b[13]]),
        }
    }

    pub fn emit(&self, b: &mut [u8]) {
        b[0..8].copy_from_slice(&self.completion_data.to_le_bytes());
        b[8..10].copy_from_slice(&self.len.to_le_bytes());
        b[10..12].copy_from_slice(&self.olflags.to_le_bytes());
        b[12..14].copy_from_slice(&self.cipher.to_le_bytes());
        b[14..18].fill(0);
    }

    /// Whether the packet must be segmented before transmission.
    pub fn needs_segmentation(&self) -> bool {
        self.cipher != 0
    }
}

/// Decoded `cipher_meta` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherMeta {
    pub aead_index: u64,
    pub header_cipher_index: u64,
    pub packet_num: u64,
    pub header_len: u64,
    pub body_len: u64,
    pub header_form: u8,
}

impl CipherMeta {
    pub fn parse(b: &[u8]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        Self {
            aead_index: word(0),
            header_cipher_index: word(1),
            packet_num: word(2),
            header_len: word(3),
            body_len: word(4),
            header_form: b[40],
        }
    }

    pub fn emit(&self, b: &mut [u8]) {
        let words = [
            self.aead_index,
            self.header_cipher_index,
            self.packet_num,
            self.header_len,
            self.body_len,
        ];
        for (i, w) in words.iter().enumerate() {
            b[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        b[40] = self.header_form;
    }

    /// Header plus body, or `None` when the runtime's lengths overflow.
    fn chunk_len(&self) -> Option<u64> {
        self.header_len.checked_add(self.body_len)
    }
}

/// Number of chunks in a cipher packet of `len` payload bytes carrying
/// `data_len` bytes of chunk data.
///
/// Panics when the sizes do not divide evenly: the runtime and the
/// iokernel disagree about the packet layout and nothing sensible can be
/// transmitted.
pub fn chunk_count(len: usize, data_len: usize) -> usize {
    let framing = (len + TX_NET_HDR_LEN)
        .checked_sub(data_len)
        .unwrap_or_else(|| panic!("segment: data_len {data_len} exceeds packet length {len}"));
    assert!(
        framing % PER_CHUNK_OVERHEAD == 0,
        "segment: {framing} framing bytes is not a multiple of {PER_CHUNK_OVERHEAD} \
         (len {len}, data_len {data_len})"
    );
    framing / PER_CHUNK_OVERHEAD
}

/// Segment the cipher packet in `buf` in place.
///
/// `buf` starts at the `tx_net_hdr` and spans exactly `len + 18` bytes.
/// Returns the offsets of the emitted sub-packets' `tx_net_hdr`s in wire
/// order. Only the last sub-packet keeps the completion token.
pub fn segment_in_place<C: CipherEngine + ?Sized>(buf: &mut [u8], cipher: &C) -> Result<Vec<usize>> {
    if buf.len() < FULL_HDR_LEN {
        return Err(SegmentError::TooShort { len: buf.len() });
    }
    let mut outer = [0u8; FULL_HDR_LEN];
    outer.copy_from_slice(&buf[..FULL_HDR_LEN]);

    let mut hdr_bytes = [0u8; TX_NET_HDR_LEN];
    hdr_bytes.copy_from_slice(&outer[..TX_NET_HDR_LEN]);
    let hdr = TxNetHdr::parse(&hdr_bytes);
    let len = usize::from(hdr.len);
    if len + TX_NET_HDR_LEN != buf.len() {
        return Err(SegmentError::TooShort { len: buf.len() });
    }

    let udp = UdpPacket::new_unchecked(&outer[TX_NET_HDR_LEN + UDP_OFFSET..]);
    let udp_len = usize::from(udp.len());
    let data_len = udp_len
        .checked_sub(UDP_HDR_LEN)
        .ok_or(SegmentError::BadUdpLength { udp_len, len })?;
    if data_len > len {
        return Err(SegmentError::BadUdpLength { udp_len, len });
    }

    let segs = chunk_count(len, data_len);
    if segs == 0 {
        return Err(SegmentError::BadUdpLength { udp_len, len });
    }

    // Metadata is overwritten by the first sub-packet's headers, so read it
    // all up front.
    let metas: Vec<CipherMeta> = (0..segs)
        .map(|k| {
            let at = FULL_HDR_LEN + k * CIPHER_META_LEN;
            CipherMeta::parse(&buf[at..at + CIPHER_META_LEN])
        })
        .collect();
    let mut chunk_total = 0u64;
    for (k, m) in metas.iter().enumerate() {
        chunk_total = m
            .chunk_len()
            .and_then(|n| chunk_total.checked_add(n))
            .ok_or(SegmentError::BadChunk { chunk: k })?;
    }
    if chunk_total != data_len as u64 {
        return Err(SegmentError::BadUdpLength { udp_len, len });
    }

    let mut offsets = vec![0usize; segs];
    let mut chunk_end = FULL_HDR_LEN + segs * CIPHER_META_LEN + data_len;

    for k in (0..segs).rev() {
        let cm = &metas[k];
        let header_len = cm.header_len as usize;
        if header_len == 0 {
            return Err(SegmentError::BadChunk { chunk: k });
        }
        // Every chunk fits inside data_len once the total matched.
        let chunk_len = cm.chunk_len().ok_or(SegmentError::BadChunk { chunk: k })? as usize;
        let pkt_len = chunk_len + CIPHER_OVERHEAD;
        let chunk_start = chunk_end - chunk_len;

        // The tag lands on the first bytes of chunk k+1, already moved out.
        let pkt = &mut buf[chunk_start..chunk_start + pkt_len];
        let (header, body) = pkt.split_at_mut(header_len);
        cipher
            .encrypt_in_place(cm.aead_index, cm.packet_num, header, body)
            .map_err(|source| SegmentError::Crypto { chunk: k, source })?;
        cipher
            .apply_header_protection(cm.header_cipher_index, cm.header_form, header, body)
            .map_err(|source| SegmentError::Crypto { chunk: k, source })?;

        let dest = chunk_start + k * SUBPACKET_GROWTH;
        if dest != chunk_start {
            buf.copy_within(chunk_start..chunk_start + pkt_len, dest);
        }

        let hdr_at = dest - FULL_HDR_LEN;
        buf[hdr_at..dest].copy_from_slice(&outer);
        let sub_len = OUTER_HDR_LEN + pkt_len;
        let sub = TxNetHdr {
            completion_data: if k == segs - 1 { hdr.completion_data } else { 0 },
            len: sub_len as u16,
            ..hdr
        };
        rewrite_outer(&mut buf[hdr_at..hdr_at + FULL_HDR_LEN], &sub);

        offsets[k] = hdr_at;
        chunk_end = chunk_start;
    }

    Ok(offsets)
}

/// Rewrite the copied headers for a sub-packet of `sub.len` payload bytes.
fn rewrite_outer(b: &mut [u8], sub: &TxNetHdr) {
    sub.emit(&mut b[..TX_NET_HDR_LEN]);
    let payload = &mut b[TX_NET_HDR_LEN..];
    let len = usize::from(sub.len);

    let mut ip = Ipv4Packet::new_unchecked(&mut payload[IP_OFFSET..UDP_OFFSET]);
    ip.set_total_len((len - ETH_HDR_LEN) as u16);
    if sub.olflags & OLFLAG_IP_CHKSUM == 0 {
        ip.fill_checksum();
    }

    let mut udp = UdpPacket::new_unchecked(&mut payload[UDP_OFFSET..OUTER_HDR_LEN]);
    udp.set_len((len - UDP_OFFSET) as u16);
    // The body changed under encryption; IPv4 permits an absent checksum.
    udp.set_checksum(0);
}
