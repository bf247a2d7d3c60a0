//! Packet building utilities for tests
//!
//! Builds plain UDP frames and the oversized cipher datagrams runtimes hand
//! over for inline segmentation, and opens the sub-packets that come out.

use iokernel::cipher::ChaChaCiphers;
use iokernel::segment::{
    CIPHER_META_LEN, CipherMeta, FULL_HDR_LEN, OUTER_HDR_LEN, PER_CHUNK_OVERHEAD,
    TX_NET_HDR_LEN, TxNetHdr,
};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

pub const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
pub const SRC_IP: [u8; 4] = [10, 0, 0, 1];
pub const DST_IP: [u8; 4] = [10, 0, 0, 2];
pub const SRC_PORT: u16 = 4433;
pub const DST_PORT: u16 = 50000;

pub const AEAD_KEY: u64 = 7;
pub const HP_KEY: u64 = 8;

/// Cipher table with the test keys installed.
pub fn ciphers() -> ChaChaCiphers {
    let mut c = ChaChaCiphers::new();
    c.install_aead_key(AEAD_KEY, &[0x42; 32], [0x24; 12]);
    c.install_header_key(HP_KEY, [0x99; 32]);
    c
}

/// Build an Ethernet/IPv4/UDP frame around `payload`.
pub fn udp_frame(payload: &[u8]) -> Vec<u8> {
    let udp_repr = UdpRepr {
        src_port: SRC_PORT,
        dst_port: DST_PORT,
    };
    let ipv4_repr = Ipv4Repr {
        src_addr: Ipv4Address::from_octets(SRC_IP),
        dst_addr: Ipv4Address::from_octets(DST_IP),
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&SRC_MAC),
        dst_addr: EthernetAddress::from_bytes(&DST_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };

    let total_len =
        eth_repr.buffer_len() + ipv4_repr.buffer_len() + udp_repr.header_len() + payload.len();
    let mut buffer = vec![0u8; total_len];

    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);

    let mut ipv4_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ipv4_repr.emit(&mut ipv4_packet, &ChecksumCapabilities::default());

    let mut udp_packet = UdpPacket::new_unchecked(ipv4_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ipv4_repr.src_addr.into(),
        &ipv4_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );

    buffer
}

/// One transport packet inside a cipher datagram.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    pub packet_num: u64,
}

impl Chunk {
    /// A short-header chunk with a 1-byte packet number. `header_len`
    /// includes that byte.
    pub fn short(header_len: usize, body: Vec<u8>, packet_num: u64) -> Self {
        let mut header = vec![0u8; header_len];
        header[0] = 0x40;
        for (i, b) in header[1..header_len - 1].iter_mut().enumerate() {
            *b = i as u8;
        }
        header[header_len - 1] = packet_num as u8;
        Self {
            header,
            body,
            packet_num,
        }
    }

    fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

/// Build the buffer a runtime submits for inline segmentation: the
/// `tx_net_hdr`, outer headers, one metadata entry per chunk and the
/// chunks back to back, with room for every sub-packet's headers and tag.
pub fn cipher_datagram(chunks: &[Chunk], token: u64, olflags: u16) -> Vec<u8> {
    let segs = chunks.len();
    let data_len: usize = chunks.iter().map(Chunk::len).sum();
    let total = segs * PER_CHUNK_OVERHEAD + data_len;
    let mut buf = vec![0u8; total];

    TxNetHdr {
        completion_data: token,
        len: (total - TX_NET_HDR_LEN) as u16,
        olflags,
        cipher: 1,
    }
    .emit(&mut buf);

    let outer = udp_frame(&[]);
    buf[TX_NET_HDR_LEN..FULL_HDR_LEN].copy_from_slice(&outer);
    let mut udp = UdpPacket::new_unchecked(&mut buf[TX_NET_HDR_LEN + 34..FULL_HDR_LEN]);
    udp.set_len((data_len + 8) as u16);

    let mut at = FULL_HDR_LEN + segs * CIPHER_META_LEN;
    for (k, c) in chunks.iter().enumerate() {
        CipherMeta {
            aead_index: AEAD_KEY,
            header_cipher_index: HP_KEY,
            packet_num: c.packet_num,
            header_len: c.header.len() as u64,
            body_len: c.body.len() as u64,
            header_form: 0,
        }
        .emit(&mut buf[FULL_HDR_LEN + k * CIPHER_META_LEN..]);
        buf[at..at + c.header.len()].copy_from_slice(&c.header);
        at += c.header.len();
        buf[at..at + c.body.len()].copy_from_slice(&c.body);
        at += c.body.len();
    }
    buf
}

/// Check the outer headers of a transmitted sub-packet and undo its
/// protection. Returns the plaintext body.
pub fn open_subpacket(ciphers: &ChaChaCiphers, frame: &[u8], chunk: &Chunk) -> Vec<u8> {
    assert_eq!(
        frame.len(),
        OUTER_HDR_LEN + chunk.len() + 16,
        "sub-packet length"
    );
    let eth = EthernetFrame::new_checked(frame).expect("ethernet header");
    assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);
    assert_eq!(eth.src_addr(), EthernetAddress::from_bytes(&SRC_MAC));

    let ip = Ipv4Packet::new_checked(eth.payload()).expect("ipv4 header");
    assert_eq!(usize::from(ip.total_len()), frame.len() - 14);
    assert!(ip.verify_checksum(), "ipv4 checksum");
    assert_eq!(ip.dst_addr(), Ipv4Address::from_octets(DST_IP));

    let udp = UdpPacket::new_checked(ip.payload()).expect("udp header");
    assert_eq!(usize::from(udp.len()), frame.len() - 34);
    assert_eq!(udp.checksum(), 0);
    assert_eq!(udp.dst_port(), DST_PORT);

    let mut pkt = udp.payload().to_vec();
    let (header, body) = pkt.split_at_mut(chunk.header.len());
    ciphers
        .remove_header_protection(HP_KEY, 0, header, body, 1)
        .expect("remove header protection");
    assert_eq!(&header[..], &chunk.header[..]);
    let n = ciphers
        .decrypt_in_place(AEAD_KEY, chunk.packet_num, header, body)
        .expect("decrypt");
    body[..n].to_vec()
}
