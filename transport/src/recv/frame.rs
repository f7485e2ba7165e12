//! Decoding of the raw Ethernet frames that the verbs reader receives

use std::net::{Ipv4Addr, SocketAddrV4};
use anyhow::bail;
use bytes::Buf;

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPV4_MIN_HEADER_SIZE: usize = 20;
pub const IP_PROTOCOL_UDP: u8 = 17;
pub const UDP_HEADER_SIZE: usize = 8;

/// more-fragments flag and fragment offset
const IPV4_FRAGMENT_MASK: u16 = 0x3fff;

#[derive(Debug, PartialEq, Eq)]
pub struct UdpFrame<'a> {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub payload: &'a [u8],
}

/// Extracts the UDP datagram from an untagged Ethernet frame carrying IPv4
pub fn parse_udp_frame(frame: &[u8]) -> anyhow::Result<UdpFrame> {
    if frame.len() < ETHERNET_HEADER_SIZE + IPV4_MIN_HEADER_SIZE + UDP_HEADER_SIZE {
        bail!("frame too short: {} bytes", frame.len());
    }

    let mut ethernet = &frame[12..ETHERNET_HEADER_SIZE];
    let ethertype = ethernet.get_u16();
    if ethertype != ETHERTYPE_IPV4 {
        bail!("not an IPv4 frame: ethertype {:#06x}", ethertype);
    }

    let ip = &frame[ETHERNET_HEADER_SIZE..];
    let version = ip[0] >> 4;
    if version != 4 {
        bail!("IP version {}", version);
    }
    let ip_header_len = usize::from(ip[0] & 0x0f) * 4;
    if ip_header_len < IPV4_MIN_HEADER_SIZE || ip.len() < ip_header_len + UDP_HEADER_SIZE {
        bail!("invalid IP header length {}", ip_header_len);
    }

    let mut fixed = &ip[2..IPV4_MIN_HEADER_SIZE];
    let total_len = usize::from(fixed.get_u16());
    let _identification = fixed.get_u16();
    let fragment = fixed.get_u16();
    let _ttl = fixed.get_u8();
    let protocol = fixed.get_u8();
    let _checksum = fixed.get_u16();
    let source_ip = Ipv4Addr::from(fixed.get_u32());
    let destination_ip = Ipv4Addr::from(fixed.get_u32());

    if fragment & IPV4_FRAGMENT_MASK != 0 {
        bail!("fragmented IP datagram");
    }
    if protocol != IP_PROTOCOL_UDP {
        bail!("not a UDP datagram: IP protocol {}", protocol);
    }
    if total_len < ip_header_len + UDP_HEADER_SIZE || total_len > ip.len() {
        bail!("invalid IP total length {}", total_len);
    }

    let mut udp = &ip[ip_header_len..total_len];
    let source_port = udp.get_u16();
    let destination_port = udp.get_u16();
    let udp_len = usize::from(udp.get_u16());
    if udp_len < UDP_HEADER_SIZE || udp_len > total_len - ip_header_len {
        bail!("invalid UDP length {}", udp_len);
    }

    let payload_start = ETHERNET_HEADER_SIZE + ip_header_len + UDP_HEADER_SIZE;
    Ok(UdpFrame {
        source: SocketAddrV4::new(source_ip, source_port),
        destination: SocketAddrV4::new(destination_ip, destination_port),
        payload: &frame[payload_start..payload_start + udp_len - UDP_HEADER_SIZE],
    })
}

/// Builds a frame the way a NIC would deliver it, with zero checksums
#[cfg(test)]
pub(crate) fn build_udp_frame(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    use bytes::BufMut;

    let mut frame = Vec::new();
    frame.put_slice(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
    frame.put_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
    frame.put_u16(ETHERTYPE_IPV4);

    frame.put_u8(0x45);
    frame.put_u8(0);
    frame.put_u16((IPV4_MIN_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()) as u16);
    frame.put_u16(0);
    frame.put_u16(0x4000); // don't fragment
    frame.put_u8(64);
    frame.put_u8(IP_PROTOCOL_UDP);
    frame.put_u16(0);
    frame.put_u32(u32::from(*source.ip()));
    frame.put_u32(u32::from(*destination.ip()));

    frame.put_u16(source.port());
    frame.put_u16(destination.port());
    frame.put_u16((UDP_HEADER_SIZE + payload.len()) as u16);
    frame.put_u16(0);

    frame.put_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn source() -> SocketAddrV4 {
        "10.0.0.1:5000".parse().unwrap()
    }

    fn destination() -> SocketAddrV4 {
        "239.1.2.3:7148".parse().unwrap()
    }

    #[test]
    fn test_parse() {
        let frame = build_udp_frame(source(), destination(), b"payload");
        let parsed = parse_udp_frame(&frame).unwrap();
        assert_eq!(parsed, UdpFrame {
            source: source(),
            destination: destination(),
            payload: b"payload",
        });
    }

    #[test]
    fn test_ethernet_padding_is_ignored() {
        let mut frame = build_udp_frame(source(), destination(), b"x");
        frame.extend_from_slice(&[0; 17]);
        assert_eq!(parse_udp_frame(&frame).unwrap().payload, b"x");
    }

    #[test]
    fn test_ip_options_are_skipped() {
        let mut frame = build_udp_frame(source(), destination(), b"abc");
        frame[ETHERNET_HEADER_SIZE] = 0x46;
        let total_len = u16::from_be_bytes([frame[16], frame[17]]) + 4;
        frame[16..18].copy_from_slice(&total_len.to_be_bytes());
        let options_at = ETHERNET_HEADER_SIZE + IPV4_MIN_HEADER_SIZE;
        frame.splice(options_at..options_at, [1, 1, 1, 0]);

        assert_eq!(parse_udp_frame(&frame).unwrap().payload, b"abc");
    }

    fn with(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut frame = build_udp_frame(source(), destination(), b"some payload");
        f(&mut frame);
        frame
    }

    #[rstest]
    #[case::too_short(vec![0; 30])]
    #[case::vlan_tagged(with(|f| f[12..14].copy_from_slice(&[0x81, 0x00])))]
    #[case::ipv6(with(|f| f[12..14].copy_from_slice(&[0x86, 0xdd])))]
    #[case::wrong_ip_version(with(|f| f[14] = 0x65))]
    #[case::short_ihl(with(|f| f[14] = 0x44))]
    #[case::more_fragments(with(|f| f[20] = 0x20))]
    #[case::fragment_offset(with(|f| f[21] = 0x01))]
    #[case::tcp(with(|f| f[23] = 6))]
    #[case::truncated(with(|f| f.truncate(f.len() - 3)))]
    #[case::udp_length_too_big(with(|f| f[38..40].copy_from_slice(&200u16.to_be_bytes())))]
    fn test_rejected(#[case] frame: Vec<u8>) {
        assert!(parse_udp_frame(&frame).is_err());
    }
}
