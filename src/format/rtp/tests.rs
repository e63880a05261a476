use super::*;
use pretty_assertions::assert_eq;

#[test]
fn test_rtp_packet_creation() {
    let payload = Bytes::from(vec![1, 2, 3, 4]);
    let packet = RTPPacket::new(
        96, // payload type
        1000, // sequence number
        90000, // timestamp
        0x12345678, // ssrc
        true, // marker
        payload.clone(),
    );

    assert_eq!(packet.version, 2);
    assert_eq!(packet.payload_type, 96);
    assert_eq!(packet.sequence_number, 1000);
    assert_eq!(packet.timestamp, 90000);
    assert_eq!(packet.ssrc, 0x12345678);
    assert!(packet.marker);
    assert_eq!(packet.payload, payload);
}

#[test]
fn test_rtp_packet_parse() {
    let data = vec![
        0x80, 0xe0, 0x03, 0xe8, // V=2, P=0, X=0, CC=0, M=1, PT=96, seq=1000
        0x00, 0x01, 0x5f, 0x90, // timestamp=90000
        0x12, 0x34, 0x56, 0x78, // SSRC=0x12345678
        0x01, 0x02, 0x03, 0x04, // payload
    ];

    let packet = RTPPacket::parse(&data).unwrap();

    assert_eq!(packet.version, 2);
    assert!(!packet.padding);
    assert!(!packet.extension);
    assert_eq!(packet.csrc_count, 0);
    assert!(packet.marker);
    assert_eq!(packet.payload_type, 96);
    assert_eq!(packet.sequence_number, 1000);
    assert_eq!(packet.timestamp, 90000);
    assert_eq!(packet.ssrc, 0x12345678);
    assert_eq!(&packet.payload[..], &[1, 2, 3, 4]);

    // unpadded packets come back byte for byte
    assert_eq!(&packet.marshal().unwrap()[..], &data[..]);
}

#[test]
fn test_rtp_packet_parse_with_extension() {
    let data = vec![
        0x90, 0xe0, 0x03, 0xe8, // V=2, P=0, X=1, CC=0, M=1, PT=96, seq=1000
        0x00, 0x01, 0x5f, 0x90, // timestamp=90000
        0x12, 0x34, 0x56, 0x78, // SSRC=0x12345678
        0xbe, 0xde, 0x00, 0x01, // Extension header (0xbede, length=1)
        0x00, 0x00, 0x00, 0x00, // Extension data (4 bytes)
        0x01, 0x02, 0x03, 0x04, // payload
    ];

    let packet = RTPPacket::parse(&data).unwrap();

    assert_eq!(packet.version, 2);
    assert!(packet.extension);
    let (ext_header, ext_data) = packet.extension_data.clone().unwrap();
    assert_eq!(ext_header, 0xbede);
    assert_eq!(ext_data.len(), 4);
    assert_eq!(&packet.marshal().unwrap()[..], &data[..]);
}

#[test]
fn test_rtp_packet_padding_stripped() {
    let data = vec![
        0xa0, 0x60, 0x00, 0x01, // V=2, P=1, PT=96, seq=1
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x01,
        0xaa, 0xbb, 0x00, 0x02, // payload aa bb + 2 bytes padding
    ];

    let packet = RTPPacket::parse(&data).unwrap();
    assert_eq!(&packet.payload[..], &[0xaa, 0xbb]);
}

#[test]
fn test_rtp_packet_rejects_invalid() {
    assert!(RTPPacket::parse(&[0x80, 0x60]).is_err());
    // version 1
    assert!(RTPPacket::parse(&[0x40; 12]).is_err());
    // CSRC count overruns the packet
    let mut data = vec![0x82, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
    data.extend_from_slice(&[0, 0, 0, 1]);
    assert!(RTPPacket::parse(&data).is_err());
}

#[test]
fn test_rtp_packet_marshal_rejects_oversized_header() {
    let mut packet = RTPPacket::new(96, 1, 0, 1, false, Bytes::from_static(b"x"));
    packet.csrc = (0..15).collect();
    let raw = packet.marshal().unwrap();
    assert_eq!(RTPPacket::parse(&raw).unwrap().csrc.len(), 15);

    packet.csrc.push(15);
    assert!(matches!(packet.marshal(), Err(RTPError::TooManyCsrc(16))));

    packet.csrc.clear();
    packet.extension_data = Some((0xBEDE, Bytes::from_static(&[1, 2, 3])));
    assert!(matches!(packet.marshal(), Err(RTPError::InvalidExtension(3))));
}
