// tests/property/framing_roundtrip_test.rs

//! `BuildPackets` followed by `ReadMessage` must yield back the original
//! packet type and payload for any valid packet size and payload, per the
//! wire-framing round-trip property.

use bytes::BytesMut;
use proptest::prelude::*;
use tds_admission_proxy::tds::framing::{PacketType, build_packets, read_message};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn build_then_read_preserves_type_and_payload(
        packet_type in any::<u8>(),
        payload in prop::collection::vec(any::<u8>(), 0..6000),
        max_size in 9usize..2048,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let result: Result<(), TestCaseError> = rt.block_on(async {
            let packets = build_packets(PacketType(packet_type), &payload, max_size);

            // Every packet but possibly the last respects max_size; only the
            // last carries the end-of-message flag.
            for (i, p) in packets.iter().enumerate() {
                prop_assert!(p.len() <= max_size.max(9));
                let is_last = i == packets.len() - 1;
                prop_assert_eq!(p[1] & 0x01 != 0, is_last);
            }

            let mut buf = BytesMut::new();
            for p in &packets {
                buf.extend_from_slice(p);
            }
            let mut reader = std::io::Cursor::new(buf.to_vec());
            let msg = read_message(&mut reader).await.unwrap();

            prop_assert_eq!(msg.packet_type, PacketType(packet_type));
            prop_assert_eq!(msg.payload.as_ref(), payload.as_slice());
            prop_assert_eq!(msg.raw_packets, packets);
            Ok(())
        });
        result?;
    }
}
