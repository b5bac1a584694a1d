//! Property-based tests for the broker wire format.
//!
//! Verification command: `cargo test -p polychat-proto --test wire`

use proptest::prelude::*;

use polychat_proto::OffsetPolicy;
use polychat_proto::broker::{self, BrokerMessage, Record};

fn arb_policy() -> impl Strategy<Value = OffsetPolicy> {
    prop_oneof![Just(OffsetPolicy::Latest), Just(OffsetPolicy::Earliest)]
}

fn arb_record() -> impl Strategy<Value = Record> {
    (any::<u64>(), prop::collection::vec(any::<u8>(), 0..512))
        .prop_map(|(offset, payload)| Record { offset, payload })
}

fn arb_message() -> impl Strategy<Value = BrokerMessage> {
    prop_oneof![
        "[a-z0-9]{1,64}".prop_map(|client_id| BrokerMessage::OpenPublisher { client_id }),
        ("[a-z]{1,16}", prop::collection::vec(any::<u8>(), 0..512))
            .prop_map(|(channel, payload)| BrokerMessage::Publish { channel, payload }),
        ("[a-z_0-9]{1,80}", "[a-z]{1,16}", any::<u32>(), arb_policy()).prop_map(
            |(cursor_id, channel, partition, policy)| BrokerMessage::OpenCursor {
                cursor_id,
                channel,
                partition,
                policy,
            }
        ),
        any::<u64>().prop_map(|max_wait_ms| BrokerMessage::Fetch { max_wait_ms }),
        prop::collection::vec(arb_record(), 0..16)
            .prop_map(|records| BrokerMessage::Batch { records }),
        ".{0,64}".prop_map(|reason| BrokerMessage::Error { reason }),
    ]
}

proptest! {
    /// Every message the client or broker can produce decodes to itself.
    #[test]
    fn broker_message_survives_the_wire(msg in arb_message()) {
        let bytes = broker::encode(&msg).expect("encode should succeed");
        let decoded = broker::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(msg, decoded);
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn decode_tolerates_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = broker::decode(&bytes);
    }
}
