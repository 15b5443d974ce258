//! Property-based tests for RoomRegistry ordering.

use duocore::{Message, MessageContent, RoomId, RoomRegistry, UserId};
use proptest::prelude::*;

fn sender_strategy() -> impl Strategy<Value = UserId> {
    prop_oneof![Just(UserId::from("a@x.com")), Just(UserId::from("b@x.com"))]
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (sender_strategy(), "[a-z]{1,12}")
        .prop_map(|(sender, text)| Message::outgoing(sender, MessageContent::Text(text)))
}

/// A registry operation interleaved with deliveries.
#[derive(Debug, Clone)]
enum Op {
    Deliver(usize, Message),
    Join(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0usize..3, message_strategy()).prop_map(|(r, m)| Op::Deliver(r, m)),
        1 => (0usize..3).prop_map(Op::Join),
    ]
}

fn room(idx: usize) -> RoomId {
    RoomId::new(format!("room-{idx}"))
}

proptest! {
    /// The room sequence equals the delivery order.
    #[test]
    fn delivery_order_is_preserved(messages in prop::collection::vec(message_strategy(), 0..64)) {
        let mut reg = RoomRegistry::new();
        let r = room(0);
        for msg in &messages {
            reg.on_message_received(r.clone(), msg.clone());
        }
        prop_assert_eq!(reg.messages(&r), messages);
    }

    /// Joining rooms never alters any room's cached sequence.
    #[test]
    fn joins_do_not_disturb_cached_rooms(ops in prop::collection::vec(op_strategy(), 0..100)) {
        let mut reg = RoomRegistry::new();
        let mut expected: [Vec<Message>; 3] = Default::default();

        for op in ops {
            match op {
                Op::Deliver(idx, msg) => {
                    reg.on_message_received(room(idx), msg.clone());
                    expected[idx].push(msg);
                }
                Op::Join(idx) => {
                    reg.join_room(room(idx));
                    prop_assert_eq!(reg.active_room(), Some(&room(idx)));
                }
            }
            for (idx, seq) in expected.iter().enumerate() {
                prop_assert_eq!(&reg.messages(&room(idx)), seq);
            }
        }
    }
}
