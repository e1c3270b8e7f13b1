//! Property-based tests for the wire frames.
//!
//! Uses proptest to verify:
//! 1. Any stream frame survives a postcard encode → decode round-trip.
//! 2. Any message survives the JSON shape used by the HTTP endpoints.
//! 3. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 4. `order_key` ordering agrees with `(timestamp, id)` ordering.

use duet_proto::codec;
use duet_proto::message::*;
use duet_proto::stream::*;
use proptest::prelude::*;
use uuid::Uuid;

fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-z0-9_-]{1,24}".prop_map(UserId::new)
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
}

fn arb_conversation_id() -> impl Strategy<Value = ConversationId> {
    any::<u128>().prop_map(|n| ConversationId::from_uuid(Uuid::from_u128(n)))
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

fn arb_message() -> impl Strategy<Value = ChatMessage> {
    (
        arb_message_id(),
        arb_conversation_id(),
        arb_user_id(),
        prop::option::of(".{0,256}"),
        arb_timestamp(),
    )
        .prop_map(|(id, conversation_id, sender_id, content, timestamp)| ChatMessage {
            id,
            conversation_id,
            sender_id,
            content,
            timestamp,
        })
}

fn arb_summary() -> impl Strategy<Value = ConversationSummary> {
    (
        arb_conversation_id(),
        arb_user_id(),
        ".{0,32}",
        prop::option::of(".{0,64}"),
        prop::option::of(arb_timestamp()),
    )
        .prop_map(
            |(conversation_id, counterpart_id, counterpart_name, latest_message, latest_message_time)| {
                ConversationSummary {
                    conversation_id,
                    counterpart_id,
                    counterpart_name,
                    latest_message,
                    latest_message_time,
                }
            },
        )
}

fn arb_notice_code() -> impl Strategy<Value = NoticeCode> {
    prop_oneof![
        Just(NoticeCode::SessionNotFound),
        Just(NoticeCode::Unauthorized),
        Just(NoticeCode::InvalidHandshake),
        Just(NoticeCode::ContentTooLarge),
        Just(NoticeCode::Internal),
    ]
}

fn arb_chat_client_frame() -> impl Strategy<Value = ChatClientFrame> {
    prop_oneof![
        (arb_conversation_id(), arb_user_id()).prop_map(|(conversation_id, user_id)| {
            ChatClientFrame::Join {
                conversation_id,
                user_id,
            }
        }),
        prop::option::of(".{0,512}").prop_map(|content| ChatClientFrame::Send { content }),
    ]
}

fn arb_chat_server_frame() -> impl Strategy<Value = ChatServerFrame> {
    prop_oneof![
        arb_conversation_id().prop_map(|conversation_id| ChatServerFrame::Joined { conversation_id }),
        arb_message().prop_map(ChatServerFrame::Message),
        (arb_notice_code(), ".{0,64}")
            .prop_map(|(code, text)| ChatServerFrame::Notice(Notice::new(code, text))),
    ]
}

fn arb_chat_list_server_frame() -> impl Strategy<Value = ChatListServerFrame> {
    prop_oneof![
        arb_user_id().prop_map(|user_id| ChatListServerFrame::Subscribed { user_id }),
        arb_summary().prop_map(|s| ChatListServerFrame::Update(ChatListUpdate::summary(s))),
        Just(ChatListServerFrame::Update(ChatListUpdate::no_data())),
    ]
}

proptest! {
    #[test]
    fn chat_client_frames_round_trip(frame in arb_chat_client_frame()) {
        let bytes = codec::encode(&frame).unwrap();
        let decoded: ChatClientFrame = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn chat_server_frames_round_trip(frame in arb_chat_server_frame()) {
        let bytes = codec::encode(&frame).unwrap();
        let decoded: ChatServerFrame = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn chat_list_frames_round_trip(frame in arb_chat_list_server_frame(), counterpart in arb_user_id()) {
        let bytes = codec::encode(&frame).unwrap();
        let decoded: ChatListServerFrame = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, frame);

        let request = ChatListClientFrame::StartDirect { counterpart_id: counterpart };
        let bytes = codec::encode(&request).unwrap();
        let decoded: ChatListClientFrame = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, request);
    }

    #[test]
    fn messages_survive_json(message in arb_message()) {
        let json = serde_json::to_string(&message).unwrap();
        let decoded: ChatMessage = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<ChatClientFrame>(&bytes);
        let _ = codec::decode::<ChatServerFrame>(&bytes);
        let _ = codec::decode::<ChatListClientFrame>(&bytes);
        let _ = codec::decode::<ChatListServerFrame>(&bytes);
    }

    #[test]
    fn order_key_sorts_by_time_then_id(a in arb_message(), b in arb_message()) {
        let expected = a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id));
        prop_assert_eq!(a.order_key().cmp(&b.order_key()), expected);
    }
}
