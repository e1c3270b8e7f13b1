#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]

//! Property-based tests for history pagination and pair resolution.
//!
//! Uses proptest to verify:
//! 1. Paging backwards through a conversation split across the hot cache and
//!    the durable store yields every message exactly once, newest first,
//!    even when messages arrive with tied timestamps.
//! 2. Every page respects the requested limit.
//! 3. The hot cache reads back newest first whatever the insertion order.
//! 4. A pair key does not depend on argument order.

use std::sync::Arc;

use duet_proto::api::PageQuery;
use duet_proto::message::{ChatMessage, ConversationId, MessageId, Timestamp, UserId};
use duet_server::durable::{DurableStore, LogStore};
use duet_server::hot_cache::HotCache;
use duet_server::resolver::PairKey;
use duet_server::retrieval::History;
use duet_server::sync::SyncJob;
use proptest::prelude::*;

/// Non-decreasing timestamps drawn from a narrow range, so ties are common.
fn arb_tied_timestamps() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1_u64..20, 0..60).prop_map(|mut stamps| {
        stamps.sort_unstable();
        stamps
    })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Appends one message per stamp to a conversation through the hot cache,
/// running a sync (insert, then trim to `capacity`) after the first `synced`
/// of them. Returns the appended ids, oldest first, and every page of a
/// backwards walk with page size `limit`.
async fn walk_pages(
    stamps: Vec<u64>,
    synced: usize,
    capacity: usize,
    limit: usize,
) -> (Vec<MessageId>, Vec<Vec<ChatMessage>>) {
    let cache = Arc::new(HotCache::new(capacity));
    let store = Arc::new(LogStore::in_memory());
    let conversation_id = store
        .create_direct(&PairKey::new(UserId::new("alice"), UserId::new("bob")))
        .await
        .unwrap()
        .conversation
        .id;
    let sync = SyncJob::new(Arc::clone(&cache), Arc::clone(&store));

    let mut ids = Vec::with_capacity(stamps.len());
    for (index, &millis) in stamps.iter().enumerate() {
        if index == synced {
            sync.run_once().await;
        }
        let mut message = ChatMessage::compose(
            conversation_id,
            UserId::new(if index % 2 == 0 { "alice" } else { "bob" }),
            Some(format!("m{index}")),
        );
        message.timestamp = Timestamp::from_millis(millis);
        ids.push(message.id);
        cache.append(message).await.unwrap();
    }
    if synced >= stamps.len() {
        sync.run_once().await;
    }

    let history = History::new(cache, store, limit, limit);
    let mut pages = Vec::new();
    let mut before = None;
    loop {
        let page = history
            .page(
                conversation_id,
                PageQuery {
                    before,
                    limit: Some(limit),
                },
            )
            .await
            .unwrap();
        let Some(oldest) = page.last() else {
            break;
        };
        before = Some(oldest.timestamp);
        pages.push(page);
    }
    (ids, pages)
}

proptest! {
    #[test]
    fn paging_visits_every_message_once(
        stamps in arb_tied_timestamps(),
        synced in 0_usize..60,
        capacity in 1_usize..10,
        limit in 1_usize..15,
    ) {
        let (ids, pages) = runtime().block_on(walk_pages(stamps, synced, capacity, limit));

        for page in &pages {
            prop_assert!(page.len() <= limit);
            prop_assert!(!page.is_empty());
        }

        let flat: Vec<&ChatMessage> = pages.iter().flatten().collect();
        for pair in flat.windows(2) {
            prop_assert!(pair[0].timestamp > pair[1].timestamp);
        }

        let mut visited: Vec<MessageId> = flat.iter().map(|m| m.id).collect();
        visited.reverse();
        prop_assert_eq!(visited, ids);
    }

    #[test]
    fn cache_reads_back_newest_first(
        stamps in prop::collection::vec(1_u64..50, 1..40).prop_shuffle(),
    ) {
        let page = runtime().block_on(async {
            let cache = HotCache::default();
            let conversation_id = ConversationId::new();
            for &millis in &stamps {
                let mut message =
                    ChatMessage::compose(conversation_id, UserId::new("alice"), None);
                message.timestamp = Timestamp::from_millis(millis);
                cache.append(message).await.unwrap();
            }
            cache
                .page(conversation_id, Timestamp::MAX, stamps.len())
                .await
                .unwrap()
        });

        prop_assert_eq!(page.len(), stamps.len());
        for pair in page.windows(2) {
            prop_assert!(pair[0].order_key() > pair[1].order_key());
        }
    }

    #[test]
    fn pair_key_is_order_independent(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
        let forward = PairKey::new(UserId::new(a.clone()), UserId::new(b.clone()));
        let backward = PairKey::new(UserId::new(b), UserId::new(a));
        prop_assert!(forward.low() <= forward.high());
        prop_assert_eq!(forward.to_string(), backward.to_string());
        prop_assert_eq!(forward, backward);
    }
}
