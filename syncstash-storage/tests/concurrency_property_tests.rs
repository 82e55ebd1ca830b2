//! Property-Based Tests for Concurrent Writers and Read Laws
//!
//! Concurrent call chains race on the same cache entries through
//! compare-and-swap. Losers must see a conflict, never a silent overwrite,
//! and whatever the cache ends up holding must be exactly the winners'
//! writes.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use syncstash_core::{BsoUpdate, ItemQuery, StashConfig, Timestamp};
use syncstash_storage::CallContext;
use syncstash_test_utils::fixtures::StashFixture;
use syncstash_test_utils::generators::{arb_bso_update, arb_id};
use tokio::runtime::{Builder, Runtime};

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

// ============================================================================
// CONCURRENT WRITERS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Racing writers to one cache-only collection: every writer either
    /// succeeds or sees a conflict, at least one succeeds, and the record
    /// holds exactly the ids the winners wrote.
    #[test]
    fn prop_racing_writers_conflict_instead_of_overwriting(
        writers in 2usize..8,
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let f = Arc::new(StashFixture::standard());
            let mut handles = Vec::new();
            for n in 0..writers {
                let f = f.clone();
                handles.push(tokio::spawn(async move {
                    let ctx = CallContext::new();
                    let id = format!("w{}", n);
                    let outcome = f
                        .stash
                        .set_items(&ctx, "u1", "tabs", &[BsoUpdate::new(id.clone())])
                        .await;
                    (id, outcome)
                }));
            }

            let mut winners = BTreeSet::new();
            for handle in handles {
                let (id, outcome) = handle
                    .await
                    .map_err(|e| TestCaseError::fail(format!("writer panicked: {}", e)))?;
                match outcome {
                    Ok(_) => {
                        winners.insert(id);
                    }
                    Err(err) => prop_assert!(err.is_conflict(), "unexpected error: {}", err),
                }
            }
            prop_assert!(!winners.is_empty());

            let record = f.collection("u1", "tabs").await;
            let stored: BTreeSet<String> = record
                .map(|r| r.items.keys().cloned().collect())
                .unwrap_or_default();
            prop_assert_eq!(stored, winners);
            Ok(())
        })?;
    }

    /// Exactly one of several simultaneous write-lock requests wins while
    /// the winner holds the lock.
    #[test]
    fn prop_cache_write_lock_has_one_holder(contenders in 2usize..8) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let f = Arc::new(StashFixture::new(
                StashConfig::new()
                    .with_cache_lock(true)
                    .with_lock_ttl(Duration::from_secs(60)),
            ));
            let mut handles = Vec::new();
            for _ in 0..contenders {
                let f = f.clone();
                handles.push(tokio::spawn(async move {
                    let ctx = CallContext::new();
                    f.stash.lock_for_write(&ctx, "u1", "history").await
                }));
            }

            let mut held = Vec::new();
            for handle in handles {
                match handle
                    .await
                    .map_err(|e| TestCaseError::fail(format!("contender panicked: {}", e)))?
                {
                    Ok(lock) => held.push(lock),
                    Err(err) => prop_assert!(err.is_conflict(), "unexpected error: {}", err),
                }
            }
            prop_assert_eq!(held.len(), 1);
            for lock in held {
                lock.release()
                    .await
                    .map_err(|e| TestCaseError::fail(format!("release failed: {}", e)))?;
            }
            Ok(())
        })?;
    }
}

// ============================================================================
// READ LAWS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// `older = T` selects exactly the items modified strictly before `T`,
    /// whichever strategy holds the collection.
    #[test]
    fn prop_older_filter_is_strict(
        writes in prop::collection::vec(arb_id(), 1..10),
        collection in prop_oneof![Just("history"), Just("bookmarks"), Just("tabs")],
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let f = StashFixture::standard();
            let ctx = CallContext::new();
            for id in &writes {
                f.clock.advance(Duration::from_millis(10));
                f.stash
                    .set_items(&ctx, "u1", collection, &[BsoUpdate::new(id.clone()).with_payload("p")])
                    .await
                    .map_err(|e| TestCaseError::fail(format!("write failed: {}", e)))?;
            }

            let all = f
                .stash
                .get_items(&ctx, "u1", collection, &ItemQuery::new())
                .await
                .map_err(|e| TestCaseError::fail(format!("read failed: {}", e)))?;
            let mut bounds: Vec<Timestamp> = all.iter().map(|bso| bso.modified).collect();
            bounds.extend(
                all.iter()
                    .map(|bso| Timestamp::from_millis(bso.modified.as_millis() + 1)),
            );

            for bound in bounds {
                let got: BTreeSet<String> = f
                    .stash
                    .get_item_ids(&ctx, "u1", collection, &ItemQuery::new().with_older(bound))
                    .await
                    .map_err(|e| TestCaseError::fail(format!("read failed: {}", e)))?
                    .into_iter()
                    .collect();
                let expected: BTreeSet<String> = all
                    .iter()
                    .filter(|bso| bso.modified < bound)
                    .map(|bso| bso.id.clone())
                    .collect();
                prop_assert_eq!(got, expected);
            }
            Ok(())
        })?;
    }

    /// Cached, cache-only and uncached collections answer the same writes
    /// with the same items.
    #[test]
    fn prop_strategies_agree_on_contents(
        batches in prop::collection::vec(prop::collection::vec(arb_bso_update(), 1..4), 1..5),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let f = StashFixture::standard();
            let ctx = CallContext::new();
            for batch in &batches {
                for collection in ["history", "bookmarks", "tabs"] {
                    f.stash
                        .set_items(&ctx, "u1", collection, batch)
                        .await
                        .map_err(|e| TestCaseError::fail(format!("write failed: {}", e)))?;
                }
            }

            let mut views = Vec::new();
            for collection in ["history", "bookmarks", "tabs"] {
                let items = f
                    .stash
                    .get_items(&ctx, "u1", collection, &ItemQuery::new())
                    .await
                    .map_err(|e| TestCaseError::fail(format!("read failed: {}", e)))?;
                let view: Vec<_> = items
                    .into_iter()
                    .map(|bso| (bso.id, bso.payload, bso.sortindex, bso.ttl))
                    .collect();
                views.push(view);
            }
            prop_assert_eq!(&views[0], &views[1]);
            prop_assert_eq!(&views[0], &views[2]);
            Ok(())
        })?;
    }
}
