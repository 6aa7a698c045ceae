mod common;

use common::{Harness, PAYER, ScriptedPeer, hash_of};
use explorer_indexer::config::SyncConfig;
use explorer_indexer::core::{StepOutcome, SyncLoop};
use explorer_indexer::storage::Store;
use explorer_indexer::{IndexerError, SyncState};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Steps until the loop has nothing left to do.
async fn sync_to_tip(sync: &mut SyncLoop) {
    for _ in 0..50 {
        if sync.step().await.unwrap() == StepOutcome::Waiting {
            return;
        }
    }
    panic!("sync loop did not settle");
}

#[tokio::test]
async fn test_linear_chain_is_fully_indexed() {
    let harness = Harness::new(ScriptedPeer::linear(10), SyncConfig::default());
    let mut sync = harness.sync_loop();
    assert_eq!(sync.restore().await.unwrap(), None);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 0, to: 9 }
    );
    assert_eq!(sync.state(), SyncState::CatchingUp);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 10, to: 10 }
    );
    assert_eq!(sync.step().await.unwrap(), StepOutcome::Waiting);
    assert_eq!(sync.state(), SyncState::Live);

    let cursor = harness.store.read_cursor().await.unwrap().unwrap();
    assert_eq!(cursor.height, 10);
    assert_eq!(cursor.hash, hash_of(0, 10));
    assert_eq!(sync.cursor(), Some(cursor));
    assert_eq!(harness.store.heights().await, (0..=10).collect::<Vec<_>>());
    assert_eq!(
        harness.store.find_linkage_break(0, 10).await.unwrap(),
        None
    );

    let status = sync.status();
    assert_eq!(status.lag, Some(0));
    assert!(status.is_synced(harness.config.sync.max_sync_lag));
}

#[tokio::test]
async fn test_fork_rewinds_to_common_ancestor_and_reextends() {
    let harness = Harness::new(ScriptedPeer::linear(10), SyncConfig::default());
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;

    harness.peer.fork_from(8, 12, 1);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Diverged { anchor: 10 }
    );
    assert_eq!(sync.state(), SyncState::ReorgRecovery);
    // the prefetched 11 and 12 were dropped, nothing was written
    assert_eq!(harness.store.len().await, 11);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Rewound {
            ancestor: Some(7),
            removed_blocks: 3
        }
    );
    assert_eq!(sync.state(), SyncState::CatchingUp);
    assert_eq!(harness.store.heights().await, (0..=7).collect::<Vec<_>>());
    assert!(harness.store.stake_rewards_at(8).await.unwrap().is_empty());

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 8, to: 12 }
    );

    let cursor = harness.store.read_cursor().await.unwrap().unwrap();
    assert_eq!(cursor.height, 12);
    assert_eq!(cursor.hash, hash_of(1, 12));
    assert_eq!(
        harness.store.read_block_hash(9).await.unwrap(),
        Some(hash_of(1, 9))
    );
    assert_eq!(
        harness.store.find_linkage_break(0, 12).await.unwrap(),
        None
    );

    // 13 blocks survive, each charging the payer a fee of 10
    assert_eq!(harness.store.balance(PAYER).await.unwrap(), Some(-130));
    assert_eq!(
        harness
            .store
            .mapping_value("credits.aleo", "account", PAYER)
            .await
            .unwrap()
            .as_deref(),
        Some("1x12u64")
    );
}

#[tokio::test]
async fn test_peer_errors_pause_then_retry_same_height() {
    let sync_config = SyncConfig {
        batch_size: 1,
        ..SyncConfig::default()
    };
    let harness = Harness::new(ScriptedPeer::linear(3), sync_config);
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();

    harness.peer.fail_next(5);
    let outcome = sync.step().await.unwrap();
    assert!(matches!(outcome, StepOutcome::Paused { .. }), "{outcome:?}");
    assert_eq!(sync.state(), SyncState::Paused);
    assert_eq!(harness.peer.block_calls(), 5);
    assert_eq!(sync.cursor(), None);
    assert!(sync.status().last_error.is_some());

    assert!(matches!(
        sync.step().await.unwrap(),
        StepOutcome::Cooling { .. }
    ));
    assert_eq!(sync.state(), SyncState::Paused);

    harness.clock.advance(harness.config.sync.pause_cooldown());
    assert_eq!(sync.step().await.unwrap(), StepOutcome::Resumed);
    assert_eq!(sync.state(), SyncState::CatchingUp);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 0, to: 0 }
    );
    assert_eq!(harness.peer.block_calls(), 6);
    assert_eq!(sync.status().last_error, None);
}

#[tokio::test]
async fn test_errors_within_retry_budget_do_not_pause() {
    let sync_config = SyncConfig {
        batch_size: 1,
        ..SyncConfig::default()
    };
    let harness = Harness::new(ScriptedPeer::linear(3), sync_config);
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();

    harness.peer.fail_next(4);
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 0, to: 0 }
    );
    assert_eq!(harness.peer.block_calls(), 5);
}

#[tokio::test]
async fn test_divergence_deeper_than_limit_halts() {
    let sync_config = SyncConfig {
        max_reorg_depth: 3,
        ..SyncConfig::default()
    };
    let harness = Harness::new(ScriptedPeer::linear(10), sync_config);
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;

    harness.peer.fork_from(2, 12, 1);
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Diverged { anchor: 10 }
    );

    let err = sync.step().await.unwrap_err();
    assert!(
        matches!(
            err,
            IndexerError::ChainDivergenceTooDeep {
                anchor: 10,
                max_depth: 3
            }
        ),
        "{err}"
    );
    assert_eq!(sync.state(), SyncState::Halted);
    assert!(sync.step().await.is_err());

    // nothing was rewound
    assert_eq!(harness.store.len().await, 11);
}

#[tokio::test]
async fn test_divergence_of_exactly_max_depth_is_recovered() {
    let sync_config = SyncConfig {
        max_reorg_depth: 3,
        ..SyncConfig::default()
    };
    let harness = Harness::new(ScriptedPeer::linear(10), sync_config);
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;

    // 8, 9 and 10 are replaced: three blocks to rewind
    harness.peer.fork_from(8, 12, 1);
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Diverged { anchor: 10 }
    );
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Rewound {
            ancestor: Some(7),
            removed_blocks: 3
        }
    );
    assert_eq!(sync.state(), SyncState::CatchingUp);
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 8, to: 12 }
    );
}

#[tokio::test]
async fn test_genesis_mismatch_halts_instead_of_wiping() {
    let harness = Harness::new(ScriptedPeer::linear(2), SyncConfig::default());
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;

    harness.peer.fork_from(0, 2, 1);
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Diverged { anchor: 2 }
    );

    let err = sync.step().await.unwrap_err();
    assert!(
        matches!(err, IndexerError::ChainDivergenceTooDeep { anchor: 2, .. }),
        "{err}"
    );
    assert_eq!(sync.state(), SyncState::Halted);
    assert_eq!(harness.store.len().await, 3);
}

#[tokio::test]
async fn test_replaced_tip_block_is_detected() {
    let harness = Harness::new(ScriptedPeer::linear(10), SyncConfig::default());
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;
    sync.flush_cache().await;

    // same height, different block 10
    harness.peer.fork_from(10, 10, 1);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Diverged { anchor: 10 }
    );
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Rewound {
            ancestor: Some(9),
            removed_blocks: 1
        }
    );
    // the orphaned block is not served while the new one is fetched
    let tip = harness.invalidator.tip().await.unwrap().unwrap();
    assert_eq!((tip.height, tip.hash), (9, hash_of(0, 9)));

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 10, to: 10 }
    );
    assert_eq!(
        harness.store.read_block_hash(10).await.unwrap(),
        Some(hash_of(1, 10))
    );

    sync.flush_cache().await;
    let tip = harness.invalidator.tip().await.unwrap().unwrap();
    assert_eq!(tip.hash, hash_of(1, 10));
    assert_eq!(sync.step().await.unwrap(), StepOutcome::Waiting);
}

#[tokio::test]
async fn test_peer_tip_below_cursor_is_revalidated() {
    let harness = Harness::new(ScriptedPeer::linear(10), SyncConfig::default());
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;

    // the peer rolled back to a different block 8
    harness.peer.fork_from(8, 8, 1);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Diverged { anchor: 8 }
    );
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Rewound {
            ancestor: Some(7),
            removed_blocks: 3
        }
    );
    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 8, to: 8 }
    );
    assert_eq!(sync.cursor().map(|c| c.hash), Some(hash_of(1, 8)));
}

#[tokio::test]
async fn test_peer_tip_below_cursor_on_same_chain_waits() {
    let harness = Harness::new(ScriptedPeer::linear(10), SyncConfig::default());
    let mut sync = harness.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;

    harness.peer.truncate(9);
    assert_eq!(sync.step().await.unwrap(), StepOutcome::Waiting);
    assert_eq!(harness.store.len().await, 11);
}

#[tokio::test]
async fn test_restart_resumes_from_stored_cursor() {
    let first = Harness::new(ScriptedPeer::linear(5), SyncConfig::default());
    let mut sync = first.sync_loop();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;
    drop(sync);

    let second = Harness::with_store(
        ScriptedPeer::linear(10),
        SyncConfig::default(),
        first.store.clone(),
    );
    let mut sync = second.sync_loop();
    let restored = sync.restore().await.unwrap().unwrap();
    assert_eq!(restored.height, 5);

    assert_eq!(
        sync.step().await.unwrap(),
        StepOutcome::Committed { from: 6, to: 10 }
    );
    assert_eq!(second.peer.block_calls(), 5);
    assert_eq!(first.store.heights().await, (0..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_run_stops_on_cancellation_between_blocks() {
    let harness = Harness::new(ScriptedPeer::linear(10), SyncConfig::default());
    let sync = harness.sync_loop();
    let mut status = sync.subscribe();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(sync.run(cancel.clone()));

    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.cursor.map(|c| c.height) == Some(10)),
    )
    .await
    .expect("sync loop reached the tip")
    .unwrap();

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(harness.store.len().await, 11);
    assert_eq!(
        harness.store.read_cursor().await.unwrap().map(|c| c.hash),
        Some(hash_of(0, 10))
    );
}

#[tokio::test]
async fn test_status_is_published() {
    let harness = Harness::new(ScriptedPeer::linear(2), SyncConfig::default());
    let mut sync = harness.sync_loop();
    let status = sync.subscribe();
    sync.restore().await.unwrap();
    sync_to_tip(&mut sync).await;

    let snapshot = status.borrow().clone();
    assert_eq!(snapshot.state, SyncState::Live);
    assert_eq!(snapshot.peer_tip, Some(2));
    assert_eq!(snapshot.cursor.map(|c| c.height), Some(2));
}
