//! Multi-node behavior: replication, partitions and snapshot catch-up.

mod fixtures;

use std::time::Duration;

use fixtures::{harness, payloads};
use raftling::{GroupState, Status};

const WAIT: Duration = Duration::from_secs(15);

#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_replicate_and_apply_in_order() -> anyhow::Result<()> {
    let h = harness(3, |_| {}).await?;
    let leader = h.wait_leader(WAIT).await?;

    let mut last = 0;
    for payload in [&b"a"[..], &b"b"[..], &b"c"[..]] {
        last = h.node(leader).raft.propose(payload).await?;
    }

    // Every node applies the full prefix.
    for id in 1..=3 {
        h.wait_node(id, WAIT, "replicated", |m| m.applied_index >= last).await?;
        assert_eq!(
            payloads(&h.node(id).sm),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            "node {id} applied out of order"
        );
    }

    // The leader observes full replication progress on each peer.
    let leader_raft = &h.node(leader).raft;
    assert!(leader_raft.committed_index() >= last);
    for peer in leader_raft.cluster().peers() {
        assert!(peer.match_index() >= last, "peer {} lags", peer.id);
    }

    h.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn follower_redirects_proposals() -> anyhow::Result<()> {
    let h = harness(3, |_| {}).await?;
    let leader = h.wait_leader(WAIT).await?;
    let follower = (1..=3).find(|id| *id != leader).unwrap();

    let err = h.node(follower).raft.propose(&b"x"[..]).await.unwrap_err();
    match err {
        raftling::ProposeError::NotLeader { leader: Some(l) } => assert_eq!(l, leader),
        other => panic!("expected a leader redirect, got {other:?}"),
    }

    h.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_leader_steps_down_and_cluster_recovers() -> anyhow::Result<()> {
    let h = harness(3, |_| {}).await?;
    let old_leader = h.wait_leader(WAIT).await?;

    h.router.isolate(old_leader);

    // Two consecutive lease windows without quorum support force the
    // step-down, and the lost peers push the group unavailable.
    h.wait_node(old_leader, WAIT, "step down", |m| m.status == Status::Follower).await?;
    h.wait_node(old_leader, WAIT, "unavailable", |m| {
        m.group_state == GroupState::Unavailable
    })
    .await?;

    // The remaining majority elects a successor at a higher term.
    let deadline = std::time::Instant::now() + WAIT;
    let new_leader = loop {
        let found = (1..=3).filter(|id| *id != old_leader).find(|id| {
            h.node(*id).raft.status() == Status::Leader
        });
        if let Some(id) = found {
            break id;
        }
        anyhow::ensure!(std::time::Instant::now() < deadline, "no successor elected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let index = h.node(new_leader).raft.propose(&b"after-partition"[..]).await?;
    h.wait_node(new_leader, WAIT, "applied", |m| m.applied_index >= index).await?;

    // The healed node rejoins as a follower and catches up.
    h.router.heal(old_leader);
    h.wait_node(old_leader, WAIT, "caught up", |m| m.applied_index >= index).await?;
    assert!(payloads(&h.node(old_leader).sm).contains(&b"after-partition".to_vec()));

    h.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_follower_catches_up_through_a_snapshot() -> anyhow::Result<()> {
    let h = harness(3, |config| {
        config.snapshot_trigger_threshold = 8;
        config.snapshot_trigger_check_interval_seconds = 1;
    })
    .await?;
    let leader = h.wait_leader(WAIT).await?;
    let straggler = (1..=3).find(|id| *id != leader).unwrap();

    h.router.isolate(straggler);

    let mut last = 0;
    for i in 0..20 {
        last = h.node(leader).raft.propose(format!("entry-{i}")).await?;
    }
    h.wait_node(leader, WAIT, "leader applied", |m| m.applied_index >= last).await?;

    // Wait for a snapshot build plus the log compaction behind it, so
    // the straggler can only catch up through a snapshot install.
    h.wait_node(leader, WAIT, "snapshot built", |m| m.snapshot_index > 0).await?;
    h.wait_node(leader, WAIT, "log compacted", |m| m.first_index > 1).await?;

    h.router.heal(straggler);

    h.wait_node(straggler, WAIT, "snapshot installed", |m| m.snapshot_index > 0).await?;
    h.wait_node(straggler, WAIT, "caught up", |m| m.applied_index >= last).await?;

    // State machines converge: the straggler restores from the snapshot
    // body and replays the remaining suffix.
    let expected = payloads(&h.node(leader).sm);
    let got = payloads(&h.node(straggler).sm);
    assert_eq!(got, expected);

    h.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn group_state_listener_observes_transitions() -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let h = harness(3, |_| {}).await?;
    let leader = h.wait_leader(WAIT).await?;

    let transitions = Arc::new(AtomicUsize::new(0));
    let seen = transitions.clone();
    h.node(leader)
        .raft
        .add_group_state_listener(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

    let peer = (1..=3).find(|id| *id != leader).unwrap();
    h.router.isolate(peer);

    h.wait_node(leader, WAIT, "partial", |m| m.group_state == GroupState::Partial).await?;
    assert!(transitions.load(Ordering::SeqCst) >= 1);

    h.router.heal(peer);
    h.wait_node(leader, WAIT, "stable again", |m| m.group_state == GroupState::Stable).await?;

    h.shutdown().await;
    Ok(())
}
