use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;

use super::*;
use crate::cluster::RebalanceProgress;
use crate::error::{as_service_error, ServiceError};
use crate::fixtures;
use crate::metakv::METAKV_KEEP_NODES_PATH;
use crate::utils::encode_rev;

fn cancel_channel() -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
    oneshot::channel()
}

/// Script nonzero remaining movement so an in-flight rebalance stays in flight.
fn hold_rebalance_open(fixture: &fixtures::ServiceFixture) {
    for idx in 0..3 {
        fixture.peers.set_progress(
            &fixtures::member_addr(idx),
            RebalanceProgress {
                vbs_remaining_to_shuffle: 64,
                vbs_owned_per_plan: 256,
            },
        );
    }
}

#[tokio::test]
async fn start_without_matching_prepare_conflicts() -> Result<()> {
    let fixture = fixtures::service_fixture();

    let res = fixture.mgr.start_topology_change(fixtures::topology_change("reb-1", TopologyChangeType::Rebalance, &["node-0"])).await;

    let err = res.expect_err("expected a conflict for an unprepared change");
    assert_eq!(as_service_error(&err), Some(ServiceError::Conflict), "expected Conflict, got {:#}", err);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_twice_with_same_change_id_conflicts_while_active() -> Result<()> {
    let fixture = fixtures::service_fixture();
    hold_rebalance_open(&fixture);
    let change = fixtures::topology_change("reb-1", TopologyChangeType::Rebalance, &["node-0", "node-1", "node-2"]);

    fixture.mgr.prepare_topology_change(change.clone()).await?;
    fixture.mgr.start_topology_change(change.clone()).await?;

    let err = fixture.mgr.start_topology_change(change).await.expect_err("expected a conflict while the rebalance is active");
    assert_eq!(as_service_error(&err), Some(ServiceError::Conflict), "expected Conflict, got {:#}", err);

    // Cancel the running rebalance; the done callback clears the slot.
    let task_id = {
        let (_cancel_tx, cancel_rx) = cancel_channel();
        let tasks = fixture.mgr.get_task_list(None, cancel_rx).await?;
        tasks.tasks[0].id.clone()
    };
    fixture.mgr.cancel_task(&task_id, None).await?;
    for _ in 0..100 {
        let (_cancel_tx, cancel_rx) = cancel_channel();
        if fixture.mgr.get_task_list(None, cancel_rx).await?.tasks.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("rebalance task never cleared after cancel");
}

#[tokio::test(start_paused = true)]
async fn stale_topology_revision_conflicts() -> Result<()> {
    let fixture = fixtures::service_fixture();
    let mut change = fixtures::topology_change("reb-1", TopologyChangeType::Rebalance, &["node-0", "node-1", "node-2"]);
    fixture.mgr.prepare_topology_change(change.clone()).await?;

    change.current_topology_rev = Some(encode_rev(999));
    let err = fixture.mgr.start_topology_change(change).await.expect_err("expected a conflict for a stale revision");
    assert_eq!(as_service_error(&err), Some(ServiceError::Conflict), "expected Conflict, got {:#}", err);
    Ok(())
}

#[tokio::test]
async fn unknown_change_type_is_not_supported() -> Result<()> {
    let fixture = fixtures::service_fixture();
    let change = fixtures::topology_change("reb-1", TopologyChangeType::Unknown, &["node-0"]);
    fixture.mgr.prepare_topology_change(change.clone()).await?;

    let err = fixture.mgr.start_topology_change(change).await.expect_err("expected unknown change types to be rejected");
    assert_eq!(as_service_error(&err), Some(ServiceError::NotSupported), "expected NotSupported, got {:#}", err);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bootstrapping_apps_fail_rebalance_admission() -> Result<()> {
    let fixture = fixtures::service_fixture();
    hold_rebalance_open(&fixture);
    fixture.peers.set_bootstrapping(&fixtures::member_addr(1), vec!["app_one".into()]);
    let change = fixtures::topology_change("reb-1", TopologyChangeType::Rebalance, &["node-0", "node-1", "node-2"]);
    fixture.mgr.prepare_topology_change(change.clone()).await?;

    let err = fixture.mgr.start_topology_change(change.clone()).await.expect_err("expected the bootstrap check to fail the call");
    assert_eq!(as_service_error(&err), None, "expected the bootstrap error to propagate verbatim, got {:#}", err);
    assert!(format!("{:#}", err).contains("app_one"), "expected the bootstrapping app in the error, got {:#}", err);

    // No rebalancer was created: only the prepared task remains, and a
    // subsequent start succeeds once bootstrap completes everywhere.
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let tasks = fixture.mgr.get_task_list(None, cancel_rx).await?;
    assert_eq!(tasks.tasks.len(), 1, "expected only the prepared task, got {:?}", tasks.tasks);
    assert_eq!(tasks.tasks[0].task_type, TaskType::Prepared, "expected only the prepared task, got {:?}", tasks.tasks);

    fixture.peers.set_bootstrapping(&fixtures::member_addr(1), Vec::new());
    fixture.mgr.start_topology_change(change).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failover_start_persists_keep_nodes_and_flags_recovery() -> Result<()> {
    let fixture = fixtures::service_fixture();
    let change = fixtures::topology_change("fo-1", TopologyChangeType::Failover, &["node-0", "node-2"]);
    fixture.mgr.prepare_topology_change(change.clone()).await?;
    fixture.mgr.start_topology_change(change).await?;

    let stored = fixture.metakv.get(METAKV_KEEP_NODES_PATH).expect("expected the retained-node set to be persisted");
    let stored: Vec<String> = serde_json::from_slice(&stored)?;
    assert_eq!(stored, vec!["node-0".to_string(), "node-2".to_string()], "unexpected persisted keep nodes: {:?}", stored);

    let (_cancel_tx, cancel_rx) = cancel_channel();
    let tasks = fixture.mgr.get_task_list(None, cancel_rx).await?;
    let failover = tasks.tasks.iter().find(|task| task.task_type == TaskType::Failover).expect("expected a failover-recovery task");
    assert!(!failover.is_cancelable, "expected the failover-recovery task to be non-cancelable");

    let err = fixture.mgr.cancel_task(&failover.id, None).await.expect_err("expected cancel of a non-cancelable task to fail");
    assert_eq!(as_service_error(&err), Some(ServiceError::NotSupported), "expected NotSupported, got {:#}", err);
    Ok(())
}

#[tokio::test]
async fn cancel_task_vocabulary_not_found_and_conflict() -> Result<()> {
    let fixture = fixtures::service_fixture();

    let err = fixture.mgr.cancel_task("no-such-task", None).await.expect_err("expected unknown ids to fail");
    assert_eq!(as_service_error(&err), Some(ServiceError::NotFound), "expected NotFound, got {:#}", err);

    let change = fixtures::topology_change("reb-1", TopologyChangeType::Rebalance, &["node-0"]);
    fixture.mgr.prepare_topology_change(change).await?;

    let err = fixture
        .mgr
        .cancel_task("reb-1", Some(encode_rev(999)))
        .await
        .expect_err("expected a stale revision to fail");
    assert_eq!(as_service_error(&err), Some(ServiceError::Conflict), "expected Conflict, got {:#}", err);

    // Canceling the prepared task with its own revision un-prepares the change.
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let tasks = fixture.mgr.get_task_list(None, cancel_rx).await?;
    fixture.mgr.cancel_task("reb-1", Some(tasks.tasks[0].rev.clone())).await?;
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let tasks = fixture.mgr.get_task_list(None, cancel_rx).await?;
    assert!(tasks.tasks.is_empty(), "expected no tasks after un-prepare, got {:?}", tasks.tasks);
    Ok(())
}

#[tokio::test]
async fn get_task_list_blocks_until_revision_advances() -> Result<()> {
    let fixture = fixtures::service_fixture();
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let current = fixture.mgr.get_task_list(None, cancel_rx).await?.rev;

    let mgr = fixture.mgr.clone();
    let (_blocked_cancel_tx, blocked_cancel_rx) = cancel_channel();
    let rev = current.clone();
    let blocked = tokio::spawn(async move { mgr.get_task_list(Some(rev), blocked_cancel_rx).await });

    // The call must still be blocked while the revision is unchanged.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!blocked.is_finished(), "expected get_task_list to block on an unchanged revision");

    let change = fixtures::topology_change("reb-1", TopologyChangeType::Rebalance, &["node-0"]);
    fixture.mgr.prepare_topology_change(change).await?;

    let tasks = tokio::time::timeout(Duration::from_secs(5), blocked).await???;
    assert_ne!(tasks.rev, current, "expected an advanced revision");
    assert_eq!(tasks.tasks.len(), 1, "expected the prepared task, got {:?}", tasks.tasks);
    Ok(())
}

#[tokio::test]
async fn get_task_list_wait_is_interrupted_by_cancel() -> Result<()> {
    let fixture = fixtures::service_fixture();
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let current = fixture.mgr.get_task_list(None, cancel_rx).await?.rev;

    let mgr = fixture.mgr.clone();
    let (blocked_cancel_tx, blocked_cancel_rx) = cancel_channel();
    let blocked = tokio::spawn(async move { mgr.get_task_list(Some(current), blocked_cancel_rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let _res = blocked_cancel_tx.send(());

    let res = tokio::time::timeout(Duration::from_secs(5), blocked).await??;
    let err = res.expect_err("expected the canceled wait to fail");
    assert_eq!(as_service_error(&err), Some(ServiceError::Canceled), "expected Canceled, got {:#}", err);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn topology_reflects_keep_nodes_and_balance() -> Result<()> {
    let fixture = fixtures::service_fixture();
    hold_rebalance_open(&fixture);
    let change = fixtures::topology_change("reb-1", TopologyChangeType::Rebalance, &["node-0", "node-1", "node-2"]);
    fixture.mgr.prepare_topology_change(change.clone()).await?;

    let (_cancel_tx, cancel_rx) = cancel_channel();
    let topology = fixture.mgr.get_current_topology(None, cancel_rx).await?;
    assert_eq!(topology.nodes.len(), 3, "expected the keep set in the topology, got {:?}", topology.nodes);
    assert!(topology.is_balanced, "expected a balanced topology before the rebalance starts");

    fixture.mgr.start_topology_change(change).await?;
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let topology = fixture.mgr.get_current_topology(None, cancel_rx).await?;
    assert!(!topology.is_balanced, "expected an unbalanced topology while the rebalance runs");
    Ok(())
}
