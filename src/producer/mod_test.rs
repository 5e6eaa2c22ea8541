use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use super::*;
use crate::cluster::MemoryCluster;
use crate::config::Config;
use crate::fixtures;

#[test]
fn vbucket_node_assignment_covers_all_vbuckets_without_overlap() {
    let members = fixtures::members(&["node-0", "node-1"]);

    let assignment = vbucket_node_assignment(&members);

    assert_eq!(assignment.len(), NUM_VBUCKETS as usize, "expected all vbuckets assigned, got {}", assignment.len());
    let node0 = assignment.values().filter(|uuid| uuid.as_str() == "node-0").count();
    let node1 = assignment.values().filter(|uuid| uuid.as_str() == "node-1").count();
    assert_eq!(node0, 512, "expected an even split for node-0, got {}", node0);
    assert_eq!(node1, 512, "expected an even split for node-1, got {}", node1);
}

#[test]
fn vbucket_node_assignment_is_deterministic_across_orderings() {
    let forward = vbucket_node_assignment(&fixtures::members(&["node-0", "node-1", "node-2"]));
    let reversed = vbucket_node_assignment(&fixtures::members(&["node-2", "node-1", "node-0"]));

    assert_eq!(forward, reversed, "expected assignment to be independent of member ordering");
}

#[test]
fn vbucket_node_assignment_simulated_node_change_recovers_full_cover() {
    let before = vbucket_node_assignment(&fixtures::members(&["node-0", "node-1", "node-2"]));
    let after = vbucket_node_assignment(&fixtures::members(&["node-0", "node-2"]));

    assert_eq!(after.len(), NUM_VBUCKETS as usize, "expected all vbuckets covered after node loss, got {}", after.len());
    assert!(after.values().all(|uuid| uuid != "node-1"), "expected no vbucket left on the departed node");
    assert!(before.values().any(|uuid| uuid == "node-1"), "expected the departed node to have owned vbuckets before");
}

#[test]
fn worker_vbucket_map_splits_contiguously_without_overlap() {
    let vbuckets: Vec<u16> = (0..NUM_VBUCKETS).collect();

    let map = worker_vbucket_map("app_one", &vbuckets, 3);

    assert_eq!(map.len(), 3, "expected 3 workers, got {}", map.len());
    let mut seen = HashSet::new();
    for vbs in map.values() {
        for vb in vbs {
            assert!(seen.insert(*vb), "vbucket {} assigned to more than one worker", vb);
        }
    }
    assert_eq!(seen.len(), NUM_VBUCKETS as usize, "expected all vbuckets covered, got {}", seen.len());
}

#[test]
fn worker_vbucket_map_bounds_workers_by_vbucket_count() {
    let map = worker_vbucket_map("app_one", &[0, 1], 8);
    assert_eq!(map.len(), 2, "expected workers bounded by vbucket count, got {}", map.len());
}

#[tokio::test]
async fn repartition_assigns_and_spawns_workers_for_owned_share() -> Result<()> {
    let config = Config::new_test();
    let cluster = Arc::new(MemoryCluster::new(fixtures::members(&["node-0", "node-1"])));
    let (producer, _ack_rx) = Producer::new("app_one".into(), config, cluster);

    producer.repartition().await?;

    let assignment = producer.assignment_map();
    assert_eq!(assignment.len(), NUM_VBUCKETS as usize, "expected a full assignment, got {}", assignment.len());
    let owned: Vec<u16> = assignment.iter().filter(|(_, uuid)| uuid.as_str() == "node-0").map(|(vb, _)| *vb).collect();
    assert_eq!(owned.len(), 512, "expected this node to own half the vbuckets, got {}", owned.len());

    let worker_map = producer.worker_map();
    assert_eq!(worker_map.len(), 3, "expected one shard per configured worker, got {}", worker_map.len());
    let sharded: usize = worker_map.values().map(|vbs| vbs.len()).sum();
    assert_eq!(sharded, 512, "expected the owned share fully sharded, got {}", sharded);

    producer.teardown_workers().await;
    Ok(())
}

#[tokio::test]
async fn repartition_respects_staged_keep_nodes() -> Result<()> {
    let config = Config::new_test();
    let cluster = Arc::new(MemoryCluster::new(fixtures::members(&["node-0", "node-1", "node-2"])));
    let (producer, _ack_rx) = Producer::new("app_one".into(), config, cluster);

    producer.notify_prepare_topology_change(vec!["node-0".into(), "node-2".into()]);
    producer.repartition().await?;

    let assignment = producer.assignment_map();
    assert!(assignment.values().all(|uuid| uuid != "node-1"), "expected no vbucket assigned to the ejected node");
    assert!(!producer.rebalance_status(), "expected no pending rebalance once assignment matches the keep set");

    producer.teardown_workers().await;
    Ok(())
}

#[tokio::test]
async fn update_settings_rejects_unknown_options_atomically() -> Result<()> {
    let config = Config::new_test();
    let cluster = Arc::new(MemoryCluster::new(fixtures::members(&["node-0"])));
    let (producer, _ack_rx) = Producer::new("app_one".into(), config, cluster);

    let before = producer.settings();
    let res = producer.update_settings(json!({"pause": true, "bogus_option": 1})).await;

    assert!(res.is_err(), "expected an unknown option to reject the update");
    assert_eq!(producer.settings(), before, "expected no settings mutation on a rejected update");

    let res = producer.update_settings(json!({"worker_count": 0})).await;
    assert!(res.is_err(), "expected worker_count of 0 to be rejected");
    assert_eq!(producer.settings(), before, "expected no settings mutation on a rejected update");

    Ok(())
}

#[tokio::test]
async fn pause_retains_assignment_and_resume_respawns_workers() -> Result<()> {
    let config = Config::new_test();
    let cluster = Arc::new(MemoryCluster::new(fixtures::members(&["node-0"])));
    let (producer, _ack_rx) = Producer::new("app_one".into(), config, cluster);
    producer.repartition().await?;
    let worker_map = producer.worker_map();
    assert!(!worker_map.is_empty(), "expected workers after initial assignment");

    producer.update_settings(json!({"pause": true})).await?;
    assert!(producer.settings().pause, "expected pause to be applied");
    assert_eq!(producer.worker_map(), worker_map, "expected the worker map to be retained while paused");
    assert_eq!(producer.remaining_events(), 0, "expected no live workers while paused");
    assert_eq!(
        producer.assignment_map().len(),
        NUM_VBUCKETS as usize,
        "expected vbucket ownership retained while paused"
    );

    producer.update_settings(json!({"pause": false})).await?;
    let resumed = producer.worker_map();
    let sharded: usize = resumed.values().map(|vbs| vbs.len()).sum();
    assert_eq!(sharded, NUM_VBUCKETS as usize, "expected the full share resharded on resume, got {}", sharded);

    producer.teardown_workers().await;
    Ok(())
}

#[tokio::test]
async fn watcher_notifies_once_per_observed_change() -> Result<()> {
    let cluster = Arc::new(MemoryCluster::new(fixtures::members(&["node-0"])));
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(1);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let watcher = watcher::ClusterChangeWatcher::new("app_one".into(), cluster.clone(), notify_tx, stop_rx).spawn();

    // Wait for the initial subscription, then trigger a change.
    fixtures::wait_for(|| cluster.subscriber_count() == 1, "watcher to subscribe").await;
    cluster.set_members(fixtures::members(&["node-0", "node-1"]));

    let notified = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv()).await;
    assert!(matches!(notified, Ok(Some(true))), "expected a single change notification");
    assert!(notify_rx.try_recv().is_err(), "expected no duplicate notification for the same change");

    // The watcher re-subscribes after the fixed interval.
    fixtures::wait_for(|| cluster.subscriber_count() == 1, "watcher to re-subscribe").await;

    let _res = stop_tx.send(true);
    watcher.await??;
    Ok(())
}

#[tokio::test]
async fn watcher_restarts_on_closed_channel_without_notifying() -> Result<()> {
    let cluster = Arc::new(MemoryCluster::new(fixtures::members(&["node-0"])));
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(1);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let watcher = watcher::ClusterChangeWatcher::new("app_one".into(), cluster.clone(), notify_tx, stop_rx).spawn();

    fixtures::wait_for(|| cluster.subscriber_count() == 1, "watcher to subscribe").await;
    cluster.drop_subscribers();

    // Restarting -> Watching again after the fixed interval, no notification sent.
    fixtures::wait_for(|| cluster.subscriber_count() == 1, "watcher to re-subscribe after channel close").await;
    assert!(notify_rx.try_recv().is_err(), "expected no notification for a closed channel");

    let _res = stop_tx.send(true);
    watcher.await??;
    Ok(())
}

#[tokio::test]
async fn watcher_retries_after_subscribe_errors() -> Result<()> {
    let cluster = Arc::new(MemoryCluster::new(fixtures::members(&["node-0"])));
    cluster.fail_next_subscribes(2);
    let (notify_tx, _notify_rx) = tokio::sync::mpsc::channel(1);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let watcher = watcher::ClusterChangeWatcher::new("app_one".into(), cluster.clone(), notify_tx, stop_rx).spawn();

    fixtures::wait_for(|| cluster.subscriber_count() == 1, "watcher to subscribe after transient errors").await;

    let _res = stop_tx.send(true);
    watcher.await??;
    Ok(())
}
