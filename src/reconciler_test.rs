use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;

use crate::fixtures::SimCluster;
use crate::mgmt::Credentials;
use crate::reconciler::{PassOutcome, Reconciler, Requeue, Settings};
use cass_core::crd::{CassandraDatacenter, CassandraDatacenterStatus, ProgressState, Rack};

/// The most passes any scenario may take to converge.
const MAX_PASSES: usize = 200;

fn datacenter(racks: &[&str], size: u32) -> CassandraDatacenter {
    let mut dc: CassandraDatacenter = serde_json::from_value(json!({
        "apiVersion": "cassandra.datastax.com/v1beta1",
        "kind": "CassandraDatacenter",
        "metadata": {"name": "dc1", "namespace": "default", "generation": 1},
        "spec": {
            "size": size,
            "serverType": "cassandra",
            "serverVersion": "3.11.6",
            "clusterName": "cluster1",
            "storageConfig": {"cassandraDataVolumeClaimSpec": {"resources": {"requests": {"storage": "1Gi"}}}},
            "racks": racks.iter().map(|name| json!({"name": name})).collect::<Vec<_>>(),
        },
    }))
    .expect("fixture datacenter should deserialize");
    dc.status = None;
    dc
}

struct Harness {
    sim: Arc<SimCluster>,
    reconciler: Reconciler,
    dc: CassandraDatacenter,
    last: Option<PassOutcome>,
    /// The requeue decision of every pass run so far.
    requeues: Vec<Requeue>,
}

impl Harness {
    fn new(dc: CassandraDatacenter, budget: u32) -> Self {
        let sim = Arc::new(SimCluster::default());
        sim.with(|state| {
            state.superuser = Some(Credentials { username: "admin".into(), password: "secret".into() });
        });
        let reconciler = Reconciler::new(sim.clone(), sim.clone(), Settings { start_retry_budget: budget });
        Self { sim, reconciler, dc, last: None, requeues: vec![] }
    }

    /// Run a single pass, persist its status and let the simulation advance.
    async fn pass(&mut self) -> PassOutcome {
        let outcome = self.reconciler.pass(&self.dc).await;
        self.dc.status = Some(outcome.status.clone());
        self.sim.tick(&self.dc);
        self.requeues.push(outcome.requeue);
        self.last = Some(outcome.clone());
        outcome
    }

    /// Run passes until the datacenter is idle, checking `each` after every pass.
    async fn converge_with(&mut self, mut each: impl FnMut(&SimCluster) -> Result<()>) -> Result<usize> {
        for passes in 1..=MAX_PASSES {
            let outcome = self.pass().await;
            each(&self.sim)?;
            match outcome.requeue {
                Requeue::Idle => return Ok(passes),
                Requeue::Never => bail!("datacenter was rejected: {:?}", outcome.status.message),
                _ => (),
            }
        }
        bail!("datacenter did not converge within {} passes, last outcome {:?}", MAX_PASSES, self.last)
    }

    async fn converge(&mut self) -> Result<usize> {
        self.converge_with(|_| Ok(())).await
    }

    fn status(&self) -> CassandraDatacenterStatus {
        self.dc.status.clone().unwrap_or_default()
    }

    fn node(&self, rack: &str, ordinal: u32) -> String {
        self.dc.pod_name(rack, ordinal)
    }

    fn normal_nodes(&self) -> usize {
        self.sim.with(|state| state.pods.values().filter(|pod| pod.server == "NORMAL").count())
    }

    fn pod_ip(&self, node: &str) -> String {
        self.sim.with(|state| state.pods.get(node).map(|pod| pod.ip.clone()).unwrap_or_default())
    }

    fn calls_since(&self, mark: usize) -> Vec<String> {
        self.sim.with(|state| state.calls[mark..].to_vec())
    }
}

#[tokio::test]
async fn first_reconciliation_builds_a_ready_datacenter() -> Result<()> {
    let mut h = Harness::new(datacenter(&[], 3), 5);
    h.converge().await?;

    let status = h.status();
    assert!(status.cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready, got {:?}", status);
    assert!(h.normal_nodes() == 3, "expected 3 normal nodes, got {}", h.normal_nodes());
    assert!(status.operation.is_none(), "expected no operation in flight, got {:?}", status.operation);
    assert!(status.node_statuses.len() == 3, "expected 3 node statuses, got {:?}", status.node_statuses);
    assert!(status.last_server_node_started.is_some(), "expected lastServerNodeStarted to be stamped");
    assert!(status.super_user_upserted.is_some(), "expected superuser to be upserted once ready");
    assert!(h.sim.calls("upsert_superuser").len() == 1, "expected one superuser upsert, got {:?}", h.sim.calls("upsert_superuser"));
    assert!(h.sim.calls("apply_services").len() == 1, "expected services to be applied once");
    let rack = h.node("default", 0);
    assert!(rack.contains("-default-sts-"), "expected the implicit default rack, got {}", rack);
    Ok(())
}

#[tokio::test]
async fn scale_up_three_to_five_starts_nodes_one_after_another() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 3), 5);
    h.converge().await?;
    let before = h.sim.calls("start").len();

    h.dc.spec.size = 5;
    h.converge_with(|sim| {
        let unsettled = sim.unsettled();
        if unsettled > 1 {
            bail!("expected at most one unsettled node, got {}", unsettled);
        }
        Ok(())
    })
    .await?;

    let starts = h.sim.calls("start");
    let new_starts = &starts[before..];
    let expected = vec![format!("start {}", h.node("r1", 3)), format!("start {}", h.node("r1", 4))];
    assert!(new_starts == expected.as_slice(), "expected starts {:?}, got {:?}", expected, new_starts);
    assert!(h.normal_nodes() == 5, "expected 5 normal nodes, got {}", h.normal_nodes());
    let seeds = h.sim.seeds();
    let expected_seeds = vec![h.node("r1", 0), h.node("r1", 1), h.node("r1", 2)];
    assert!(seeds == expected_seeds, "expected seeds {:?}, got {:?}", expected_seeds, seeds);
    assert!(h.status().cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready");
    Ok(())
}

#[tokio::test]
async fn scale_up_from_one_keeps_a_single_node_in_flight() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1", "r2", "r3"], 1), 5);
    h.converge().await?;
    h.dc.spec.size = 5;
    let mut max_unsettled = 0;
    h.converge_with(|sim| {
        max_unsettled = max_unsettled.max(sim.unsettled());
        Ok(())
    })
    .await?;
    assert!(max_unsettled <= 1, "expected at most one unsettled node at a time, got {}", max_unsettled);
    let per_rack: Vec<u32> = ["r1", "r2", "r3"]
        .iter()
        .map(|rack| h.sim.with(|state| state.racks.get(*rack).map(|rack| rack.replicas).unwrap_or(0)))
        .collect();
    assert!(per_rack == vec![2, 2, 1], "expected balanced racks, got {:?}", per_rack);
    assert!(h.sim.seeds().len() == 3, "expected 3 seeds, got {:?}", h.sim.seeds());
    Ok(())
}

#[tokio::test]
async fn scale_down_decommissions_highest_ordinals_first() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 5), 5);
    h.converge().await?;
    let seeds_before = h.sim.seeds();

    h.dc.spec.size = 3;
    h.converge().await?;

    let decommissions = h.sim.calls("decommission");
    let expected = vec![format!("decommission {}", h.node("r1", 4)), format!("decommission {}", h.node("r1", 3))];
    assert!(decommissions == expected, "expected {:?}, got {:?}", expected, decommissions);
    let volumes = h.sim.calls("delete_volume");
    assert!(volumes.len() == 2, "expected both volumes to be deleted, got {:?}", volumes);
    assert!(h.sim.seeds() == seeds_before, "expected seeds to be untouched, got {:?}", h.sim.seeds());
    assert!(h.normal_nodes() == 3, "expected 3 normal nodes, got {}", h.normal_nodes());
    assert!(h.status().node_statuses.len() == 3, "expected removed nodes to leave the status, got {:?}", h.status().node_statuses);
    Ok(())
}

#[tokio::test]
async fn canary_rack_addition_places_before_restarting_first_rack() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 3), 5);
    h.converge().await?;
    let mark = h.sim.call_count();

    h.dc.spec.racks.push(Rack::new("r2"));
    h.dc.spec.size = 6;
    h.dc.spec.canary_upgrade = true;
    h.dc.spec.config = Some(json!({"cassandra-yaml": {"num_tokens": 16}}));
    h.converge().await?;

    let calls: Vec<String> = h.sim.with(|state| state.calls[mark..].to_vec());
    let last_scale = calls.iter().rposition(|call| call.starts_with("scale r2"));
    let first_restart = calls.iter().position(|call| call.starts_with("drain") || call.starts_with("delete_pod"));
    match (last_scale, first_restart) {
        (Some(scale), Some(restart)) => assert!(scale < restart, "expected placement to finish first, got {:?}", calls),
        other => bail!("expected both placement and restart steps, got {:?} in {:?}", other, calls),
    }
    let r1_prefix = h.dc.statefulset_name("r1");
    let restarted: Vec<&String> = calls.iter().filter(|call| call.starts_with("delete_pod")).collect();
    assert!(restarted.len() == 3, "expected the 3 nodes of r1 to restart, got {:?}", restarted);
    assert!(
        restarted.iter().all(|call| call.contains(&r1_prefix)),
        "expected only r1 to be restarted, got {:?}",
        restarted
    );
    assert!(h.normal_nodes() == 6, "expected 6 normal nodes, got {}", h.normal_nodes());
    assert!(h.status().cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready");
    Ok(())
}

#[tokio::test]
async fn config_change_restarts_every_rack_in_order() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1", "r2"], 4), 5);
    h.converge().await?;
    let mark = h.sim.call_count();

    h.dc.spec.config = Some(json!({"jvm-options": {"initial_heap_size": "1G"}}));
    h.converge().await?;

    let calls: Vec<String> = h.sim.with(|state| state.calls[mark..].to_vec());
    let restarted: Vec<String> = calls
        .iter()
        .filter_map(|call| call.strip_prefix("delete_pod ").map(String::from))
        .collect();
    let expected = vec![h.node("r1", 0), h.node("r1", 1), h.node("r2", 0), h.node("r2", 1)];
    assert!(restarted == expected, "expected restarts {:?}, got {:?}", expected, restarted);
    assert!(h.sim.calls("drain").len() == 4, "expected every node to be drained before restart");
    let desired = h.dc.config_hash()?;
    let stale = h.sim.with(|state| state.pods.values().filter(|pod| pod.config_hash.as_deref() != Some(desired.as_str())).count());
    assert!(stale == 0, "expected every pod to carry the new config, got {} stale", stale);
    Ok(())
}

#[tokio::test]
async fn replacement_rebuilds_node_without_decommission() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 3), 5);
    h.converge().await?;
    let target = h.node("r1", 1);
    let (old_uid, old_ip) = h.sim.with(|state| {
        let pod = &state.pods[&target];
        (pod.uid.clone(), pod.ip.clone())
    });
    let mark = h.sim.call_count();

    h.dc.spec.replace_nodes = vec![target.clone()];
    let outcome = h.pass().await;
    assert!(
        outcome.status.node_replacements == vec![target.clone()],
        "expected node to be flagged for replacement, got {:?}",
        outcome.status.node_replacements
    );
    h.converge().await?;

    let calls: Vec<String> = h.sim.with(|state| state.calls[mark..].to_vec());
    assert!(!calls.iter().any(|call| call.starts_with("decommission")), "expected no decommission, got {:?}", calls);
    let expected_start = format!("start {} replace_ip={}", target, old_ip);
    assert!(calls.contains(&expected_start), "expected {:?} in {:?}", expected_start, calls);
    let touched: Vec<&String> = calls
        .iter()
        .filter(|call| call.starts_with("start") || call.starts_with("delete") || call.starts_with("drain"))
        .filter(|call| !call.contains(&target))
        .collect();
    assert!(touched.is_empty(), "expected other nodes to be untouched, got {:?}", touched);

    let new_uid = h.sim.with(|state| state.pods[&target].uid.clone());
    assert!(new_uid != old_uid, "expected a new pod, got the old uid {}", new_uid);
    let status = h.status();
    assert!(status.completed_replacements == vec![target.clone()], "expected replacement to be acknowledged, got {:?}", status);
    assert!(status.node_replacements.is_empty(), "expected no pending replacements, got {:?}", status.node_replacements);
    assert!(status.cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready");
    Ok(())
}

#[tokio::test]
async fn unreachable_node_exhausts_retry_budget_and_is_flagged() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 2), 2);
    h.converge().await?;
    h.dc.spec.size = 3;
    let target = h.node("r1", 2);
    h.sim.with(|state| {
        state.unreachable.insert(target.clone());
    });

    let mut flagged = false;
    for _ in 0..20 {
        let outcome = h.pass().await;
        if outcome.status.node_replacements.contains(&target) {
            flagged = true;
            assert!(outcome.status.operation.is_none(), "expected the failed operation to end, got {:?}", outcome.status.operation);
            let message = outcome.status.message.unwrap_or_default();
            assert!(message.contains("unreachable"), "expected an unreachable message, got {}", message);
            break;
        }
    }
    assert!(flagged, "expected node {} to be flagged for replacement", target);
    assert!(h.sim.calls(&format!("start {}", target)).is_empty(), "expected no start call against an unreachable node");

    // Once reachable again, the node is rebuilt through the replace path.
    h.sim.with(|state| {
        state.unreachable.clear();
    });
    h.converge().await?;
    assert!(h.normal_nodes() == 3, "expected 3 normal nodes, got {}", h.normal_nodes());
    assert!(h.status().node_replacements.is_empty(), "expected replacement to be cleared");
    Ok(())
}

#[tokio::test]
async fn restart_request_is_acknowledged_once() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 2), 5);
    h.converge().await?;
    h.dc.spec.rolling_restart_request = 1;
    h.converge().await?;
    let status = h.status();
    assert!(status.rolling_restart_ack == 1, "expected restart token to be acknowledged, got {}", status.rolling_restart_ack);
    assert!(status.last_rolling_restart.is_some(), "expected lastRollingRestart to be stamped");
    assert!(h.sim.calls("delete_pod").len() == 2, "expected both nodes to restart, got {:?}", h.sim.calls("delete_pod"));

    // The same token never triggers another restart.
    h.converge().await?;
    assert!(h.sim.calls("delete_pod").len() == 2, "expected no further restart, got {:?}", h.sim.calls("delete_pod"));
    Ok(())
}

#[tokio::test]
async fn converged_datacenter_stays_idle() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1", "r2"], 4), 5);
    h.converge().await?;
    let calls = h.sim.call_count();
    let status = h.status();
    for _ in 0..5 {
        let outcome = h.pass().await;
        assert!(outcome.requeue == Requeue::Idle, "expected Idle, got {:?}", outcome.requeue);
    }
    assert!(h.sim.call_count() == calls, "expected no further calls, got {:?}", h.sim.with(|state| state.calls[calls..].to_vec()));
    assert!(h.status() == status, "expected status to stay put, got {:?}", h.status());
    Ok(())
}

#[tokio::test]
async fn stopped_datacenter_drains_then_scales_to_zero() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 3), 5);
    h.converge().await?;
    h.dc.spec.stopped = true;
    h.converge().await?;

    assert!(h.sim.calls("drain").len() == 3, "expected every node to be drained, got {:?}", h.sim.calls("drain"));
    let replicas = h.sim.with(|state| state.racks.get("r1").map(|rack| rack.replicas));
    assert!(replicas == Some(0), "expected rack scaled to zero, got {:?}", replicas);
    assert!(h.sim.with(|state| state.pods.is_empty()), "expected no pods left");
    assert!(h.sim.with(|state| state.volumes.len()) == 3, "expected volumes to be kept");
    assert!(h.status().cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready");

    // Resuming brings the same nodes back.
    h.dc.spec.stopped = false;
    h.converge().await?;
    assert!(h.normal_nodes() == 3, "expected 3 normal nodes, got {}", h.normal_nodes());
    Ok(())
}

#[tokio::test]
async fn invalid_desired_state_halts_without_requeue() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1", "r1"], 3), 5);
    let outcome = h.pass().await;
    assert!(outcome.requeue == Requeue::Never, "expected no requeue, got {:?}", outcome.requeue);
    let message = outcome.status.message.unwrap_or_default();
    assert!(message.contains("more than once"), "expected duplicate rack message, got {}", message);
    assert!(h.sim.call_count() == 0, "expected nothing to be applied");

    let mut dc = datacenter(&["r1"], 3);
    dc.spec.server_version = "2.0.0".into();
    let mut h = Harness::new(dc, 5);
    let outcome = h.pass().await;
    assert!(outcome.requeue == Requeue::Never, "expected no requeue for unknown version, got {:?}", outcome.requeue);
    Ok(())
}

#[tokio::test]
async fn removing_a_populated_rack_is_refused() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1", "r2"], 2), 5);
    h.converge().await?;
    h.dc.spec.racks.retain(|rack| rack.name != "r2");
    let calls = h.sim.call_count();
    let outcome = h.pass().await;
    assert!(outcome.requeue == Requeue::Never, "expected no requeue, got {:?}", outcome.requeue);
    let message = outcome.status.message.unwrap_or_default();
    assert!(message.contains("orphan"), "expected orphan message, got {}", message);
    assert!(h.sim.call_count() == calls, "expected nothing to be mutated");
    Ok(())
}

#[tokio::test]
async fn removal_needing_replacement_is_rebuilt_then_decommissioned() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 4), 5);
    h.converge().await?;
    let victim = h.node("r1", 3);
    let old_ip = h.pod_ip(&victim);
    let mark = h.sim.call_count();

    h.dc.spec.size = 3;
    h.dc.spec.replace_nodes = vec![victim.clone()];
    h.converge().await?;

    let calls = h.calls_since(mark);
    let teardown = calls.iter().position(|call| call == &format!("delete_pod {}", victim));
    let start = calls.iter().position(|call| call == &format!("start {} replace_ip={}", victim, old_ip));
    let decommission = calls.iter().position(|call| call == &format!("decommission {}", victim));
    match (teardown, start, decommission) {
        (Some(teardown), Some(start), Some(decommission)) => assert!(
            teardown < start && start < decommission,
            "expected the node to be rebuilt before it is decommissioned, got {:?}",
            calls
        ),
        other => bail!("expected teardown, start and decommission of {}, got {:?} in {:?}", victim, other, calls),
    }
    let decommissions = calls.iter().filter(|call| call.starts_with("decommission")).count();
    assert!(decommissions == 1, "expected a single decommission, got {:?}", calls);
    let replicas = h.sim.with(|state| state.racks.get("r1").map(|rack| rack.replicas));
    assert!(replicas == Some(3), "expected rack scaled to 3, got {:?}", replicas);
    assert!(h.normal_nodes() == 3, "expected 3 normal nodes, got {}", h.normal_nodes());
    let status = h.status();
    assert!(status.node_replacements.is_empty(), "expected no pending replacements, got {:?}", status.node_replacements);
    assert!(status.cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready, got {:?}", status);
    Ok(())
}

#[tokio::test]
async fn seed_label_moves_only_once_the_new_seed_is_normal() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 3), 5);
    h.converge().await?;

    h.dc.spec.racks.push(Rack::new("r2"));
    h.dc.spec.size = 4;
    h.converge_with(|sim| {
        let (early, count) = sim.with(|state| {
            let early: Vec<String> = state
                .pods
                .iter()
                .filter(|(_, pod)| pod.seed && pod.server != "NORMAL")
                .map(|(name, _)| name.clone())
                .collect();
            (early, state.pods.values().filter(|pod| pod.seed).count())
        });
        if !early.is_empty() {
            bail!("expected only normal nodes to carry the seed label, got {:?}", early);
        }
        if count < 3 {
            bail!("expected at least 3 seeds at all times, got {}", count);
        }
        Ok(())
    })
    .await?;

    let seeds = h.sim.seeds();
    let expected = vec![h.node("r1", 0), h.node("r1", 1), h.node("r2", 0)];
    assert!(seeds == expected, "expected seeds {:?}, got {:?}", expected, seeds);
    Ok(())
}

#[tokio::test]
async fn already_done_replies_count_as_success() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 4), 5);
    h.converge().await?;

    let victim = h.node("r1", 3);
    h.sim.with(|state| {
        state.already_done.insert(victim.clone());
    });
    h.dc.spec.size = 3;
    h.converge().await?;
    let answered = h.sim.calls(&format!("decommission {} (already done)", victim));
    assert!(answered.len() == 1, "expected one decommission answered as already done, got {:?}", answered);
    assert!(h.normal_nodes() == 3, "expected 3 normal nodes, got {}", h.normal_nodes());

    let node = h.node("r1", 0);
    h.sim.with(|state| {
        state.already_done.insert(node.clone());
    });
    h.dc.spec.stopped = true;
    h.converge().await?;
    let answered = h.sim.calls(&format!("drain {} (already done)", node));
    assert!(answered.len() == 1, "expected one drain answered as already done, got {:?}", answered);
    assert!(h.sim.with(|state| state.pods.is_empty()), "expected no pods left");

    assert!(!h.requeues.contains(&Requeue::Backoff), "expected no pass to back off, got {:?}", h.requeues);
    Ok(())
}

#[tokio::test]
async fn lost_volume_rebuilds_node_without_decommission() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 3), 5);
    h.converge().await?;
    let target = h.node("r1", 1);
    let old_ip = h.pod_ip(&target);
    let mark = h.sim.call_count();

    h.sim.with(|state| {
        state.volumes.remove(&target);
    });
    let outcome = h.pass().await;
    assert!(
        outcome.status.node_replacements.contains(&target),
        "expected node with a lost volume to be flagged, got {:?}",
        outcome.status.node_replacements
    );
    h.converge().await?;

    let calls = h.calls_since(mark);
    assert!(!calls.iter().any(|call| call.starts_with("decommission")), "expected no decommission, got {:?}", calls);
    for expected in [
        format!("delete_volume {}", target),
        format!("delete_pod {}", target),
        format!("start {} replace_ip={}", target, old_ip),
    ] {
        assert!(calls.contains(&expected), "expected {:?} in {:?}", expected, calls);
    }
    assert!(h.sim.with(|state| state.volumes.contains(&target)), "expected the node to get a new volume");
    assert!(h.normal_nodes() == 3, "expected 3 normal nodes, got {}", h.normal_nodes());
    let status = h.status();
    assert!(status.node_replacements.is_empty(), "expected no pending replacements, got {:?}", status.node_replacements);
    assert!(status.cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready");
    Ok(())
}

#[tokio::test]
async fn lost_status_write_repeats_teardown_safely() -> Result<()> {
    let mut h = Harness::new(datacenter(&["r1"], 3), 5);
    h.converge().await?;
    let target = h.node("r1", 2);
    let old_ip = h.pod_ip(&target);
    let mark = h.sim.call_count();

    // The teardown runs, but the status recording it is never written.
    h.dc.spec.replace_nodes = vec![target.clone()];
    let outcome = h.reconciler.pass(&h.dc).await;
    assert!(outcome.status.operation.is_some(), "expected a replace operation to start, got {:?}", outcome.status);
    h.sim.tick(&h.dc);

    h.converge().await?;
    let calls = h.calls_since(mark);
    let teardowns = calls.iter().filter(|call| *call == &format!("delete_pod {}", target)).count();
    assert!(teardowns == 2, "expected the teardown to be repeated once, got {:?}", calls);
    let expected_start = format!("start {} replace_ip={}", target, old_ip);
    assert!(calls.contains(&expected_start), "expected {:?} in {:?}", expected_start, calls);
    assert!(!calls.iter().any(|call| call.starts_with("decommission")), "expected no decommission, got {:?}", calls);
    let status = h.status();
    assert!(status.completed_replacements == vec![target.clone()], "expected replacement to be acknowledged, got {:?}", status);
    assert!(status.cassandra_operator_progress == Some(ProgressState::Ready), "expected Ready");
    Ok(())
}
