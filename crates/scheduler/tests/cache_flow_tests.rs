//! End-to-end cache orchestration flows against a simulated fleet.

mod common;

use common::{assert_contiguous_fids, assert_record_invariants, expiry, harness, make_dag, wait_until};
use courier_core::rpc::NodeType;
use courier_metadata::MetadataStore as _;

#[tokio::test]
async fn test_single_node_carfile_reaches_reliability() {
    let h = harness(60).await;
    h.register_node("c1", NodeType::Candidate, 0.1);

    let dag = make_dag(&h.sim, "flow-a", 2);
    h.manager
        .cache_carfile(&dag.root_cid, 1, expiry())
        .await
        .unwrap();

    let ctx = h.ctx.clone();
    let hash = dag.root_hash.clone();
    wait_until("carfile reaches reliability 1", || {
        let ctx = ctx.clone();
        let hash = hash.clone();
        async move {
            ctx.metadata
                .get_carfile_info(&hash)
                .await
                .unwrap()
                .is_some_and(|row| row.reliability == 1)
        }
    })
    .await;

    let data = h.ctx.metadata.get_carfile_info(&dag.root_hash).await.unwrap().unwrap();
    assert_eq!(data.total_blocks, 3);
    assert_eq!(data.total_size, dag.total_size as i64);
    assert_eq!(data.cache_count, 1);
    assert_eq!(data.nodes, 1);

    let caches = h.ctx.metadata.get_caches_of_carfile(&dag.root_hash).await.unwrap();
    assert_eq!(caches.len(), 1);
    assert_eq!(caches[0].status, "success");
    assert!(caches[0].is_root);
    assert_eq!(caches[0].done_blocks, 3);
    assert_eq!(caches[0].done_size, dag.total_size as i64);

    // nothing left undone for the finished attempt
    let undone = h.ctx.metadata.get_undone_blocks(&caches[0].cache_id).await.unwrap();
    assert!(undone.is_empty());

    assert_record_invariants(&h.ctx, &dag.root_hash).await;
    assert_contiguous_fids(&h.sim);
}

#[tokio::test]
async fn test_failed_root_fetch_recovers_on_restart() {
    let h = harness(60).await;
    h.register_node("c1", NodeType::Candidate, 0.1);

    let dag = make_dag(&h.sim, "flow-b", 2);
    // the first dispatch of the root comes back negative
    h.sim.fail_times(&dag.root_cid, 1);

    h.manager
        .cache_carfile(&dag.root_cid, 1, expiry())
        .await
        .unwrap();

    let ctx = h.ctx.clone();
    let hash = dag.root_hash.clone();
    wait_until("carfile recovers to reliability 1", || {
        let ctx = ctx.clone();
        let hash = hash.clone();
        async move {
            ctx.metadata
                .get_carfile_info(&hash)
                .await
                .unwrap()
                .is_some_and(|row| row.reliability == 1)
        }
    })
    .await;

    let caches = h.ctx.metadata.get_caches_of_carfile(&dag.root_hash).await.unwrap();
    assert_eq!(caches.len(), 1, "the same attempt restarts rather than forking");
    assert_eq!(caches[0].status, "success");

    // the failure was recorded for debugging
    let errors = h.ctx.live.cache_errors(&caches[0].cache_id);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].cid, dag.root_cid);

    assert_record_invariants(&h.ctx, &dag.root_hash).await;
}

#[tokio::test]
async fn test_second_attempt_lands_on_second_node() {
    let h = harness(60).await;
    h.register_node("c1", NodeType::Candidate, 0.1);
    h.register_node("e2", NodeType::Edge, 0.2);

    let dag = make_dag(&h.sim, "flow-c", 2);
    h.manager
        .cache_carfile(&dag.root_cid, 2, expiry())
        .await
        .unwrap();

    let ctx = h.ctx.clone();
    let hash = dag.root_hash.clone();
    wait_until("carfile reaches reliability 2", || {
        let ctx = ctx.clone();
        let hash = hash.clone();
        async move {
            ctx.metadata
                .get_carfile_info(&hash)
                .await
                .unwrap()
                .is_some_and(|row| row.reliability == 2)
        }
    })
    .await;

    let data = h.ctx.metadata.get_carfile_info(&dag.root_hash).await.unwrap().unwrap();
    assert_eq!(data.nodes, 2);
    assert_eq!(data.cache_count, 2);

    let caches = h.ctx.metadata.get_caches_of_carfile(&dag.root_hash).await.unwrap();
    assert_eq!(caches.len(), 2);
    assert!(caches.iter().all(|c| c.status == "success"));
    assert_eq!(caches.iter().filter(|c| c.is_root).count(), 1);

    // the root attempt went to the candidate, the second to the edge
    assert!(!h.sim.requests_for("c1").is_empty());
    let edge_requests = h.sim.requests_for("e2");
    assert!(!edge_requests.is_empty());
    // the non-root attempt copies from the node that already holds the
    // blocks rather than the gateway
    assert!(edge_requests.iter().all(|r| r.download_url == "sim://c1"));

    assert_record_invariants(&h.ctx, &dag.root_hash).await;
    assert_contiguous_fids(&h.sim);
}

#[tokio::test]
async fn test_quit_node_repair_restores_reliability() {
    let h = harness(60).await;
    h.register_node("c1", NodeType::Candidate, 0.1);

    let dag = make_dag(&h.sim, "flow-d", 2);
    h.manager
        .cache_carfile(&dag.root_cid, 1, expiry())
        .await
        .unwrap();

    let ctx = h.ctx.clone();
    let hash = dag.root_hash.clone();
    wait_until("initial replication", {
        let ctx = ctx.clone();
        let hash = hash.clone();
        move || {
            let ctx = ctx.clone();
            let hash = hash.clone();
            async move {
                ctx.metadata
                    .get_carfile_info(&hash)
                    .await
                    .unwrap()
                    .is_some_and(|row| row.reliability == 1)
            }
        }
    })
    .await;

    // a second candidate is available for the repair
    h.register_node("c2", NodeType::Candidate, 0.1);

    h.manager.node_quit("c1").await.unwrap();

    // the repair decremented reliability and flipped the cache to restore
    let caches = h.ctx.metadata.get_caches_of_carfile(&dag.root_hash).await.unwrap();
    assert_eq!(caches.len(), 1);
    let restored_id = caches[0].cache_id.clone();

    wait_until("repair restores reliability", {
        let ctx = ctx.clone();
        let hash = hash.clone();
        move || {
            let ctx = ctx.clone();
            let hash = hash.clone();
            async move {
                ctx.metadata
                    .get_carfile_info(&hash)
                    .await
                    .unwrap()
                    .is_some_and(|row| row.reliability == 1)
            }
        }
    })
    .await;

    let cache = h.ctx.metadata.get_cache_info(&restored_id).await.unwrap().unwrap();
    assert_eq!(cache.status, "success");

    // the restored blocks landed on the surviving candidate
    assert!(!h.sim.requests_for("c2").is_empty());

    assert_record_invariants(&h.ctx, &dag.root_hash).await;
}

#[tokio::test]
async fn test_results_for_lost_lease_are_discarded() {
    let h = harness(60).await;
    h.register_node("c1", NodeType::Candidate, 0.1);

    let dag = make_dag(&h.sim, "flow-e", 2);
    h.manager
        .cache_carfile(&dag.root_cid, 1, expiry())
        .await
        .unwrap();

    let ctx = h.ctx.clone();
    let hash = dag.root_hash.clone();
    wait_until("replication finishes", {
        let ctx = ctx.clone();
        let hash = hash.clone();
        move || {
            let ctx = ctx.clone();
            let hash = hash.clone();
            async move {
                ctx.metadata
                    .get_carfile_info(&hash)
                    .await
                    .unwrap()
                    .is_some_and(|row| row.reliability == 1)
            }
        }
    })
    .await;

    let data_before = h.ctx.metadata.get_carfile_info(&dag.root_hash).await.unwrap().unwrap();
    let caches = h.ctx.metadata.get_caches_of_carfile(&dag.root_hash).await.unwrap();

    // a straggler result arrives after the attempt's lease is gone
    h.ctx.live.push_result(courier_core::rpc::CacheResultRequest {
        device_id: "c1".to_string(),
        result: courier_core::rpc::CacheResult {
            cid: dag.children[0].clone(),
            is_ok: false,
            msg: "late failure".to_string(),
            links: Vec::new(),
            block_size: 0,
            links_size: 0,
            carfile_hash: dag.root_hash.clone(),
            cache_id: caches[0].cache_id.clone(),
        },
    });

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let data_after = h.ctx.metadata.get_carfile_info(&dag.root_hash).await.unwrap().unwrap();
    assert_eq!(data_after.reliability, data_before.reliability);
    let cache = h.ctx.metadata.get_cache_info(&caches[0].cache_id).await.unwrap().unwrap();
    assert_eq!(cache.status, "success");
    assert_eq!(cache.done_blocks, 3);
}

#[tokio::test]
async fn test_lease_expiry_times_out_attempt_and_stamps_blocks() {
    // tight lease so the watcher fires quickly
    let h = harness(1).await;
    h.register_node("c1", NodeType::Candidate, 0.1);

    let dag = make_dag(&h.sim, "flow-f", 2);
    // children never answer; the root succeeds and expands the frontier
    for child in &dag.children {
        h.sim.silence(child);
    }

    h.manager
        .cache_carfile(&dag.root_cid, 1, expiry())
        .await
        .unwrap();

    let ctx = h.ctx.clone();
    let hash = dag.root_hash.clone();
    // the first timeout restarts the attempt once; with the children
    // still silent the second timeout exhausts the cache-count budget and
    // the carfile stops for good
    wait_until("attempt times out for good", {
        let ctx = ctx.clone();
        let hash = hash.clone();
        move || {
            let ctx = ctx.clone();
            let hash = hash.clone();
            async move {
                let Some(data) = ctx.metadata.get_carfile_info(&hash).await.unwrap() else {
                    return false;
                };
                data.cache_count >= 2
                    && ctx
                        .metadata
                        .get_caches_of_carfile(&hash)
                        .await
                        .unwrap()
                        .iter()
                        .any(|c| c.status == "timeout")
            }
        }
    })
    .await;

    let caches = h.ctx.metadata.get_caches_of_carfile(&dag.root_hash).await.unwrap();
    let timed_out = caches.iter().find(|c| c.status == "timeout").unwrap();

    // the root made it, the silent children were stamped
    assert_eq!(timed_out.done_blocks, 1);
    let stamped = h
        .ctx
        .metadata
        .get_blocks_with_status(&timed_out.cache_id, "timeout")
        .await
        .unwrap();
    assert_eq!(stamped.len(), 2);
    assert!(stamped.iter().all(|b| b.end_time.is_some()));

    // a timed-out attempt contributes nothing
    let data = h.ctx.metadata.get_carfile_info(&dag.root_hash).await.unwrap().unwrap();
    assert_eq!(data.reliability, 0);
}
