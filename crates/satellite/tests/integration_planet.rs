//! End-to-end scenarios over the in-process planet: real erasure coding,
//! real piece files, real framed TCP between satellite workers and nodes.

mod common;

use std::collections::HashSet;

use common::{quick_config, segment_path, sha256, test_redundancy, Planet};

use orbit_common::bloom::BloomFilter;
use orbit_common::error::Error;
use orbit_common::id::NodeId;
use orbit_common::orders::{Action, Order, PieceHash, sign_order_limit};
use orbit_common::pointer::RemotePiece;
use orbit_common::time::now_ms;
use orbit_proto::{RetainRequest, SignedRetain};
use orbit_satellite::repair::RepairOutcome;
use orbit_satellite::PieceTransport;
use orbit_storage::BlobStore;

fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut out = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upload_download_round_trip_with_rollup() {
    let planet = Planet::new(4, quick_config()).await;
    let path = segment_path(b"round-trip");
    let data = random_bytes(512);

    let pointer = planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let remote = pointer.remote().expect("remote");

    // four distinct nodes holding piece numbers 0..3
    let nums: HashSet<u16> = remote.pieces.iter().map(|p| p.piece_num).collect();
    let nodes: HashSet<NodeId> = remote.pieces.iter().map(|p| p.node_id).collect();
    assert_eq!(nums, (0..4).collect::<HashSet<u16>>());
    assert_eq!(nodes.len(), 4);
    assert!(remote.pieces_hashes_verified);

    // any two shares reconstruct the exact bytes
    let got = planet
        .download_segment(&path, &[1, 3])
        .await
        .expect("download");
    assert_eq!(got, data);

    // settlement credits 4 PUT receipts and 2 GET receipts
    assert_eq!(planet.settle_all(), 6);
    let rollup = planet.satellite.orders.rollup();
    assert_eq!(rollup.action_total(Action::Put), 4 * 256);
    assert_eq!(rollup.action_total(Action::Get), 2 * 256);

    // settling again changes nothing: the unsent sets are empty now and
    // serials are spent
    assert_eq!(planet.settle_all(), 0);
    assert_eq!(rollup.action_total(Action::Put), 4 * 256);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_audit_classifies_tampered_node() {
    let planet = Planet::new(4, quick_config()).await;
    let path = segment_path(b"tampered");
    let data = random_bytes(512);

    let pointer = planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let remote = pointer.remote().expect("remote").clone();
    let victim = remote
        .pieces
        .iter()
        .find(|p| p.piece_num == 1)
        .expect("piece 1");
    planet.tamper_piece(&victim.node_id, &remote.root_piece_id, 1);

    let report = planet
        .satellite
        .verifier
        .verify(&path)
        .await
        .expect("verify");
    assert_eq!(report.fails, vec![victim.node_id]);
    assert_eq!(report.successes.len(), 3);
    assert!(report.offlines.is_empty());
    assert!(report.pending_audits.is_empty());

    // the tampered piece is gone from the pointer
    let after = planet.satellite.metainfo.get(&path).expect("pointer");
    assert!(after
        .remote()
        .expect("remote")
        .piece_for_node(&victim.node_id)
        .is_none());
    assert_eq!(after.remote().expect("remote").pieces.len(), 3);

    // counters: one failed audit for the victim, successes elsewhere
    planet
        .satellite
        .reporter
        .record(&report)
        .expect("record report");
    let victim_rep = planet
        .satellite
        .overlay
        .get(&victim.node_id)
        .expect("dossier")
        .reputation;
    assert_eq!(victim_rep.audit_count, 1);
    assert_eq!(victim_rep.audit_success_count, 0);
    for node_id in &report.successes {
        let rep = planet.satellite.overlay.get(node_id).expect("dossier").reputation;
        assert_eq!(rep.audit_count, 1);
        assert_eq!(rep.audit_success_count, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_audit_marks_unreachable_node_offline() {
    let planet = Planet::new(4, quick_config()).await;
    let path = segment_path(b"offline-node");
    let data = random_bytes(512);

    let pointer = planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let victim = pointer.remote().expect("remote").pieces[0].node_id;

    // repoint the node's address at a dead port
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        addr
    };
    let key = planet.node(&victim).endpoint.public_key();
    planet.satellite.overlay.update_contact(key, dead, 1 << 30, 1 << 30);

    let report = planet
        .satellite
        .verifier
        .verify(&path)
        .await
        .expect("verify");
    assert_eq!(report.offlines, vec![victim]);
    assert_eq!(report.successes.len(), 3);
    assert!(report.fails.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repair_restores_redundancy() {
    let planet = Planet::new(6, quick_config()).await;
    let path = segment_path(b"repairable");
    let data = random_bytes(512);

    let pointer = planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let originals: Vec<RemotePiece> = pointer.remote().expect("remote").pieces.clone();
    let lost: Vec<NodeId> = originals.iter().take(2).map(|p| p.node_id).collect();
    for node in &lost {
        planet.satellite.overlay.disqualify(node).expect("disqualify");
    }

    // checker notices the injury and enqueues it
    let stats = planet.satellite.checker.run_once();
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.irreparable, 0);

    let outcome = planet
        .satellite
        .repair_worker
        .run_once()
        .await
        .expect("worker processed an entry");
    assert_eq!(outcome, RepairOutcome::Repaired { added: 2, removed: 2 });

    let repaired = planet.satellite.metainfo.get(&path).expect("pointer");
    let remote = repaired.remote().expect("remote");
    assert_eq!(remote.pieces.len(), 4);

    // piece numbers preserved, all four nodes healthy and distinct
    let nums: HashSet<u16> = remote.pieces.iter().map(|p| p.piece_num).collect();
    assert_eq!(nums, (0..4).collect::<HashSet<u16>>());
    let node_ids: HashSet<NodeId> = remote.pieces.iter().map(|p| p.node_id).collect();
    assert_eq!(node_ids.len(), 4);
    for piece in &remote.pieces {
        assert!(planet.satellite.overlay.is_healthy(&piece.node_id));
        assert!(!lost.contains(&piece.node_id));
    }

    // replacements exclude every original, healthy or lost
    let original_ids: HashSet<NodeId> = originals.iter().map(|p| p.node_id).collect();
    let replaced_nums: Vec<u16> = originals.iter().take(2).map(|p| p.piece_num).collect();
    for piece in remote.pieces.iter().filter(|p| replaced_nums.contains(&p.piece_num)) {
        assert!(!original_ids.contains(&piece.node_id));
    }

    // the data is readable purely from the replacement pieces
    let got = planet
        .download_segment(&path, &replaced_nums)
        .await
        .expect("download from replacements");
    assert_eq!(got, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_repair_cas_and_garbage_reclaim() {
    let planet = Planet::new(8, quick_config()).await;
    let path = segment_path(b"cas-race");
    let data = random_bytes(512);

    let pre_image = planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let remote = pre_image.remote().expect("remote").clone();
    let lost: Vec<RemotePiece> = remote.pieces.iter().take(2).cloned().collect();
    for piece in &lost {
        planet.satellite.overlay.disqualify(&piece.node_id).expect("disqualify");
    }

    // the winning worker repairs and commits first
    let outcome = planet
        .satellite
        .repairer
        .repair(&path)
        .await
        .expect("winner repair");
    assert!(matches!(outcome, RepairOutcome::Repaired { .. }));

    // the losing worker, still holding the stale pre-image, finishes its own
    // replacement uploads onto nodes the winner did not use
    let winner_pointer = planet.satellite.metainfo.get(&path).expect("pointer");
    let mut used: HashSet<NodeId> = remote.pieces.iter().map(|p| p.node_id).collect();
    used.extend(
        winner_pointer
            .remote()
            .expect("remote")
            .pieces
            .iter()
            .map(|p| p.node_id),
    );
    let loser_nodes: Vec<NodeId> = planet
        .nodes
        .iter()
        .map(|n| n.node_id)
        .filter(|id| !used.contains(id))
        .take(2)
        .collect();
    assert_eq!(loser_nodes.len(), 2);

    let mut loser_pieces = Vec::new();
    for (piece, node_id) in lost.iter().zip(&loser_nodes) {
        let payload = random_bytes(256); // stands in for the re-encoded share
        let derived = remote.root_piece_id.derive(node_id, piece.piece_num);
        let (limit, order) = planet
            .satellite
            .orders
            .issue_for_worker(*node_id, derived, Action::PutRepair, payload.len() as u64)
            .expect("issue");
        let uplink_hash = PieceHash::sign(
            planet.satellite.identity.as_ref(),
            derived,
            sha256(&payload),
            payload.len() as u64,
            now_ms(),
        );
        let addr = planet.node(node_id).addr.clone();
        let node_hash = planet
            .transport
            .upload(
                &addr,
                &limit,
                &uplink_hash,
                &payload,
                &order,
                std::time::Duration::from_secs(10),
            )
            .await
            .expect("loser upload");
        loser_pieces.push(RemotePiece {
            piece_num: piece.piece_num,
            node_id: *node_id,
            hash: Some(node_hash),
        });
    }

    // the loser's compare-and-swap must fail: the pre-image changed
    let remove: Vec<NodeId> = lost.iter().map(|p| p.node_id).collect();
    let err = planet
        .satellite
        .metainfo
        .update_pieces(&path, &pre_image, loser_pieces.clone(), &remove)
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));

    // exactly one update won
    let final_pointer = planet.satellite.metainfo.get(&path).expect("pointer");
    let final_remote = final_pointer.remote().expect("remote");
    assert_eq!(final_remote.pieces.len(), 4);
    for piece in &loser_pieces {
        assert!(final_remote.piece_for_node(&piece.node_id).is_none());
    }

    // the loser's uploads are garbage: a retain snapshot of the final
    // pointer reclaims them on the next cycle
    for piece in &loser_pieces {
        let node = planet.node(&piece.node_id);
        let mut filter = BloomFilter::new(16, 1e-4);
        for live in &final_remote.pieces {
            if live.node_id == piece.node_id {
                let derived = final_remote.root_piece_id.derive(&live.node_id, live.piece_num);
                filter.add(derived.as_bytes());
            }
        }
        let signed = SignedRetain::sign(
            planet.satellite.identity.as_ref(),
            RetainRequest {
                filter,
                created_before_ms: now_ms() + 1_000,
            },
        )
        .expect("sign retain");
        let summary = node.endpoint.apply_signed_retain(&signed).expect("retain");
        assert_eq!(summary.deleted, 1, "stray repair piece reclaimed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_containment_resolves_slow_node() {
    let planet = Planet::new(4, quick_config()).await;
    let path = segment_path(b"slow-node");
    let data = random_bytes(512);

    let pointer = planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let remote = pointer.remote().expect("remote").clone();
    let slow = remote.pieces[0].clone();
    let slow_addr = planet.node(&slow.node_id).addr.clone();

    // the node dials fine but the transfer stalls
    planet.transport.stall(&slow_addr);
    let report = planet
        .satellite
        .verifier
        .verify(&path)
        .await
        .expect("verify");
    assert_eq!(report.pending_audits.len(), 1);
    assert_eq!(report.successes.len(), 3);
    assert!(report.fails.is_empty());

    let pending = planet
        .satellite
        .containment
        .get(&slow.node_id)
        .expect("pending audit");
    // the expected hash is the share the node owed, synthesized from the
    // reconstructed stripe
    let scheme = orbit_erasure::ErasureScheme::from_redundancy(&remote.redundancy).expect("scheme");
    let shares = scheme.encode_segment(&data).expect("encode");
    let expected_share = &shares[slow.piece_num as usize][0..256];
    assert_eq!(pending.expected_share_hash, sha256(expected_share));
    assert_eq!(pending.piece_id, remote.root_piece_id);

    // the node recovers and the reverify resolves it as success
    planet.transport.heal(&slow_addr);
    let reverify = planet
        .satellite
        .verifier
        .reverify(&path)
        .await
        .expect("reverify");
    assert_eq!(reverify.successes, vec![slow.node_id]);
    assert!(reverify.fails.is_empty());
    assert!(planet.satellite.containment.get(&slow.node_id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reverify_drops_pending_for_vanished_node() {
    let planet = Planet::new(4, quick_config()).await;
    let path = segment_path(b"vanished");
    let data = random_bytes(512);

    let pointer = planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let remote = pointer.remote().expect("remote").clone();
    let slow = remote.pieces[0].clone();
    let slow_addr = planet.node(&slow.node_id).addr.clone();

    planet.transport.stall(&slow_addr);
    planet
        .satellite
        .verifier
        .verify(&path)
        .await
        .expect("verify");
    assert!(planet.satellite.containment.get(&slow.node_id).is_some());
    planet.transport.heal(&slow_addr);

    // the node disappears from the pointer before the reverify
    let current = planet.satellite.metainfo.get(&path).expect("pointer");
    planet
        .satellite
        .metainfo
        .update_pieces(&path, &current, Vec::new(), &[slow.node_id])
        .expect("remove piece");

    let report = planet
        .satellite
        .verifier
        .reverify(&path)
        .await
        .expect("reverify");
    // dropped silently: neither success nor failure is credited
    assert!(!report.successes.contains(&slow.node_id));
    assert!(!report.fails.contains(&slow.node_id));
    assert!(planet.satellite.containment.get(&slow.node_id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_order_limit_rejected_over_the_wire() {
    let planet = Planet::new(1, quick_config()).await;
    let node = &planet.nodes[0];
    let payload = random_bytes(128);
    let piece = orbit_common::id::PieceId::generate();

    let limit = sign_order_limit(
        planet.satellite.identity.as_ref(),
        planet.uplink.node_id(),
        planet.uplink.public_key(),
        node.node_id,
        piece,
        Action::Put,
        payload.len() as u64,
        None,
        now_ms() - 2_000, // expired before the upload starts
    );
    let uplink_hash = PieceHash::sign(
        &planet.uplink,
        piece,
        sha256(&payload),
        payload.len() as u64,
        now_ms(),
    );
    let order = Order::sign(&planet.uplink, &limit, payload.len() as u64);

    let err = planet
        .transport
        .upload(
            &node.addr,
            &limit,
            &uplink_hash,
            &payload,
            &order,
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        orbit_satellite::TransportError::PermissionDenied(_)
    ));

    // no piece file was created
    assert!(node
        .endpoint
        .store()
        .open(planet.satellite.identity.node_id(), piece)
        .is_err());
    assert!(node.blobs.list(planet.satellite.identity.node_id().as_bytes()).expect("list").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gc_cycle_reclaims_deleted_segment() {
    let planet = Planet::new(4, quick_config()).await;
    let keep_path = segment_path(b"kept");
    let drop_path = segment_path(b"dropped");
    let keep_data = random_bytes(512);
    let drop_data = random_bytes(512);

    planet
        .upload_segment(&keep_path, &keep_data, test_redundancy())
        .await
        .expect("upload kept");
    planet
        .upload_segment(&drop_path, &drop_data, test_redundancy())
        .await
        .expect("upload dropped");
    planet.satellite.metainfo.delete(&drop_path).expect("delete pointer");

    // pieces linger on the nodes until a retain cycle reaches them
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let stats = planet.satellite.gc.run_once().await;
    assert_eq!(stats.nodes_failed, 0);
    assert_eq!(stats.pieces_deleted, 4);

    // the kept segment still reads back
    let got = planet.download_segment(&keep_path, &[0, 1]).await.expect("download");
    assert_eq!(got, keep_data);

    // a second cycle is a no-op
    let again = planet.satellite.gc.run_once().await;
    assert_eq!(again.pieces_deleted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_stripe_segment_audits_cleanly() {
    let planet = Planet::new(4, quick_config()).await;
    let path = segment_path(b"multi-stripe");
    // 3 full stripes plus a short tail that pads
    let data = random_bytes(512 * 3 + 100);

    planet
        .upload_segment(&path, &data, test_redundancy())
        .await
        .expect("upload");
    let got = planet.download_segment(&path, &[0, 2]).await.expect("download");
    assert_eq!(got, data);

    // whatever stripe the sample lands on, all four nodes pass
    for _ in 0..4 {
        let report = planet
            .satellite
            .verifier
            .verify(&path)
            .await
            .expect("verify");
        assert_eq!(report.successes.len(), 4, "fails={:?}", report.fails);
    }
}
