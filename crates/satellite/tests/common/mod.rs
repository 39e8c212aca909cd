//! In-process planet: one satellite, N storage nodes serving the real wire
//! protocol on loopback, and helpers that play the uplink role.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::Notify;

use orbit_common::config::SatelliteConfig;
use orbit_common::error::Result;
use orbit_common::id::{NodeId, PieceId};
use orbit_common::identity::Identity;
use orbit_common::orders::{Action, Order, OrderLimit, PieceHash};
use orbit_common::path::SegmentPath;
use orbit_common::pointer::{Pointer, RedundancyScheme, RemotePiece, RemoteSegment};
use orbit_common::time::now_ms;
use orbit_erasure::ErasureScheme;
use orbit_node::monitor::CapacityMonitor;
use orbit_node::orders::{SerialStore, UnsentOrders};
use orbit_node::pieces::{PieceStore, V0HeaderTable};
use orbit_node::trust::TrustedSatellites;
use orbit_node::NodeEndpoint;
use orbit_satellite::transport::{PieceTransport, TransportError};
use orbit_satellite::{RemoteTransport, Satellite};
use orbit_storage::{BlobRef, BlobStore, FileStore};

pub struct PlanetNode {
    pub node_id: NodeId,
    pub addr: String,
    pub endpoint: NodeEndpoint,
    pub blobs: Arc<FileStore>,
    _tmp: TempDir,
}

pub struct Planet {
    pub satellite: Satellite,
    pub nodes: Vec<PlanetNode>,
    pub uplink: Identity,
    pub transport: Arc<FlakyTransport>,
    shutdown: Arc<Notify>,
}

impl Drop for Planet {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

/// Fault-injecting decorator over the real TCP transport: addresses in the
/// stall set answer every request with a post-dial timeout.
pub struct FlakyTransport {
    inner: RemoteTransport,
    stalled: Mutex<HashSet<String>>,
}

impl FlakyTransport {
    fn new() -> Self {
        FlakyTransport {
            inner: RemoteTransport::new(Duration::from_secs(2)),
            stalled: Mutex::new(HashSet::new()),
        }
    }

    pub fn stall(&self, addr: &str) {
        self.stalled.lock().insert(addr.to_string());
    }

    pub fn heal(&self, addr: &str) {
        self.stalled.lock().remove(addr);
    }

    fn is_stalled(&self, addr: &str) -> bool {
        self.stalled.lock().contains(addr)
    }
}

#[async_trait::async_trait]
impl PieceTransport for FlakyTransport {
    async fn download(
        &self,
        address: &str,
        limit: &OrderLimit,
        order: &Order,
        offset: u64,
        length: u64,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        if self.is_stalled(address) {
            return Err(TransportError::Timeout);
        }
        self.inner
            .download(address, limit, order, offset, length, timeout)
            .await
    }

    async fn upload(
        &self,
        address: &str,
        limit: &OrderLimit,
        uplink_hash: &PieceHash,
        payload: &[u8],
        order: &Order,
        timeout: Duration,
    ) -> std::result::Result<PieceHash, TransportError> {
        if self.is_stalled(address) {
            return Err(TransportError::Timeout);
        }
        self.inner
            .upload(address, limit, uplink_hash, payload, order, timeout)
            .await
    }

    async fn delete(
        &self,
        address: &str,
        limit: &OrderLimit,
        timeout: Duration,
    ) -> std::result::Result<bool, TransportError> {
        self.inner.delete(address, limit, timeout).await
    }

    async fn retain(
        &self,
        address: &str,
        request: &orbit_proto::SignedRetain,
        timeout: Duration,
    ) -> std::result::Result<orbit_proto::GcSummary, TransportError> {
        self.inner.retain(address, request, timeout).await
    }
}

impl Planet {
    /// Boot a satellite and `node_count` storage nodes listening on
    /// loopback, all registered and mutually trusted.
    pub async fn new(node_count: usize, config: SatelliteConfig) -> Planet {
        let satellite_identity = Arc::new(Identity::generate());
        let transport = Arc::new(FlakyTransport::new());
        let satellite = Satellite::new(satellite_identity.clone(), config, transport.clone());
        let shutdown = Arc::new(Notify::new());

        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let tmp = TempDir::new().expect("node tmpdir");
            let blobs = Arc::new(FileStore::new(tmp.path()).expect("blob store"));
            let monitor = Arc::new(CapacityMonitor::new(1 << 30));
            let store = PieceStore::new(blobs.clone(), monitor, Arc::new(V0HeaderTable::new()));
            let trust = Arc::new(TrustedSatellites::new());
            trust.add(satellite_identity.public_key());

            let endpoint = NodeEndpoint::new(
                Arc::new(Identity::generate()),
                store,
                trust,
                Arc::new(SerialStore::new(60 * 60 * 1000)),
                Arc::new(UnsentOrders::new()),
            );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            let addr = listener.local_addr().expect("addr").to_string();
            tokio::spawn(orbit_node::server::serve(
                endpoint.clone(),
                listener,
                shutdown.clone(),
            ));

            let node_id = satellite.overlay.update_contact(
                endpoint.public_key(),
                addr.clone(),
                1 << 30,
                1 << 30,
            );
            assert_eq!(node_id, endpoint.node_id());

            nodes.push(PlanetNode {
                node_id,
                addr,
                endpoint,
                blobs,
                _tmp: tmp,
            });
        }

        Planet {
            satellite,
            nodes,
            uplink: Identity::generate(),
            transport,
            shutdown,
        }
    }

    pub fn node(&self, node_id: &NodeId) -> &PlanetNode {
        self.nodes
            .iter()
            .find(|n| &n.node_id == node_id)
            .expect("node in planet")
    }

    /// Play the uplink: select nodes, erasure-encode, upload one piece per
    /// node over the wire, and commit the pointer.
    pub async fn upload_segment(
        &self,
        path: &SegmentPath,
        data: &[u8],
        redundancy: RedundancyScheme,
    ) -> Result<Pointer> {
        let scheme = ErasureScheme::from_redundancy(&redundancy).expect("scheme");
        let pieces = scheme.encode_segment(data).expect("encode");
        let root = PieceId::generate();

        let targets = self
            .satellite
            .overlay
            .find_storage_nodes(&orbit_satellite::overlay::FindRequest {
                count: redundancy.total as usize,
                free_disk: data.len() as u64,
                free_bandwidth: data.len() as u64,
                excluded: HashSet::new(),
            })?;

        let mut remote_pieces = Vec::new();
        for (num, target) in targets.iter().enumerate() {
            let payload = &pieces[num];
            let derived = root.derive(&target.node_id, num as u16);
            let limit = self.satellite.orders.issue(
                self.uplink.node_id(),
                self.uplink.public_key(),
                target.node_id,
                derived,
                Action::Put,
                payload.len() as u64,
                None,
            )?;
            let uplink_hash = PieceHash::sign(
                &self.uplink,
                derived,
                sha256(payload),
                payload.len() as u64,
                now_ms(),
            );
            let order = Order::sign(&self.uplink, &limit, payload.len() as u64);
            let node_hash = self
                .transport
                .upload(
                    &target.address,
                    &limit,
                    &uplink_hash,
                    payload,
                    &order,
                    Duration::from_secs(10),
                )
                .await
                .map_err(|e| orbit_common::error::Error::unavailable(e.to_string()))?;

            remote_pieces.push(RemotePiece {
                piece_num: num as u16,
                node_id: target.node_id,
                hash: Some(node_hash),
            });
        }

        let pointer = Pointer::new_remote(
            RemoteSegment {
                redundancy,
                root_piece_id: root,
                pieces: remote_pieces,
                pieces_hashes_verified: false,
            },
            data.len() as u64,
            now_ms(),
        );
        self.satellite
            .metainfo
            .commit_segment(path, pointer, self.satellite.overlay.as_ref())
    }

    /// Play the downloading uplink: fetch `k` specific pieces and decode.
    pub async fn download_segment(
        &self,
        path: &SegmentPath,
        use_piece_nums: &[u16],
    ) -> Result<Vec<u8>> {
        let pointer = self.satellite.metainfo.get(path)?;
        let remote = pointer.remote().expect("remote pointer").clone();
        let scheme = ErasureScheme::from_redundancy(&remote.redundancy).expect("scheme");
        let piece_len =
            remote.redundancy.stripe_count(pointer.segment_size) * remote.redundancy.share_size as u64;

        let mut fetched = Vec::new();
        for piece in &remote.pieces {
            if !use_piece_nums.contains(&piece.piece_num) {
                continue;
            }
            let dossier = self.satellite.overlay.get(&piece.node_id)?;
            let derived = remote.root_piece_id.derive(&piece.node_id, piece.piece_num);
            let limit = self.satellite.orders.issue(
                self.uplink.node_id(),
                self.uplink.public_key(),
                piece.node_id,
                derived,
                Action::Get,
                piece_len,
                None,
            )?;
            let order = Order::sign(&self.uplink, &limit, piece_len);
            let bytes = self
                .transport
                .download(
                    &dossier.address,
                    &limit,
                    &order,
                    0,
                    piece_len,
                    Duration::from_secs(10),
                )
                .await
                .map_err(|e| orbit_common::error::Error::unavailable(e.to_string()))?;
            fetched.push((piece.piece_num as usize, bytes));
        }

        scheme
            .decode_segment(&fetched, pointer.segment_size)
            .map_err(|e| orbit_common::error::Error::internal(e.to_string()))
    }

    /// Drain every node's unsent receipts into the satellite's settlement
    /// endpoint, as the settlement agents would.
    pub fn settle_all(&self) -> usize {
        let mut accepted = 0;
        for node in &self.nodes {
            for (satellite_id, items) in node.endpoint.unsent_orders().take_all() {
                assert_eq!(satellite_id, self.satellite.identity.node_id());
                accepted += self.satellite.orders.settle(node.node_id, &items).accepted;
            }
        }
        accepted
    }

    /// Flip one payload byte of a stored piece, leaving the header intact —
    /// the disk-level tamper an audit must catch.
    pub fn tamper_piece(&self, node_id: &NodeId, root: &PieceId, piece_num: u16) {
        let node = self.node(node_id);
        let derived = root.derive(node_id, piece_num);
        let blob_ref = BlobRef {
            namespace: *self.satellite.identity.node_id().as_bytes(),
            key: *derived.as_bytes(),
        };
        let mut reader = node.blobs.open(blob_ref).expect("open blob");
        let mut contents = reader.read_at(0, reader.size() as usize).expect("read");
        let header_reserved = orbit_node::pieces::HEADER_RESERVED;
        contents[header_reserved] ^= 0xff; // first payload byte

        node.blobs.delete(blob_ref).expect("delete");
        let mut writer = node.blobs.create(blob_ref, None).expect("create");
        writer.write_all(&contents).expect("write");
        writer.commit().expect("commit");
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

pub fn test_redundancy() -> RedundancyScheme {
    RedundancyScheme {
        required: 2,
        repair: 2,
        optimal: 3,
        total: 4,
        share_size: 256,
    }
}

pub fn segment_path(object: &[u8]) -> SegmentPath {
    SegmentPath::new("project", orbit_common::path::SegmentRef::Last, "bucket", object)
        .expect("path")
}

pub fn quick_config() -> SatelliteConfig {
    let mut config = SatelliteConfig::default();
    config.audit.min_download_timeout_ms = 2_000;
    config.selection.new_node_fraction = 0.0;
    config.selection.audit_threshold = 1_000_000; // nobody vets during tests
    config
}
