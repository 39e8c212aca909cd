//! Satellite assembly.
//!
//! Every component receives its collaborators by reference at construction;
//! nothing is threaded through ambient state. [`Satellite::new`] wires the
//! full graph once, and both the binary and the integration harness run the
//! same object.

use std::sync::Arc;

use orbit_common::config::SatelliteConfig;
use orbit_common::identity::Identity;

use crate::audit::{AuditChore, Containment, Reporter, Verifier};
use crate::gc::GarbageCollector;
use crate::metainfo;
use crate::orders::OrdersService;
use crate::overlay::OverlayService;
use crate::repair::{Checker, RepairQueue, RepairWorker, SegmentRepairer};
use crate::tally::Tally;
use crate::transport::PieceTransport;

pub struct Satellite {
    pub identity: Arc<Identity>,
    pub config: SatelliteConfig,
    pub metainfo: Arc<metainfo::Service>,
    pub overlay: Arc<OverlayService>,
    pub orders: Arc<OrdersService>,
    pub containment: Arc<Containment>,
    pub verifier: Arc<Verifier>,
    pub reporter: Arc<Reporter>,
    pub audit: Arc<AuditChore>,
    pub repair_queue: Arc<RepairQueue>,
    pub checker: Arc<Checker>,
    pub repairer: Arc<SegmentRepairer>,
    pub repair_worker: Arc<RepairWorker>,
    pub gc: Arc<GarbageCollector>,
    pub tally: Arc<Tally>,
}

impl Satellite {
    #[must_use]
    pub fn new(
        identity: Arc<Identity>,
        config: SatelliteConfig,
        transport: Arc<dyn PieceTransport>,
    ) -> Self {
        let metainfo = Arc::new(metainfo::Service::new());
        let overlay = Arc::new(OverlayService::new(config.selection.clone()));
        let orders = Arc::new(OrdersService::new(identity.clone(), config.orders.clone()));
        let containment = Arc::new(Containment::new(config.audit.containment_window_ms));

        let verifier = Arc::new(Verifier::new(
            identity.clone(),
            metainfo.clone(),
            overlay.clone(),
            orders.clone(),
            containment.clone(),
            transport.clone(),
            config.audit.clone(),
        ));
        let reporter = Arc::new(Reporter::new(overlay.clone(), containment.clone(), 3));
        let audit = Arc::new(AuditChore::new(
            metainfo.clone(),
            verifier.clone(),
            reporter.clone(),
        ));

        let repair_queue = Arc::new(RepairQueue::new(
            config.repair.lease_ms,
            config.repair.max_attempts,
        ));
        let checker = Arc::new(Checker::new(
            metainfo.clone(),
            overlay.clone(),
            repair_queue.clone(),
        ));
        let repairer = Arc::new(SegmentRepairer::new(
            identity.clone(),
            metainfo.clone(),
            overlay.clone(),
            orders.clone(),
            transport.clone(),
            config.repair.clone(),
        ));
        let repair_worker = Arc::new(RepairWorker::new(repairer.clone(), repair_queue.clone()));

        let gc = Arc::new(GarbageCollector::new(
            identity.clone(),
            metainfo.clone(),
            overlay.clone(),
            transport,
        ));
        let tally = Arc::new(Tally::new(metainfo.clone(), orders.clone(), overlay.clone()));

        Satellite {
            identity,
            config,
            metainfo,
            overlay,
            orders,
            containment,
            verifier,
            reporter,
            audit,
            repair_queue,
            checker,
            repairer,
            repair_worker,
            gc,
            tally,
        }
    }
}
