//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use derive_new::new;
use ipnetwork::Ipv4Network;
use rvr_utils::{Receiver, Sender, UnboundedSender};
use serde::{Deserialize, Serialize};

use crate::api::{NetworkView, RouterView};
use crate::debug::Debug;
use crate::error::Error;
use crate::events;
use crate::instance::{
    NetworkId, OfferingId, PromoteReason, RedundantRole, RouterId,
    RouterInstance, VmState,
};
use crate::master::{Allocator, HaConfig, MasterFeedback};
use crate::monitor::HeartbeatMonitor;
use crate::provision::Provisioner;
use crate::reconcile::{RuleId, RuleSet};
use crate::store::Store;
use crate::tasks;
use crate::tasks::messages::input::NetworkMsg;
use crate::update::UpdateJob;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum NetworkState {
    Allocated,
    Implemented,
    Shutdown,
}

/// Persistent part of a network: everything except runtime channels, timers
/// and in-flight operations.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NetworkRecord {
    pub id: NetworkId,
    pub name: String,
    pub state: NetworkState,
    pub offering_id: OfferingId,
    pub cidr: Ipv4Network,
    pub gateway: Ipv4Addr,
    // SourceNAT IP, shared by both pair members and copied onto every
    // replacement instance.
    pub source_nat_ip: Ipv4Addr,
    // Additional associated public IPs.
    pub public_ips: Vec<Ipv4Addr>,
    pub rules: RuleSet,
    pub next_rule_id: u64,
}

// Exclusive administrative operation currently mutating the pair. A second
// exclusive operation is rejected until this one resolves.
#[derive(Debug)]
pub(crate) enum PendingOp {
    Implement {
        remaining: usize,
        responder: rvr_utils::Responder<Result<(), Error>>,
    },
    StopRouter {
        router_id: RouterId,
        forced: bool,
        responder: rvr_utils::Responder<Result<(), Error>>,
    },
    StartRouter {
        router_id: RouterId,
        responder: rvr_utils::Responder<Result<(), Error>>,
    },
    RebootRouter {
        router_id: RouterId,
        responder: rvr_utils::Responder<Result<(), Error>>,
    },
    DestroyRouter {
        router_id: RouterId,
        responder: rvr_utils::Responder<Result<(), Error>>,
    },
    Restart {
        phase: RestartPhase,
        remaining: usize,
        responder: rvr_utils::Responder<Result<(), Error>>,
    },
    Shutdown {
        remaining: usize,
        responder: rvr_utils::Responder<Result<(), Error>>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RestartPhase {
    // cleanup=false: re-pushing the rule set in place.
    Pushing,
    // cleanup=true: tearing the pair down, then rebuilding it.
    Destroying,
    Deploying,
}

#[derive(Clone, Debug, new)]
pub(crate) struct NetworkChannelsTx {
    // Loops back into this network's own event queue (used by child tasks).
    pub input: Sender<NetworkMsg>,
    // Record index updates towards the master task.
    pub master: UnboundedSender<MasterFeedback>,
}

/// One RvR network aggregate.
///
/// All reads-then-writes of the pair's role/state happen inside this
/// aggregate's event-loop task, one message at a time; different networks
/// run fully in parallel.
#[derive(Debug)]
pub struct Network {
    pub(crate) config: Arc<HaConfig>,
    pub(crate) record: NetworkRecord,
    pub(crate) routers: BTreeMap<RouterId, RouterInstance>,
    pub(crate) monitor: HeartbeatMonitor,
    pub(crate) update: Option<UpdateJob>,
    pub(crate) pending: Option<PendingOp>,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    pub(crate) store: Store,
    pub(crate) allocator: Arc<Allocator>,
    pub(crate) tx: NetworkChannelsTx,
}

// ===== impl NetworkState =====

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkState::Allocated => write!(f, "Allocated"),
            NetworkState::Implemented => write!(f, "Implemented"),
            NetworkState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

// ===== impl Network =====

impl Network {
    pub(crate) fn new(
        config: Arc<HaConfig>,
        record: NetworkRecord,
        routers: Vec<RouterInstance>,
        provisioner: Arc<dyn Provisioner>,
        store: Store,
        allocator: Arc<Allocator>,
        tx: NetworkChannelsTx,
    ) -> Network {
        Network {
            config,
            record,
            routers: routers
                .into_iter()
                .map(|router| (router.id, router))
                .collect(),
            monitor: Default::default(),
            update: None,
            pending: None,
            provisioner,
            store,
            allocator,
            tx,
        }
    }

    /// Event loop: processes one message at a time until the network is shut
    /// down. This is the per-network serialization point.
    pub(crate) async fn run(mut self, mut rx: Receiver<NetworkMsg>) {
        // Recovered running routers resume monitoring; their roles stay
        // UNKNOWN until re-observed.
        let running = self
            .routers
            .values()
            .filter(|router| router.is_running())
            .map(|router| router.id)
            .collect::<Vec<_>>();
        for router_id in running {
            self.register_monitor(router_id);
        }

        while let Some(msg) = rx.recv().await {
            match msg {
                NetworkMsg::Request(request) => {
                    events::process_request(&mut self, request);
                }
                NetworkMsg::Advertisement(adv) => {
                    if let Err(error) =
                        events::process_advertisement(&mut self, adv)
                    {
                        error.log();
                    }
                }
                NetworkMsg::SilenceTimer(msg) => {
                    if let Err(error) =
                        events::process_silence(&mut self, msg.router_id)
                    {
                        error.log();
                    }
                }
                NetworkMsg::ProvisionResult(msg) => {
                    if let Err(error) =
                        events::process_provision_result(&mut self, msg)
                    {
                        error.log();
                    }
                }
                NetworkMsg::RulePushResult(msg) => {
                    events::process_rule_push_result(&mut self, msg);
                }
                NetworkMsg::ConvergenceTick => {
                    if let Err(error) =
                        events::process_convergence_tick(&mut self)
                    {
                        error.log();
                    }
                }
            }

            // A shut-down network with no remaining routers has nothing left
            // to process.
            if self.record.state == NetworkState::Shutdown
                && self.routers.is_empty()
                && self.pending.is_none()
            {
                break;
            }
        }

        let _ = self
            .tx
            .master
            .send(MasterFeedback::NetworkShutdown(self.record.id));
    }

    pub(crate) fn router(
        &self,
        router_id: RouterId,
    ) -> Result<&RouterInstance, Error> {
        self.routers
            .get(&router_id)
            .ok_or(Error::RouterNotFound(router_id))
    }

    pub(crate) fn router_mut(
        &mut self,
        router_id: RouterId,
    ) -> Result<&mut RouterInstance, Error> {
        self.routers
            .get_mut(&router_id)
            .ok_or(Error::RouterNotFound(router_id))
    }

    /// Another instance of this network currently holding a healthy PRIMARY
    /// record. Updates transiently hold three records, so this checks every
    /// other instance, not just "the" peer.
    pub(crate) fn other_healthy_primary(
        &self,
        router_id: RouterId,
    ) -> Option<&RouterInstance> {
        self.routers
            .values()
            .find(|router| router.id != router_id && router.is_healthy_primary())
    }

    /// Whether any other instance of this network is running.
    pub(crate) fn any_other_running(&self, router_id: RouterId) -> bool {
        self.routers
            .values()
            .any(|router| router.id != router_id && router.is_running())
    }

    pub(crate) fn primary(&self) -> Option<&RouterInstance> {
        self.routers
            .values()
            .find(|router| router.role == RedundantRole::Primary)
    }

    pub(crate) fn backup(&self) -> Option<&RouterInstance> {
        self.routers
            .values()
            .find(|router| router.role == RedundantRole::Backup)
    }

    /// Records a validated role transition. This is the split-brain guard:
    /// no transition may record a second PRIMARY while the current PRIMARY
    /// is backed by a running VM.
    pub(crate) fn set_role(
        &mut self,
        router_id: RouterId,
        role: RedundantRole,
        reason: PromoteReason,
    ) -> Result<(), Error> {
        if role == RedundantRole::Primary
            && self.other_healthy_primary(router_id).is_some()
        {
            return Err(Error::SplitBrainRejected(router_id));
        }

        let router = self.router_mut(router_id)?;
        router.role_update(role, reason);
        self.save_router(router_id);
        Ok(())
    }

    pub(crate) fn set_vm_state(
        &mut self,
        router_id: RouterId,
        vm_state: VmState,
    ) {
        if let Some(router) = self.routers.get_mut(&router_id) {
            router.vm_update(vm_state);
            self.save_router(router_id);
        }
    }

    pub(crate) fn insert_router(&mut self, router: RouterInstance) {
        let router_id = router.id;
        self.store.save_router(&router);
        let _ = self
            .tx
            .master
            .send(MasterFeedback::RouterAdded(router_id, self.record.id));
        self.routers.insert(router_id, router);
    }

    pub(crate) fn remove_router(&mut self, router_id: RouterId) {
        Debug::RouterDestroy(router_id).log();

        self.monitor.unregister(router_id);
        self.routers.remove(&router_id);
        self.store.remove_router(router_id);
        let _ = self.tx.master.send(MasterFeedback::RouterRemoved(router_id));
    }

    /// (Re)arms heartbeat monitoring for a router that is Running.
    pub(crate) fn register_monitor(&mut self, router_id: RouterId) {
        let timer = tasks::silence_timer(
            router_id,
            self.config.silence_timeout(),
            &self.tx.input,
        );
        self.monitor.register(router_id, timer);
    }

    pub(crate) fn next_rule_id(&mut self) -> RuleId {
        let id = RuleId(self.record.next_rule_id);
        self.record.next_rule_id += 1;
        id
    }

    /// Checks that the given public IP is associated with this network.
    pub(crate) fn check_public_ip(&self, ip: Ipv4Addr) -> Result<(), Error> {
        if ip == self.record.source_nat_ip
            || self.record.public_ips.contains(&ip)
        {
            Ok(())
        } else {
            Err(Error::InvalidOperation(
                "public IP is not associated with this network",
            ))
        }
    }

    /// Whether an exclusive pair-mutating operation is already in flight.
    pub(crate) fn is_busy(&self) -> bool {
        self.pending.is_some() || self.update.is_some()
    }

    /// A stable pair: two running instances, exactly one serving PRIMARY and
    /// one BACKUP, with no UNKNOWN left to resolve.
    pub(crate) fn is_stable(&self) -> bool {
        self.routers.len() == 2
            && self.routers.values().all(|router| router.is_running())
            && self
                .routers
                .values()
                .filter(|router| router.is_healthy_primary())
                .filter(|router| router.serving)
                .count()
                == 1
            && self
                .routers
                .values()
                .filter(|router| router.role == RedundantRole::Backup)
                .count()
                == 1
    }

    pub(crate) fn views(&self, filter: Option<RouterId>) -> Vec<RouterView> {
        self.routers
            .values()
            .filter(|router| filter.is_none_or(|id| router.id == id))
            .map(|router| {
                RouterView::from_instance(router, self.record.rules.version)
            })
            .collect()
    }

    pub(crate) fn view(&self) -> NetworkView {
        NetworkView {
            id: self.record.id,
            name: self.record.name.clone(),
            state: self.record.state,
            offering_id: self.record.offering_id,
            cidr: self.record.cidr,
            gateway: self.record.gateway,
            source_nat_ip: self.record.source_nat_ip,
            public_ips: self.record.public_ips.clone(),
        }
    }

    pub(crate) fn save_record(&self) {
        self.store.save_network(&self.record);
    }

    pub(crate) fn save_router(&self, router_id: RouterId) {
        if let Some(router) = self.routers.get(&router_id) {
            self.store.save_router(router);
        }
    }
}
