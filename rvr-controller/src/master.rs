//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use rvr_utils::task::Task;
use rvr_utils::{Database, Receiver, UnboundedReceiver, UnboundedSender};
use tokio::sync::mpsc;
use tracing::{Instrument, debug_span, info};

use crate::api::{ApiRequest, Controller, ListRouters, NetworkRequest};
use crate::error::Error;
use crate::instance::{
    NetworkId, Offering, OfferingId, PromoteReason, RedundantRole, RouterId,
    RouterInstance, VmState,
};
use crate::monitor::Advertisement;
use crate::network::{Network, NetworkChannelsTx, NetworkRecord, NetworkState};
use crate::provision::Provisioner;
use crate::store::Store;
use crate::tasks::messages::input::NetworkMsg;

/// Controller-wide HA configuration. The failover window is a configurable
/// SLO: an instance is considered silent after `silence_multiplier`
/// advertisement intervals without a signal.
#[derive(Clone, Debug)]
pub struct HaConfig {
    pub advert_interval: Duration,
    pub silence_multiplier: u32,
    pub convergence_interval: Duration,
    pub convergence_retries: usize,
    // Pool the SourceNAT and additional public IPs are drawn from.
    pub public_cidr: Ipv4Network,
}

/// Shared id/address allocation. Network tasks allocate router ids directly;
/// everything else is allocated by the master task.
#[derive(Debug, Default)]
pub struct Allocator {
    next_network: AtomicU64,
    next_router: AtomicU64,
    next_offering: AtomicU64,
    next_public: AtomicU64,
}

// Record-index updates flowing from network tasks back to the master.
#[derive(Debug)]
pub(crate) enum MasterFeedback {
    RouterAdded(RouterId, NetworkId),
    RouterRemoved(RouterId),
    NetworkShutdown(NetworkId),
}

#[derive(Debug)]
struct NetworkHandle {
    input: rvr_utils::Sender<NetworkMsg>,
    _task: Task<()>,
}

/// The controller master: routes API requests and heartbeat events to the
/// per-network tasks and owns the cross-network router index.
#[derive(Debug)]
pub struct Master {
    config: Arc<HaConfig>,
    provisioner: Arc<dyn Provisioner>,
    store: Store,
    allocator: Arc<Allocator>,
    offerings: BTreeMap<OfferingId, Offering>,
    networks: HashMap<NetworkId, NetworkHandle>,
    router_index: HashMap<RouterId, NetworkId>,
    feedback_tx: UnboundedSender<MasterFeedback>,
}

// ===== impl HaConfig =====

impl HaConfig {
    pub fn silence_timeout(&self) -> Duration {
        self.advert_interval * self.silence_multiplier
    }
}

impl Default for HaConfig {
    fn default() -> HaConfig {
        HaConfig {
            advert_interval: Duration::from_secs(1),
            silence_multiplier: 3,
            convergence_interval: Duration::from_secs(1),
            convergence_retries: 30,
            public_cidr: "203.0.113.0/24".parse().unwrap(),
        }
    }
}

// ===== impl Allocator =====

impl Allocator {
    pub(crate) fn next_router(&self) -> u64 {
        self.next_router.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_network(&self) -> u64 {
        self.next_network.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_offering(&self) -> u64 {
        self.next_offering.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn alloc_public(&self, pool: &Ipv4Network) -> Option<Ipv4Addr> {
        // Skip the network address, keep the broadcast address out.
        let offset = self.next_public.fetch_add(1, Ordering::Relaxed) + 1;
        if offset + 1 >= u64::from(pool.size()) {
            return None;
        }
        pool.iter().nth(offset as usize)
    }

    // Raises a counter so future allocations don't collide with restored
    // records.
    fn bump(counter: &AtomicU64, allocated: u64) {
        counter.fetch_max(allocated, Ordering::Relaxed);
    }
}

// ===== impl Master =====

impl Master {
    fn new(
        config: Arc<HaConfig>,
        provisioner: Arc<dyn Provisioner>,
        store: Store,
        feedback_tx: UnboundedSender<MasterFeedback>,
    ) -> Master {
        Master {
            config,
            provisioner,
            store,
            allocator: Arc::new(Allocator::default()),
            offerings: Default::default(),
            networks: Default::default(),
            router_index: Default::default(),
            feedback_tx,
        }
    }

    // Reloads persisted records and resumes the corresponding network tasks.
    // Recovered roles degrade to UNKNOWN until re-observed through the
    // heartbeat monitor.
    fn restore(&mut self) {
        let snapshot = self.store.load();

        for offering in snapshot.offerings {
            Allocator::bump(&self.allocator.next_offering, offering.id.0);
            self.offerings.insert(offering.id, offering);
        }

        let mut routers_by_net: HashMap<NetworkId, Vec<RouterInstance>> =
            HashMap::new();
        for mut router in snapshot.routers {
            if router.vm_state == VmState::Destroyed {
                continue;
            }
            Allocator::bump(&self.allocator.next_router, router.id.0);

            // Roles and rule sync must be re-observed after a restart.
            router.role = RedundantRole::Unknown;
            router.promote_reason = PromoteReason::NotPromoted;
            router.serving = false;
            router.applied_rules = None;
            if matches!(router.vm_state, VmState::Starting | VmState::Stopping)
            {
                router.vm_state = VmState::Stopped;
            }

            routers_by_net
                .entry(router.network_id)
                .or_default()
                .push(router);
        }

        for record in snapshot.networks {
            Allocator::bump(&self.allocator.next_network, record.id.0);
            self.bump_public_allocations(&record);

            let routers =
                routers_by_net.remove(&record.id).unwrap_or_default();
            if record.state == NetworkState::Shutdown && routers.is_empty() {
                continue;
            }

            info!(
                network = %record.id,
                routers = routers.len(),
                "restored network records",
            );
            for router in &routers {
                self.router_index.insert(router.id, record.id);
            }
            self.spawn_network(record, routers);
        }
    }

    fn bump_public_allocations(&self, record: &NetworkRecord) {
        let pool = &self.config.public_cidr;
        for ip in std::iter::once(record.source_nat_ip)
            .chain(record.public_ips.iter().copied())
        {
            if pool.contains(ip) {
                let offset =
                    u64::from(u32::from(ip)) - u64::from(u32::from(pool.network()));
                Allocator::bump(&self.allocator.next_public, offset);
            }
        }
    }

    fn spawn_network(
        &mut self,
        record: NetworkRecord,
        routers: Vec<RouterInstance>,
    ) {
        let network_id = record.id;
        let (input_tx, input_rx) = mpsc::channel(64);
        let tx =
            NetworkChannelsTx::new(input_tx.clone(), self.feedback_tx.clone());
        let net = Network::new(
            self.config.clone(),
            record,
            routers,
            self.provisioner.clone(),
            self.store.clone(),
            self.allocator.clone(),
            tx,
        );

        let task = Task::spawn(
            net.run(input_rx)
                .instrument(debug_span!("network", id = %network_id)),
        );
        self.networks.insert(
            network_id,
            NetworkHandle {
                input: input_tx,
                _task: task,
            },
        );
    }

    async fn run(
        mut self,
        mut api_rx: Receiver<ApiRequest>,
        mut heartbeat_rx: Receiver<Advertisement>,
        mut feedback_rx: UnboundedReceiver<MasterFeedback>,
    ) {
        loop {
            tokio::select! {
                request = api_rx.recv() => match request {
                    Some(request) => self.process_api(request).await,
                    // All controller handles are gone.
                    None => break,
                },
                Some(adv) = heartbeat_rx.recv() => {
                    self.process_advertisement(adv).await;
                }
                Some(feedback) = feedback_rx.recv() => {
                    self.process_feedback(feedback);
                }
            }
        }
    }

    async fn process_api(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::CreateOffering {
                name,
                redundant,
                responder,
            } => {
                let id = OfferingId(self.allocator.next_offering());
                let offering = Offering::new(id, name, redundant);
                self.store.save_offering(&offering);
                self.offerings.insert(id, offering);
                let _ = responder.send(id);
            }
            ApiRequest::CreateNetwork {
                name,
                offering_id,
                cidr,
                gateway,
                responder,
            } => {
                let result =
                    self.create_network(name, offering_id, cidr, gateway);
                let _ = responder.send(result);
            }
            ApiRequest::GetNetwork {
                network_id,
                responder,
            } => {
                self.forward(network_id, NetworkRequest::GetView { responder })
                    .await;
            }
            ApiRequest::ImplementNetwork {
                network_id,
                responder,
            } => {
                self.forward(network_id, NetworkRequest::Implement { responder })
                    .await;
            }
            ApiRequest::ListRouters { query, responder } => match query {
                ListRouters::Network(network_id) => {
                    self.forward(
                        network_id,
                        NetworkRequest::ListRouters {
                            filter: None,
                            responder,
                        },
                    )
                    .await;
                }
                ListRouters::Router(router_id) => {
                    match self.router_index.get(&router_id).copied() {
                        Some(network_id) => {
                            self.forward(
                                network_id,
                                NetworkRequest::ListRouters {
                                    filter: Some(router_id),
                                    responder,
                                },
                            )
                            .await;
                        }
                        // Unknown routers list as empty, not as an error.
                        None => {
                            let _ = responder.send(Ok(Vec::new()));
                        }
                    }
                }
            },
            ApiRequest::StopRouter {
                router_id,
                forced,
                responder,
            } => match self.router_index.get(&router_id).copied() {
                Some(network_id) => {
                    self.forward(
                        network_id,
                        NetworkRequest::StopRouter {
                            router_id,
                            forced,
                            responder,
                        },
                    )
                    .await;
                }
                None => {
                    let _ =
                        responder.send(Err(Error::RouterNotFound(router_id)));
                }
            },
            ApiRequest::StartRouter {
                router_id,
                responder,
            } => match self.router_index.get(&router_id).copied() {
                Some(network_id) => {
                    self.forward(
                        network_id,
                        NetworkRequest::StartRouter {
                            router_id,
                            responder,
                        },
                    )
                    .await;
                }
                None => {
                    let _ =
                        responder.send(Err(Error::RouterNotFound(router_id)));
                }
            },
            ApiRequest::RebootRouter {
                router_id,
                responder,
            } => match self.router_index.get(&router_id).copied() {
                Some(network_id) => {
                    self.forward(
                        network_id,
                        NetworkRequest::RebootRouter {
                            router_id,
                            responder,
                        },
                    )
                    .await;
                }
                None => {
                    let _ =
                        responder.send(Err(Error::RouterNotFound(router_id)));
                }
            },
            ApiRequest::DestroyRouter {
                router_id,
                responder,
            } => match self.router_index.get(&router_id).copied() {
                Some(network_id) => {
                    self.forward(
                        network_id,
                        NetworkRequest::DestroyRouter {
                            router_id,
                            responder,
                        },
                    )
                    .await;
                }
                None => {
                    let _ =
                        responder.send(Err(Error::RouterNotFound(router_id)));
                }
            },
            ApiRequest::UpdateNetwork {
                network_id,
                offering_id,
                update_in_sequence,
                forced,
                responder,
            } => match self.offerings.get(&offering_id) {
                Some(offering) => {
                    self.forward(
                        network_id,
                        NetworkRequest::Update {
                            target: offering.clone(),
                            update_in_sequence,
                            forced,
                            responder,
                        },
                    )
                    .await;
                }
                None => {
                    let _ = responder
                        .send(Err(Error::OfferingNotFound(offering_id)));
                }
            },
            ApiRequest::RestartNetwork {
                network_id,
                cleanup,
                responder,
            } => {
                self.forward(
                    network_id,
                    NetworkRequest::Restart { cleanup, responder },
                )
                .await;
            }
            ApiRequest::ShutdownNetwork {
                network_id,
                responder,
            } => {
                self.forward(network_id, NetworkRequest::Shutdown { responder })
                    .await;
            }
            ApiRequest::RuleOp {
                network_id,
                op,
                responder,
            } => {
                self.forward(network_id, NetworkRequest::RuleOp { op, responder })
                    .await;
            }
            ApiRequest::NetworkRules {
                network_id,
                responder,
            } => {
                self.forward(network_id, NetworkRequest::Rules { responder })
                    .await;
            }
            ApiRequest::AssociatePublicIp {
                network_id,
                responder,
            } => match self.allocator.alloc_public(&self.config.public_cidr) {
                Some(ip) => {
                    self.forward(
                        network_id,
                        NetworkRequest::AddPublicIp { ip, responder },
                    )
                    .await;
                }
                None => {
                    let _ = responder.send(Err(Error::InvalidOperation(
                        "public IP pool exhausted",
                    )));
                }
            },
            ApiRequest::DisassociatePublicIp {
                network_id,
                ip,
                responder,
            } => {
                self.forward(
                    network_id,
                    NetworkRequest::RemovePublicIp { ip, responder },
                )
                .await;
            }
        }
    }

    fn create_network(
        &mut self,
        name: String,
        offering_id: OfferingId,
        cidr: Option<Ipv4Network>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<NetworkId, Error> {
        let offering = self
            .offerings
            .get(&offering_id)
            .ok_or(Error::OfferingNotFound(offering_id))?;
        if !offering.redundant {
            return Err(Error::NotRedundant(offering_id));
        }

        let cidr = cidr.unwrap_or(Self::DFLT_GUEST_CIDR.parse().unwrap());
        let gateway = match gateway {
            Some(gateway) => gateway,
            None => cidr
                .iter()
                .nth(1)
                .ok_or(Error::InvalidOperation("guest CIDR too small"))?,
        };
        if !cidr.contains(gateway) {
            return Err(Error::InvalidOperation(
                "gateway is outside the guest CIDR",
            ));
        }

        let source_nat_ip = self
            .allocator
            .alloc_public(&self.config.public_cidr)
            .ok_or(Error::InvalidOperation("public IP pool exhausted"))?;

        let id = NetworkId(self.allocator.next_network());
        let record = NetworkRecord {
            id,
            name,
            state: NetworkState::Allocated,
            offering_id,
            cidr,
            gateway,
            source_nat_ip,
            public_ips: Vec::new(),
            rules: Default::default(),
            next_rule_id: 1,
        };

        info!(network = %id, %cidr, %source_nat_ip, "network created");

        self.store.save_network(&record);
        self.spawn_network(record, Vec::new());
        Ok(id)
    }

    async fn forward(&mut self, network_id: NetworkId, request: NetworkRequest) {
        match self.networks.get(&network_id) {
            Some(handle) => {
                if let Err(error) =
                    handle.input.send(NetworkMsg::Request(request)).await
                    && let NetworkMsg::Request(request) = error.0
                {
                    request.reject(Error::NetworkNotFound(network_id));
                }
            }
            None => request.reject(Error::NetworkNotFound(network_id)),
        }
    }

    async fn process_advertisement(&mut self, adv: Advertisement) {
        if let Some(network_id) = self.router_index.get(&adv.router_id)
            && let Some(handle) = self.networks.get(network_id)
        {
            let _ = handle.input.send(NetworkMsg::Advertisement(adv)).await;
        }
    }

    fn process_feedback(&mut self, feedback: MasterFeedback) {
        match feedback {
            MasterFeedback::RouterAdded(router_id, network_id) => {
                self.router_index.insert(router_id, network_id);
            }
            MasterFeedback::RouterRemoved(router_id) => {
                self.router_index.remove(&router_id);
            }
            MasterFeedback::NetworkShutdown(network_id) => {
                info!(network = %network_id, "network shut down");
                self.networks.remove(&network_id);
            }
        }
    }

    const DFLT_GUEST_CIDR: &'static str = "10.1.1.0/24";
}

// ===== global functions =====

/// Spawns the controller master task and returns the API handle. Must be
/// called from within a tokio runtime.
pub fn spawn(
    config: HaConfig,
    provisioner: Arc<dyn Provisioner>,
    heartbeat_rx: Receiver<Advertisement>,
    db: Option<Database>,
) -> Controller {
    let (api_tx, api_rx) = mpsc::channel(16);
    let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();

    let mut master = Master::new(
        Arc::new(config),
        provisioner,
        Store::new(db),
        feedback_tx,
    );
    master.restore();

    let mut task =
        Task::spawn(master.run(api_rx, heartbeat_rx, feedback_rx));
    task.detach();

    Controller::new(api_tx)
}
