//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use rvr_utils::mac_addr::MacAddr;
use rvr_utils::{Responder, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::Error;
use crate::instance::{
    HostId, NetworkId, Offering, OfferingId, RedundantRole, RouterId,
    RouterInstance, VmState,
};
use crate::network::NetworkState;
use crate::reconcile::{
    LbAlgorithm, Protocol, RuleId, RuleOp, RuleSet,
};

/// Router fields exposed to callers. These fields, and the pair invariants
/// over them, are the contract external monitoring relies on.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RouterView {
    pub id: RouterId,
    pub network_id: NetworkId,
    pub redundant_state: RedundantRole,
    pub state: VmState,
    pub public_ip: Ipv4Addr,
    pub public_mac: MacAddr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: MacAddr,
    pub link_local_ip: Ipv4Addr,
    pub host_id: Option<HostId>,
    pub offering_id: OfferingId,
    pub created_at: DateTime<Utc>,
    pub rules_synced: bool,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NetworkView {
    pub id: NetworkId,
    pub name: String,
    pub state: NetworkState,
    pub offering_id: OfferingId,
    pub cidr: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub source_nat_ip: Ipv4Addr,
    pub public_ips: Vec<Ipv4Addr>,
}

/// Router listing query: all routers of a network, or one router by id.
#[derive(Clone, Copy, Debug)]
pub enum ListRouters {
    Network(NetworkId),
    Router(RouterId),
}

// Requests processed by the master task.
#[derive(Debug)]
pub(crate) enum ApiRequest {
    CreateOffering {
        name: String,
        redundant: bool,
        responder: Responder<OfferingId>,
    },
    CreateNetwork {
        name: String,
        offering_id: OfferingId,
        cidr: Option<Ipv4Network>,
        gateway: Option<Ipv4Addr>,
        responder: Responder<Result<NetworkId, Error>>,
    },
    GetNetwork {
        network_id: NetworkId,
        responder: Responder<Result<NetworkView, Error>>,
    },
    ImplementNetwork {
        network_id: NetworkId,
        responder: Responder<Result<(), Error>>,
    },
    ListRouters {
        query: ListRouters,
        responder: Responder<Result<Vec<RouterView>, Error>>,
    },
    StopRouter {
        router_id: RouterId,
        forced: bool,
        responder: Responder<Result<(), Error>>,
    },
    StartRouter {
        router_id: RouterId,
        responder: Responder<Result<(), Error>>,
    },
    RebootRouter {
        router_id: RouterId,
        responder: Responder<Result<(), Error>>,
    },
    DestroyRouter {
        router_id: RouterId,
        responder: Responder<Result<(), Error>>,
    },
    UpdateNetwork {
        network_id: NetworkId,
        offering_id: OfferingId,
        update_in_sequence: bool,
        forced: bool,
        responder: Responder<Result<(), Error>>,
    },
    RestartNetwork {
        network_id: NetworkId,
        cleanup: bool,
        responder: Responder<Result<(), Error>>,
    },
    ShutdownNetwork {
        network_id: NetworkId,
        responder: Responder<Result<(), Error>>,
    },
    RuleOp {
        network_id: NetworkId,
        op: RuleOp,
        responder: Responder<Result<Option<RuleId>, Error>>,
    },
    NetworkRules {
        network_id: NetworkId,
        responder: Responder<Result<RuleSet, Error>>,
    },
    AssociatePublicIp {
        network_id: NetworkId,
        responder: Responder<Result<Ipv4Addr, Error>>,
    },
    DisassociatePublicIp {
        network_id: NetworkId,
        ip: Ipv4Addr,
        responder: Responder<Result<(), Error>>,
    },
}

// Requests routed into one network's event loop.
#[derive(Debug)]
pub(crate) enum NetworkRequest {
    Implement {
        responder: Responder<Result<(), Error>>,
    },
    GetView {
        responder: Responder<Result<NetworkView, Error>>,
    },
    ListRouters {
        filter: Option<RouterId>,
        responder: Responder<Result<Vec<RouterView>, Error>>,
    },
    StopRouter {
        router_id: RouterId,
        forced: bool,
        responder: Responder<Result<(), Error>>,
    },
    StartRouter {
        router_id: RouterId,
        responder: Responder<Result<(), Error>>,
    },
    RebootRouter {
        router_id: RouterId,
        responder: Responder<Result<(), Error>>,
    },
    DestroyRouter {
        router_id: RouterId,
        responder: Responder<Result<(), Error>>,
    },
    Update {
        target: Offering,
        update_in_sequence: bool,
        forced: bool,
        responder: Responder<Result<(), Error>>,
    },
    Restart {
        cleanup: bool,
        responder: Responder<Result<(), Error>>,
    },
    Shutdown {
        responder: Responder<Result<(), Error>>,
    },
    RuleOp {
        op: RuleOp,
        responder: Responder<Result<Option<RuleId>, Error>>,
    },
    Rules {
        responder: Responder<Result<RuleSet, Error>>,
    },
    AddPublicIp {
        ip: Ipv4Addr,
        responder: Responder<Result<Ipv4Addr, Error>>,
    },
    RemovePublicIp {
        ip: Ipv4Addr,
        responder: Responder<Result<(), Error>>,
    },
}

// ===== impl RouterView =====

impl RouterView {
    pub(crate) fn from_instance(
        router: &RouterInstance,
        current_rules: u64,
    ) -> RouterView {
        RouterView {
            id: router.id,
            network_id: router.network_id,
            redundant_state: router.role,
            state: router.vm_state,
            public_ip: router.identity.public_ip,
            public_mac: router.identity.public_mac,
            guest_ip: router.identity.guest_ip,
            guest_mac: router.identity.guest_mac,
            link_local_ip: router.identity.link_local_ip,
            host_id: router.host_id,
            offering_id: router.offering_id,
            created_at: router.created_at,
            rules_synced: router.applied_rules == Some(current_rules),
        }
    }
}

// ===== impl NetworkRequest =====

impl NetworkRequest {
    // Fails the request without routing it to a network task.
    pub(crate) fn reject(self, error: Error) {
        match self {
            NetworkRequest::Implement { responder }
            | NetworkRequest::StopRouter { responder, .. }
            | NetworkRequest::StartRouter { responder, .. }
            | NetworkRequest::RebootRouter { responder, .. }
            | NetworkRequest::DestroyRouter { responder, .. }
            | NetworkRequest::Update { responder, .. }
            | NetworkRequest::Restart { responder, .. }
            | NetworkRequest::Shutdown { responder }
            | NetworkRequest::RemovePublicIp { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            NetworkRequest::GetView { responder } => {
                let _ = responder.send(Err(error));
            }
            NetworkRequest::ListRouters { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            NetworkRequest::RuleOp { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            NetworkRequest::Rules { responder } => {
                let _ = responder.send(Err(error));
            }
            NetworkRequest::AddPublicIp { responder, .. } => {
                let _ = responder.send(Err(error));
            }
        }
    }
}

/// Cloneable handle over the controller. All operations are asynchronous
/// request/response exchanges with the master task.
#[derive(Clone, Debug)]
pub struct Controller {
    tx: Sender<ApiRequest>,
}

// ===== impl Controller =====

impl Controller {
    pub(crate) fn new(tx: Sender<ApiRequest>) -> Controller {
        Controller { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> ApiRequest,
    ) -> Result<T, Error> {
        let (responder, response) = oneshot::channel();
        self.tx
            .send(build(responder))
            .await
            .map_err(|_| Error::ControllerClosed)?;
        response.await.map_err(|_| Error::ControllerClosed)
    }

    async fn rule_op(
        &self,
        network_id: NetworkId,
        op: RuleOp,
    ) -> Result<Option<RuleId>, Error> {
        self.request(|responder| ApiRequest::RuleOp {
            network_id,
            op,
            responder,
        })
        .await?
    }

    pub async fn create_offering(
        &self,
        name: &str,
        redundant: bool,
    ) -> Result<OfferingId, Error> {
        self.request(|responder| ApiRequest::CreateOffering {
            name: name.to_owned(),
            redundant,
            responder,
        })
        .await
    }

    /// Creates a network in the Allocated state. No routers exist until the
    /// first workload forces implementation.
    pub async fn create_network(
        &self,
        name: &str,
        offering_id: OfferingId,
        cidr: Option<Ipv4Network>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<NetworkId, Error> {
        self.request(|responder| ApiRequest::CreateNetwork {
            name: name.to_owned(),
            offering_id,
            cidr,
            gateway,
            responder,
        })
        .await?
    }

    pub async fn get_network(
        &self,
        network_id: NetworkId,
    ) -> Result<NetworkView, Error> {
        self.request(|responder| ApiRequest::GetNetwork {
            network_id,
            responder,
        })
        .await?
    }

    /// Transitions a network to Implemented, provisioning its router pair.
    /// Models the first VM deployment on the network.
    pub async fn implement_network(
        &self,
        network_id: NetworkId,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::ImplementNetwork {
            network_id,
            responder,
        })
        .await?
    }

    pub async fn list_routers(
        &self,
        query: ListRouters,
    ) -> Result<Vec<RouterView>, Error> {
        self.request(|responder| ApiRequest::ListRouters {
            query,
            responder,
        })
        .await?
    }

    pub async fn stop_router(
        &self,
        router_id: RouterId,
        forced: bool,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::StopRouter {
            router_id,
            forced,
            responder,
        })
        .await?
    }

    pub async fn start_router(
        &self,
        router_id: RouterId,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::StartRouter {
            router_id,
            responder,
        })
        .await?
    }

    pub async fn reboot_router(
        &self,
        router_id: RouterId,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::RebootRouter {
            router_id,
            responder,
        })
        .await?
    }

    pub async fn destroy_router(
        &self,
        router_id: RouterId,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::DestroyRouter {
            router_id,
            responder,
        })
        .await?
    }

    /// Migrates a network's pair to a new offering, one router at a time.
    pub async fn update_network(
        &self,
        network_id: NetworkId,
        offering_id: OfferingId,
        update_in_sequence: bool,
        forced: bool,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::UpdateNetwork {
            network_id,
            offering_id,
            update_in_sequence,
            forced,
            responder,
        })
        .await?
    }

    /// Restarts the network's gateway service. With cleanup the pair is torn
    /// down and rebuilt; without, the rule set is re-pushed in place. Both
    /// leave the same externally observable state.
    pub async fn restart_network(
        &self,
        network_id: NetworkId,
        cleanup: bool,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::RestartNetwork {
            network_id,
            cleanup,
            responder,
        })
        .await?
    }

    pub async fn shutdown_network(
        &self,
        network_id: NetworkId,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::ShutdownNetwork {
            network_id,
            responder,
        })
        .await?
    }

    pub async fn network_rules(
        &self,
        network_id: NetworkId,
    ) -> Result<RuleSet, Error> {
        self.request(|responder| ApiRequest::NetworkRules {
            network_id,
            responder,
        })
        .await?
    }

    pub async fn associate_public_ip(
        &self,
        network_id: NetworkId,
    ) -> Result<Ipv4Addr, Error> {
        self.request(|responder| ApiRequest::AssociatePublicIp {
            network_id,
            responder,
        })
        .await?
    }

    pub async fn disassociate_public_ip(
        &self,
        network_id: NetworkId,
        ip: Ipv4Addr,
    ) -> Result<(), Error> {
        self.request(|responder| ApiRequest::DisassociatePublicIp {
            network_id,
            ip,
            responder,
        })
        .await?
    }

    pub async fn create_firewall_rule(
        &self,
        network_id: NetworkId,
        protocol: Protocol,
        source_cidrs: Vec<Ipv4Network>,
        start_port: u16,
        end_port: u16,
    ) -> Result<RuleId, Error> {
        self.rule_op(
            network_id,
            RuleOp::AddFirewall {
                protocol,
                source_cidrs,
                start_port,
                end_port,
            },
        )
        .await?
        .ok_or(Error::InvalidOperation("rule id missing"))
    }

    pub async fn delete_firewall_rule(
        &self,
        network_id: NetworkId,
        rule_id: RuleId,
    ) -> Result<(), Error> {
        self.rule_op(network_id, RuleOp::DeleteFirewall(rule_id))
            .await
            .map(|_| ())
    }

    pub async fn create_port_forwarding_rule(
        &self,
        network_id: NetworkId,
        public_ip: Ipv4Addr,
        protocol: Protocol,
        public_port: u16,
        private_port: u16,
        guest_ip: Ipv4Addr,
    ) -> Result<RuleId, Error> {
        self.rule_op(
            network_id,
            RuleOp::AddPortForwarding {
                public_ip,
                protocol,
                public_port,
                private_port,
                guest_ip,
            },
        )
        .await?
        .ok_or(Error::InvalidOperation("rule id missing"))
    }

    pub async fn delete_port_forwarding_rule(
        &self,
        network_id: NetworkId,
        rule_id: RuleId,
    ) -> Result<(), Error> {
        self.rule_op(network_id, RuleOp::DeletePortForwarding(rule_id))
            .await
            .map(|_| ())
    }

    pub async fn create_lb_rule(
        &self,
        network_id: NetworkId,
        name: &str,
        public_ip: Ipv4Addr,
        algorithm: LbAlgorithm,
        public_port: u16,
        private_port: u16,
        members: Vec<Ipv4Addr>,
    ) -> Result<RuleId, Error> {
        self.rule_op(
            network_id,
            RuleOp::AddLoadBalancer {
                name: name.to_owned(),
                public_ip,
                algorithm,
                public_port,
                private_port,
                members,
            },
        )
        .await?
        .ok_or(Error::InvalidOperation("rule id missing"))
    }

    pub async fn delete_lb_rule(
        &self,
        network_id: NetworkId,
        rule_id: RuleId,
    ) -> Result<(), Error> {
        self.rule_op(network_id, RuleOp::DeleteLoadBalancer(rule_id))
            .await
            .map(|_| ())
    }

    pub async fn enable_static_nat(
        &self,
        network_id: NetworkId,
        public_ip: Ipv4Addr,
        guest_ip: Ipv4Addr,
    ) -> Result<(), Error> {
        self.rule_op(
            network_id,
            RuleOp::EnableStaticNat {
                public_ip,
                guest_ip,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn disable_static_nat(
        &self,
        network_id: NetworkId,
        public_ip: Ipv4Addr,
    ) -> Result<(), Error> {
        self.rule_op(network_id, RuleOp::DisableStaticNat { public_ip })
            .await
            .map(|_| ())
    }

    pub async fn add_vpn_user(
        &self,
        network_id: NetworkId,
        name: &str,
    ) -> Result<(), Error> {
        self.rule_op(
            network_id,
            RuleOp::AddVpnUser {
                name: name.to_owned(),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_vpn_user(
        &self,
        network_id: NetworkId,
        name: &str,
    ) -> Result<(), Error> {
        self.rule_op(
            network_id,
            RuleOp::RemoveVpnUser {
                name: name.to_owned(),
            },
        )
        .await
        .map(|_| ())
    }
}
