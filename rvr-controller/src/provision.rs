//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use async_trait::async_trait;
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::instance::{
    HostId, Identity, NetworkId, OfferingId, RedundantRole, RouterId,
};
use crate::reconcile::RuleSet;

/// External compute boundary: the hypervisor/orchestration layer that
/// actually creates, destroys and reconfigures router VMs. The controller
/// never talks to a hypervisor directly; everything goes through this trait.
///
/// All operations are blocking-with-timeout from the controller's point of
/// view and run in child tasks, never inside a network's event loop.
#[async_trait]
pub trait Provisioner: Send + Sync + std::fmt::Debug {
    /// Creates and boots a new router instance.
    async fn deploy(
        &self,
        spec: DeploySpec,
    ) -> Result<DeployedRouter, ProvisionError>;

    /// Expunges a router instance.
    async fn destroy(&self, router_id: RouterId)
    -> Result<(), ProvisionError>;

    /// Stops a router instance. A forced stop models a power-off rather than
    /// a clean guest shutdown.
    async fn stop(
        &self,
        router_id: RouterId,
        forced: bool,
    ) -> Result<(), ProvisionError>;

    /// Starts a previously stopped router instance.
    async fn start(&self, router_id: RouterId) -> Result<(), ProvisionError>;

    /// Reboots a running router instance.
    async fn reboot(&self, router_id: RouterId) -> Result<(), ProvisionError>;

    /// Programs the full rule set into a running router instance.
    async fn push_rules(
        &self,
        router_id: RouterId,
        rules: &RuleSet,
    ) -> Result<(), ProvisionError>;
}

/// Everything the compute layer needs to build one router instance.
#[derive(Clone, Debug, new)]
#[derive(Deserialize, Serialize)]
pub struct DeploySpec {
    pub router_id: RouterId,
    pub network_id: NetworkId,
    // Role the guest boots with. Only the very first member of a pair boots
    // as PRIMARY; every later instance joins as BACKUP and relies on the
    // in-guest election to promote it if needed.
    pub bootstrap_role: RedundantRole,
    pub identity: Identity,
    pub gateway: Ipv4Addr,
    pub offering_id: OfferingId,
}

#[derive(Clone, Copy, Debug, new)]
#[derive(Deserialize, Serialize)]
pub struct DeployedRouter {
    pub host_id: HostId,
}

// Provisioner errors.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ProvisionError {
    NoCapacity,
    AgentUnreachable(RouterId),
    Failed(String),
}

// ===== impl ProvisionError =====

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionError::NoCapacity => {
                write!(f, "no host has capacity for the router instance")
            }
            ProvisionError::AgentUnreachable(..) => {
                write!(f, "router agent is unreachable")
            }
            ProvisionError::Failed(reason) => {
                write!(f, "provisioning failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ProvisionError {}
