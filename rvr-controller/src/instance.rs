//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use derive_new::new;
use rvr_utils::mac_addr::MacAddr;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NetworkId(pub u64);

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct RouterId(pub u64);

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct OfferingId(pub u64);

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct HostId(pub u64);

/// A network offering revision. Routers carry the offering they were built
/// from as a version tag; a rolling update converges both members of a pair
/// onto the network's current offering.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Offering {
    pub id: OfferingId,
    pub name: String,
    pub redundant: bool,
}

/// Redundant role of a router instance as recorded by the controller.
///
/// `Fault` and `Unknown` are the transient observations after an involuntary
/// or administrative stop, before the peer's status is confirmed. There is no
/// "stopped" role: a stopped router is `VmState::Stopped` with role
/// `Unknown`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RedundantRole {
    Primary,
    Backup,
    Fault,
    Unknown,
}

/// Compute lifecycle state of a router instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
}

/// Why an instance last became PRIMARY.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PromoteReason {
    NotPromoted,
    Bootstrap,
    PeerSilent,
    PeerStopped,
}

/// Network identity of a router instance. The public half is shared by both
/// members of a pair (and copied onto replacements); the guest half is
/// per-instance.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Identity {
    pub public_ip: Ipv4Addr,
    pub public_mac: MacAddr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: MacAddr,
    pub link_local_ip: Ipv4Addr,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RouterInstance {
    pub id: RouterId,
    pub network_id: NetworkId,
    pub role: RedundantRole,
    pub vm_state: VmState,
    pub identity: Identity,
    pub host_id: Option<HostId>,
    // Offering the instance was built from.
    pub offering_id: OfferingId,
    pub created_at: DateTime<Utc>,
    // Rule-set version last pushed successfully to this instance.
    pub applied_rules: Option<u64>,
    // A promoted instance is serving only once the full rule set has been
    // reconciled onto it.
    pub serving: bool,
    pub promote_reason: PromoteReason,
    pub statistics: Statistics,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Statistics {
    pub last_change: DateTime<Utc>,
    pub transitions: u32,
    pub adverts_rcvd: u64,
    pub silence_events: u32,
}

// ===== impl RedundantRole =====

impl std::fmt::Display for RedundantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedundantRole::Primary => write!(f, "PRIMARY"),
            RedundantRole::Backup => write!(f, "BACKUP"),
            RedundantRole::Fault => write!(f, "FAULT"),
            RedundantRole::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ===== impl VmState =====

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Starting => write!(f, "Starting"),
            VmState::Running => write!(f, "Running"),
            VmState::Stopping => write!(f, "Stopping"),
            VmState::Stopped => write!(f, "Stopped"),
            VmState::Destroyed => write!(f, "Destroyed"),
        }
    }
}

// ===== impl RouterInstance =====

impl RouterInstance {
    pub(crate) fn new(
        id: RouterId,
        network_id: NetworkId,
        role: RedundantRole,
        offering_id: OfferingId,
        identity: Identity,
    ) -> RouterInstance {
        Debug::RouterCreate(id, role).log();

        RouterInstance {
            id,
            network_id,
            role,
            vm_state: VmState::Starting,
            identity,
            host_id: None,
            offering_id,
            created_at: Utc::now(),
            applied_rules: None,
            serving: false,
            promote_reason: PromoteReason::NotPromoted,
            statistics: Default::default(),
        }
    }

    /// Updates the recorded redundant role of the instance.
    ///
    /// The split-brain guard lives at the pair level
    /// ([`crate::network::Network::set_role`]); this method only records an
    /// already validated transition.
    pub(crate) fn role_update(
        &mut self,
        role: RedundantRole,
        reason: PromoteReason,
    ) {
        let old_role = self.role;
        if old_role == role {
            return;
        }

        Debug::FsmTransition(self.id, old_role, role).log();

        self.role = role;
        self.promote_reason = match role {
            RedundantRole::Primary => reason,
            _ => PromoteReason::NotPromoted,
        };
        if role != RedundantRole::Primary {
            self.serving = false;
        }
        self.statistics.transitions += 1;
        self.statistics.last_change = Utc::now();
    }

    /// Updates the compute lifecycle state of the instance.
    pub(crate) fn vm_update(&mut self, vm_state: VmState) {
        let old_state = self.vm_state;
        if old_state == vm_state {
            return;
        }

        Debug::VmTransition(self.id, old_state, vm_state).log();

        self.vm_state = vm_state;
        self.statistics.last_change = Utc::now();
    }

    pub fn is_running(&self) -> bool {
        self.vm_state == VmState::Running
    }

    /// Whether this instance holds the recorded PRIMARY role backed by a
    /// running VM. Such a peer blocks any other promotion attempt.
    pub(crate) fn is_healthy_primary(&self) -> bool {
        self.role == RedundantRole::Primary && self.is_running()
    }
}

// ===== impl Statistics =====

impl Default for Statistics {
    fn default() -> Statistics {
        Statistics {
            last_change: Utc::now(),
            transitions: 0,
            adverts_rcvd: 0,
            silence_events: 0,
        }
    }
}

// ===== impl NetworkId / RouterId / OfferingId / HostId =====

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for OfferingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
