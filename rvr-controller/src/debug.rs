//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{debug, debug_span};

use crate::instance::{NetworkId, OfferingId, RedundantRole, RouterId, VmState};
use crate::update::UpdatePhase;

// Controller debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    RouterCreate(RouterId, RedundantRole),
    RouterDestroy(RouterId),
    FsmTransition(RouterId, RedundantRole, RedundantRole),
    VmTransition(RouterId, VmState, VmState),
    AdvertStale(RouterId),
    SilenceExpiry(RouterId),
    RulePush(RouterId, u64),
    RulesSynced(RouterId, u64),
    PairEnsure(NetworkId, usize),
    UpdateStart(NetworkId, OfferingId),
    UpdatePhase(NetworkId, &'a UpdatePhase),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::RouterCreate(router_id, role) => {
                debug_span!("router", id = %router_id).in_scope(|| {
                    debug!(%role, "{}", self);
                });
            }
            Debug::RouterDestroy(router_id)
            | Debug::AdvertStale(router_id)
            | Debug::SilenceExpiry(router_id) => {
                debug_span!("router", id = %router_id).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(router_id, old_role, new_role) => {
                debug_span!("router", id = %router_id).in_scope(|| {
                    debug!(%old_role, %new_role, "{}", self);
                });
            }
            Debug::VmTransition(router_id, old_state, new_state) => {
                debug_span!("router", id = %router_id).in_scope(|| {
                    debug!(%old_state, %new_state, "{}", self);
                });
            }
            Debug::RulePush(router_id, version)
            | Debug::RulesSynced(router_id, version) => {
                debug_span!("router", id = %router_id).in_scope(|| {
                    debug!(%version, "{}", self);
                });
            }
            Debug::PairEnsure(network_id, missing) => {
                debug_span!("network", id = %network_id).in_scope(|| {
                    debug!(%missing, "{}", self);
                });
            }
            Debug::UpdateStart(network_id, offering_id) => {
                debug_span!("network", id = %network_id).in_scope(|| {
                    debug!(offering = %offering_id, "{}", self);
                });
            }
            Debug::UpdatePhase(network_id, phase) => {
                debug_span!("network", id = %network_id).in_scope(|| {
                    debug!(?phase, "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::RouterCreate(..) => {
                write!(f, "router record created")
            }
            Debug::RouterDestroy(..) => {
                write!(f, "router record destroyed")
            }
            Debug::FsmTransition(..) => {
                write!(f, "role transition")
            }
            Debug::VmTransition(..) => {
                write!(f, "lifecycle transition")
            }
            Debug::AdvertStale(..) => {
                write!(f, "stale advertisement discarded")
            }
            Debug::SilenceExpiry(..) => {
                write!(f, "silence timer expired")
            }
            Debug::RulePush(..) => {
                write!(f, "rule push started")
            }
            Debug::RulesSynced(..) => {
                write!(f, "rule set synchronized")
            }
            Debug::PairEnsure(..) => {
                write!(f, "provisioning missing pair members")
            }
            Debug::UpdateStart(..) => {
                write!(f, "sequential offering update started")
            }
            Debug::UpdatePhase(..) => {
                write!(f, "update phase transition")
            }
        }
    }
}
