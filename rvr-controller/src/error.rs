//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use rvr_utils::convergence::ConvergenceTimeout;
use tracing::{warn, warn_span};

use crate::instance::{NetworkId, OfferingId, RouterId};
use crate::provision::ProvisionError;

// Controller errors.
#[derive(Debug)]
pub enum Error {
    // A transition would have recorded two simultaneous PRIMARYs.
    SplitBrainRejected(RouterId),
    // A wait-for-stabilization step exhausted its retry budget.
    Convergence(ConvergenceTimeout),
    // A public IP with active rules referencing it can't be released.
    RuleInUse(Ipv4Addr),
    // The external compute provisioner failed.
    Provision(RouterId, ProvisionError),
    NetworkNotFound(NetworkId),
    RouterNotFound(RouterId),
    OfferingNotFound(OfferingId),
    NotRedundant(OfferingId),
    // The network's pair is already being mutated by another operation.
    OperationInProgress(NetworkId),
    // The peer can't take over yet, so the requested teardown is refused.
    PeerNotReady(RouterId),
    InvalidOperation(&'static str),
    // The controller task is gone.
    ControllerClosed,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::SplitBrainRejected(router_id)
            | Error::Provision(router_id, _)
            | Error::RouterNotFound(router_id)
            | Error::PeerNotReady(router_id) => {
                warn_span!("router", id = %router_id).in_scope(|| {
                    warn!("{}", self);
                });
            }
            Error::NetworkNotFound(network_id)
            | Error::OperationInProgress(network_id) => {
                warn_span!("network", id = %network_id).in_scope(|| {
                    warn!("{}", self);
                });
            }
            Error::RuleInUse(ip) => {
                warn!(%ip, "{}", self);
            }
            _ => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SplitBrainRejected(..) => {
                write!(f, "transition rejected: would elect a second PRIMARY")
            }
            Error::Convergence(error) => error.fmt(f),
            Error::RuleInUse(..) => {
                write!(f, "active rules still reference this address")
            }
            Error::Provision(_, error) => error.fmt(f),
            Error::NetworkNotFound(..) => {
                write!(f, "network not found")
            }
            Error::RouterNotFound(..) => {
                write!(f, "router not found")
            }
            Error::OfferingNotFound(..) => {
                write!(f, "network offering not found")
            }
            Error::NotRedundant(..) => {
                write!(f, "network offering has no redundant router support")
            }
            Error::OperationInProgress(..) => {
                write!(f, "another operation is mutating the router pair")
            }
            Error::PeerNotReady(..) => {
                write!(f, "peer router is not ready to take over")
            }
            Error::InvalidOperation(reason) => {
                write!(f, "invalid operation: {reason}")
            }
            Error::ControllerClosed => {
                write!(f, "controller is shut down")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Convergence(error) => Some(error),
            Error::Provision(_, error) => Some(error),
            _ => None,
        }
    }
}

impl From<ConvergenceTimeout> for Error {
    fn from(error: ConvergenceTimeout) -> Error {
        Error::Convergence(error)
    }
}
