//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rvr_utils::task::TimeoutTask;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::instance::{RedundantRole, RouterId};

/// One liveness/role-advertisement signal observed on a router's private
/// link-local segment. The wire mechanism producing these is a black box;
/// the controller only consumes the resulting event stream.
#[derive(Clone, Copy, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Advertisement {
    pub router_id: RouterId,
    pub role: RedundantRole,
    pub timestamp: DateTime<Utc>,
}

/// Per-network heartbeat monitor.
///
/// Orders and deduplicates the advertisement stream per router and keeps a
/// silence timer per monitored instance. The monitor never decides role
/// transitions itself; it only feeds the state machine.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    observed: BTreeMap<RouterId, Observation>,
}

#[derive(Debug)]
struct Observation {
    last_seen: DateTime<Utc>,
    role: Option<RedundantRole>,
    silence_timer: TimeoutTask,
}

// ===== impl HeartbeatMonitor =====

impl HeartbeatMonitor {
    /// Starts monitoring a router that entered the Running state. The caller
    /// provides a freshly armed silence timer.
    pub(crate) fn register(
        &mut self,
        router_id: RouterId,
        silence_timer: TimeoutTask,
    ) {
        self.observed.insert(
            router_id,
            Observation {
                last_seen: Utc::now(),
                role: None,
                silence_timer,
            },
        );
    }

    /// Stops monitoring a router (administrative stop, reboot or destroy).
    /// Dropping the observation cancels its silence timer.
    pub(crate) fn unregister(&mut self, router_id: RouterId) {
        self.observed.remove(&router_id);
    }

    /// Feeds one advertisement into the monitor. Returns false if the signal
    /// was discarded (router not monitored, or duplicate/out-of-order
    /// timestamp). An accepted advertisement re-arms the silence timer.
    pub(crate) fn observe(&mut self, adv: &Advertisement) -> bool {
        let Some(observation) = self.observed.get_mut(&adv.router_id) else {
            return false;
        };

        if observation.role.is_some() && adv.timestamp <= observation.last_seen
        {
            Debug::AdvertStale(adv.router_id).log();
            return false;
        }

        observation.last_seen = adv.timestamp;
        observation.role = Some(adv.role);
        observation.silence_timer.reset(None);
        true
    }

    /// Role the router last advertised for itself, if any signal has been
    /// seen since monitoring started.
    pub(crate) fn observed_role(
        &self,
        router_id: RouterId,
    ) -> Option<RedundantRole> {
        self.observed.get(&router_id).and_then(|obs| obs.role)
    }
}
