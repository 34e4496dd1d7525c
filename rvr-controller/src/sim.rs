//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rvr_utils::Sender;
use rvr_utils::task::Task;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::instance::{HostId, NetworkId, RedundantRole, RouterId};
use crate::master::HaConfig;
use crate::monitor::Advertisement;
use crate::provision::{
    DeploySpec, DeployedRouter, ProvisionError, Provisioner,
};
use crate::reconcile::RuleSet;

/// Simulated compute provisioner.
///
/// Stands in for the hypervisor layer: router "guests" are tasks that
/// advertise their role on a per-network link at the configured interval and
/// run the usual election rule. A BACKUP that hears no PRIMARY for a full
/// failover window promotes itself; colliding PRIMARYs resolve towards the
/// lower router id. Starting and rebooting keep the guest silent for a full
/// failover window, modelling boot time. Used by the daemon and by the
/// conformance tests.
#[derive(Debug)]
pub struct SimProvisioner {
    config: Arc<HaConfig>,
    heartbeat_tx: Sender<Advertisement>,
    state: Mutex<SimState>,
}

#[derive(Debug, Default)]
struct SimState {
    guests: HashMap<RouterId, SimGuest>,
    links: HashMap<NetworkId, Arc<Mutex<LinkState>>>,
    rules: HashMap<RouterId, RuleSet>,
    next_host: u64,
    fail_deploys: usize,
}

#[derive(Debug)]
struct SimGuest {
    network_id: NetworkId,
    running: bool,
    _task: Option<Task<()>>,
}

// Shared per-network link-local segment: who advertised what, when.
#[derive(Debug, Default)]
struct LinkState {
    adverts: HashMap<RouterId, (Instant, RedundantRole)>,
}

// ===== impl SimProvisioner =====

impl SimProvisioner {
    pub fn new(
        config: Arc<HaConfig>,
        heartbeat_tx: Sender<Advertisement>,
    ) -> SimProvisioner {
        SimProvisioner {
            config,
            heartbeat_tx,
            state: Default::default(),
        }
    }

    /// Rule set last programmed into the given router, as the router itself
    /// sees it.
    pub fn applied_rules(&self, router_id: RouterId) -> Option<RuleSet> {
        self.state.lock().unwrap().rules.get(&router_id).cloned()
    }

    /// Whether the simulated guest is up.
    pub fn is_running(&self, router_id: RouterId) -> bool {
        self.state
            .lock()
            .unwrap()
            .guests
            .get(&router_id)
            .map(|guest| guest.running)
            .unwrap_or(false)
    }

    /// Makes the next `count` deployments fail with NoCapacity.
    pub fn fail_next_deploys(&self, count: usize) {
        self.state.lock().unwrap().fail_deploys = count;
    }

    fn boot_delay(&self) -> Duration {
        self.config.silence_timeout() + self.config.advert_interval
    }

    fn spawn_guest(
        &self,
        router_id: RouterId,
        link: Arc<Mutex<LinkState>>,
        boot_role: RedundantRole,
    ) -> Task<()> {
        let heartbeat_tx = self.heartbeat_tx.clone();
        let advert_interval = self.config.advert_interval;
        let master_down = self.config.silence_timeout();

        Task::spawn(async move {
            let mut role = boot_role;
            let booted = Instant::now();
            let mut ticker = time::interval(advert_interval);

            loop {
                ticker.tick().await;

                {
                    let mut link = link.lock().unwrap();
                    match role {
                        RedundantRole::Backup => {
                            let primary_alive =
                                link.adverts.iter().any(|(id, (at, role))| {
                                    *id != router_id
                                        && *role == RedundantRole::Primary
                                        && at.elapsed() < master_down
                                });
                            if !primary_alive
                                && booted.elapsed() >= master_down
                            {
                                debug!(router = %router_id, "sim guest promoted itself");
                                role = RedundantRole::Primary;
                            }
                        }
                        RedundantRole::Primary => {
                            // Collision: the lower router id keeps PRIMARY.
                            let yield_to_peer =
                                link.adverts.iter().any(|(id, (at, role))| {
                                    *id < router_id
                                        && *role == RedundantRole::Primary
                                        && at.elapsed() < master_down
                                });
                            if yield_to_peer {
                                debug!(router = %router_id, "sim guest yielded PRIMARY");
                                role = RedundantRole::Backup;
                            }
                        }
                        _ => {}
                    }
                    link.adverts.insert(router_id, (Instant::now(), role));
                }

                let adv = Advertisement {
                    router_id,
                    role,
                    timestamp: Utc::now(),
                };
                let _ = heartbeat_tx.send(adv).await;
            }
        })
    }
}

#[async_trait]
impl Provisioner for SimProvisioner {
    async fn deploy(
        &self,
        spec: DeploySpec,
    ) -> Result<DeployedRouter, ProvisionError> {
        let (host_id, link) = {
            let mut state = self.state.lock().unwrap();
            if state.fail_deploys > 0 {
                state.fail_deploys -= 1;
                return Err(ProvisionError::NoCapacity);
            }
            state.next_host += 1;
            let host_id = HostId(state.next_host);
            let link =
                state.links.entry(spec.network_id).or_default().clone();
            (host_id, link)
        };

        let task =
            self.spawn_guest(spec.router_id, link, spec.bootstrap_role);

        let mut state = self.state.lock().unwrap();
        state.guests.insert(
            spec.router_id,
            SimGuest {
                network_id: spec.network_id,
                running: true,
                _task: Some(task),
            },
        );
        Ok(DeployedRouter::new(host_id))
    }

    async fn destroy(
        &self,
        router_id: RouterId,
    ) -> Result<(), ProvisionError> {
        let mut state = self.state.lock().unwrap();
        if let Some(guest) = state.guests.remove(&router_id) {
            state.rules.remove(&router_id);
            if let Some(link) = state.links.get(&guest.network_id) {
                link.lock().unwrap().adverts.remove(&router_id);
            }
        }
        Ok(())
    }

    async fn stop(
        &self,
        router_id: RouterId,
        _forced: bool,
    ) -> Result<(), ProvisionError> {
        let mut state = self.state.lock().unwrap();
        let guest = state
            .guests
            .get_mut(&router_id)
            .ok_or(ProvisionError::AgentUnreachable(router_id))?;
        guest.running = false;
        // Dropping the task silences the guest immediately.
        guest._task = None;
        Ok(())
    }

    async fn start(&self, router_id: RouterId) -> Result<(), ProvisionError> {
        let link = {
            let state = self.state.lock().unwrap();
            let guest = state
                .guests
                .get(&router_id)
                .ok_or(ProvisionError::AgentUnreachable(router_id))?;
            state
                .links
                .get(&guest.network_id)
                .cloned()
                .ok_or(ProvisionError::AgentUnreachable(router_id))?
        };

        // Boot time: the guest stays silent for a full failover window.
        time::sleep(self.boot_delay()).await;

        let task = self.spawn_guest(router_id, link, RedundantRole::Backup);
        let mut state = self.state.lock().unwrap();
        let guest = state
            .guests
            .get_mut(&router_id)
            .ok_or(ProvisionError::AgentUnreachable(router_id))?;
        guest.running = true;
        guest._task = Some(task);
        Ok(())
    }

    async fn reboot(&self, router_id: RouterId) -> Result<(), ProvisionError> {
        {
            let mut state = self.state.lock().unwrap();
            let guest = state
                .guests
                .get_mut(&router_id)
                .ok_or(ProvisionError::AgentUnreachable(router_id))?;
            guest.running = false;
            guest._task = None;
        }

        self.start(router_id).await
    }

    async fn push_rules(
        &self,
        router_id: RouterId,
        rules: &RuleSet,
    ) -> Result<(), ProvisionError> {
        let mut state = self.state.lock().unwrap();
        match state.guests.get(&router_id) {
            Some(guest) if guest.running => {
                state.rules.insert(router_id, rules.clone());
                Ok(())
            }
            _ => Err(ProvisionError::AgentUnreachable(router_id)),
        }
    }
}
