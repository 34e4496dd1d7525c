//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use rvr_utils::Responder;

use crate::api::NetworkRequest;
use crate::debug::Debug;
use crate::error::Error;
use crate::instance::{PromoteReason, RedundantRole, RouterId, VmState};
use crate::monitor::Advertisement;
use crate::network::{Network, NetworkState, PendingOp, RestartPhase};
use crate::pair;
use crate::provision::DeployedRouter;
use crate::reconcile;
use crate::tasks;
use crate::tasks::messages::input::{
    ProvisionOp, ProvisionResultMsg, RulePushResultMsg,
};
use crate::update;

// ===== administrative requests =====

pub(crate) fn process_request(net: &mut Network, request: NetworkRequest) {
    match request {
        NetworkRequest::Implement { responder } => {
            if net.is_busy() {
                respond(responder, Err(Error::OperationInProgress(net.record.id)));
                return;
            }
            implement(net, responder);
        }
        NetworkRequest::GetView { responder } => {
            respond(responder, Ok(net.view()));
        }
        NetworkRequest::ListRouters { filter, responder } => {
            respond(responder, Ok(net.views(filter)));
        }
        NetworkRequest::StopRouter {
            router_id,
            forced,
            responder,
        } => {
            admin_stop(net, router_id, forced, responder);
        }
        NetworkRequest::StartRouter {
            router_id,
            responder,
        } => {
            admin_start(net, router_id, responder);
        }
        NetworkRequest::RebootRouter {
            router_id,
            responder,
        } => {
            admin_reboot(net, router_id, responder);
        }
        NetworkRequest::DestroyRouter {
            router_id,
            responder,
        } => {
            admin_destroy(net, router_id, responder);
        }
        NetworkRequest::Update {
            target,
            update_in_sequence,
            forced,
            responder,
        } => {
            if net.is_busy() {
                respond(responder, Err(Error::OperationInProgress(net.record.id)));
                return;
            }
            update::start(net, target, update_in_sequence, forced, responder);
        }
        NetworkRequest::Restart { cleanup, responder } => {
            restart(net, cleanup, responder);
        }
        NetworkRequest::Shutdown { responder } => {
            shutdown(net, responder);
        }
        NetworkRequest::RuleOp { op, responder } => {
            respond(responder, reconcile::process_rule_op(net, op));
        }
        NetworkRequest::Rules { responder } => {
            respond(responder, Ok(net.record.rules.clone()));
        }
        NetworkRequest::AddPublicIp { ip, responder } => {
            net.record.public_ips.push(ip);
            net.save_record();
            respond(responder, Ok(ip));
        }
        NetworkRequest::RemovePublicIp { ip, responder } => {
            respond(responder, remove_public_ip(net, ip));
        }
    }
}

fn implement(net: &mut Network, responder: Responder<Result<(), Error>>) {
    if net.record.state == NetworkState::Shutdown {
        respond(responder, Err(Error::InvalidOperation("network is shut down")));
        return;
    }

    match pair::ensure_pair(net) {
        Ok(0) => {
            // Pair already complete.
            net.record.state = NetworkState::Implemented;
            net.save_record();
            respond(responder, Ok(()));
        }
        Ok(remaining) => {
            net.pending = Some(PendingOp::Implement {
                remaining,
                responder,
            });
        }
        Err(error) => respond(responder, Err(error)),
    }
}

fn admin_stop(
    net: &mut Network,
    router_id: RouterId,
    forced: bool,
    responder: Responder<Result<(), Error>>,
) {
    if net.is_busy() {
        respond(responder, Err(Error::OperationInProgress(net.record.id)));
        return;
    }
    match net.router(router_id) {
        Ok(router) if !router.is_running() => {
            respond(responder, Err(Error::InvalidOperation("router is not running")));
            return;
        }
        Err(error) => {
            respond(responder, Err(error));
            return;
        }
        Ok(_) => {}
    }

    net.monitor.unregister(router_id);
    net.set_vm_state(router_id, VmState::Stopping);
    tasks::provision_op(
        net.provisioner.clone(),
        router_id,
        ProvisionOp::Stop,
        None,
        forced,
        &net.tx.input,
    );
    net.pending = Some(PendingOp::StopRouter {
        router_id,
        forced,
        responder,
    });
}

fn admin_start(
    net: &mut Network,
    router_id: RouterId,
    responder: Responder<Result<(), Error>>,
) {
    if net.is_busy() {
        respond(responder, Err(Error::OperationInProgress(net.record.id)));
        return;
    }
    match net.router(router_id) {
        Ok(router) if router.vm_state != VmState::Stopped => {
            respond(responder, Err(Error::InvalidOperation("router is not stopped")));
            return;
        }
        Err(error) => {
            respond(responder, Err(error));
            return;
        }
        Ok(_) => {}
    }

    net.set_vm_state(router_id, VmState::Starting);
    tasks::provision_op(
        net.provisioner.clone(),
        router_id,
        ProvisionOp::Start,
        None,
        false,
        &net.tx.input,
    );
    net.pending = Some(PendingOp::StartRouter {
        router_id,
        responder,
    });
}

fn admin_reboot(
    net: &mut Network,
    router_id: RouterId,
    responder: Responder<Result<(), Error>>,
) {
    if net.is_busy() {
        respond(responder, Err(Error::OperationInProgress(net.record.id)));
        return;
    }
    match net.router(router_id) {
        Ok(router) if !router.is_running() => {
            respond(responder, Err(Error::InvalidOperation("router is not running")));
            return;
        }
        Err(error) => {
            respond(responder, Err(error));
            return;
        }
        Ok(_) => {}
    }

    // The recorded role deliberately survives the reboot window: a rebooted
    // BACKUP comes back as BACKUP with no transition at all, and a rebooted
    // PRIMARY keeps its record until the peer's election demotes it.
    net.monitor.unregister(router_id);
    net.set_vm_state(router_id, VmState::Starting);
    tasks::provision_op(
        net.provisioner.clone(),
        router_id,
        ProvisionOp::Reboot,
        None,
        false,
        &net.tx.input,
    );
    net.pending = Some(PendingOp::RebootRouter {
        router_id,
        responder,
    });
}

fn admin_destroy(
    net: &mut Network,
    router_id: RouterId,
    responder: Responder<Result<(), Error>>,
) {
    if net.is_busy() {
        respond(responder, Err(Error::OperationInProgress(net.record.id)));
        return;
    }
    match pair::decommission(net, router_id) {
        Ok(()) => {
            net.pending = Some(PendingOp::DestroyRouter {
                router_id,
                responder,
            });
        }
        Err(error) => respond(responder, Err(error)),
    }
}

fn restart(
    net: &mut Network,
    cleanup: bool,
    responder: Responder<Result<(), Error>>,
) {
    if net.is_busy() {
        respond(responder, Err(Error::OperationInProgress(net.record.id)));
        return;
    }
    if net.record.state != NetworkState::Implemented {
        respond(responder, Err(Error::InvalidOperation("network is not implemented")));
        return;
    }

    if cleanup {
        // Tear the pair down completely and rebuild it, replaying the full
        // rule set from scratch.
        let router_ids = net.routers.keys().copied().collect::<Vec<_>>();
        if router_ids.is_empty() {
            match pair::ensure_pair(net) {
                Ok(0) => respond(responder, Ok(())),
                Ok(remaining) => {
                    net.pending = Some(PendingOp::Restart {
                        phase: RestartPhase::Deploying,
                        remaining,
                        responder,
                    });
                }
                Err(error) => respond(responder, Err(error)),
            }
            return;
        }
        for router_id in &router_ids {
            pair::destroy_unguarded(net, *router_id);
        }
        net.pending = Some(PendingOp::Restart {
            phase: RestartPhase::Destroying,
            remaining: router_ids.len(),
            responder,
        });
    } else {
        // Leave the routers running and re-push the rule set in place.
        let running = net
            .routers
            .values()
            .filter(|router| router.is_running())
            .count();
        if running == 0 {
            respond(responder, Ok(()));
            return;
        }
        reconcile::apply(net, true);
        net.pending = Some(PendingOp::Restart {
            phase: RestartPhase::Pushing,
            remaining: running,
            responder,
        });
    }
}

fn shutdown(net: &mut Network, responder: Responder<Result<(), Error>>) {
    if net.is_busy() {
        respond(responder, Err(Error::OperationInProgress(net.record.id)));
        return;
    }

    let router_ids = net.routers.keys().copied().collect::<Vec<_>>();
    if router_ids.is_empty() {
        net.record.state = NetworkState::Shutdown;
        net.save_record();
        respond(responder, Ok(()));
        return;
    }

    for router_id in &router_ids {
        pair::destroy_unguarded(net, *router_id);
    }
    net.pending = Some(PendingOp::Shutdown {
        remaining: router_ids.len(),
        responder,
    });
}

fn remove_public_ip(
    net: &mut Network,
    ip: std::net::Ipv4Addr,
) -> Result<(), Error> {
    if ip == net.record.source_nat_ip {
        return Err(Error::InvalidOperation("cannot release the source NAT IP"));
    }
    // Active NAT/LB/static-NAT mappings pin the address.
    if net.record.rules.references_ip(ip) {
        return Err(Error::RuleInUse(ip));
    }
    let position = net
        .record
        .public_ips
        .iter()
        .position(|existing| *existing == ip)
        .ok_or(Error::InvalidOperation(
            "public IP is not associated with this network",
        ))?;
    net.record.public_ips.remove(position);
    net.save_record();
    Ok(())
}

// ===== heartbeat events =====

// Role observation from the heartbeat monitor. Outside administrative
// commands, this is the only trigger for promotion and for resolving
// FAULT/UNKNOWN.
pub(crate) fn process_advertisement(
    net: &mut Network,
    adv: Advertisement,
) -> Result<(), Error> {
    if !net.monitor.observe(&adv) {
        return Ok(());
    }

    let router = net.router_mut(adv.router_id)?;
    router.statistics.adverts_rcvd += 1;
    let recorded = router.role;

    match (recorded, adv.role) {
        (current, observed) if current == observed => Ok(()),
        (_, RedundantRole::Primary) => {
            // The instance believes it is PRIMARY. Refuse to record a second
            // one while the current PRIMARY is healthy.
            if net.other_healthy_primary(adv.router_id).is_some() {
                return Err(Error::SplitBrainRejected(adv.router_id));
            }

            let peer_stopped = net.routers.values().any(|router| {
                router.id != adv.router_id
                    && matches!(
                        router.vm_state,
                        VmState::Stopped | VmState::Stopping
                    )
            });
            let reason = if peer_stopped {
                PromoteReason::PeerStopped
            } else {
                PromoteReason::PeerSilent
            };

            // Demote the stale PRIMARY record, if one is left.
            let stale = net
                .routers
                .values()
                .find(|router| {
                    router.id != adv.router_id
                        && router.role == RedundantRole::Primary
                })
                .map(|router| router.id);
            if let Some(stale_id) = stale {
                net.set_role(
                    stale_id,
                    RedundantRole::Unknown,
                    PromoteReason::NotPromoted,
                )?;
            }

            net.set_role(adv.router_id, RedundantRole::Primary, reason)?;

            // Push the full rule set before the instance counts as serving
            // the network's public IP.
            reconcile::reconcile_on_promotion(net, adv.router_id);
            Ok(())
        }
        (_, RedundantRole::Backup) => {
            // Resolves FAULT/UNKNOWN, and demotes a rebooted old PRIMARY
            // that rejoined as BACKUP.
            net.set_role(
                adv.router_id,
                RedundantRole::Backup,
                PromoteReason::NotPromoted,
            )
        }
        // Instances never advertise FAULT/UNKNOWN for themselves.
        _ => Ok(()),
    }
}

// Silence timer expiry: no advertisement for a full failover window.
pub(crate) fn process_silence(
    net: &mut Network,
    router_id: RouterId,
) -> Result<(), Error> {
    Debug::SilenceExpiry(router_id).log();

    let Ok(router) = net.router(router_id) else {
        return Ok(());
    };
    if !router.is_running() {
        // Expected silence: the instance is administratively down.
        return Ok(());
    }

    net.router_mut(router_id)?.statistics.silence_events += 1;

    // Keep monitoring: if signals resume, the FAULT resolves through the
    // normal advertisement path.
    net.register_monitor(router_id);
    net.set_role(router_id, RedundantRole::Fault, PromoteReason::NotPromoted)
}

// ===== provisioner completions =====

pub(crate) fn process_provision_result(
    net: &mut Network,
    msg: ProvisionResultMsg,
) -> Result<(), Error> {
    // Results belonging to an active sequential update are the
    // orchestrator's business.
    if let Some(job) = &net.update
        && update::involves(job, msg.router_id)
    {
        return update::process_provision_result(net, msg);
    }

    let related = match &net.pending {
        Some(PendingOp::Implement { .. }) => msg.op == ProvisionOp::Deploy,
        Some(PendingOp::StopRouter { router_id, .. }) => {
            *router_id == msg.router_id && msg.op == ProvisionOp::Stop
        }
        Some(PendingOp::StartRouter { router_id, .. }) => {
            *router_id == msg.router_id && msg.op == ProvisionOp::Start
        }
        Some(PendingOp::RebootRouter { router_id, .. }) => {
            *router_id == msg.router_id && msg.op == ProvisionOp::Reboot
        }
        Some(PendingOp::DestroyRouter { router_id, .. }) => {
            *router_id == msg.router_id && msg.op == ProvisionOp::Destroy
        }
        Some(PendingOp::Restart { phase, .. }) => match phase {
            RestartPhase::Destroying => msg.op == ProvisionOp::Destroy,
            RestartPhase::Deploying => msg.op == ProvisionOp::Deploy,
            RestartPhase::Pushing => false,
        },
        Some(PendingOp::Shutdown { .. }) => msg.op == ProvisionOp::Destroy,
        None => false,
    };
    if !related {
        return process_unattended_result(net, msg);
    }

    let Some(pending) = net.pending.take() else {
        return Ok(());
    };
    match pending {
        PendingOp::Implement {
            remaining,
            responder,
        } => match msg.result {
            Ok(Some(deployed)) => {
                finalize_deploy(net, msg.router_id, deployed)?;
                let remaining = remaining - 1;
                if remaining == 0 {
                    net.record.state = NetworkState::Implemented;
                    net.save_record();
                    respond(responder, Ok(()));
                } else {
                    net.pending = Some(PendingOp::Implement {
                        remaining,
                        responder,
                    });
                }
                Ok(())
            }
            Ok(None) => {
                net.remove_router(msg.router_id);
                respond(
                    responder,
                    Err(Error::InvalidOperation("deploy returned no placement")),
                );
                Ok(())
            }
            Err(error) => {
                net.remove_router(msg.router_id);
                respond(
                    responder,
                    Err(Error::Provision(msg.router_id, error)),
                );
                Ok(())
            }
        },
        PendingOp::StopRouter {
            router_id,
            forced,
            responder,
        } => match msg.result {
            Ok(_) => {
                net.set_vm_state(router_id, VmState::Stopped);
                // An explicit stop reads UNKNOWN; an involuntary (forced)
                // one reads FAULT. Either way the peer's own silence
                // detection drives the promotion.
                let role = if forced {
                    RedundantRole::Fault
                } else {
                    RedundantRole::Unknown
                };
                if let Err(error) =
                    net.set_role(router_id, role, PromoteReason::NotPromoted)
                {
                    error.log();
                }
                respond(responder, Ok(()));
                Ok(())
            }
            Err(error) => {
                // The stop failed; the instance is still up.
                net.set_vm_state(router_id, VmState::Running);
                net.register_monitor(router_id);
                respond(responder, Err(Error::Provision(router_id, error)));
                Ok(())
            }
        },
        PendingOp::StartRouter {
            router_id,
            responder,
        } => match msg.result {
            Ok(_) => {
                net.set_vm_state(router_id, VmState::Running);
                net.register_monitor(router_id);
                reconcile::apply(net, false);
                respond(responder, Ok(()));
                Ok(())
            }
            Err(error) => {
                net.set_vm_state(router_id, VmState::Stopped);
                respond(responder, Err(Error::Provision(router_id, error)));
                Ok(())
            }
        },
        PendingOp::RebootRouter {
            router_id,
            responder,
        } => match msg.result {
            Ok(_) => {
                net.set_vm_state(router_id, VmState::Running);
                net.register_monitor(router_id);
                reconcile::apply(net, false);
                respond(responder, Ok(()));
                Ok(())
            }
            Err(error) => {
                net.set_vm_state(router_id, VmState::Stopped);
                if let Err(error) = net.set_role(
                    router_id,
                    RedundantRole::Unknown,
                    PromoteReason::NotPromoted,
                ) {
                    error.log();
                }
                respond(responder, Err(Error::Provision(router_id, error)));
                Ok(())
            }
        },
        PendingOp::DestroyRouter {
            router_id,
            responder,
        } => match msg.result {
            Ok(_) => {
                net.remove_router(router_id);
                respond(responder, Ok(()));
                // Self-heal: replace the destroyed member.
                if net.record.state == NetworkState::Implemented
                    && let Err(error) = pair::ensure_pair(net)
                {
                    error.log();
                }
                Ok(())
            }
            Err(error) => {
                net.set_vm_state(router_id, VmState::Stopped);
                respond(responder, Err(Error::Provision(router_id, error)));
                Ok(())
            }
        },
        PendingOp::Restart {
            phase: RestartPhase::Destroying,
            remaining,
            responder,
        } => match msg.result {
            Ok(_) => {
                net.remove_router(msg.router_id);
                let remaining = remaining - 1;
                if remaining > 0 {
                    net.pending = Some(PendingOp::Restart {
                        phase: RestartPhase::Destroying,
                        remaining,
                        responder,
                    });
                    return Ok(());
                }
                // Rebuild the pair and replay the rule set from scratch.
                match pair::ensure_pair(net) {
                    Ok(0) => respond(responder, Ok(())),
                    Ok(remaining) => {
                        net.pending = Some(PendingOp::Restart {
                            phase: RestartPhase::Deploying,
                            remaining,
                            responder,
                        });
                    }
                    Err(error) => respond(responder, Err(error)),
                }
                Ok(())
            }
            Err(error) => {
                respond(
                    responder,
                    Err(Error::Provision(msg.router_id, error)),
                );
                Ok(())
            }
        },
        PendingOp::Restart {
            phase: RestartPhase::Deploying,
            remaining,
            responder,
        } => match msg.result {
            Ok(Some(deployed)) => {
                finalize_deploy(net, msg.router_id, deployed)?;
                let remaining = remaining - 1;
                if remaining == 0 {
                    respond(responder, Ok(()));
                } else {
                    net.pending = Some(PendingOp::Restart {
                        phase: RestartPhase::Deploying,
                        remaining,
                        responder,
                    });
                }
                Ok(())
            }
            Ok(None) => {
                net.remove_router(msg.router_id);
                respond(
                    responder,
                    Err(Error::InvalidOperation("deploy returned no placement")),
                );
                Ok(())
            }
            Err(error) => {
                net.remove_router(msg.router_id);
                respond(
                    responder,
                    Err(Error::Provision(msg.router_id, error)),
                );
                Ok(())
            }
        },
        PendingOp::Restart {
            phase: RestartPhase::Pushing,
            ..
        } => {
            // Rule pushes report through RulePushResult, not here.
            net.pending = Some(pending);
            Ok(())
        }
        PendingOp::Shutdown {
            remaining,
            responder,
        } => match msg.result {
            Ok(_) => {
                net.remove_router(msg.router_id);
                let remaining = remaining - 1;
                if remaining == 0 {
                    net.record.state = NetworkState::Shutdown;
                    net.save_record();
                    respond(responder, Ok(()));
                } else {
                    net.pending = Some(PendingOp::Shutdown {
                        remaining,
                        responder,
                    });
                }
                Ok(())
            }
            Err(error) => {
                respond(
                    responder,
                    Err(Error::Provision(msg.router_id, error)),
                );
                Ok(())
            }
        },
    }
}

// Completions with no pending administrative operation attached: self-heal
// deployments and rollback teardowns.
fn process_unattended_result(
    net: &mut Network,
    msg: ProvisionResultMsg,
) -> Result<(), Error> {
    match msg.op {
        ProvisionOp::Deploy => match msg.result {
            Ok(Some(deployed)) => {
                finalize_deploy(net, msg.router_id, deployed)?;
                Ok(())
            }
            Ok(None) => {
                net.remove_router(msg.router_id);
                Ok(())
            }
            Err(error) => {
                Error::Provision(msg.router_id, error).log();
                net.remove_router(msg.router_id);
                Ok(())
            }
        },
        ProvisionOp::Destroy => {
            match msg.result {
                Ok(_) => net.remove_router(msg.router_id),
                Err(error) => {
                    Error::Provision(msg.router_id, error).log();
                }
            }
            // Keep the pair whole after any unattended teardown.
            if net.record.state == NetworkState::Implemented {
                pair::ensure_pair(net)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ===== rule push completions =====

pub(crate) fn process_rule_push_result(
    net: &mut Network,
    msg: RulePushResultMsg,
) {
    let current_version = net.record.rules.version;
    let push_error = msg.result.err();

    match &push_error {
        None => {
            if let Ok(router) = net.router_mut(msg.router_id) {
                if router.applied_rules.is_none_or(|v| v < msg.version) {
                    router.applied_rules = Some(msg.version);
                }
                if router.role == RedundantRole::Primary
                    && !router.serving
                    && router.applied_rules == Some(current_version)
                {
                    // Promotion is complete; the instance now serves the
                    // network's public IP.
                    router.serving = true;
                }
                Debug::RulesSynced(msg.router_id, msg.version).log();
                net.save_router(msg.router_id);
            }
        }
        Some(error) => {
            Error::Provision(msg.router_id, error.clone()).log();
        }
    }

    // A restart without cleanup completes when every re-push resolves.
    match net.pending.take() {
        Some(PendingOp::Restart {
            phase: RestartPhase::Pushing,
            remaining,
            responder,
        }) => {
            if let Some(error) = push_error {
                respond(responder, Err(Error::Provision(msg.router_id, error)));
                return;
            }
            let remaining = remaining - 1;
            if remaining == 0 {
                respond(responder, Ok(()));
            } else {
                net.pending = Some(PendingOp::Restart {
                    phase: RestartPhase::Pushing,
                    remaining,
                    responder,
                });
            }
        }
        other => net.pending = other,
    }
}

// ===== convergence ticks =====

pub(crate) fn process_convergence_tick(net: &mut Network) -> Result<(), Error> {
    update::process_convergence_tick(net)
}

// ===== helper functions =====

// Completes a successful deployment: records the placement, starts heartbeat
// monitoring and brings the new instance's rules in sync.
pub(crate) fn finalize_deploy(
    net: &mut Network,
    router_id: RouterId,
    deployed: DeployedRouter,
) -> Result<(), Error> {
    net.router_mut(router_id)?.host_id = Some(deployed.host_id);
    net.set_vm_state(router_id, VmState::Running);
    net.register_monitor(router_id);
    reconcile::apply(net, false);
    Ok(())
}

fn respond<T>(responder: Responder<T>, value: T) {
    let _ = responder.send(value);
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rvr_utils::mac_addr::MacAddr;
    use tokio::sync::mpsc;

    use super::*;
    use crate::instance::{
        Identity, NetworkId, OfferingId, RouterId, RouterInstance,
    };
    use crate::master::{Allocator, HaConfig};
    use crate::network::{NetworkChannelsTx, NetworkRecord};
    use crate::sim::SimProvisioner;
    use crate::store::Store;

    fn test_network() -> Network {
        let config = Arc::new(HaConfig::default());
        let (input_tx, _input_rx) = mpsc::channel(8);
        let (master_tx, _master_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, _heartbeat_rx) = mpsc::channel(8);
        let provisioner =
            Arc::new(SimProvisioner::new(config.clone(), heartbeat_tx));
        let record = NetworkRecord {
            id: NetworkId(1),
            name: "test".to_owned(),
            state: NetworkState::Implemented,
            offering_id: OfferingId(1),
            cidr: "10.1.1.0/24".parse().unwrap(),
            gateway: "10.1.1.1".parse().unwrap(),
            source_nat_ip: "203.0.113.10".parse().unwrap(),
            public_ips: Vec::new(),
            rules: Default::default(),
            next_rule_id: 1,
        };
        Network::new(
            config,
            record,
            Vec::new(),
            provisioner,
            Store::new(None),
            Arc::new(Allocator::default()),
            NetworkChannelsTx::new(input_tx, master_tx),
        )
    }

    fn test_router(
        net: &mut Network,
        id: u64,
        role: RedundantRole,
    ) -> RouterId {
        let router_id = RouterId(id);
        let identity = Identity::new(
            "203.0.113.10".parse().unwrap(),
            MacAddr::virtual_router(1),
            format!("10.1.1.{}", id + 1).parse().unwrap(),
            MacAddr::random_unicast(),
            format!("169.254.0.{id}").parse().unwrap(),
        );
        let mut router = RouterInstance::new(
            router_id,
            NetworkId(1),
            role,
            OfferingId(1),
            identity,
        );
        router.vm_state = VmState::Running;
        net.insert_router(router);
        net.register_monitor(router_id);
        router_id
    }

    fn advert(router_id: RouterId, role: RedundantRole) -> Advertisement {
        Advertisement {
            router_id,
            role,
            timestamp: Utc::now(),
        }
    }

    // A BACKUP claiming PRIMARY while the recorded PRIMARY is healthy is a
    // split-brain attempt and must not change the records.
    #[tokio::test]
    async fn test_split_brain_rejected() {
        let mut net = test_network();
        let r1 = test_router(&mut net, 1, RedundantRole::Primary);
        let r2 = test_router(&mut net, 2, RedundantRole::Backup);

        let result =
            process_advertisement(&mut net, advert(r2, RedundantRole::Primary));
        assert!(
            matches!(result, Err(Error::SplitBrainRejected(id)) if id == r2)
        );
        assert_eq!(net.router(r1).unwrap().role, RedundantRole::Primary);
        assert_eq!(net.router(r2).unwrap().role, RedundantRole::Backup);
    }

    // Once the PRIMARY is administratively stopped, the peer's claim is
    // accepted and attributed to the stop.
    #[tokio::test]
    async fn test_promotion_after_peer_stop() {
        let mut net = test_network();
        let r1 = test_router(&mut net, 1, RedundantRole::Primary);
        let r2 = test_router(&mut net, 2, RedundantRole::Backup);

        net.set_vm_state(r1, VmState::Stopped);
        net.set_role(r1, RedundantRole::Unknown, PromoteReason::NotPromoted)
            .unwrap();

        process_advertisement(&mut net, advert(r2, RedundantRole::Primary))
            .unwrap();
        let promoted = net.router(r2).unwrap();
        assert_eq!(promoted.role, RedundantRole::Primary);
        assert_eq!(promoted.promote_reason, PromoteReason::PeerStopped);
    }

    // A silent PRIMARY degrades to FAULT, which unblocks the peer's
    // promotion; the promotion reason reflects the silence.
    #[tokio::test]
    async fn test_silence_then_promotion() {
        let mut net = test_network();
        let r1 = test_router(&mut net, 1, RedundantRole::Primary);
        let r2 = test_router(&mut net, 2, RedundantRole::Backup);

        process_silence(&mut net, r1).unwrap();
        assert_eq!(net.router(r1).unwrap().role, RedundantRole::Fault);

        process_advertisement(&mut net, advert(r2, RedundantRole::Primary))
            .unwrap();
        let promoted = net.router(r2).unwrap();
        assert_eq!(promoted.role, RedundantRole::Primary);
        assert_eq!(promoted.promote_reason, PromoteReason::PeerSilent);
        assert_eq!(net.router(r1).unwrap().role, RedundantRole::Fault);
    }

    // A rebooted old PRIMARY advertising BACKUP is demoted without fuss.
    #[tokio::test]
    async fn test_old_primary_rejoins_as_backup() {
        let mut net = test_network();
        let r1 = test_router(&mut net, 1, RedundantRole::Primary);
        let _r2 = test_router(&mut net, 2, RedundantRole::Backup);

        process_advertisement(&mut net, advert(r1, RedundantRole::Backup))
            .unwrap();
        assert_eq!(net.router(r1).unwrap().role, RedundantRole::Backup);
    }

    // Out-of-order advertisements are discarded before they reach the state
    // machine.
    #[tokio::test]
    async fn test_stale_advertisement_dropped() {
        let mut net = test_network();
        let _r1 = test_router(&mut net, 1, RedundantRole::Primary);
        let r2 = test_router(&mut net, 2, RedundantRole::Backup);

        let newer = advert(r2, RedundantRole::Backup);
        let mut older = advert(r2, RedundantRole::Primary);
        older.timestamp = newer.timestamp - chrono::Duration::seconds(1);

        process_advertisement(&mut net, newer).unwrap();
        process_advertisement(&mut net, older).unwrap();
        assert_eq!(net.router(r2).unwrap().role, RedundantRole::Backup);
    }
}
