//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use rvr_utils::Responder;
use rvr_utils::convergence::RetryBudget;
use rvr_utils::task::IntervalTask;

use crate::debug::Debug;
use crate::error::Error;
use crate::events;
use crate::instance::{
    Offering, PromoteReason, RedundantRole, RouterId, VmState,
};
use crate::network::{Network, NetworkState};
use crate::pair;
use crate::tasks;
use crate::tasks::messages::input::{ProvisionOp, ProvisionResultMsg};

/// An in-flight sequential offering update.
///
/// The orchestrator is a phase machine over the pair, advanced by provision
/// completions and by a convergence poll with a bounded retry budget. At
/// most one router is unavailable at a time, and the PRIMARY role is always
/// held by a running instance. Within each replacement step the new router
/// is provisioned and confirmed stable before the old one is destroyed; the
/// only destructive action taken before its successor exists is vacating the
/// old PRIMARY, which is safe because the new BACKUP is already confirmed
/// healthy at that point.
#[derive(Debug)]
pub struct UpdateJob {
    pub(crate) target: Offering,
    pub(crate) phase: UpdatePhase,
    pub(crate) budget: RetryBudget,
    pub(crate) responder: Option<Responder<Result<(), Error>>>,
    _tick: IntervalTask,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdatePhase {
    // Waiting for the replacement BACKUP (new offering) to deploy.
    DeployNewBackup {
        new_backup: RouterId,
        old_backup: RouterId,
    },
    // Waiting for the replacement to advertise BACKUP and sync its rules.
    AwaitBackupStable {
        new_backup: RouterId,
        old_backup: RouterId,
    },
    // Waiting for the old BACKUP teardown.
    DestroyOldBackup {
        new_backup: RouterId,
        old_backup: RouterId,
    },
    // Waiting for the old PRIMARY to vacate (administrative stop).
    VacatePrimary {
        old_primary: RouterId,
        new_primary: RouterId,
    },
    // Waiting for the replacement to win the election and finish rule
    // reconciliation.
    AwaitPromotion {
        old_primary: RouterId,
        new_primary: RouterId,
    },
    // Waiting for the final BACKUP (new offering) to deploy.
    DeployFinalBackup {
        final_backup: RouterId,
        old_primary: RouterId,
    },
    // Waiting for the final BACKUP to advertise and sync.
    AwaitFinalStable {
        final_backup: RouterId,
        old_primary: RouterId,
    },
    // Waiting for the vacated old PRIMARY teardown.
    DestroyOldPrimary {
        final_backup: RouterId,
        old_primary: RouterId,
    },
}

// ===== global functions =====

// Starts a sequential update towards the target offering. Validation
// failures are reported to the caller immediately; afterwards the job owns
// the responder until it completes or exhausts its budget.
pub(crate) fn start(
    net: &mut Network,
    target: Offering,
    update_in_sequence: bool,
    forced: bool,
    responder: Responder<Result<(), Error>>,
) {
    if let Err(error) = validate(net, &target, update_in_sequence, forced) {
        error.log();
        let _ = responder.send(Err(error));
        return;
    }

    // Updating to the current offering is a no-op.
    if target.id == net.record.offering_id {
        let _ = responder.send(Ok(()));
        return;
    }

    let Some(old_backup) = net.backup().map(|router| router.id) else {
        let _ = responder.send(Err(Error::InvalidOperation(
            "router pair has not stabilized",
        )));
        return;
    };

    let new_backup =
        match pair::deploy_router(net, RedundantRole::Backup, target.id) {
            Ok(router_id) => router_id,
            Err(error) => {
                error.log();
                let _ = responder.send(Err(error));
                return;
            }
        };

    Debug::UpdateStart(net.record.id, target.id).log();

    let tick =
        tasks::convergence_tick(net.config.convergence_interval, &net.tx.input);
    net.update = Some(UpdateJob {
        target,
        phase: UpdatePhase::DeployNewBackup {
            new_backup,
            old_backup,
        },
        budget: RetryBudget::new(
            net.config.convergence_retries,
            net.config.convergence_interval,
        ),
        responder: Some(responder),
        _tick: tick,
    });
}

fn validate(
    net: &Network,
    target: &Offering,
    update_in_sequence: bool,
    forced: bool,
) -> Result<(), Error> {
    if !update_in_sequence {
        return Err(Error::InvalidOperation(
            "redundant networks require update_in_sequence",
        ));
    }
    if !forced {
        return Err(Error::InvalidOperation(
            "updating an implemented redundant network requires forced",
        ));
    }
    if net.record.state != NetworkState::Implemented {
        return Err(Error::InvalidOperation("network is not implemented"));
    }
    if !target.redundant {
        return Err(Error::NotRedundant(target.id));
    }
    if target.id != net.record.offering_id && !net.is_stable() {
        return Err(Error::InvalidOperation(
            "router pair has not stabilized",
        ));
    }
    Ok(())
}

// Whether a provision completion belongs to the active update.
pub(crate) fn involves(job: &UpdateJob, router_id: RouterId) -> bool {
    match job.phase {
        UpdatePhase::DeployNewBackup {
            new_backup,
            old_backup,
        }
        | UpdatePhase::AwaitBackupStable {
            new_backup,
            old_backup,
        }
        | UpdatePhase::DestroyOldBackup {
            new_backup,
            old_backup,
        } => router_id == new_backup || router_id == old_backup,
        UpdatePhase::VacatePrimary {
            old_primary,
            new_primary,
        }
        | UpdatePhase::AwaitPromotion {
            old_primary,
            new_primary,
        } => router_id == old_primary || router_id == new_primary,
        UpdatePhase::DeployFinalBackup {
            final_backup,
            old_primary,
        }
        | UpdatePhase::AwaitFinalStable {
            final_backup,
            old_primary,
        }
        | UpdatePhase::DestroyOldPrimary {
            final_backup,
            old_primary,
        } => router_id == final_backup || router_id == old_primary,
    }
}

pub(crate) fn process_provision_result(
    net: &mut Network,
    msg: ProvisionResultMsg,
) -> Result<(), Error> {
    let Some(mut job) = net.update.take() else {
        return Ok(());
    };

    match (job.phase, msg.op) {
        (
            UpdatePhase::DeployNewBackup {
                new_backup,
                old_backup,
            },
            ProvisionOp::Deploy,
        ) if msg.router_id == new_backup => match msg.result {
            Ok(Some(deployed)) => {
                if let Err(error) =
                    events::finalize_deploy(net, new_backup, deployed)
                {
                    error.log();
                }
                transition(
                    net,
                    &mut job,
                    UpdatePhase::AwaitBackupStable {
                        new_backup,
                        old_backup,
                    },
                );
                net.update = Some(job);
            }
            Ok(None) => {
                net.remove_router(new_backup);
                let error =
                    Error::InvalidOperation("deploy returned no placement");
                finish(job, Err(error));
            }
            Err(error) => {
                // The old pair was never touched; abort cleanly.
                net.remove_router(new_backup);
                finish(job, Err(Error::Provision(new_backup, error)));
            }
        },
        (
            UpdatePhase::DestroyOldBackup {
                new_backup,
                old_backup,
            },
            ProvisionOp::Destroy,
        ) if msg.router_id == old_backup => match msg.result {
            Ok(_) => {
                net.remove_router(old_backup);

                // Vacate the old PRIMARY; the in-guest election promotes the
                // confirmed-healthy new BACKUP.
                let Some(old_primary) =
                    net.primary().map(|router| router.id)
                else {
                    finish(
                        job,
                        Err(Error::InvalidOperation("pair lost its PRIMARY")),
                    );
                    return Ok(());
                };
                net.monitor.unregister(old_primary);
                net.set_vm_state(old_primary, VmState::Stopping);
                tasks::provision_op(
                    net.provisioner.clone(),
                    old_primary,
                    ProvisionOp::Stop,
                    None,
                    false,
                    &net.tx.input,
                );
                transition(
                    net,
                    &mut job,
                    UpdatePhase::VacatePrimary {
                        old_primary,
                        new_primary: new_backup,
                    },
                );
                net.update = Some(job);
            }
            Err(error) => {
                // Keep the old pair; roll the replacement back.
                pair::destroy_unguarded(net, new_backup);
                finish(job, Err(Error::Provision(old_backup, error)));
            }
        },
        (
            UpdatePhase::VacatePrimary {
                old_primary,
                new_primary,
            },
            ProvisionOp::Stop,
        ) if msg.router_id == old_primary => match msg.result {
            Ok(_) => {
                net.set_vm_state(old_primary, VmState::Stopped);
                if let Err(error) = net.set_role(
                    old_primary,
                    RedundantRole::Unknown,
                    PromoteReason::NotPromoted,
                ) {
                    error.log();
                }
                transition(
                    net,
                    &mut job,
                    UpdatePhase::AwaitPromotion {
                        old_primary,
                        new_primary,
                    },
                );
                net.update = Some(job);
            }
            Err(error) => {
                // The old PRIMARY kept running; restore monitoring and keep
                // the recorded roles as they were.
                net.set_vm_state(old_primary, VmState::Running);
                net.register_monitor(old_primary);
                finish(job, Err(Error::Provision(old_primary, error)));
            }
        },
        (
            UpdatePhase::DeployFinalBackup {
                final_backup,
                old_primary,
            },
            ProvisionOp::Deploy,
        ) if msg.router_id == final_backup => match msg.result {
            Ok(Some(deployed)) => {
                if let Err(error) =
                    events::finalize_deploy(net, final_backup, deployed)
                {
                    error.log();
                }
                transition(
                    net,
                    &mut job,
                    UpdatePhase::AwaitFinalStable {
                        final_backup,
                        old_primary,
                    },
                );
                net.update = Some(job);
            }
            Ok(None) => {
                net.remove_router(final_backup);
                let error =
                    Error::InvalidOperation("deploy returned no placement");
                finish(job, Err(error));
            }
            Err(error) => {
                // The vacated old PRIMARY has not been destroyed; the pair
                // still has a serving PRIMARY and can be healed.
                net.remove_router(final_backup);
                finish(job, Err(Error::Provision(final_backup, error)));
            }
        },
        (
            UpdatePhase::DestroyOldPrimary {
                final_backup: _,
                old_primary,
            },
            ProvisionOp::Destroy,
        ) if msg.router_id == old_primary => match msg.result {
            Ok(_) => {
                net.remove_router(old_primary);

                // Postcondition reached: both members on the target
                // offering, one PRIMARY, one BACKUP.
                net.record.offering_id = job.target.id;
                net.save_record();
                finish(job, Ok(()));
            }
            Err(error) => {
                finish(job, Err(Error::Provision(old_primary, error)));
            }
        },
        _ => {
            net.update = Some(job);
        }
    }

    Ok(())
}

// One convergence poll. Every tick consumes budget; exhausting it fails the
// update with a ConvergenceTimeout and leaves the last consistent recorded
// state.
pub(crate) fn process_convergence_tick(
    net: &mut Network,
) -> Result<(), Error> {
    let Some(mut job) = net.update.take() else {
        return Ok(());
    };

    match job.phase {
        UpdatePhase::AwaitBackupStable {
            new_backup,
            old_backup,
        } => {
            if backup_ready(net, new_backup) {
                match pair::decommission(net, old_backup) {
                    Ok(()) => {
                        transition(
                            net,
                            &mut job,
                            UpdatePhase::DestroyOldBackup {
                                new_backup,
                                old_backup,
                            },
                        );
                        net.update = Some(job);
                    }
                    Err(error) => {
                        pair::destroy_unguarded(net, new_backup);
                        finish(job, Err(error));
                    }
                }
            } else if let Err(timeout) = job.budget.consume() {
                // The replacement never stabilized; roll it back.
                pair::destroy_unguarded(net, new_backup);
                finish(job, Err(Error::Convergence(timeout)));
            } else {
                net.update = Some(job);
            }
        }
        UpdatePhase::AwaitPromotion {
            old_primary,
            new_primary,
        } => {
            let promoted = net
                .routers
                .get(&new_primary)
                .map(|router| router.is_healthy_primary() && router.serving)
                .unwrap_or(false);
            if promoted {
                match pair::deploy_router(
                    net,
                    RedundantRole::Backup,
                    job.target.id,
                ) {
                    Ok(final_backup) => {
                        transition(
                            net,
                            &mut job,
                            UpdatePhase::DeployFinalBackup {
                                final_backup,
                                old_primary,
                            },
                        );
                        net.update = Some(job);
                    }
                    Err(error) => finish(job, Err(error)),
                }
            } else if let Err(timeout) = job.budget.consume() {
                finish(job, Err(Error::Convergence(timeout)));
            } else {
                net.update = Some(job);
            }
        }
        UpdatePhase::AwaitFinalStable {
            final_backup,
            old_primary,
        } => {
            if backup_ready(net, final_backup) {
                match pair::decommission(net, old_primary) {
                    Ok(()) => {
                        transition(
                            net,
                            &mut job,
                            UpdatePhase::DestroyOldPrimary {
                                final_backup,
                                old_primary,
                            },
                        );
                        net.update = Some(job);
                    }
                    Err(error) => finish(job, Err(error)),
                }
            } else if let Err(timeout) = job.budget.consume() {
                finish(job, Err(Error::Convergence(timeout)));
            } else {
                net.update = Some(job);
            }
        }
        // Phases waiting on a provisioner completion still consume budget,
        // so a hung collaborator can't wedge the orchestrator forever.
        _ => {
            if let Err(timeout) = job.budget.consume() {
                finish(job, Err(Error::Convergence(timeout)));
            } else {
                net.update = Some(job);
            }
        }
    }

    Ok(())
}

// A replacement BACKUP is ready once it runs, advertises BACKUP for itself
// (no UNKNOWN left to resolve) and has acknowledged the current rule set.
fn backup_ready(net: &Network, router_id: RouterId) -> bool {
    let Some(router) = net.routers.get(&router_id) else {
        return false;
    };
    router.is_running()
        && router.applied_rules == Some(net.record.rules.version)
        && net.monitor.observed_role(router_id)
            == Some(RedundantRole::Backup)
}

fn transition(net: &Network, job: &mut UpdateJob, phase: UpdatePhase) {
    job.phase = phase;
    job.budget.refill();
    Debug::UpdatePhase(net.record.id, &job.phase).log();
}

fn finish(mut job: UpdateJob, result: Result<(), Error>) {
    if let Err(error) = &result {
        error.log();
    }
    if let Some(responder) = job.responder.take() {
        let _ = responder.send(result);
    }
}
