//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::time::Duration;

use rvr_utils::Sender;
use rvr_utils::task::{IntervalTask, Task, TimeoutTask};
use tracing::Instrument;

use crate::instance::RouterId;
use crate::provision::{DeploySpec, Provisioner};
use crate::reconcile::RuleSet;

//
// Controller tasks diagram:
//                                +--------------+
//                                |     API      |
//                                +--------------+
//                                      | ^
//                                      | |
//                                      V | (1x per network)
//                                +--------------+
//            heartbeats (1x) ->  |              | -> (Nx) provision_op
//         silence_timer (Nx) ->  |   network    | -> (Nx) rule_push
//       convergence_tick (1x) -> |              |
//                                +--------------+
//                                      | ^
//                                      | |
//                                      V |
//                                +--------------+
//                                | provisioner  |
//                                +--------------+
//

// Controller inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    // Type aliases.
    pub type NetworkInputMsg = input::NetworkMsg;

    // Input messages (child task -> network task).
    pub mod input {
        use super::*;

        use crate::api::NetworkRequest;
        use crate::instance::RouterId;
        use crate::monitor::Advertisement;
        use crate::provision::{DeployedRouter, ProvisionError};

        #[derive(Debug)]
        pub enum NetworkMsg {
            Request(NetworkRequest),
            Advertisement(Advertisement),
            SilenceTimer(SilenceTimerMsg),
            ProvisionResult(ProvisionResultMsg),
            RulePushResult(RulePushResultMsg),
            ConvergenceTick,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct SilenceTimerMsg {
            pub router_id: RouterId,
        }

        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        #[derive(Deserialize, Serialize)]
        pub enum ProvisionOp {
            Deploy,
            Destroy,
            Stop,
            Start,
            Reboot,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct ProvisionResultMsg {
            pub router_id: RouterId,
            pub op: ProvisionOp,
            pub result: Result<Option<DeployedRouter>, ProvisionError>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct RulePushResultMsg {
            pub router_id: RouterId,
            pub version: u64,
            pub result: Result<(), ProvisionError>,
        }
    }
}

use messages::input::{
    NetworkMsg, ProvisionOp, ProvisionResultMsg, RulePushResultMsg,
    SilenceTimerMsg,
};

// ===== controller tasks =====

// Per-router silence timer. Re-armed by the heartbeat monitor on every
// accepted advertisement; firing means no signal was seen for the whole
// failover window.
pub(crate) fn silence_timer(
    router_id: RouterId,
    timeout: Duration,
    input_tx: &Sender<NetworkMsg>,
) -> TimeoutTask {
    let input_tx = input_tx.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = SilenceTimerMsg { router_id };
        let _ = input_tx.send(NetworkMsg::SilenceTimer(msg)).await;
    })
}

// Convergence poll driving an active sequential update. One tick consumes
// one attempt of the update's retry budget.
pub(crate) fn convergence_tick(
    interval: Duration,
    input_tx: &Sender<NetworkMsg>,
) -> IntervalTask {
    let input_tx = input_tx.clone();
    IntervalTask::new(interval, false, move || {
        let input_tx = input_tx.clone();
        async move {
            let _ = input_tx.send(NetworkMsg::ConvergenceTick).await;
        }
    })
}

// Runs one provisioner operation to completion and feeds the outcome back
// into the network's event loop.
pub(crate) fn provision_op(
    provisioner: Arc<dyn Provisioner>,
    router_id: RouterId,
    op: ProvisionOp,
    spec: Option<DeploySpec>,
    forced: bool,
    input_tx: &Sender<NetworkMsg>,
) {
    let input_tx = input_tx.clone();
    let mut task = Task::spawn(
        async move {
            let result = match op {
                ProvisionOp::Deploy => {
                    // A deploy without a spec is a programming error; surface
                    // it as a failed provision rather than panicking.
                    match spec {
                        Some(spec) => {
                            provisioner.deploy(spec).await.map(Some)
                        }
                        None => Err(
                            crate::provision::ProvisionError::Failed(
                                "missing deploy spec".to_owned(),
                            ),
                        ),
                    }
                }
                ProvisionOp::Destroy => {
                    provisioner.destroy(router_id).await.map(|_| None)
                }
                ProvisionOp::Stop => {
                    provisioner.stop(router_id, forced).await.map(|_| None)
                }
                ProvisionOp::Start => {
                    provisioner.start(router_id).await.map(|_| None)
                }
                ProvisionOp::Reboot => {
                    provisioner.reboot(router_id).await.map(|_| None)
                }
            };

            let msg = ProvisionResultMsg {
                router_id,
                op,
                result,
            };
            let _ = input_tx.send(NetworkMsg::ProvisionResult(msg)).await;
        }
        .in_current_span(),
    );
    task.detach();
}

// Pushes a rule-set snapshot to one router and reports the outcome.
pub(crate) fn rule_push(
    provisioner: Arc<dyn Provisioner>,
    router_id: RouterId,
    rules: RuleSet,
    input_tx: &Sender<NetworkMsg>,
) {
    let input_tx = input_tx.clone();
    let mut task = Task::spawn(
        async move {
            let version = rules.version;
            let result = provisioner.push_rules(router_id, &rules).await;

            let msg = RulePushResultMsg {
                router_id,
                version,
                result,
            };
            let _ = input_tx.send(NetworkMsg::RulePushResult(msg)).await;
        }
        .in_current_span(),
    );
    task.detach();
}
