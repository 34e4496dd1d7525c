//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use rvr_controller::api::{Controller, ListRouters, RouterView};
use rvr_controller::error::Error;
use rvr_controller::instance::{
    NetworkId, OfferingId, RedundantRole, VmState,
};
use rvr_controller::master::{self, HaConfig};
use rvr_controller::monitor::Advertisement;
use rvr_controller::reconcile::{LbAlgorithm, Protocol};
use rvr_controller::sim::SimProvisioner;
use rvr_utils::Sender;
use rvr_utils::convergence::wait_for;
use tokio::sync::mpsc;

//
// Helper functions.
//

const POLL: Duration = Duration::from_millis(20);
const POLL_BUDGET: usize = 300;

fn test_config() -> HaConfig {
    HaConfig {
        advert_interval: Duration::from_millis(25),
        silence_multiplier: 3,
        convergence_interval: Duration::from_millis(25),
        convergence_retries: 150,
        public_cidr: "203.0.113.0/24".parse().unwrap(),
    }
}

struct TestBed {
    controller: Controller,
    provisioner: Arc<SimProvisioner>,
    heartbeat_tx: Sender<Advertisement>,
}

async fn start_controller() -> TestBed {
    start_controller_with(test_config()).await
}

async fn start_controller_with(config: HaConfig) -> TestBed {
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(64);
    let provisioner = Arc::new(SimProvisioner::new(
        Arc::new(config.clone()),
        heartbeat_tx.clone(),
    ));
    let controller =
        master::spawn(config, provisioner.clone(), heartbeat_rx, None);
    TestBed {
        controller,
        provisioner,
        heartbeat_tx,
    }
}

async fn routers(
    controller: &Controller,
    network: NetworkId,
) -> Vec<RouterView> {
    controller
        .list_routers(ListRouters::Network(network))
        .await
        .unwrap()
}

fn primary_of(routers: &[RouterView]) -> &RouterView {
    routers
        .iter()
        .find(|router| router.redundant_state == RedundantRole::Primary)
        .expect("no PRIMARY in pair")
}

fn backup_of(routers: &[RouterView]) -> &RouterView {
    routers
        .iter()
        .find(|router| router.redundant_state == RedundantRole::Backup)
        .expect("no BACKUP in pair")
}

// Waits until the pair is fully stable: two running instances, one PRIMARY,
// one BACKUP, rules in sync on both.
async fn wait_for_stable_pair(
    controller: &Controller,
    network: NetworkId,
) -> Vec<RouterView> {
    wait_for(POLL, POLL_BUDGET, || {
        let controller = controller.clone();
        async move {
            let routers = controller
                .list_routers(ListRouters::Network(network))
                .await
                .unwrap();
            let stable = routers.len() == 2
                && routers.iter().all(|router| {
                    router.state == VmState::Running && router.rules_synced
                })
                && routers
                    .iter()
                    .filter(|router| {
                        router.redundant_state == RedundantRole::Primary
                    })
                    .count()
                    == 1
                && routers
                    .iter()
                    .filter(|router| {
                        router.redundant_state == RedundantRole::Backup
                    })
                    .count()
                    == 1;
            stable.then_some(routers)
        }
    })
    .await
    .expect("pair did not stabilize")
}

// Creates an RvR-enabled network, implements it (first VM deployment) and
// waits for the pair to stabilize.
async fn implement_network(bed: &TestBed) -> (NetworkId, OfferingId) {
    let offering = bed
        .controller
        .create_offering("RVR-enabled", true)
        .await
        .unwrap();
    let network = bed
        .controller
        .create_network("tenant-net", offering, None, None)
        .await
        .unwrap();

    // No routers exist while the network is Allocated.
    assert!(routers(&bed.controller, network).await.is_empty());

    bed.controller.implement_network(network).await.unwrap();
    wait_for_stable_pair(&bed.controller, network).await;
    (network, offering)
}

//
// Tests.
//

// Input:
//  * Create a network with a redundant offering; deploy the first workload
// Output:
//  * Exactly two routers, one PRIMARY and one BACKUP
//  * Both share the public IP and public MAC; guest IPs and MACs differ
//  * Both placed on a host and fully rule-synced
#[tokio::test]
async fn implement_pair1() {
    let bed = start_controller().await;
    let (network, offering) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    assert_eq!(pair.len(), 2);

    let primary = primary_of(&pair);
    let backup = backup_of(&pair);
    assert_eq!(primary.public_ip, backup.public_ip);
    assert_eq!(primary.public_mac, backup.public_mac);
    assert_ne!(primary.guest_ip, backup.guest_ip);
    assert_ne!(primary.guest_mac, backup.guest_mac);
    assert_ne!(primary.link_local_ip, backup.link_local_ip);
    assert!(primary.host_id.is_some());
    assert!(backup.host_id.is_some());
    assert_eq!(primary.offering_id, offering);
    assert_eq!(backup.offering_id, offering);

    // Lookup by router id returns the single matching record.
    let by_id = bed
        .controller
        .list_routers(ListRouters::Router(primary.id))
        .await
        .unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].id, primary.id);
}

// Input:
//  * Administrative stop of the PRIMARY; later an administrative start
// Output:
//  * The BACKUP self-promotes within the failover window
//  * The stopped router reads UNKNOWN while down
//  * The restarted router rejoins as BACKUP, never contesting the PRIMARY
//  * The public IP is unchanged across the whole round trip
#[tokio::test]
async fn primary_failover1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let old_primary = primary_of(&pair).id;
    let old_backup = backup_of(&pair).id;
    let public_ip = primary_of(&pair).public_ip;

    bed.controller.stop_router(old_primary, false).await.unwrap();

    // The peer must detect the silence and take over on its own.
    let pair = wait_for(POLL, POLL_BUDGET, || {
        let controller = bed.controller.clone();
        async move {
            let routers = controller
                .list_routers(ListRouters::Network(network))
                .await
                .unwrap();
            routers
                .iter()
                .any(|router| {
                    router.id == old_backup
                        && router.redundant_state == RedundantRole::Primary
                        && router.rules_synced
                })
                .then_some(routers)
        }
    })
    .await
    .expect("BACKUP was not promoted");

    let stopped = pair
        .iter()
        .find(|router| router.id == old_primary)
        .unwrap();
    assert_eq!(stopped.state, VmState::Stopped);
    assert!(matches!(
        stopped.redundant_state,
        RedundantRole::Unknown | RedundantRole::Fault
    ));

    // Restart the old PRIMARY: it must come back as BACKUP.
    bed.controller.start_router(old_primary).await.unwrap();
    let pair = wait_for_stable_pair(&bed.controller, network).await;

    let rejoined = pair
        .iter()
        .find(|router| router.id == old_primary)
        .unwrap();
    assert_eq!(rejoined.redundant_state, RedundantRole::Backup);
    let promoted = pair.iter().find(|router| router.id == old_backup).unwrap();
    assert_eq!(promoted.redundant_state, RedundantRole::Primary);
    assert!(pair.iter().all(|router| router.public_ip == public_ip));
}

// Input:
//  * Forced (involuntary) stop of the PRIMARY
// Output:
//  * The stopped router reads FAULT; the peer takes over
#[tokio::test]
async fn forced_stop_reads_fault1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let old_primary = primary_of(&pair).id;
    let old_backup = backup_of(&pair).id;

    bed.controller.stop_router(old_primary, true).await.unwrap();

    wait_for(POLL, POLL_BUDGET, || {
        let controller = bed.controller.clone();
        async move {
            let routers = controller
                .list_routers(ListRouters::Network(network))
                .await
                .unwrap();
            let promoted = routers.iter().any(|router| {
                router.id == old_backup
                    && router.redundant_state == RedundantRole::Primary
            });
            let faulted = routers.iter().any(|router| {
                router.id == old_primary
                    && router.redundant_state == RedundantRole::Fault
            });
            (promoted && faulted).then_some(())
        }
    })
    .await
    .expect("forced stop did not surface as FAULT");
}

// Input:
//  * Administrative reboot of the PRIMARY
// Output:
//  * Role swap: the old BACKUP ends as PRIMARY, the rebooted router as
//    BACKUP; public IP unchanged
#[tokio::test]
async fn reboot_primary_swaps_roles1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let old_primary = primary_of(&pair).id;
    let old_backup = backup_of(&pair).id;
    let public_ip = primary_of(&pair).public_ip;

    bed.controller.reboot_router(old_primary).await.unwrap();

    let pair = wait_for_stable_pair(&bed.controller, network).await;
    assert_eq!(primary_of(&pair).id, old_backup);
    assert_eq!(backup_of(&pair).id, old_primary);
    assert!(pair.iter().all(|router| router.public_ip == public_ip));
}

// Input:
//  * Administrative reboot of the BACKUP
// Output:
//  * No role change: the PRIMARY keeps PRIMARY throughout
#[tokio::test]
async fn reboot_backup_no_role_change1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let old_primary = primary_of(&pair).id;
    let old_backup = backup_of(&pair).id;

    bed.controller.reboot_router(old_backup).await.unwrap();

    let pair = wait_for_stable_pair(&bed.controller, network).await;
    assert_eq!(primary_of(&pair).id, old_primary);
    assert_eq!(backup_of(&pair).id, old_backup);
}

// Input:
//  * A forged PRIMARY advertisement for the BACKUP while the real PRIMARY
//    is healthy
// Output:
//  * The transition is rejected: at no instant do two routers read PRIMARY
#[tokio::test]
async fn split_brain_guard1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let old_primary = primary_of(&pair).id;
    let backup = backup_of(&pair).id;

    for _ in 0..10 {
        let _ = bed
            .heartbeat_tx
            .send(Advertisement {
                router_id: backup,
                role: RedundantRole::Primary,
                timestamp: Utc::now(),
            })
            .await;
        tokio::time::sleep(POLL).await;

        let pair = routers(&bed.controller, network).await;
        let primaries = pair
            .iter()
            .filter(|router| {
                router.redundant_state == RedundantRole::Primary
            })
            .count();
        assert!(primaries <= 1, "split brain: two PRIMARYs recorded");
        assert_eq!(primary_of(&pair).id, old_primary);
    }
}

// Input:
//  * Full rule set; then updateNetwork from offering A to offering B with
//    update_in_sequence
// Output:
//  * Both routers end on offering B, one PRIMARY one BACKUP
//  * The public IP survives the update
//  * At no sampled instant were both routers unavailable
#[tokio::test]
async fn rolling_update1() {
    let bed = start_controller().await;
    let (network, offering_a) = implement_network(&bed).await;

    let offering_b = bed
        .controller
        .create_offering("RVR-enabled-v2", true)
        .await
        .unwrap();

    let pair = routers(&bed.controller, network).await;
    let public_ip = primary_of(&pair).public_ip;
    assert!(pair.iter().all(|router| router.offering_id == offering_a));

    // Availability watcher: at least one running router at every sample.
    let stop = Arc::new(AtomicBool::new(false));
    let outages = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let controller = bed.controller.clone();
        let stop = stop.clone();
        let outages = outages.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                let routers = controller
                    .list_routers(ListRouters::Network(network))
                    .await
                    .unwrap();
                let running = routers
                    .iter()
                    .filter(|router| router.state == VmState::Running)
                    .count();
                if running == 0 {
                    outages.fetch_add(1, Ordering::Relaxed);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    bed.controller
        .update_network(network, offering_b, true, true)
        .await
        .unwrap();

    stop.store(true, Ordering::Relaxed);
    watcher.await.unwrap();
    assert_eq!(outages.load(Ordering::Relaxed), 0);

    let pair = wait_for_stable_pair(&bed.controller, network).await;
    assert_eq!(pair.len(), 2);
    assert!(pair.iter().all(|router| router.offering_id == offering_b));
    assert!(pair.iter().all(|router| router.public_ip == public_ip));

    let view = bed.controller.get_network(network).await.unwrap();
    assert_eq!(view.offering_id, offering_b);
}

// Input:
//  * updateNetwork while the compute provisioner cannot deploy
// Output:
//  * The update fails; the old pair is intact, still on offering A, and the
//    old router was never destroyed
#[tokio::test]
async fn update_aborts_on_provision_failure1() {
    let bed = start_controller().await;
    let (network, offering_a) = implement_network(&bed).await;

    let offering_b = bed
        .controller
        .create_offering("RVR-enabled-v2", true)
        .await
        .unwrap();

    let pair = routers(&bed.controller, network).await;
    let old_ids =
        [primary_of(&pair).id, backup_of(&pair).id];

    bed.provisioner.fail_next_deploys(1);
    let result = bed
        .controller
        .update_network(network, offering_b, true, true)
        .await;
    assert!(matches!(result, Err(Error::Provision(..))));

    let pair = wait_for_stable_pair(&bed.controller, network).await;
    assert!(pair.iter().all(|router| router.offering_id == offering_a));
    assert!(pair.iter().all(|router| old_ids.contains(&router.id)));
}

// Input:
//  * updateNetwork while the in-guest election can never promote the
//    replacement (failover window far beyond the retry budget)
// Output:
//  * The update fails with ConvergenceTimeout instead of retrying forever;
//    the recorded roles stay consistent
#[tokio::test]
async fn update_convergence_timeout1() {
    let mut config = test_config();
    // Promotion after the vacate step can't happen within the budget.
    config.silence_multiplier = 2000;
    config.convergence_retries = 10;
    let bed = start_controller_with(config).await;
    let (network, _) = implement_network(&bed).await;

    let offering_b = bed
        .controller
        .create_offering("RVR-enabled-v2", true)
        .await
        .unwrap();

    let result = bed
        .controller
        .update_network(network, offering_b, true, true)
        .await;
    assert!(matches!(result, Err(Error::Convergence(_))));

    // No split brain afterwards: at most one recorded PRIMARY.
    let pair = routers(&bed.controller, network).await;
    let primaries = pair
        .iter()
        .filter(|router| router.redundant_state == RedundantRole::Primary)
        .count();
    assert!(primaries <= 1);
}

// Input:
//  * Rule set R; then restartNetwork with cleanup=true
// Output:
//  * The pair is rebuilt from scratch (new router ids) with the same public
//    IP and the externally observable rule set still equal to R
#[tokio::test]
async fn restart_cleanup_roundtrip1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let public_ip = primary_of(&pair).public_ip;
    let old_ids = [pair[0].id, pair[1].id];

    let extra_ip = bed.controller.associate_public_ip(network).await.unwrap();
    bed.controller
        .create_firewall_rule(
            network,
            Protocol::Tcp,
            vec!["0.0.0.0/0".parse().unwrap()],
            22,
            22,
        )
        .await
        .unwrap();
    bed.controller
        .create_port_forwarding_rule(
            network,
            public_ip,
            Protocol::Tcp,
            8080,
            80,
            "10.1.1.10".parse().unwrap(),
        )
        .await
        .unwrap();
    bed.controller
        .create_lb_rule(
            network,
            "web",
            public_ip,
            LbAlgorithm::RoundRobin,
            443,
            8443,
            vec!["10.1.1.10".parse().unwrap(), "10.1.1.11".parse().unwrap()],
        )
        .await
        .unwrap();
    bed.controller
        .enable_static_nat(
            network,
            extra_ip,
            "10.1.1.12".parse().unwrap(),
        )
        .await
        .unwrap();
    bed.controller.add_vpn_user(network, "alice").await.unwrap();

    let rules_before = bed.controller.network_rules(network).await.unwrap();
    wait_for_stable_pair(&bed.controller, network).await;

    bed.controller.restart_network(network, true).await.unwrap();
    let pair = wait_for_stable_pair(&bed.controller, network).await;

    // Fresh instances, same public identity.
    assert!(pair.iter().all(|router| !old_ids.contains(&router.id)));
    assert!(pair.iter().all(|router| router.public_ip == public_ip));

    // The rule set survived the rebuild, on the records and on the routers.
    let rules_after = bed.controller.network_rules(network).await.unwrap();
    assert_eq!(rules_before.rules, rules_after.rules);
    let primary = primary_of(&pair);
    let applied = bed.provisioner.applied_rules(primary.id).unwrap();
    assert_eq!(applied.rules, rules_before.rules);
}

// Input:
//  * Rule set R; then restartNetwork with cleanup=false
// Output:
//  * Routers keep running (same ids); the rule set is re-pushed and the
//    externally observable state equals R, same as the cleanup path
#[tokio::test]
async fn restart_in_place_roundtrip1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let old_ids = [pair[0].id, pair[1].id];
    let public_ip = primary_of(&pair).public_ip;

    bed.controller
        .create_firewall_rule(
            network,
            Protocol::Udp,
            vec!["192.0.2.0/24".parse().unwrap()],
            53,
            53,
        )
        .await
        .unwrap();
    let rules_before = bed.controller.network_rules(network).await.unwrap();
    wait_for_stable_pair(&bed.controller, network).await;

    bed.controller.restart_network(network, false).await.unwrap();
    let pair = wait_for_stable_pair(&bed.controller, network).await;

    let mut ids = [pair[0].id, pair[1].id];
    ids.sort();
    let mut expected = old_ids;
    expected.sort();
    assert_eq!(ids, expected);
    assert!(pair.iter().all(|router| router.public_ip == public_ip));

    let rules_after = bed.controller.network_rules(network).await.unwrap();
    assert_eq!(rules_before.rules, rules_after.rules);
    for router in &pair {
        let applied = bed.provisioner.applied_rules(router.id).unwrap();
        assert_eq!(applied.rules, rules_before.rules);
    }
}

// Input:
//  * Static NAT active on a secondary public IP; attempt to release the IP
// Output:
//  * The release fails with RuleInUse until the mapping is removed
#[tokio::test]
async fn rule_in_use1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let ip = bed.controller.associate_public_ip(network).await.unwrap();
    bed.controller
        .enable_static_nat(network, ip, "10.1.1.20".parse().unwrap())
        .await
        .unwrap();

    let result = bed.controller.disassociate_public_ip(network, ip).await;
    assert!(matches!(result, Err(Error::RuleInUse(in_use)) if in_use == ip));

    bed.controller.disable_static_nat(network, ip).await.unwrap();
    bed.controller
        .disassociate_public_ip(network, ip)
        .await
        .unwrap();
}

// Input:
//  * Administrative destroy of the BACKUP
// Output:
//  * The pair self-heals: exactly one replacement is provisioned and joins
//    as BACKUP with the same public identity
#[tokio::test]
async fn destroy_backup_self_heals1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let primary = primary_of(&pair).id;
    let old_backup = backup_of(&pair).id;
    let public_ip = primary_of(&pair).public_ip;

    bed.controller.destroy_router(old_backup).await.unwrap();

    let pair = wait_for_stable_pair(&bed.controller, network).await;
    assert_eq!(pair.len(), 2);
    assert_eq!(primary_of(&pair).id, primary);
    let replacement = backup_of(&pair);
    assert_ne!(replacement.id, old_backup);
    assert_eq!(replacement.public_ip, public_ip);

    // The destroyed router is gone for good.
    let by_id = bed
        .controller
        .list_routers(ListRouters::Router(old_backup))
        .await
        .unwrap();
    assert!(by_id.is_empty());
}

// Input:
//  * Administrative destroy of the recorded PRIMARY
// Output:
//  * Refused: the peer has not completed promotion
#[tokio::test]
async fn destroy_primary_refused1() {
    let bed = start_controller().await;
    let (network, _) = implement_network(&bed).await;

    let pair = routers(&bed.controller, network).await;
    let primary = primary_of(&pair).id;

    let result = bed.controller.destroy_router(primary).await;
    assert!(matches!(result, Err(Error::PeerNotReady(_))));

    // Nothing changed.
    let pair = routers(&bed.controller, network).await;
    assert_eq!(pair.len(), 2);
    assert_eq!(primary_of(&pair).id, primary);
}
