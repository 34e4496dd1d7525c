//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashSet;
use std::net::Ipv4Addr;

use rvr_utils::mac_addr::MacAddr;

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::{
    Identity, OfferingId, RedundantRole, RouterId, RouterInstance, VmState,
};
use crate::network::Network;
use crate::provision::DeploySpec;
use crate::tasks;
use crate::tasks::messages::input::ProvisionOp;

/// Number of router instances backing every RvR network in steady state.
pub const PAIR_SIZE: usize = 2;

// Provisions whatever is missing to bring the network back to a full pair.
// Never provisions a third instance: records are created eagerly, so
// in-flight deployments count against the pair size. Returns the number of
// instances being provisioned.
pub(crate) fn ensure_pair(net: &mut Network) -> Result<usize, Error> {
    let missing = PAIR_SIZE.saturating_sub(net.routers.len());
    if missing == 0 {
        return Ok(0);
    }

    Debug::PairEnsure(net.record.id, missing).log();

    for _ in 0..missing {
        // The first member of a fresh pair is the designated PRIMARY; any
        // later instance (the second member, or a replacement) joins as
        // BACKUP.
        let role = match net.primary() {
            None => RedundantRole::Primary,
            Some(_) => RedundantRole::Backup,
        };
        deploy_router(net, role, net.record.offering_id)?;
    }

    Ok(missing)
}

// Creates the record for one new router instance and starts its deployment.
// The record is inserted before the provisioner is invoked so that the pair
// size invariant holds across the provisioning window.
pub(crate) fn deploy_router(
    net: &mut Network,
    role: RedundantRole,
    offering_id: OfferingId,
) -> Result<RouterId, Error> {
    let router_id = RouterId(net.allocator.next_router());
    let identity = allocate_identity(net, router_id)?;

    let router = RouterInstance::new(
        router_id,
        net.record.id,
        role,
        offering_id,
        identity.clone(),
    );
    net.insert_router(router);

    // Only the very first instance boots as PRIMARY; replacements always
    // boot as BACKUP and rely on the in-guest election for promotion.
    let bootstrap_role = match role {
        RedundantRole::Primary => RedundantRole::Primary,
        _ => RedundantRole::Backup,
    };
    let spec = DeploySpec::new(
        router_id,
        net.record.id,
        bootstrap_role,
        identity,
        net.record.gateway,
        offering_id,
    );
    tasks::provision_op(
        net.provisioner.clone(),
        router_id,
        ProvisionOp::Deploy,
        Some(spec),
        false,
        &net.tx.input,
    );

    Ok(router_id)
}

// Tears one router instance down, guaranteeing the network's public IP never
// goes unreachable: the peer must be running, and a PRIMARY can only be
// decommissioned after its peer has completed promotion.
pub(crate) fn decommission(
    net: &mut Network,
    router_id: RouterId,
) -> Result<(), Error> {
    let router = net.router(router_id)?;
    let role = router.role;

    if !net.any_other_running(router_id) {
        return Err(Error::PeerNotReady(router_id));
    }
    if role == RedundantRole::Primary {
        // The recorded PRIMARY is still this router; its peer has not
        // completed promotion.
        return Err(Error::PeerNotReady(router_id));
    }

    destroy_unguarded(net, router_id);
    Ok(())
}

// Starts the teardown of one instance without the decommission guards. Used
// by whole-network teardown paths (shutdown, restart with cleanup), where a
// window with zero routers is expected.
pub(crate) fn destroy_unguarded(net: &mut Network, router_id: RouterId) {
    net.monitor.unregister(router_id);
    net.set_vm_state(router_id, VmState::Stopping);
    tasks::provision_op(
        net.provisioner.clone(),
        router_id,
        ProvisionOp::Destroy,
        None,
        false,
        &net.tx.input,
    );
}

// Allocates the network identity for a new instance: the shared public
// IP/MAC copied from the network, a distinct guest IP/MAC, and a link-local
// address derived from the router id.
fn allocate_identity(
    net: &Network,
    router_id: RouterId,
) -> Result<Identity, Error> {
    let used = net
        .routers
        .values()
        .map(|router| router.identity.guest_ip)
        .collect::<HashSet<_>>();

    let guest_ip = net
        .record
        .cidr
        .iter()
        // Skip the network address.
        .skip(1)
        .filter(|ip| *ip != net.record.gateway)
        .find(|ip| !used.contains(ip))
        .ok_or(Error::InvalidOperation("guest subnet exhausted"))?;

    let link_local_ip = Ipv4Addr::new(
        169,
        254,
        ((router_id.0 >> 8) & 0xff) as u8,
        (router_id.0 & 0xff) as u8,
    );

    Ok(Identity::new(
        net.record.source_nat_ip,
        MacAddr::virtual_router(net.record.id.0 as u8),
        guest_ip,
        MacAddr::random_unicast(),
        link_local_ip,
    ))
}
