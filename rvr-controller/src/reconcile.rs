//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use enum_as_inner::EnumAsInner;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::RouterId;
use crate::network::Network;
use crate::tasks;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct RuleId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum LbAlgorithm {
    RoundRobin,
    LeastConn,
    Source,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct FirewallRule {
    pub id: RuleId,
    pub protocol: Protocol,
    pub source_cidrs: Vec<Ipv4Network>,
    pub start_port: u16,
    pub end_port: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PortForwardingRule {
    pub id: RuleId,
    pub public_ip: Ipv4Addr,
    pub protocol: Protocol,
    pub public_port: u16,
    pub private_port: u16,
    pub guest_ip: Ipv4Addr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct LoadBalancerRule {
    pub id: RuleId,
    pub name: String,
    pub public_ip: Ipv4Addr,
    pub algorithm: LbAlgorithm,
    pub public_port: u16,
    pub private_port: u16,
    pub members: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct StaticNatRule {
    pub public_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct VpnUser {
    pub name: String,
}

/// One network rule. The closed set of rule kinds the reconciliation engine
/// understands; routers never hold rules as their own source of truth.
#[derive(Clone, Debug, EnumAsInner, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Rule {
    Firewall(FirewallRule),
    PortForwarding(PortForwardingRule),
    LoadBalancer(LoadBalancerRule),
    StaticNat(StaticNatRule),
    VpnUser(VpnUser),
}

/// The desired rule set of a network, owned by the network entity. The
/// version counter increments on every mutation; a router is in sync once
/// the version it last acknowledged matches.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RuleSet {
    pub version: u64,
    pub rules: Vec<Rule>,
}

/// Rule CRUD operations, all funneling into the same desired-state rule set.
#[derive(Debug)]
pub enum RuleOp {
    AddFirewall {
        protocol: Protocol,
        source_cidrs: Vec<Ipv4Network>,
        start_port: u16,
        end_port: u16,
    },
    DeleteFirewall(RuleId),
    AddPortForwarding {
        public_ip: Ipv4Addr,
        protocol: Protocol,
        public_port: u16,
        private_port: u16,
        guest_ip: Ipv4Addr,
    },
    DeletePortForwarding(RuleId),
    AddLoadBalancer {
        name: String,
        public_ip: Ipv4Addr,
        algorithm: LbAlgorithm,
        public_port: u16,
        private_port: u16,
        members: Vec<Ipv4Addr>,
    },
    DeleteLoadBalancer(RuleId),
    EnableStaticNat {
        public_ip: Ipv4Addr,
        guest_ip: Ipv4Addr,
    },
    DisableStaticNat {
        public_ip: Ipv4Addr,
    },
    AddVpnUser {
        name: String,
    },
    RemoveVpnUser {
        name: String,
    },
}

// ===== impl Rule =====

impl Rule {
    fn id(&self) -> Option<RuleId> {
        match self {
            Rule::Firewall(rule) => Some(rule.id),
            Rule::PortForwarding(rule) => Some(rule.id),
            Rule::LoadBalancer(rule) => Some(rule.id),
            // Static-NAT bindings and VPN users are keyed by address/name.
            Rule::StaticNat(..) | Rule::VpnUser(..) => None,
        }
    }

    fn public_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Rule::Firewall(..) | Rule::VpnUser(..) => None,
            Rule::PortForwarding(rule) => Some(rule.public_ip),
            Rule::LoadBalancer(rule) => Some(rule.public_ip),
            Rule::StaticNat(rule) => Some(rule.public_ip),
        }
    }
}

// ===== impl RuleSet =====

impl RuleSet {
    pub(crate) fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.version += 1;
    }

    pub(crate) fn remove_by_id(&mut self, id: RuleId) -> Option<Rule> {
        let index = self.rules.iter().position(|rule| rule.id() == Some(id))?;
        let rule = self.rules.remove(index);
        self.version += 1;
        Some(rule)
    }

    pub(crate) fn remove_static_nat(
        &mut self,
        public_ip: Ipv4Addr,
    ) -> Option<Rule> {
        let index = self.rules.iter().position(|rule| {
            matches!(rule, Rule::StaticNat(nat) if nat.public_ip == public_ip)
        })?;
        let rule = self.rules.remove(index);
        self.version += 1;
        Some(rule)
    }

    pub(crate) fn remove_vpn_user(&mut self, name: &str) -> Option<Rule> {
        let index = self.rules.iter().position(|rule| {
            matches!(rule, Rule::VpnUser(user) if user.name == name)
        })?;
        let rule = self.rules.remove(index);
        self.version += 1;
        Some(rule)
    }

    pub fn static_nat(&self, public_ip: Ipv4Addr) -> Option<&StaticNatRule> {
        self.rules.iter().find_map(|rule| {
            rule.as_static_nat().filter(|nat| nat.public_ip == public_ip)
        })
    }

    /// Whether any NAT, load-balancer or static-NAT mapping still targets
    /// the given public IP.
    pub fn references_ip(&self, public_ip: Ipv4Addr) -> bool {
        self.rules.iter().any(|rule| rule.public_ip() == Some(public_ip))
    }
}

// ===== global functions =====

// Pushes the current rule set to every running router that isn't in sync
// with it yet. Idempotent: routers already at the current version are left
// alone unless `force` is set (network restart without cleanup re-pushes
// unconditionally).
pub(crate) fn apply(net: &mut Network, force: bool) {
    let version = net.record.rules.version;
    let targets = net
        .routers
        .values()
        .filter(|router| router.is_running())
        .filter(|router| force || router.applied_rules != Some(version))
        .map(|router| router.id)
        .collect::<Vec<_>>();

    for router_id in targets {
        push_rules(net, router_id);
    }
}

// Pushes the full current rule set to a router transitioning into PRIMARY.
// The instance isn't considered serving until this push completes.
pub(crate) fn reconcile_on_promotion(net: &mut Network, router_id: RouterId) {
    push_rules(net, router_id);
}

// Applies a rule CRUD operation to the network's desired rule set and
// triggers reconciliation. Returns the id of a newly created rule, if any.
pub(crate) fn process_rule_op(
    net: &mut Network,
    op: RuleOp,
) -> Result<Option<RuleId>, Error> {
    let created = match op {
        RuleOp::AddFirewall {
            protocol,
            source_cidrs,
            start_port,
            end_port,
        } => {
            let id = net.next_rule_id();
            net.record.rules.add(Rule::Firewall(FirewallRule {
                id,
                protocol,
                source_cidrs,
                start_port,
                end_port,
            }));
            Some(id)
        }
        RuleOp::DeleteFirewall(id)
        | RuleOp::DeletePortForwarding(id)
        | RuleOp::DeleteLoadBalancer(id) => {
            net.record
                .rules
                .remove_by_id(id)
                .ok_or(Error::InvalidOperation("rule not found"))?;
            None
        }
        RuleOp::AddPortForwarding {
            public_ip,
            protocol,
            public_port,
            private_port,
            guest_ip,
        } => {
            net.check_public_ip(public_ip)?;
            let id = net.next_rule_id();
            net.record.rules.add(Rule::PortForwarding(PortForwardingRule {
                id,
                public_ip,
                protocol,
                public_port,
                private_port,
                guest_ip,
            }));
            Some(id)
        }
        RuleOp::AddLoadBalancer {
            name,
            public_ip,
            algorithm,
            public_port,
            private_port,
            members,
        } => {
            net.check_public_ip(public_ip)?;
            let id = net.next_rule_id();
            net.record.rules.add(Rule::LoadBalancer(LoadBalancerRule {
                id,
                name,
                public_ip,
                algorithm,
                public_port,
                private_port,
                members,
            }));
            Some(id)
        }
        RuleOp::EnableStaticNat {
            public_ip,
            guest_ip,
        } => {
            net.check_public_ip(public_ip)?;
            if net.record.rules.static_nat(public_ip).is_some() {
                return Err(Error::InvalidOperation(
                    "static NAT already enabled for this IP",
                ));
            }
            net.record.rules.add(Rule::StaticNat(StaticNatRule {
                public_ip,
                guest_ip,
            }));
            None
        }
        RuleOp::DisableStaticNat { public_ip } => {
            net.record
                .rules
                .remove_static_nat(public_ip)
                .ok_or(Error::InvalidOperation("static NAT not enabled"))?;
            None
        }
        RuleOp::AddVpnUser { name } => {
            net.record.rules.add(Rule::VpnUser(VpnUser { name }));
            None
        }
        RuleOp::RemoveVpnUser { name } => {
            net.record
                .rules
                .remove_vpn_user(&name)
                .ok_or(Error::InvalidOperation("VPN user not found"))?;
            None
        }
    };

    net.save_record();
    apply(net, false);

    Ok(created)
}

fn push_rules(net: &mut Network, router_id: RouterId) {
    let version = net.record.rules.version;
    Debug::RulePush(router_id, version).log();

    tasks::rule_push(
        net.provisioner.clone(),
        router_id,
        net.record.rules.clone(),
        &net.tx.input,
    );
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn firewall(id: u64) -> Rule {
        Rule::Firewall(FirewallRule {
            id: RuleId(id),
            protocol: Protocol::Tcp,
            source_cidrs: vec!["0.0.0.0/0".parse().unwrap()],
            start_port: 22,
            end_port: 22,
        })
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let mut rules = RuleSet::default();
        assert_eq!(rules.version, 0);

        rules.add(firewall(1));
        rules.add(firewall(2));
        assert_eq!(rules.version, 2);

        assert!(rules.remove_by_id(RuleId(1)).is_some());
        assert_eq!(rules.version, 3);
        assert_eq!(rules.rules.len(), 1);

        // Removing an unknown rule must not bump the version.
        assert!(rules.remove_by_id(RuleId(99)).is_none());
        assert_eq!(rules.version, 3);
    }

    #[test]
    fn test_references_ip() {
        let ip: Ipv4Addr = "203.0.113.10".parse().unwrap();
        let other: Ipv4Addr = "203.0.113.11".parse().unwrap();

        let mut rules = RuleSet::default();
        assert!(!rules.references_ip(ip));

        rules.add(Rule::StaticNat(StaticNatRule {
            public_ip: ip,
            guest_ip: "10.1.1.10".parse().unwrap(),
        }));
        assert!(rules.references_ip(ip));
        assert!(!rules.references_ip(other));

        assert!(rules.remove_static_nat(ip).is_some());
        assert!(!rules.references_ip(ip));
    }

    #[test]
    fn test_static_nat_lookup() {
        let ip: Ipv4Addr = "203.0.113.10".parse().unwrap();
        let mut rules = RuleSet::default();
        rules.add(Rule::StaticNat(StaticNatRule {
            public_ip: ip,
            guest_ip: "10.1.1.10".parse().unwrap(),
        }));

        assert!(rules.static_nat(ip).is_some());
        assert!(rules.static_nat("203.0.113.99".parse().unwrap()).is_none());
    }
}
