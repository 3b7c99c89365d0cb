//! Per-namespace egress firewall rules compiled from EgressNetworkPolicy objects.

use cidr::{IpCidr, IpInet};
use eyre::{Result, format_err};
use log::{error, info, warn};
use std::collections::BTreeMap as Map;
use std::net::IpAddr;

use crate::api::{EgressNetworkPolicy, EgressNetworkPolicyRuleType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum RuleType {
    Allow,
    Deny,
}
impl From<EgressNetworkPolicyRuleType> for RuleType {
    fn from(v: EgressNetworkPolicyRuleType) -> Self {
        match v {
            EgressNetworkPolicyRuleType::Allow => RuleType::Allow,
            EgressNetworkPolicyRuleType::Deny => RuleType::Deny,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallItem {
    pub rule_type: RuleType,
    pub net: IpCidr,
}

/// Parse a CIDR selector. Host bits are accepted and masked, bare addresses are host routes.
pub fn parse_net(selector: &str) -> Result<IpCidr> {
    if selector.contains('/') {
        let inet: IpInet = (selector.parse()).map_err(|e| format_err!("invalid CIDR {selector:?}: {e}"))?;
        Ok(inet.network())
    } else {
        let ip: IpAddr = (selector.parse()).map_err(|e| format_err!("invalid address {selector:?}: {e}"))?;
        Ok(IpCidr::new_host(ip))
    }
}

/// Rules denying every destination.
pub fn deny_all() -> Vec<FirewallItem> {
    [IpAddr::from([0u8; 4]), IpAddr::from([0u8; 16])]
        .into_iter()
        .filter_map(|ip| IpCidr::new(ip, 0).ok())
        .map(|net| FirewallItem {
            rule_type: RuleType::Deny,
            net,
        })
        .collect()
}

/// Result of compiling a policy.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Compiled {
    pub items: Vec<FirewallItem>,
    pub uses_dns: bool,
}

/// Compile the egress rules of a policy, in order. `resolve` gives the current addresses of a DNS name.
///
/// Invalid rules are logged and skipped; the remaining rules still apply.
pub fn compile<F>(policy: &EgressNetworkPolicy, mut resolve: F) -> Compiled
where
    F: FnMut(&str) -> Vec<IpAddr>,
{
    let ns = policy.metadata.namespace.as_deref().unwrap_or_default();
    let name = policy.metadata.name.as_deref().unwrap_or_default();

    let mut compiled = Compiled::default();

    for rule in &policy.spec.egress {
        let rule_type = RuleType::from(rule.type_);

        if let Some(selector) = rule.to.cidr_selector.as_deref().filter(|s| !s.is_empty()) {
            let selector = if selector == "0.0.0.0/32" {
                warn!("correcting CIDRSelector '0.0.0.0/32' to '0.0.0.0/0' in EgressNetworkPolicy {ns}:{name}");
                "0.0.0.0/0"
            } else {
                selector
            };

            match parse_net(selector) {
                Ok(net) => compiled.items.push(FirewallItem { rule_type, net }),
                Err(e) => error!("EgressNetworkPolicy {ns}:{name}: {e}; skipping rule"),
            }
        } else if let Some(dns_name) = rule.to.dns_name.as_deref().filter(|s| !s.is_empty()) {
            compiled.uses_dns = true;
            for ip in resolve(dns_name) {
                compiled.items.push(FirewallItem {
                    rule_type,
                    net: IpCidr::new_host(ip),
                });
            }
        } else {
            // validation should have rejected this
            error!("EgressNetworkPolicy {ns}:{name}: invalid peer {:?}; skipping rule", rule.to);
        }
    }

    compiled
}

/// Firewall state of one namespace.
///
/// `active_policy` is set iff exactly one policy is registered, unless the namespace was
/// forced into blocking (see [`Firewall::block_all`]).
#[derive(Debug, Default)]
pub struct ProxyFirewallItem {
    namespace_firewalls: Map<String, Vec<FirewallItem>>,
    active_policy: Option<String>,
    dns_unavailable: bool,
}
impl ProxyFirewallItem {
    pub fn active_policy(&self) -> Option<&str> {
        self.active_policy.as_deref()
    }

    pub fn rules(&self, uid: &str) -> Option<&[FirewallItem]> {
        self.namespace_firewalls.get(uid).map(Vec::as_slice)
    }

    fn blocks_ip(&self, ip: &IpAddr) -> bool {
        let Some(active) = self.active_policy.as_ref() else {
            return true; // ambiguous: fail safe
        };
        for item in self.namespace_firewalls.get(active).into_iter().flatten() {
            if item.net.contains(ip) {
                return item.rule_type == RuleType::Deny;
            }
        }
        false
    }
}

/// Queryable firewall state of a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirewallStatus {
    /// no egress policy: nothing is blocked
    Unrestricted,
    /// exactly one policy, identified by its UID
    Active(String),
    /// more than one policy: all external traffic is blocked
    MultiplePolicies(Vec<String>),
    /// the policy uses DNS rules and the resolver is unusable: all external traffic is blocked
    DnsUnavailable(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("multiple egress policies in namespace {namespace:?} ({}); dropping all traffic", .uids.join(", "))]
pub struct MultiplePolicies {
    pub namespace: String,
    pub uids: Vec<String>,
}

/// The firewall rule store, keyed by namespace.
#[derive(Debug, Default)]
pub struct Firewall {
    namespaces: Map<String, ProxyFirewallItem>,
}
impl Firewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&self, namespace: &str) -> Option<&ProxyFirewallItem> {
        self.namespaces.get(namespace)
    }

    /// Replace the rules of policy `uid` in `namespace`. An empty rule list unregisters the policy.
    ///
    /// Rules are always replaced, never appended, so applying the same policy twice is a no-op.
    pub fn set_policy(
        &mut self,
        namespace: &str,
        uid: &str,
        items: Vec<FirewallItem>,
    ) -> Result<(), MultiplePolicies> {
        if items.is_empty() {
            let Some(ns_fw) = self.namespaces.get_mut(namespace) else {
                return Ok(());
            };
            ns_fw.namespace_firewalls.remove(uid);
        } else {
            let ns_fw = self.namespaces.entry(namespace.to_string()).or_default();
            ns_fw.namespace_firewalls.insert(uid.to_string(), items);
        }

        let Some(ns_fw) = self.namespaces.get_mut(namespace) else {
            return Ok(());
        };
        ns_fw.dns_unavailable = false;

        match ns_fw.namespace_firewalls.len() {
            0 => {
                self.namespaces.remove(namespace);
                Ok(())
            }
            1 => {
                let active = ns_fw.namespace_firewalls.keys().next().cloned();
                if ns_fw.active_policy != active {
                    info!("applied egress firewall policy {active:?} to namespace {namespace:?}");
                }
                ns_fw.active_policy = active;
                Ok(())
            }
            _ => {
                ns_fw.active_policy = None;
                Err(MultiplePolicies {
                    namespace: namespace.to_string(),
                    uids: ns_fw.namespace_firewalls.keys().cloned().collect(),
                })
            }
        }
    }

    /// Block all external traffic of a namespace until its policies are recompiled.
    pub fn block_all(&mut self, namespace: &str) {
        if let Some(ns_fw) = self.namespaces.get_mut(namespace) {
            ns_fw.active_policy = None;
            ns_fw.dns_unavailable = true;
        }
    }

    /// Whether traffic from `namespace` to `ip` is denied. Namespaces without policies block nothing.
    pub fn blocks_ip(&self, namespace: &str, ip: &IpAddr) -> bool {
        match self.namespaces.get(namespace) {
            None => false,
            Some(ns_fw) => ns_fw.blocks_ip(ip),
        }
    }

    pub fn status(&self, namespace: &str) -> FirewallStatus {
        let Some(ns_fw) = self.namespaces.get(namespace) else {
            return FirewallStatus::Unrestricted;
        };
        if let Some(active) = &ns_fw.active_policy {
            return FirewallStatus::Active(active.clone());
        }
        if ns_fw.dns_unavailable {
            let uid = ns_fw.namespace_firewalls.keys().next().cloned();
            return FirewallStatus::DnsUnavailable(uid.unwrap_or_default());
        }
        FirewallStatus::MultiplePolicies(ns_fw.namespace_firewalls.keys().cloned().collect())
    }
}
