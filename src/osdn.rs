//! Egress proxy filter: forwards to the base proxy only the endpoints that the namespace's egress
//! firewall lets through.

use cidr::IpCidr;
use eyre::{Result, format_err};
use itertools::Itertools;
use k8s_openapi::api::core::v1 as core;
use kube::api::{Api, ListParams};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap as Map;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ClusterNetwork, EgressNetworkPolicy, NetNamespace};
use crate::egress_dns::{EgressDns, EgressDnsUpdate, Resolver};
use crate::firewall::{self, Firewall, FirewallStatus};
use crate::netid::NetIds;
use crate::proxy::{ProxyProvider, ready_addresses};


/// Name of the authoritative ClusterNetwork.
pub const DEFAULT_CLUSTER_NETWORK: &str = "default";

/// Where the proxy reads the cluster configuration it needs at startup.
pub trait ClusterSource: Send + Sync {
    fn cluster_network(&self) -> impl Future<Output = Result<ClusterNetwork>> + Send;
    fn egress_network_policies(&self) -> impl Future<Output = Result<Vec<EgressNetworkPolicy>>> + Send;
}

impl ClusterSource for kube::Client {
    async fn cluster_network(&self) -> Result<ClusterNetwork> {
        let api: Api<ClusterNetwork> = Api::all(self.clone());
        Ok(api.get(DEFAULT_CLUSTER_NETWORK).await?)
    }

    async fn egress_network_policies(&self) -> Result<Vec<EgressNetworkPolicy>> {
        let api: Api<EgressNetworkPolicy> = Api::all(self.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Pod and service networks. Traffic to these never goes through the egress firewall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub cluster_networks: Vec<IpCidr>,
    pub service_network: IpCidr,
}

impl NetworkInfo {
    pub fn from_cluster_network(cn: &ClusterNetwork) -> Result<Self> {
        let mut cluster_networks = (cn.cluster_networks.iter())
            .map(|entry| firewall::parse_net(&entry.cidr))
            .collect::<Result<Vec<_>>>()?;

        if cluster_networks.is_empty() {
            let Some(network) = cn.network.as_deref() else {
                return Err(format_err!("ClusterNetwork has no cluster network"));
            };
            cluster_networks.push(firewall::parse_net(network)?);
        }

        let service_network = firewall::parse_net(&cn.service_network)
            .map_err(|e| format_err!("invalid service network: {e}"))?;

        Ok(Self {
            cluster_networks,
            service_network,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.service_network.contains(ip) || self.cluster_networks.iter().any(|net| net.contains(ip))
    }
}

/// An Endpoints object and whether the base proxy is kept from seeing it.
#[derive(Debug, Clone)]
pub struct ProxyEndpoints {
    pub endpoints: core::Endpoints,
    pub blocked: bool,
}

#[derive(Default)]
struct FirewallState {
    firewall: Firewall,
    /// by Endpoints UID
    endpoints: Map<String, ProxyEndpoints>,
    /// by policy UID
    policies: Map<String, EgressNetworkPolicy>,
}

pub struct OsdnProxy<P, R> {
    base: P,
    network: NetworkInfo,
    egress_dns: Arc<EgressDns<R>>,
    state: Mutex<FirewallState>,
    // never held while taking `state`
    ids: Mutex<NetIds>,
}

fn endpoints_uid(ep: &core::Endpoints) -> String {
    match &ep.metadata.uid {
        Some(uid) => uid.clone(),
        None => format!(
            "{}/{}",
            ep.metadata.namespace.as_deref().unwrap_or_default(),
            ep.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}

/// Whether any ready address of `ep` is outside the cluster and denied by its namespace's firewall.
pub fn endpoints_blocked(network: &NetworkInfo, firewall: &Firewall, ep: &core::Endpoints) -> bool {
    let ns = ep.metadata.namespace.as_deref().unwrap_or_default();
    if firewall.namespace(ns).is_none() {
        return false;
    }

    for addr in ready_addresses(ep) {
        let Ok(ip) = addr.ip.parse::<IpAddr>() else {
            continue;
        };
        if network.contains(&ip) {
            continue;
        }
        if firewall.blocks_ip(ns, &ip) {
            let name = ep.metadata.name.as_deref().unwrap_or_default();
            warn!("service {name:?} in namespace {ns:?} has an endpoint pointing to firewalled destination ({ip})");
            return true;
        }
    }
    false
}

impl<P: ProxyProvider, R: Resolver> OsdnProxy<P, R> {
    /// Load the network configuration and the existing policies, then wrap `base`.
    pub async fn start<S: ClusterSource>(
        base: P,
        source: &S,
        egress_dns: Arc<EgressDns<R>>,
    ) -> Result<Self> {
        info!("starting egress proxy filter");

        let cn = (source.cluster_network().await)
            .map_err(|e| format_err!("could not get ClusterNetwork resource: {e}"))?;
        let network = NetworkInfo::from_cluster_network(&cn)?;
        info!(
            "cluster networks: {}, service network: {}",
            network.cluster_networks.iter().join(", "),
            network.service_network
        );

        let policies = (source.egress_network_policies().await)
            .map_err(|e| format_err!("could not get EgressNetworkPolicies: {e}"))?;

        let proxy = Self {
            base,
            network,
            egress_dns,
            state: Mutex::new(FirewallState::default()),
            ids: Mutex::new(NetIds::new()),
        };

        // resolve the existing DNS rules before they are first compiled
        for policy in &policies {
            proxy.egress_dns.add(policy);
            if let Some(uid) = policy.uid() {
                proxy.egress_dns.update(uid).await;
            }
        }

        // network IDs are not known yet; they are checked again when NetNamespaces arrive
        let mut state = proxy.state.lock();
        for policy in policies {
            proxy.update_policy_locked(&mut state, &policy);
            if let Some(uid) = policy.uid() {
                state.policies.insert(uid.to_string(), policy.clone());
            }
        }
        drop(state);

        Ok(proxy)
    }

    pub fn base(&self) -> &P {
        &self.base
    }

    pub fn network(&self) -> &NetworkInfo {
        &self.network
    }

    pub fn firewall_status(&self, namespace: &str) -> FirewallStatus {
        self.state.lock().firewall.status(namespace)
    }

    /// Whether the Endpoints object with this UID is currently kept from the base proxy.
    pub fn is_blocked(&self, uid: &str) -> Option<bool> {
        self.state.lock().endpoints.get(uid).map(|pe| pe.blocked)
    }

    pub fn endpoints_blocked(&self, ep: &core::Endpoints) -> bool {
        endpoints_blocked(&self.network, &self.state.lock().firewall, ep)
    }

    pub fn on_egress_policy_apply(&self, policy: &EgressNetworkPolicy) {
        if let Some(uid) = policy.uid() {
            (self.state.lock().policies).insert(uid.to_string(), policy.clone());
        }
        self.update_egress_network_policy(policy);
    }

    pub fn on_egress_policy_delete(&self, policy: &EgressNetworkPolicy) {
        let Some(uid) = policy.uid() else {
            return;
        };
        self.state.lock().policies.remove(uid);
        self.egress_dns.delete(uid);

        let mut deleted = policy.clone();
        deleted.spec.egress.clear();
        self.update_egress_network_policy(&deleted);
    }

    pub fn on_net_namespace_apply(&self, netns: &NetNamespace) {
        let changed = self.ids.lock().apply(netns);
        if changed {
            self.reapply_policies(&netns_name(netns));
        }
    }

    pub fn on_net_namespace_delete(&self, netns: &NetNamespace) {
        self.ids.lock().delete(netns);
    }

    /// Recompile the policies of a namespace, for instance after its network ID changed.
    fn reapply_policies(&self, namespace: &str) {
        let policies: Vec<_> = (self.state.lock().policies.values())
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect();

        for policy in policies {
            self.update_egress_network_policy(&policy);
        }
    }

    fn update_egress_network_policy(&self, policy: &EgressNetworkPolicy) {
        let ns = policy.metadata.namespace.as_deref().unwrap_or_default();
        let name = policy.metadata.name.as_deref().unwrap_or_default();

        // removing rules never depends on the namespace's network
        let global = if policy.spec.egress.is_empty() {
            false
        } else {
            let is_global = self.ids.lock().is_global(ns);
            match is_global {
                Ok(v) => v,
                Err(e) => {
                    error!("could not find network ID for EgressNetworkPolicy {ns}:{name}: {e}");
                    return;
                }
            }
        };

        if global {
            error!("EgressNetworkPolicy in global network namespace is not allowed ({ns}:{name}); ignoring firewall rules");
            // drop what may have been applied before the namespace joined the global network
            if let Some(uid) = policy.uid() {
                self.egress_dns.delete(uid);
            }
            let mut ignored = policy.clone();
            ignored.spec.egress.clear();
            self.update_policy_locked(&mut self.state.lock(), &ignored);
            return;
        }

        self.egress_dns.add(policy);

        let mut state = self.state.lock();
        self.update_policy_locked(&mut state, policy);
    }

    fn update_policy_locked(&self, state: &mut FirewallState, policy: &EgressNetworkPolicy) {
        let Some(uid) = policy.uid() else {
            return;
        };
        let ns = policy.metadata.namespace.as_deref().unwrap_or_default();

        let compiled = firewall::compile(policy, |name| self.egress_dns.get_ips(uid, name));

        let mut items = compiled.items;
        let mut dns_failed = false;
        if compiled.uses_dns {
            if let Err(e) = self.egress_dns.check() {
                error!("DNS resolver unusable for EgressNetworkPolicy {ns}:{uid}, dropping all traffic: {e}");
                items = firewall::deny_all();
                dns_failed = true;
            } else if self.egress_dns.is_pending(uid) {
                // recompiled by the DNS update of the first resolution
                info!("EgressNetworkPolicy {ns}:{uid} waits for its DNS names, dropping all traffic");
                items = firewall::deny_all();
            }
        }

        debug!("EgressNetworkPolicy {ns}:{uid}: {} firewall rules", items.len());

        if let Err(e) = state.firewall.set_policy(ns, uid, items) {
            error!("{e}");
        }
        if dns_failed {
            state.firewall.block_all(ns);
        }

        self.reevaluate_namespace(state, ns);
    }

    /// Forward the blocked state transitions of a namespace's endpoints to the base proxy.
    fn reevaluate_namespace(&self, state: &mut FirewallState, ns: &str) {
        let FirewallState {
            firewall,
            endpoints,
            ..
        } = state;

        for pe in endpoints.values_mut() {
            if pe.endpoints.metadata.namespace.as_deref() != Some(ns) {
                continue;
            }
            let blocked = endpoints_blocked(&self.network, firewall, &pe.endpoints);
            match (pe.blocked, blocked) {
                (true, false) => self.base.on_endpoints_add(&pe.endpoints),
                (false, true) => self.base.on_endpoints_delete(&pe.endpoints),
                _ => {}
            }
            pe.blocked = blocked;
        }
    }

    /// Apply one DNS change, refreshing the policy cache from `source` if the policy is unknown.
    pub async fn on_dns_update<S: ClusterSource>(&self, update: &EgressDnsUpdate, source: &S) {
        let cached = self.state.lock().policies.get(&update.uid).cloned();

        let policy = match cached {
            Some(policy) => policy,
            None => {
                let policies = match source.egress_network_policies().await {
                    Ok(v) => v,
                    Err(e) => {
                        error!("could not get EgressNetworkPolicies: {e}");
                        return;
                    }
                };

                let mut state = self.state.lock();
                for policy in policies {
                    if let Some(uid) = policy.uid() {
                        state.policies.insert(uid.to_string(), policy.clone());
                    }
                }
                match state.policies.get(&update.uid) {
                    Some(policy) => policy.clone(),
                    None => {
                        debug!("DNS update for unknown EgressNetworkPolicy {}", update.uid);
                        return;
                    }
                }
            }
        };

        info!(
            "DNS addresses of EgressNetworkPolicy {}:{} changed",
            update.namespace, update.uid
        );
        self.update_egress_network_policy(&policy);
    }

    /// Apply DNS changes until `stop` is cancelled or the updates stream ends.
    pub async fn run_dns_updates<S: ClusterSource>(
        &self,
        mut updates: mpsc::Receiver<EgressDnsUpdate>,
        source: &S,
        stop: CancellationToken,
    ) {
        loop {
            let update = tokio::select! {
                _ = stop.cancelled() => return,
                update = updates.recv() => update,
            };
            let Some(update) = update else {
                info!("egress DNS updates stream closed");
                return;
            };
            self.on_dns_update(&update, source).await;
        }
    }
}

fn netns_name(netns: &NetNamespace) -> String {
    if netns.netname.is_empty() {
        netns.metadata.name.clone().unwrap_or_default()
    } else {
        netns.netname.clone()
    }
}

impl<P: ProxyProvider, R: Resolver> ProxyProvider for OsdnProxy<P, R> {
    fn on_service_add(&self, service: &core::Service) {
        self.base.on_service_add(service);
    }

    fn on_service_update(&self, old: &core::Service, service: &core::Service) {
        self.base.on_service_update(old, service);
    }

    fn on_service_delete(&self, service: &core::Service) {
        self.base.on_service_delete(service);
    }

    fn on_services_synced(&self) {
        self.base.on_services_synced();
    }

    fn on_endpoints_add(&self, ep: &core::Endpoints) {
        let mut state = self.state.lock();

        let blocked = endpoints_blocked(&self.network, &state.firewall, ep);
        state.endpoints.insert(
            endpoints_uid(ep),
            ProxyEndpoints {
                endpoints: ep.clone(),
                blocked,
            },
        );

        if !blocked {
            self.base.on_endpoints_add(ep);
        }
    }

    fn on_endpoints_update(&self, old: &core::Endpoints, ep: &core::Endpoints) {
        let mut state = self.state.lock();

        let blocked = endpoints_blocked(&self.network, &state.firewall, ep);
        let was_blocked = (state.endpoints.get(&endpoints_uid(ep))).is_none_or(|pe| pe.blocked);

        state.endpoints.insert(
            endpoints_uid(ep),
            ProxyEndpoints {
                endpoints: ep.clone(),
                blocked,
            },
        );

        match (was_blocked, blocked) {
            (true, false) => self.base.on_endpoints_add(ep),
            (false, false) => self.base.on_endpoints_update(old, ep),
            (false, true) => self.base.on_endpoints_delete(old),
            (true, true) => {}
        }
    }

    fn on_endpoints_delete(&self, ep: &core::Endpoints) {
        let mut state = self.state.lock();

        if let Some(pe) = state.endpoints.remove(&endpoints_uid(ep)) {
            if !pe.blocked {
                self.base.on_endpoints_delete(ep);
            }
        }
    }

    fn on_endpoints_synced(&self) {
        self.base.on_endpoints_synced();
    }

    fn sync(&self) {
        self.base.sync();
    }

    fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send {
        self.base.sync_loop(stop)
    }
}
