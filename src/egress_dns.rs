//! Resolution of DNS names used in egress policies, with change notification.

use eyre::{Result, format_err};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap as Map;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::api::EgressNetworkPolicy;

/// Sleep used when no name is tracked (a new policy wakes the loop up).
const IDLE_WAIT: Duration = Duration::from_secs(30 * 60);

pub trait Resolver: Send + Sync + 'static {
    /// Resolve a name to its addresses.
    fn resolve(&self, name: &str) -> impl Future<Output = std::io::Result<Vec<IpAddr>>> + Send;

    /// Check that the resolver is usable at all.
    fn check(&self) -> Result<()>;
}

/// The host's resolver.
pub struct SystemResolver {
    resolv_conf: PathBuf,
}
impl SystemResolver {
    pub fn new() -> Self {
        Self {
            resolv_conf: "/etc/resolv.conf".into(),
        }
    }
}
impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}
impl Resolver for SystemResolver {
    async fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }

    fn check(&self) -> Result<()> {
        let path = &self.resolv_conf;
        let conf = std::fs::read_to_string(path)
            .map_err(|e| format_err!("failed to read {}: {e}", path.display()))?;

        let has_nameserver = (conf.lines())
            .map(|l| l.trim_start())
            .any(|l| l.starts_with("nameserver"));
        if !has_nameserver {
            return Err(format_err!("no nameserver in {}", path.display()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// refresh period of successfully resolved names
    #[serde(default = "defaults::ttl_secs")]
    pub ttl_secs: u64,
    /// retry period of failed resolutions
    #[serde(default = "defaults::retry_secs")]
    pub retry_secs: u64,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::ttl_secs(),
            retry_secs: defaults::retry_secs(),
        }
    }
}

mod defaults {
    pub fn ttl_secs() -> u64 {
        30 * 60
    }
    pub fn retry_secs() -> u64 {
        30
    }
}

/// Emitted when the addresses of a policy's DNS names changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressDnsUpdate {
    pub uid: String,
    pub namespace: String,
}

#[derive(Debug)]
struct DnsEntry {
    ips: Vec<IpAddr>,
    next_query: Instant,
    /// false until the first successful resolution
    resolved: bool,
}

#[derive(Debug)]
struct PolicyDns {
    namespace: String,
    names: Map<String, DnsEntry>,
}

pub struct EgressDns<R> {
    resolver: R,
    ttl: Duration,
    retry: Duration,
    policies: Mutex<Map<String, PolicyDns>>,
    added: Notify,
    updates: mpsc::Sender<EgressDnsUpdate>,
}

impl<R: Resolver> EgressDns<R> {
    pub fn new(resolver: R, cfg: &Config) -> (Arc<Self>, mpsc::Receiver<EgressDnsUpdate>) {
        let (tx, rx) = mpsc::channel(64);
        let dns = Self {
            resolver,
            ttl: Duration::from_secs(cfg.ttl_secs.max(1)),
            retry: Duration::from_secs(cfg.retry_secs.max(1)),
            policies: Mutex::new(Map::new()),
            added: Notify::new(),
            updates: tx,
        };
        (Arc::new(dns), rx)
    }

    /// Track the DNS names of a policy. Names already tracked keep their addresses.
    pub fn add(&self, policy: &EgressNetworkPolicy) {
        let Some(uid) = policy.uid() else {
            return;
        };

        let names: Vec<_> = policy.dns_names().map(String::from).collect();
        if names.is_empty() {
            self.delete(uid);
            return;
        }

        let namespace = policy.metadata.namespace.clone().unwrap_or_default();
        let now = Instant::now();

        let mut policies = self.policies.lock();
        let entry = policies.entry(uid.to_string()).or_insert_with(|| PolicyDns {
            namespace,
            names: Map::new(),
        });

        entry.names.retain(|name, _| names.contains(name));
        for name in names {
            entry.names.entry(name).or_insert_with(|| DnsEntry {
                ips: Vec::new(),
                next_query: now,
                resolved: false,
            });
        }
        drop(policies);

        self.added.notify_one();
    }

    pub fn delete(&self, uid: &str) {
        self.policies.lock().remove(uid);
    }

    /// Current addresses of `name` for the policy `uid`.
    pub fn get_ips(&self, uid: &str, name: &str) -> Vec<IpAddr> {
        let policies = self.policies.lock();
        (policies.get(uid))
            .and_then(|p| p.names.get(name))
            .map(|e| e.ips.clone())
            .unwrap_or_default()
    }

    /// True while a name of the policy `uid` never resolved.
    pub fn is_pending(&self, uid: &str) -> bool {
        let policies = self.policies.lock();
        (policies.get(uid)).is_some_and(|p| p.names.values().any(|e| !e.resolved))
    }

    pub fn check(&self) -> Result<()> {
        self.resolver.check()
    }

    /// Keep tracked names resolved, emitting updates, until `stop` is cancelled.
    pub async fn sync(&self, stop: CancellationToken) {
        info!("egress DNS sync started");
        loop {
            let wait = match self.next_query() {
                None => IDLE_WAIT,
                Some((at, uid)) => {
                    let now = Instant::now();
                    if at <= now {
                        if self.update(&uid).await {
                            let Some(namespace) = self.namespace_of(&uid) else {
                                continue;
                            };
                            let update = EgressDnsUpdate { uid, namespace };
                            if self.updates.send(update).await.is_err() {
                                info!("egress DNS updates receiver stopped");
                                return;
                            }
                        }
                        continue;
                    }
                    at - now
                }
            };

            tokio::select! {
                _ = stop.cancelled() => {
                    info!("egress DNS sync stopped");
                    return;
                }
                _ = self.added.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn next_query(&self) -> Option<(Instant, String)> {
        let policies = self.policies.lock();
        (policies.iter())
            .flat_map(|(uid, p)| p.names.values().map(move |e| (e.next_query, uid)))
            .min_by_key(|(at, _)| *at)
            .map(|(at, uid)| (at, uid.clone()))
    }

    fn namespace_of(&self, uid: &str) -> Option<String> {
        self.policies.lock().get(uid).map(|p| p.namespace.clone())
    }

    /// Resolve the due names of a policy. Returns true if any address changed, or a name
    /// resolved for the first time.
    pub async fn update(&self, uid: &str) -> bool {
        let now = Instant::now();
        let due: Vec<String> = {
            let policies = self.policies.lock();
            let Some(p) = policies.get(uid) else {
                return false;
            };
            (p.names.iter())
                .filter(|(_, e)| e.next_query <= now)
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut results = Vec::with_capacity(due.len());
        for name in due {
            let result = self.resolver.resolve(&name).await;
            results.push((name, result));
        }

        let now = Instant::now();
        let mut changed = false;

        let mut policies = self.policies.lock();
        let Some(p) = policies.get_mut(uid) else {
            return false; // deleted while resolving
        };

        for (name, result) in results {
            let Some(entry) = p.names.get_mut(&name) else {
                continue;
            };
            match result {
                Ok(mut ips) => {
                    ips.sort();
                    ips.dedup();
                    if ips != entry.ips || !entry.resolved {
                        debug!("egress DNS: {name} resolved to {ips:?}");
                        changed = true;
                        entry.ips = ips;
                        entry.resolved = true;
                    }
                    entry.next_query = now + self.ttl;
                }
                Err(e) => {
                    warn!("egress DNS: failed to resolve {name}: {e}");
                    entry.next_query = now + self.retry;
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;

    struct FakeResolver {
        answers: Mutex<Map<String, io::Result<Vec<IpAddr>>>>,
    }
    impl FakeResolver {
        fn new() -> Self {
            Self {
                answers: Mutex::new(Map::new()),
            }
        }
        fn set(&self, name: &str, ips: &[&str]) {
            let ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
            self.answers.lock().insert(name.into(), Ok(ips));
        }
        fn fail(&self, name: &str) {
            let err = io::Error::new(io::ErrorKind::Other, "SERVFAIL");
            self.answers.lock().insert(name.into(), Err(err));
        }
    }
    impl Resolver for FakeResolver {
        async fn resolve(&self, name: &str) -> io::Result<Vec<IpAddr>> {
            match self.answers.lock().get(name) {
                Some(Ok(ips)) => Ok(ips.clone()),
                Some(Err(e)) => Err(io::Error::new(e.kind(), e.to_string())),
                None => Err(io::Error::new(io::ErrorKind::NotFound, name.to_string())),
            }
        }
        fn check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn policy(uid: &str, names: &[&str]) -> EgressNetworkPolicy {
        let egress: Vec<_> = (names.iter())
            .map(|name| json!({"type": "Allow", "to": {"dnsName": name}}))
            .collect();
        serde_json::from_value(json!({
            "metadata": {"name": "default", "namespace": "ns1", "uid": uid},
            "spec": {"egress": egress},
        }))
        .unwrap()
    }

    fn ips(ips: &[&str]) -> Vec<IpAddr> {
        ips.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_update() {
        let (dns, _rx) = EgressDns::new(FakeResolver::new(), &Config::default());
        dns.resolver.set("a.example.com", &["1.1.1.2", "1.1.1.1", "1.1.1.1"]);

        dns.add(&policy("u1", &["a.example.com"]));
        assert!(dns.get_ips("u1", "a.example.com").is_empty());

        assert!(dns.update("u1").await);
        assert_eq!(dns.get_ips("u1", "a.example.com"), ips(&["1.1.1.1", "1.1.1.2"]));

        // not due anymore
        assert!(!dns.update("u1").await);
        let (at, uid) = dns.next_query().unwrap();
        assert_eq!(uid, "u1");
        assert!(at > Instant::now());
    }

    #[tokio::test]
    async fn test_failure_keeps_addresses() {
        let (dns, _rx) = EgressDns::new(FakeResolver::new(), &Config::default());
        dns.resolver.set("a.example.com", &["1.1.1.1"]);
        dns.add(&policy("u1", &["a.example.com"]));
        assert!(dns.update("u1").await);

        // force a new query
        dns.policies.lock().get_mut("u1").unwrap().names.get_mut("a.example.com").unwrap().next_query =
            Instant::now();
        dns.resolver.fail("a.example.com");

        assert!(!dns.update("u1").await);
        assert_eq!(dns.get_ips("u1", "a.example.com"), ips(&["1.1.1.1"]));
    }

    #[tokio::test]
    async fn test_pending_until_first_resolution() {
        let (dns, _rx) = EgressDns::new(FakeResolver::new(), &Config::default());
        dns.resolver.set("empty.example.com", &[]);
        dns.resolver.fail("down.example.com");

        assert!(!dns.is_pending("u1"));

        dns.add(&policy("u1", &["empty.example.com", "down.example.com"]));
        assert!(dns.is_pending("u1"));

        // an empty answer is a resolution
        assert!(dns.update("u1").await);
        assert!(dns.get_ips("u1", "empty.example.com").is_empty());
        assert!(dns.is_pending("u1"));

        dns.policies.lock().get_mut("u1").unwrap().names.get_mut("down.example.com").unwrap().next_query =
            Instant::now();
        dns.resolver.set("down.example.com", &["3.3.3.3"]);
        assert!(dns.update("u1").await);
        assert!(!dns.is_pending("u1"));

        // a later failure keeps the name resolved
        dns.policies.lock().get_mut("u1").unwrap().names.get_mut("down.example.com").unwrap().next_query =
            Instant::now();
        dns.resolver.fail("down.example.com");
        assert!(!dns.update("u1").await);
        assert!(!dns.is_pending("u1"));
    }

    #[tokio::test]
    async fn test_zero_periods_are_clamped() {
        let cfg = Config {
            ttl_secs: 0,
            retry_secs: 0,
        };
        let (dns, _rx) = EgressDns::new(FakeResolver::new(), &cfg);
        dns.resolver.set("a.example.com", &["1.1.1.1"]);
        dns.resolver.fail("b.example.com");
        dns.add(&policy("u1", &["a.example.com", "b.example.com"]));

        assert!(dns.update("u1").await);
        let (at, _) = dns.next_query().unwrap();
        assert!(at >= Instant::now() + Duration::from_millis(500));
        assert!(!dns.update("u1").await);
    }

    #[tokio::test]
    async fn test_add_and_delete() {
        let (dns, _rx) = EgressDns::new(FakeResolver::new(), &Config::default());
        dns.resolver.set("a.example.com", &["1.1.1.1"]);
        dns.resolver.set("b.example.com", &["2.2.2.2"]);

        dns.add(&policy("u1", &["a.example.com", "b.example.com"]));
        assert!(dns.update("u1").await);

        // re-adding keeps resolved addresses and forgets removed names
        dns.add(&policy("u1", &["a.example.com"]));
        assert_eq!(dns.get_ips("u1", "a.example.com"), ips(&["1.1.1.1"]));
        assert!(dns.get_ips("u1", "b.example.com").is_empty());

        // no more names
        dns.add(&policy("u1", &[]));
        assert!(dns.next_query().is_none());

        dns.add(&policy("u1", &["a.example.com"]));
        dns.delete("u1");
        assert!(dns.next_query().is_none());
    }

    #[tokio::test]
    async fn test_sync_emits_updates() {
        let (dns, mut rx) = EgressDns::new(FakeResolver::new(), &Config::default());
        dns.resolver.set("a.example.com", &["1.1.1.1"]);

        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let dns = dns.clone();
            let stop = stop.clone();
            async move { dns.sync(stop).await }
        });

        dns.add(&policy("u1", &["a.example.com"]));

        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            update,
            EgressDnsUpdate {
                uid: "u1".into(),
                namespace: "ns1".into()
            }
        );

        stop.cancel();
        task.await.unwrap();
    }
}
