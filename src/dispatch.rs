//! Routes watch events to the proxy handlers, one object change at a time.

use k8s_openapi::api::core::v1 as core;
use log::{debug, info};

use crate::api::{EgressNetworkPolicy, NetNamespace};
use crate::egress_dns::Resolver;
use crate::kube_watch::Event;
use crate::memstore::{Change, Store};
use crate::osdn::OsdnProxy;
use crate::proxy::ProxyProvider;

/// Handlers of the SDN resources, on top of the service proxy ones.
pub trait SdnHandler: ProxyProvider {
    fn on_egress_policy_apply(&self, policy: &EgressNetworkPolicy);
    fn on_egress_policy_delete(&self, policy: &EgressNetworkPolicy);
    fn on_net_namespace_apply(&self, netns: &NetNamespace);
    fn on_net_namespace_delete(&self, netns: &NetNamespace);
}

impl<P: ProxyProvider, R: Resolver> SdnHandler for OsdnProxy<P, R> {
    fn on_egress_policy_apply(&self, policy: &EgressNetworkPolicy) {
        OsdnProxy::on_egress_policy_apply(self, policy)
    }
    fn on_egress_policy_delete(&self, policy: &EgressNetworkPolicy) {
        OsdnProxy::on_egress_policy_delete(self, policy)
    }
    fn on_net_namespace_apply(&self, netns: &NetNamespace) {
        OsdnProxy::on_net_namespace_apply(self, netns)
    }
    fn on_net_namespace_delete(&self, netns: &NetNamespace) {
        OsdnProxy::on_net_namespace_delete(self, netns)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    services: Store<core::Service>,
    endpoints: Store<core::Endpoints>,
    policies: Store<EgressNetworkPolicy>,
    netnamespaces: Store<NetNamespace>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch<H: SdnHandler>(&mut self, handler: &H, event: Event) {
        match event {
            Event::Service(e) => {
                for change in self.services.ingest(e) {
                    match change {
                        Change::Add(v) => handler.on_service_add(&v),
                        Change::Update(old, v) => handler.on_service_update(&old, &v),
                        Change::Delete(v) => handler.on_service_delete(&v),
                        Change::Synced => {
                            info!("services synced ({})", self.services.len());
                            handler.on_services_synced();
                        }
                    }
                }
            }
            Event::Endpoints(e) => {
                for change in self.endpoints.ingest(e) {
                    match change {
                        Change::Add(v) => handler.on_endpoints_add(&v),
                        Change::Update(old, v) => handler.on_endpoints_update(&old, &v),
                        Change::Delete(v) => handler.on_endpoints_delete(&v),
                        Change::Synced => {
                            info!("endpoints synced ({})", self.endpoints.len());
                            handler.on_endpoints_synced();
                        }
                    }
                }
            }
            Event::EgressNetworkPolicy(e) => {
                for change in self.policies.ingest(e) {
                    match change {
                        Change::Add(v) | Change::Update(_, v) => handler.on_egress_policy_apply(&v),
                        Change::Delete(v) => handler.on_egress_policy_delete(&v),
                        Change::Synced => debug!("egress network policies synced"),
                    }
                }
            }
            Event::NetNamespace(e) => {
                for change in self.netnamespaces.ingest(e) {
                    match change {
                        Change::Add(v) | Change::Update(_, v) => handler.on_net_namespace_apply(&v),
                        Change::Delete(v) => handler.on_net_namespace_delete(&v),
                        Change::Synced => debug!("net namespaces synced"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::watcher;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::future::Future;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().push(s.into());
        }
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    fn name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
        meta.name.as_deref().unwrap_or_default()
    }

    impl ProxyProvider for Recorder {
        fn on_service_add(&self, v: &core::Service) {
            self.push(format!("service add {}", name(&v.metadata)));
        }
        fn on_service_update(&self, _: &core::Service, v: &core::Service) {
            self.push(format!("service update {}", name(&v.metadata)));
        }
        fn on_service_delete(&self, v: &core::Service) {
            self.push(format!("service delete {}", name(&v.metadata)));
        }
        fn on_services_synced(&self) {
            self.push("services synced");
        }
        fn on_endpoints_add(&self, v: &core::Endpoints) {
            self.push(format!("endpoints add {}", name(&v.metadata)));
        }
        fn on_endpoints_update(&self, _: &core::Endpoints, v: &core::Endpoints) {
            self.push(format!("endpoints update {}", name(&v.metadata)));
        }
        fn on_endpoints_delete(&self, v: &core::Endpoints) {
            self.push(format!("endpoints delete {}", name(&v.metadata)));
        }
        fn on_endpoints_synced(&self) {
            self.push("endpoints synced");
        }
        fn sync(&self) {}
        fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send {
            async move { stop.cancelled().await }
        }
    }

    impl SdnHandler for Recorder {
        fn on_egress_policy_apply(&self, v: &EgressNetworkPolicy) {
            self.push(format!("policy apply {}", name(&v.metadata)));
        }
        fn on_egress_policy_delete(&self, v: &EgressNetworkPolicy) {
            self.push(format!("policy delete {}", name(&v.metadata)));
        }
        fn on_net_namespace_apply(&self, v: &NetNamespace) {
            self.push(format!("netns apply {}", name(&v.metadata)));
        }
        fn on_net_namespace_delete(&self, v: &NetNamespace) {
            self.push(format!("netns delete {}", name(&v.metadata)));
        }
    }

    fn endpoints(name: &str, version: &str) -> core::Endpoints {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": "ns1", "resourceVersion": version},
        }))
        .unwrap()
    }

    #[test]
    fn test_endpoints_changes() {
        let rec = Recorder::default();
        let mut d = Dispatcher::new();

        d.dispatch(&rec, Event::Endpoints(watcher::Event::Init));
        d.dispatch(&rec, Event::Endpoints(watcher::Event::InitApply(endpoints("web", "1"))));
        d.dispatch(&rec, Event::Endpoints(watcher::Event::InitDone));
        d.dispatch(&rec, Event::Endpoints(watcher::Event::Apply(endpoints("web", "2"))));
        d.dispatch(&rec, Event::Endpoints(watcher::Event::Delete(endpoints("web", "2"))));

        assert_eq!(
            rec.take(),
            [
                "endpoints add web",
                "endpoints synced",
                "endpoints update web",
                "endpoints delete web"
            ]
        );
    }

    #[test]
    fn test_sdn_changes() {
        let rec = Recorder::default();
        let mut d = Dispatcher::new();

        let netns: NetNamespace = serde_json::from_value(json!({
            "apiVersion": "network.openshift.io/v1",
            "kind": "NetNamespace",
            "metadata": {"name": "ns1", "resourceVersion": "1"},
            "netname": "ns1",
            "netid": 42,
        }))
        .unwrap();
        let policy: EgressNetworkPolicy = serde_json::from_value(json!({
            "apiVersion": "network.openshift.io/v1",
            "kind": "EgressNetworkPolicy",
            "metadata": {"name": "default", "namespace": "ns1", "uid": "p1", "resourceVersion": "1"},
            "spec": {"egress": []},
        }))
        .unwrap();

        d.dispatch(&rec, Event::NetNamespace(watcher::Event::Apply(netns.clone())));
        d.dispatch(&rec, Event::EgressNetworkPolicy(watcher::Event::Apply(policy.clone())));
        d.dispatch(&rec, Event::EgressNetworkPolicy(watcher::Event::Delete(policy)));
        d.dispatch(&rec, Event::NetNamespace(watcher::Event::Delete(netns)));

        assert_eq!(
            rec.take(),
            [
                "netns apply ns1",
                "policy apply default",
                "policy delete default",
                "netns delete ns1"
            ]
        );
    }
}
