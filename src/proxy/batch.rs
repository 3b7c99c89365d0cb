use k8s_openapi::api::core::v1 as core;
use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap as Map;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use super::{BatchProvider, ProxyProvider, endpoints_key, service_key};
use crate::keys;

#[derive(Default)]
struct Objects {
    services: Map<keys::Object, core::Service>,
    endpoints: Map<keys::Object, core::Endpoints>,
    services_synced: bool,
    endpoints_synced: bool,
}
impl Objects {
    fn synced(&self) -> bool {
        self.services_synced && self.endpoints_synced
    }
}

/// Adapts per-object callbacks to a [`BatchProvider`].
///
/// Nothing is forwarded until both services and endpoints reported synced; from then on, every
/// change forwards the complete current list of its kind.
pub struct Batcher<B> {
    inner: B,
    objects: Mutex<Objects>,
}

impl<B: BatchProvider> Batcher<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            objects: Mutex::new(Objects::default()),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn update_services<F>(&self, f: F)
    where
        F: FnOnce(&mut Map<keys::Object, core::Service>),
    {
        let mut objects = self.objects.lock();
        f(&mut objects.services);
        if !objects.synced() {
            return;
        }
        let services: Vec<_> = objects.services.values().cloned().collect();
        self.inner.on_service_update(&services);
    }

    fn update_endpoints<F>(&self, f: F)
    where
        F: FnOnce(&mut Map<keys::Object, core::Endpoints>),
    {
        let mut objects = self.objects.lock();
        f(&mut objects.endpoints);
        if !objects.synced() {
            return;
        }
        let endpoints: Vec<_> = objects.endpoints.values().cloned().collect();
        self.inner.on_endpoints_update(&endpoints);
    }

    fn mark_synced<F>(&self, f: F)
    where
        F: FnOnce(&mut Objects),
    {
        let mut objects = self.objects.lock();
        let was_synced = objects.synced();
        f(&mut *objects);
        if was_synced || !objects.synced() {
            return;
        }

        debug!(
            "initial sync: {} services, {} endpoints",
            objects.services.len(),
            objects.endpoints.len()
        );
        let services: Vec<_> = objects.services.values().cloned().collect();
        let endpoints: Vec<_> = objects.endpoints.values().cloned().collect();
        self.inner.on_service_update(&services);
        self.inner.on_endpoints_update(&endpoints);
    }
}

impl<B: BatchProvider> ProxyProvider for Batcher<B> {
    fn on_service_add(&self, service: &core::Service) {
        let Some(key) = service_key(service) else {
            return;
        };
        self.update_services(|services| {
            services.insert(key, service.clone());
        });
    }

    fn on_service_update(&self, _old: &core::Service, service: &core::Service) {
        self.on_service_add(service);
    }

    fn on_service_delete(&self, service: &core::Service) {
        let Some(key) = service_key(service) else {
            return;
        };
        self.update_services(|services| {
            services.remove(&key);
        });
    }

    fn on_services_synced(&self) {
        self.mark_synced(|objects| objects.services_synced = true);
    }

    fn on_endpoints_add(&self, endpoints: &core::Endpoints) {
        let Some(key) = endpoints_key(endpoints) else {
            return;
        };
        self.update_endpoints(|all| {
            all.insert(key, endpoints.clone());
        });
    }

    fn on_endpoints_update(&self, _old: &core::Endpoints, endpoints: &core::Endpoints) {
        self.on_endpoints_add(endpoints);
    }

    fn on_endpoints_delete(&self, endpoints: &core::Endpoints) {
        let Some(key) = endpoints_key(endpoints) else {
            return;
        };
        self.update_endpoints(|all| {
            all.remove(&key);
        });
    }

    fn on_endpoints_synced(&self) {
        self.mark_synced(|objects| objects.endpoints_synced = true);
    }

    fn sync(&self) {
        self.inner.sync();
    }

    fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send {
        self.inner.sync_loop(stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        services: Mutex<Vec<Vec<String>>>,
        endpoints: Mutex<Vec<Vec<String>>>,
    }

    fn names<K: kube::Resource>(objs: &[K]) -> Vec<String> {
        objs.iter().map(|o| o.meta().name.clone().unwrap()).collect()
    }

    impl BatchProvider for Recorder {
        fn on_service_update(&self, services: &[core::Service]) {
            self.services.lock().push(names(services));
        }
        fn on_endpoints_update(&self, endpoints: &[core::Endpoints]) {
            self.endpoints.lock().push(names(endpoints));
        }
        fn sync(&self) {}
        async fn sync_loop(&self, _stop: CancellationToken) {}
    }

    fn service(name: &str) -> core::Service {
        serde_json::from_value(json!({"metadata": {"name": name, "namespace": "ns1"}})).unwrap()
    }

    fn endpoints(name: &str) -> core::Endpoints {
        serde_json::from_value(json!({"metadata": {"name": name, "namespace": "ns1"}})).unwrap()
    }

    #[test]
    fn test_batches() {
        let batcher = Batcher::new(Recorder::default());

        batcher.on_service_add(&service("a"));
        batcher.on_endpoints_add(&endpoints("a"));
        batcher.on_services_synced();
        assert!(batcher.inner().services.lock().is_empty());

        batcher.on_endpoints_synced();
        assert_eq!(*batcher.inner().services.lock(), vec![vec!["a".to_string()]]);
        assert_eq!(*batcher.inner().endpoints.lock(), vec![vec!["a".to_string()]]);

        batcher.on_service_add(&service("b"));
        batcher.on_service_delete(&service("a"));
        batcher.on_endpoints_update(&endpoints("a"), &endpoints("a"));

        let services = batcher.inner().services.lock().clone();
        assert_eq!(services[1], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(services[2], vec!["b".to_string()]);
        assert_eq!(batcher.inner().endpoints.lock().len(), 2);
    }
}
