//! Routes each service either to the main proxier or, while it is idled, to the unidling proxier.

use k8s_openapi::api::core::v1 as core;
use log::info;
use parking_lot::Mutex;
use std::collections::BTreeSet as Set;
use std::future::Future;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{BatchProvider, cluster_ip, endpoints_key, has_ready_addresses, service_key};
use crate::api::IDLED_AT_ANNOTATION;
use crate::keys;

/// An Endpoints object is idled when the idler annotated it and it has no ready address.
pub fn is_idled(endpoints: &core::Endpoints) -> bool {
    let annotated = (endpoints.metadata.annotations.as_ref())
        .is_some_and(|a| a.contains_key(IDLED_AT_ANNOTATION));
    annotated && !has_ready_addresses(endpoints)
}

/// Split endpoints between the main proxier and the unidling proxier.
pub fn partition<'a>(
    endpoints: &'a [core::Endpoints],
    using_userspace: &Set<keys::Object>,
) -> (Vec<&'a core::Endpoints>, Vec<&'a core::Endpoints>) {
    endpoints.iter().partition(|ep| {
        !endpoints_key(ep).is_some_and(|key| using_userspace.contains(&key))
    })
}

#[derive(Default)]
struct State {
    using_userspace: Set<keys::Object>,
    current_services: Vec<core::Service>,
}

pub struct HybridProxier<M, U> {
    main: M,
    unidling: U,
    sync_period: Duration,
    state: Mutex<State>,
}

impl<M: BatchProvider, U: BatchProvider> HybridProxier<M, U> {
    pub fn new(main: M, unidling: U, sync_period: Duration) -> Self {
        Self {
            main,
            unidling,
            sync_period,
            state: Mutex::new(State::default()),
        }
    }

    pub fn main(&self) -> &M {
        &self.main
    }

    pub fn unidling(&self) -> &U {
        &self.unidling
    }

    pub fn is_using_userspace(&self, service: &keys::Object) -> bool {
        self.state.lock().using_userspace.contains(service)
    }
}

impl<M: BatchProvider, U: BatchProvider> BatchProvider for HybridProxier<M, U> {
    fn on_endpoints_update(&self, endpoints: &[core::Endpoints]) {
        let (for_main, services) = {
            let mut state = self.state.lock();

            // always rebuilt from scratch
            let using_userspace: Set<_> = (endpoints.iter())
                .filter(|ep| is_idled(ep))
                .filter_map(endpoints_key)
                .collect();

            for key in using_userspace.difference(&state.using_userspace) {
                info!("service {key} is idled, switching to the unidling proxy");
            }
            for key in state.using_userspace.difference(&using_userspace) {
                info!("service {key} is not idled anymore, switching to the main proxy");
            }

            let (for_main, _) = partition(endpoints, &using_userspace);
            let for_main: Vec<_> = for_main.into_iter().cloned().collect();

            state.using_userspace = using_userspace;
            (for_main, state.current_services.clone())
        };

        // the unidling proxy needs every endpoint to know when to replay held traffic
        self.unidling.on_endpoints_update(endpoints);
        self.main.on_endpoints_update(&for_main);

        self.on_service_update(&services);
    }

    fn on_service_update(&self, services: &[core::Service]) {
        let (for_main, for_userspace) = {
            let mut state = self.state.lock();
            state.current_services = services.to_vec();

            let mut for_main = Vec::new();
            let mut for_userspace = Vec::new();

            for service in services {
                if cluster_ip(service).is_none() {
                    continue;
                }
                let Some(key) = service_key(service) else {
                    continue;
                };
                if state.using_userspace.contains(&key) {
                    for_userspace.push(service.clone());
                } else {
                    for_main.push(service.clone());
                }
            }
            (for_main, for_userspace)
        };

        self.main.on_service_update(&for_main);
        self.unidling.on_service_update(&for_userspace);
    }

    fn sync(&self) {
        self.main.sync();
        self.unidling.sync();
    }

    fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send {
        async move {
            tokio::join!(
                self.main.sync_loop(stop.clone()),
                self.unidling.sync_loop(stop.clone()),
                super::every(self.sync_period, &stop, || self.sync()),
            );
        }
    }
}
