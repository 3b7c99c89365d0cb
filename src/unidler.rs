//! Unidling: catch traffic to idled services, ask for their pods back, then let the traffic through.

use eyre::Result;
use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use log::{debug, error, info};
use std::collections::BTreeMap as Map;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::api::{Idler, NEED_PODS_REASON, want_idle_patch};
use crate::keys::ServicePortName;

pub mod holder;
pub mod iptables;
#[cfg(target_os = "linux")]
pub mod nfqueue;
pub mod proxy;
pub mod socket;

/// Requests the pods of an idled service back.
pub trait NeedPodsSignaler: Send + Sync + 'static {
    fn need_pods(&self, service: &ServicePortName) -> impl Future<Output = Result<()>> + Send;
}

/// Ready backends of each service port.
pub type LoadBalancer = Map<ServicePortName, Vec<SocketAddr>>;

pub fn backends(lb: &watch::Receiver<LoadBalancer>, name: &ServicePortName) -> Vec<SocketAddr> {
    lb.borrow().get(name).cloned().unwrap_or_default()
}

pub fn has_endpoints(lb: &watch::Receiver<LoadBalancer>, name: &ServicePortName) -> bool {
    lb.borrow().get(name).is_some_and(|b| !b.is_empty())
}

/// Signal in the background. Failures are logged only: held traffic times out on its own.
pub fn spawn_need_pods<S: NeedPodsSignaler>(signaler: &Arc<S>, service: &ServicePortName) {
    let signaler = signaler.clone();
    let service = service.clone();
    tokio::spawn(async move {
        info!("service-port {service} needs pods");
        if let Err(e) = signaler.need_pods(&service).await {
            error!("failed to signal that {service} needs pods: {e}");
        }
    });
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interception {
    /// netfilter queue when available, sockets otherwise
    #[default]
    Auto,
    Socket,
    Queue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalerKind {
    #[default]
    Event,
    Idler,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Address of the portal sockets.
    #[serde(default = "defaults::bind_address")]
    pub bind_address: IpAddr,
    #[serde(default)]
    pub interception: Interception,
    /// netfilter queue number
    #[serde(default)]
    pub queue_num: u16,
    /// Connections held per service port; the oldest is closed when full.
    #[serde(default = "defaults::max_held_connections")]
    pub max_held_connections: usize,
    /// How long held traffic waits for endpoints.
    #[serde(default = "defaults::need_pods_wait_timeout_secs")]
    pub need_pods_wait_timeout_secs: u64,
    #[serde(default)]
    pub signaler: SignalerKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: defaults::bind_address(),
            interception: Interception::default(),
            queue_num: 0,
            max_held_connections: defaults::max_held_connections(),
            need_pods_wait_timeout_secs: defaults::need_pods_wait_timeout_secs(),
            signaler: SignalerKind::default(),
        }
    }
}

impl Config {
    pub fn need_pods_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.need_pods_wait_timeout_secs.max(1))
    }
}

mod defaults {
    use super::*;

    pub fn bind_address() -> IpAddr {
        Ipv4Addr::UNSPECIFIED.into()
    }
    pub fn max_held_connections() -> usize {
        16
    }
    pub fn need_pods_wait_timeout_secs() -> u64 {
        30
    }
}

// ------------------------------------------------------------------------
// signalers

/// Emits a `NeedPods` event on the service; the idling controller reacts to it.
pub struct EventSignaler {
    client: kube::Client,
    node_name: String,
}

impl EventSignaler {
    pub fn new(client: kube::Client, node_name: String) -> Self {
        Self { client, node_name }
    }
}

pub fn need_pods_event(service: &ServicePortName, host: &str, nanos: u128) -> core::Event {
    core::Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{nanos:x}", service.name())),
            namespace: Some(service.namespace().to_string()),
            ..Default::default()
        },
        involved_object: core::ObjectReference {
            api_version: Some("v1".into()),
            kind: Some("Service".into()),
            namespace: Some(service.namespace().to_string()),
            name: Some(service.name().to_string()),
            ..Default::default()
        },
        reason: Some(NEED_PODS_REASON.into()),
        message: Some(format!(
            "The service-port {}:{} needs pods.",
            service.name(),
            service.port
        )),
        type_: Some("Normal".into()),
        count: Some(1),
        source: Some(core::EventSource {
            component: Some("sdn-proxy".into()),
            host: Some(host.to_string()),
        }),
        ..Default::default()
    }
}

impl NeedPodsSignaler for EventSignaler {
    async fn need_pods(&self, service: &ServicePortName) -> Result<()> {
        let nanos = (std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH))
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let event = need_pods_event(service, &self.node_name, nanos);

        let api: Api<core::Event> = Api::namespaced(self.client.clone(), service.namespace());
        api.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}

/// Access to Idler resources.
pub trait IdlerClient: Send + Sync + 'static {
    fn list_idlers(&self, namespace: &str) -> impl Future<Output = Result<Vec<Idler>>> + Send;
    /// Apply a JSON patch (RFC 6902) given as raw bytes.
    fn patch_idler(
        &self,
        namespace: &str,
        name: &str,
        patch: &'static str,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl IdlerClient for kube::Client {
    async fn list_idlers(&self, namespace: &str) -> Result<Vec<Idler>> {
        let api: Api<Idler> = Api::namespaced(self.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_idler(&self, namespace: &str, name: &str, patch: &'static str) -> Result<()> {
        // sent as-is: the Idler controller expects these exact bytes
        let api: Api<Idler> = Api::namespaced(self.clone(), namespace);
        let url = format!("{}/{name}", api.resource_url());
        let req = http::Request::patch(url)
            .header(http::header::CONTENT_TYPE, "application/json-patch+json")
            .body(patch.as_bytes().to_vec())?;
        let _: Idler = self.request(req).await?;
        Ok(())
    }
}

/// Unidles the Idlers triggered by the service.
pub struct IdlerSignaler<C> {
    client: C,
}

impl<C: IdlerClient> IdlerSignaler<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: IdlerClient> NeedPodsSignaler for IdlerSignaler<C> {
    async fn need_pods(&self, service: &ServicePortName) -> Result<()> {
        let ns = service.namespace();
        let idlers = self.client.list_idlers(ns).await?;

        let mut result = Ok(());
        let mut found = false;
        for idler in idlers.iter().filter(|i| i.is_triggered_by(service.name())) {
            found = true;
            let name = idler.metadata.name.as_deref().unwrap_or_default();
            if !idler.spec.want_idle {
                debug!("idler {ns}/{name} is already unidling");
                continue;
            }
            info!("unidling idler {ns}/{name} for {service}");
            if let Err(e) = self.client.patch_idler(ns, name, want_idle_patch(false)).await {
                error!("failed to unidle idler {ns}/{name}: {e}");
                result = Err(e);
            }
        }
        if !found {
            debug!("no idler triggered by {service}");
        }
        result
    }
}

/// The signaler selected by configuration.
pub enum Signaler {
    Event(EventSignaler),
    Idler(IdlerSignaler<kube::Client>),
}

impl Signaler {
    pub fn new(kind: &SignalerKind, client: kube::Client, node_name: String) -> Self {
        match kind {
            SignalerKind::Event => Signaler::Event(EventSignaler::new(client, node_name)),
            SignalerKind::Idler => Signaler::Idler(IdlerSignaler::new(client)),
        }
    }
}

impl NeedPodsSignaler for Signaler {
    async fn need_pods(&self, service: &ServicePortName) -> Result<()> {
        match self {
            Signaler::Event(s) => s.need_pods(service).await,
            Signaler::Idler(s) => s.need_pods(service).await,
        }
    }
}
