//! Service proxy capabilities, as implemented by the egress filter, the hybrid proxier and its
//! children.

use k8s_openapi::api::core::v1 as core;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

use crate::keys;

pub mod batch;
pub mod exec;
pub mod hybrid;

/// Per-object proxy callbacks.
///
/// Callers must deliver the events of a given object in resource-version order; implementations
/// neither reorder nor deduplicate them.
pub trait ProxyProvider: Send + Sync {
    fn on_service_add(&self, service: &core::Service);
    fn on_service_update(&self, old: &core::Service, service: &core::Service);
    fn on_service_delete(&self, service: &core::Service);
    fn on_services_synced(&self);

    fn on_endpoints_add(&self, endpoints: &core::Endpoints);
    fn on_endpoints_update(&self, old: &core::Endpoints, endpoints: &core::Endpoints);
    fn on_endpoints_delete(&self, endpoints: &core::Endpoints);
    fn on_endpoints_synced(&self);

    /// Request a synchronization of the proxy rules.
    fn sync(&self);

    /// Run the proxy until `stop` is cancelled.
    fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send;
}

/// Full-list proxy callbacks: every call carries the complete current set.
pub trait BatchProvider: Send + Sync {
    fn on_service_update(&self, services: &[core::Service]);
    fn on_endpoints_update(&self, endpoints: &[core::Endpoints]);

    /// Request a synchronization of the proxy rules.
    fn sync(&self);

    /// Run the proxy until `stop` is cancelled.
    fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send;
}

/// Call `f` every `period` until `stop` is cancelled.
pub async fn every<F: FnMut()>(period: Duration, stop: &CancellationToken, mut f: F) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => f(),
        }
    }
}

pub fn service_key(service: &core::Service) -> Option<keys::Object> {
    keys::Object::try_from(&service.metadata).ok()
}

pub fn endpoints_key(endpoints: &core::Endpoints) -> Option<keys::Object> {
    keys::Object::try_from(&endpoints.metadata).ok()
}

/// The cluster IP of a service, if one is assigned (headless services have none).
pub fn cluster_ip(service: &core::Service) -> Option<IpAddr> {
    let ip = service.spec.as_ref()?.cluster_ip.as_deref()?;
    if ip.is_empty() || ip == "None" {
        return None;
    }
    ip.parse().ok()
}

/// Ready addresses of an Endpoints object, across all subsets.
pub fn ready_addresses(endpoints: &core::Endpoints) -> impl Iterator<Item = &core::EndpointAddress> {
    (endpoints.subsets.iter().flatten())
        .flat_map(|subset| subset.addresses.iter().flatten())
}

pub fn has_ready_addresses(endpoints: &core::Endpoints) -> bool {
    ready_addresses(endpoints).next().is_some()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum Protocol {
    TCP,
    UDP,
    SCTP,
}

impl TryFrom<&Option<String>> for Protocol {
    type Error = eyre::Error;
    fn try_from(v: &Option<String>) -> Result<Protocol, eyre::Error> {
        match v.as_deref() {
            None | Some("TCP") => Ok(Protocol::TCP),
            Some("UDP") => Ok(Protocol::UDP),
            Some("SCTP") => Ok(Protocol::SCTP),
            Some(v) => Err(eyre::format_err!("invalid protocol: {v}")),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::TCP => "tcp",
            Protocol::UDP => "udp",
            Protocol::SCTP => "sctp",
        })
    }
}

/// A port exposed by a service.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServicePort {
    pub name: keys::ServicePortName,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

/// Ports of a service reachable through its cluster IP.
pub fn service_ports(service: &core::Service) -> Vec<ServicePort> {
    let (Some(key), Some(ip)) = (service_key(service), cluster_ip(service)) else {
        return Vec::new();
    };
    let ports = service.spec.as_ref().and_then(|s| s.ports.as_ref());

    (ports.into_iter().flatten())
        .filter_map(|p| {
            Some(ServicePort {
                name: keys::ServicePortName::new(key.clone(), p.name.clone().unwrap_or_default()),
                ip,
                port: u16::try_from(p.port).ok()?,
                protocol: Protocol::try_from(&p.protocol).ok()?,
            })
        })
        .collect()
}

/// Ready backend addresses of each named port of an Endpoints object.
pub fn port_backends(endpoints: &core::Endpoints) -> Vec<(keys::ServicePortName, Vec<SocketAddr>)> {
    let Some(key) = endpoints_key(endpoints) else {
        return Vec::new();
    };

    let mut backends: Vec<(keys::ServicePortName, Vec<SocketAddr>)> = Vec::new();

    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let Ok(port_num) = u16::try_from(port.port) else {
                continue;
            };
            let name = keys::ServicePortName::new(key.clone(), port.name.clone().unwrap_or_default());

            let addrs = (subset.addresses.iter().flatten())
                .filter_map(|addr| addr.ip.parse::<IpAddr>().ok())
                .map(|ip| SocketAddr::new(ip, port_num));

            match backends.iter_mut().find(|(n, _)| *n == name) {
                Some((_, v)) => v.extend(addrs),
                None => backends.push((name, addrs.collect())),
            }
        }
    }

    backends
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_ports() {
        let svc: core::Service = serde_json::from_value(json!({
            "metadata": {"name": "web", "namespace": "ns1"},
            "spec": {
                "clusterIP": "172.30.0.10",
                "ports": [
                    {"name": "http", "port": 80, "protocol": "TCP"},
                    {"name": "dns", "port": 53, "protocol": "UDP"},
                ]
            }
        }))
        .unwrap();

        let ports = service_ports(&svc);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name.to_string(), "ns1/web:http");
        assert_eq!(ports[0].ip, "172.30.0.10".parse::<IpAddr>().unwrap());
        assert_eq!(ports[1].protocol, Protocol::UDP);

        let headless: core::Service = serde_json::from_value(json!({
            "metadata": {"name": "db", "namespace": "ns1"},
            "spec": {"clusterIP": "None", "ports": [{"port": 5432}]}
        }))
        .unwrap();
        assert!(service_ports(&headless).is_empty());
    }

    #[test]
    fn test_port_backends() {
        let ep: core::Endpoints = serde_json::from_value(json!({
            "metadata": {"name": "web", "namespace": "ns1"},
            "subsets": [
                {
                    "addresses": [{"ip": "10.128.0.5"}, {"ip": "10.128.0.6"}],
                    "notReadyAddresses": [{"ip": "10.128.0.7"}],
                    "ports": [{"name": "http", "port": 8080}]
                },
                {
                    "addresses": [{"ip": "10.128.1.5"}],
                    "ports": [{"name": "http", "port": 8080}]
                }
            ]
        }))
        .unwrap();

        let backends = port_backends(&ep);
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].0.to_string(), "ns1/web:http");
        assert_eq!(
            backends[0].1,
            vec![
                "10.128.0.5:8080".parse::<SocketAddr>().unwrap(),
                "10.128.0.6:8080".parse().unwrap(),
                "10.128.1.5:8080".parse().unwrap(),
            ]
        );
        assert!(has_ready_addresses(&ep));
        assert_eq!(ready_addresses(&ep).count(), 3);
    }
}
