//! Main proxier: hands the forwarded services and endpoints to an external rule programmer.
//!
//! The current snapshot is written as JSON on the command's stdin. The command only runs when the
//! snapshot changed since its last successful run.

use k8s_openapi::api::core::v1 as core;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::BTreeMap as Map;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3;

use super::{BatchProvider, Protocol, port_backends, service_ports};
use crate::actions;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Command receiving the proxy snapshot on stdin.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub services: Vec<SnapshotPort>,
}

#[derive(Debug, PartialEq, Eq, serde::Serialize)]
pub struct SnapshotPort {
    /// `namespace/name:port`
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub endpoints: Vec<SocketAddr>,
}

impl Snapshot {
    pub fn new(services: &[core::Service], endpoints: &[core::Endpoints]) -> Self {
        let backends: Map<_, _> = endpoints.iter().flat_map(port_backends).collect();

        let mut ports: Vec<_> = (services.iter().flat_map(service_ports))
            .map(|sp| {
                let mut endpoints = backends.get(&sp.name).cloned().unwrap_or_default();
                endpoints.sort();
                SnapshotPort {
                    name: sp.name.to_string(),
                    ip: sp.ip,
                    port: sp.port,
                    protocol: sp.protocol,
                    endpoints,
                }
            })
            .collect();
        ports.sort_by(|a, b| a.name.cmp(&b.name));

        Self { services: ports }
    }
}

#[derive(Default)]
struct Objects {
    services: Vec<core::Service>,
    endpoints: Vec<core::Endpoints>,
}

pub struct ExecProxy {
    cfg: Config,
    objects: Mutex<Objects>,
    kick: Notify,
}

impl ExecProxy {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            objects: Mutex::new(Objects::default()),
            kick: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let objects = self.objects.lock();
        Snapshot::new(&objects.services, &objects.endpoints)
    }

    async fn apply(&self, content: Vec<u8>) -> actions::Result {
        actions::pipe(&self.cfg.cmd, &self.cfg.args, content).await
    }
}

impl BatchProvider for ExecProxy {
    fn on_service_update(&self, services: &[core::Service]) {
        self.objects.lock().services = services.to_vec();
        self.kick.notify_one();
    }

    fn on_endpoints_update(&self, endpoints: &[core::Endpoints]) {
        self.objects.lock().endpoints = endpoints.to_vec();
        self.kick.notify_one();
    }

    fn sync(&self) {
        self.kick.notify_one();
    }

    fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send {
        async move {
            let mut last_applied = None;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = self.kick.notified() => {}
                }

                let snapshot = self.snapshot();
                let content = match serde_json::to_vec(&snapshot) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("failed to serialize proxy snapshot: {e}");
                        continue;
                    }
                };

                let hash = xxh3::xxh3_128(&content);
                if last_applied == Some(hash) {
                    debug!("proxy snapshot unchanged");
                    continue;
                }

                match self.apply(content).await {
                    Ok(()) => {
                        info!("proxy rules updated ({} service ports)", snapshot.services.len());
                        last_applied = Some(hash);
                    }
                    Err(e) => error!("proxy update failed ({e}), will retry on next sync"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::{Duration, sleep};

    fn service() -> core::Service {
        serde_json::from_value(json!({
            "metadata": {"name": "web", "namespace": "ns1"},
            "spec": {"clusterIP": "172.30.0.10", "ports": [{"name": "http", "port": 80}]}
        }))
        .unwrap()
    }

    fn endpoints() -> core::Endpoints {
        serde_json::from_value(json!({
            "metadata": {"name": "web", "namespace": "ns1"},
            "subsets": [{
                "addresses": [{"ip": "10.128.0.6"}, {"ip": "10.128.0.5"}],
                "ports": [{"name": "http", "port": 8080}]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_snapshot() {
        let snapshot = Snapshot::new(&[service()], &[endpoints()]);
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({"services": [{
                "name": "ns1/web:http",
                "ip": "172.30.0.10",
                "port": 80,
                "protocol": "TCP",
                "endpoints": ["10.128.0.5:8080", "10.128.0.6:8080"],
            }]})
        );

        let no_endpoints = Snapshot::new(&[service()], &[]);
        assert!(no_endpoints.services[0].endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_sync_loop_runs_command() {
        let dir = std::env::temp_dir().join(format!("sdn-proxy-exec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("snapshot.json");

        let proxy = Arc::new(ExecProxy::new(Config {
            cmd: "sh".into(),
            args: vec!["-c".into(), format!("cat > {}", out.display())],
        }));

        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let proxy = proxy.clone();
            let stop = stop.clone();
            async move { proxy.sync_loop(stop).await }
        });

        proxy.on_service_update(&[service()]);
        proxy.on_endpoints_update(&[endpoints()]);

        let mut written = String::new();
        for _ in 0..50 {
            sleep(Duration::from_millis(20)).await;
            written = std::fs::read_to_string(&out).unwrap_or_default();
            if written.contains("10.128.0.6:8080") {
                break;
            }
        }

        stop.cancel();
        task.await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(written.contains("ns1/web:http"), "{written}");
    }
}
