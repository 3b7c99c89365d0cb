//! The proxier of idled services: opens a portal per idled service port and keeps the load
//! balancer view its portals wait on.

use eyre::{Result, format_err};
use k8s_openapi::api::core::v1 as core;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use super::iptables::{self, Rule, Target};
use super::socket::{self, PortalContext};
use super::{Config, Interception, LoadBalancer, NeedPodsSignaler};
use crate::proxy::{BatchProvider, Protocol, ServicePort, port_backends, service_ports};

pub struct UnidlingProxy<S> {
    cfg: Config,
    signaler: Arc<S>,
    ports: Mutex<Set<ServicePort>>,
    lb: watch::Sender<LoadBalancer>,
    kick: Notify,
}

impl<S: NeedPodsSignaler> UnidlingProxy<S> {
    pub fn new(cfg: Config, signaler: S) -> Self {
        Self {
            cfg,
            signaler: Arc::new(signaler),
            ports: Mutex::new(Set::new()),
            lb: watch::Sender::new(LoadBalancer::new()),
            kick: Notify::new(),
        }
    }

    /// Service ports that currently need a portal.
    pub fn ports(&self) -> Vec<ServicePort> {
        self.ports.lock().iter().cloned().collect()
    }

    pub fn load_balancer(&self) -> watch::Receiver<LoadBalancer> {
        self.lb.subscribe()
    }

    async fn reconcile(&self, interceptor: &Interceptor<S>, portals: &mut Map<ServicePort, Portal>) {
        let desired = self.ports.lock().clone();

        let stale: Vec<_> = (portals.keys())
            .filter(|port| !desired.contains(*port))
            .cloned()
            .collect();

        for port in stale {
            if let Some(portal) = portals.remove(&port) {
                info!("closing portal of {}", port.name);
                interceptor.close(&port, portal).await;
            }
        }

        for port in desired {
            if portals.contains_key(&port) {
                continue;
            }
            match interceptor.open(&port).await {
                Ok(portal) => {
                    info!("opened portal of {} ({}:{}/{})", port.name, port.ip, port.port, port.protocol);
                    portals.insert(port, portal);
                }
                // retried on the next sync
                Err(e) => error!("failed to open portal of {}: {e}", port.name),
            }
        }
    }
}

impl<S: NeedPodsSignaler> BatchProvider for UnidlingProxy<S> {
    fn on_service_update(&self, services: &[core::Service]) {
        let ports: Set<_> = services.iter().flat_map(service_ports).collect();
        debug!("{} idled service ports", ports.len());
        *self.ports.lock() = ports;
        self.kick.notify_one();
    }

    fn on_endpoints_update(&self, endpoints: &[core::Endpoints]) {
        let lb: LoadBalancer = endpoints.iter().flat_map(port_backends).collect();
        self.lb.send_replace(lb);
    }

    fn sync(&self) {
        self.kick.notify_one();
    }

    fn sync_loop(&self, stop: CancellationToken) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = iptables::setup().await {
                error!("unidling disabled: {e}");
                stop.cancelled().await;
                return;
            }

            let interceptor = match Interceptor::start(&self.cfg, self.signaler.clone(), &self.lb, &stop) {
                Ok(v) => v,
                Err(e) => {
                    error!("unidling disabled: {e}");
                    iptables::cleanup().await;
                    stop.cancelled().await;
                    return;
                }
            };

            let mut portals = Map::new();
            loop {
                self.reconcile(&interceptor, &mut portals).await;

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = self.kick.notified() => {}
                }
            }

            for (port, portal) in portals {
                interceptor.close(&port, portal).await;
            }
            iptables::cleanup().await;
            info!("unidling proxy stopped");
        }
    }
}

// ------------------------------------------------------------------------
// interception strategies

struct Portal {
    rule: Rule,
    /// stops the portal's socket task
    stop: Option<CancellationToken>,
}

/// Idled destinations, as seen by the queue.
type Destinations = Map<(Protocol, SocketAddr), crate::keys::ServicePortName>;

enum Interceptor<S> {
    Socket {
        bind_address: std::net::IpAddr,
        signaler: Arc<S>,
        lb: watch::Receiver<LoadBalancer>,
        max_held_connections: usize,
        wait_timeout: tokio::time::Duration,
        stop: CancellationToken,
    },
    #[cfg(target_os = "linux")]
    Queue {
        num: u16,
        destinations: watch::Sender<Destinations>,
    },
}

impl<S: NeedPodsSignaler> Interceptor<S> {
    fn start(
        cfg: &Config,
        signaler: Arc<S>,
        lb: &watch::Sender<LoadBalancer>,
        stop: &CancellationToken,
    ) -> Result<Self> {
        let socket = || {
            info!("intercepting idled services traffic with local sockets");
            Interceptor::Socket {
                bind_address: cfg.bind_address,
                signaler: signaler.clone(),
                lb: lb.subscribe(),
                max_held_connections: cfg.max_held_connections,
                wait_timeout: cfg.need_pods_wait_timeout(),
                stop: stop.clone(),
            }
        };

        match cfg.interception {
            Interception::Socket => Ok(socket()),
            #[cfg(target_os = "linux")]
            Interception::Queue => Self::start_queue(cfg, signaler.clone(), lb, stop),
            #[cfg(target_os = "linux")]
            Interception::Auto => match Self::start_queue(cfg, signaler.clone(), lb, stop) {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!("netfilter queue unavailable ({e})");
                    Ok(socket())
                }
            },
            #[cfg(not(target_os = "linux"))]
            Interception::Queue => Err(format_err!("netfilter queues are only available on Linux")),
            #[cfg(not(target_os = "linux"))]
            Interception::Auto => Ok(socket()),
        }
    }

    #[cfg(target_os = "linux")]
    fn start_queue(
        cfg: &Config,
        signaler: Arc<S>,
        lb: &watch::Sender<LoadBalancer>,
        stop: &CancellationToken,
    ) -> Result<Self> {
        let queue = (super::nfqueue::Queue::bind(cfg.queue_num))
            .map_err(|e| format_err!("failed to bind netfilter queue {}: {e}", cfg.queue_num))?;

        info!("intercepting idled services traffic with netfilter queue {}", cfg.queue_num);

        let (destinations, rx) = watch::channel(Destinations::new());
        tokio::spawn(queue::run(
            queue,
            rx,
            lb.subscribe(),
            signaler,
            cfg.need_pods_wait_timeout(),
            stop.clone(),
        ));

        Ok(Interceptor::Queue {
            num: cfg.queue_num,
            destinations,
        })
    }

    async fn open(&self, port: &ServicePort) -> Result<Portal> {
        match self {
            Interceptor::Socket {
                bind_address,
                signaler,
                lb,
                max_held_connections,
                wait_timeout,
                stop,
            } => {
                let ctx = PortalContext {
                    name: port.name.clone(),
                    lb: lb.clone(),
                    signaler: signaler.clone(),
                    max_held_connections: *max_held_connections,
                    wait_timeout: *wait_timeout,
                };
                let portal_stop = stop.child_token();
                let bind = SocketAddr::new(*bind_address, 0);

                let local_port = match port.protocol {
                    Protocol::TCP => {
                        let listener = TcpListener::bind(bind).await?;
                        let local_port = listener.local_addr()?.port();
                        tokio::spawn(socket::serve_tcp(listener, ctx, portal_stop.clone()));
                        local_port
                    }
                    Protocol::UDP => {
                        let udp = UdpSocket::bind(bind).await?;
                        let local_port = udp.local_addr()?.port();
                        tokio::spawn(socket::serve_udp(udp, ctx, portal_stop.clone()));
                        local_port
                    }
                    Protocol::SCTP => {
                        return Err(format_err!("SCTP is not supported"));
                    }
                };

                let rule = iptables::portal_rule(port, Target::Redirect { to_port: local_port });
                if let Err(e) = iptables::add(&rule).await {
                    portal_stop.cancel();
                    return Err(e.into());
                }

                Ok(Portal {
                    rule,
                    stop: Some(portal_stop),
                })
            }
            #[cfg(target_os = "linux")]
            Interceptor::Queue { num, destinations } => {
                if port.protocol == Protocol::SCTP {
                    return Err(format_err!("SCTP is not supported"));
                }

                let rule = iptables::portal_rule(port, Target::Queue { num: *num });
                iptables::add(&rule).await?;

                let dst = SocketAddr::new(port.ip, port.port);
                destinations.send_modify(|d| {
                    d.insert((port.protocol, dst), port.name.clone());
                });

                Ok(Portal { rule, stop: None })
            }
        }
    }

    async fn close(&self, port: &ServicePort, portal: Portal) {
        if let Err(e) = iptables::delete(&portal.rule).await {
            error!("failed to remove portal rule of {}: {e}", port.name);
        }
        if let Some(stop) = portal.stop {
            stop.cancel();
        }

        #[cfg(target_os = "linux")]
        if let Interceptor::Queue { destinations, .. } = self {
            // the rule is gone: held packets can be re-injected
            let dst = SocketAddr::new(port.ip, port.port);
            destinations.send_modify(|d| {
                d.remove(&(port.protocol, dst));
            });
        }
    }
}

#[cfg(target_os = "linux")]
mod queue {
    use log::{debug, error, info};
    use std::sync::Arc;
    use tokio::sync::watch;
    use tokio::time::{self, Duration, Instant};
    use tokio_util::sync::CancellationToken;

    use super::Destinations;
    use crate::unidler::holder::QueueFilter;
    use crate::unidler::nfqueue::{Queue, Verdict};
    use crate::unidler::{LoadBalancer, NeedPodsSignaler, has_endpoints, spawn_need_pods};

    fn apply(queue: &Queue, verdicts: Vec<(u32, Verdict)>) {
        for (id, v) in verdicts {
            if let Err(e) = queue.verdict(id, v) {
                error!("netfilter queue {}: verdict on packet {id} failed: {e}", queue.num());
            }
        }
    }

    pub async fn run<S: NeedPodsSignaler>(
        queue: Queue,
        mut destinations: watch::Receiver<Destinations>,
        lb: watch::Receiver<LoadBalancer>,
        signaler: Arc<S>,
        hold_period: Duration,
        stop: CancellationToken,
    ) {
        let mut filter = QueueFilter::new();
        filter.set_destinations(destinations.borrow_and_update().clone());

        let mut ticker = time::interval(hold_period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                packets = queue.recv() => {
                    let packets = match packets {
                        Ok(v) => v,
                        Err(e) => {
                            error!("netfilter queue {}: {e}", queue.num());
                            continue;
                        }
                    };

                    for packet in packets {
                        let now = Instant::now();
                        let step = filter.packet(packet.id, &packet.payload, |name| has_endpoints(&lb, name), now);
                        apply(&queue, step.verdicts);
                        if let Some(name) = step.need_pods {
                            spawn_need_pods(&signaler, &name);
                        }
                    }
                }
                changed = destinations.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = destinations.borrow_and_update().clone();
                    let released = filter.set_destinations(next);
                    if !released.is_empty() {
                        info!("re-injecting {} held packets", released.len());
                    }
                    apply(&queue, released);
                }
                _ = ticker.tick() => {
                    let aged = filter.tick(Instant::now(), hold_period);
                    if !aged.is_empty() {
                        debug!("dropping {} aged packets", aged.len());
                    }
                    apply(&queue, aged);
                }
            }
        }

        apply(&queue, filter.drain());
    }
}
