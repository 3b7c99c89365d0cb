//! Socket portals: idled service ports redirected to local listeners.
//!
//! TCP connections are held until the service has endpoints, then forwarded to them. UDP
//! datagrams only wake the service up: senders are expected to retry.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::future::{Future, pending};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::{LoadBalancer, NeedPodsSignaler, backends, has_endpoints, spawn_need_pods};
use crate::keys::ServicePortName;

/// Connections waiting for endpoints, oldest first.
#[derive(Debug)]
pub struct ConnectionList<C> {
    conns: VecDeque<(C, Instant)>,
    max: usize,
}

impl<C> ConnectionList<C> {
    pub fn new(max: usize) -> Self {
        Self {
            conns: VecDeque::new(),
            max: max.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Hold a connection. When full, the oldest connection is evicted and returned.
    pub fn add(&mut self, conn: C, now: Instant) -> Option<C> {
        let evicted = if self.conns.len() >= self.max {
            self.conns.pop_front().map(|(c, _)| c)
        } else {
            None
        };
        self.conns.push_back((conn, now));
        evicted
    }

    /// Release all connections, oldest first.
    pub fn take(&mut self) -> Vec<C> {
        self.conns.drain(..).map(|(c, _)| c).collect()
    }

    /// Drop all connections. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.conns.len();
        self.conns.clear();
        n
    }
}

/// What a portal needs to know about its service port.
pub struct PortalContext<S> {
    pub name: ServicePortName,
    pub lb: watch::Receiver<LoadBalancer>,
    pub signaler: Arc<S>,
    pub max_held_connections: usize,
    pub wait_timeout: Duration,
}

fn until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => pending().await,
        }
    }
}

/// Round-robin over the backends.
#[derive(Default)]
struct RoundRobin(usize);
impl RoundRobin {
    fn next(&mut self, backends: &[SocketAddr]) -> Option<SocketAddr> {
        if backends.is_empty() {
            return None;
        }
        let backend = backends[self.0 % backends.len()];
        self.0 = self.0.wrapping_add(1);
        Some(backend)
    }
}

pub async fn serve_tcp<S: NeedPodsSignaler>(
    listener: TcpListener,
    mut ctx: PortalContext<S>,
    stop: CancellationToken,
) {
    let name = ctx.name.clone();
    let mut held = ConnectionList::new(ctx.max_held_connections);
    let mut rr = RoundRobin::default();
    // set while waiting for endpoints after a signal
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                // the portal closes when the service wakes up: its endpoints may be there already
                let backends = backends(&ctx.lb, &name);
                if !backends.is_empty() && !held.is_empty() {
                    info!("{name}: portal closed, forwarding {} held connections", held.len());
                    for conn in held.take() {
                        if let Some(backend) = rr.next(&backends) {
                            tokio::spawn(forward(conn, backend, name.to_string()));
                        }
                    }
                }
                let n = held.clear();
                if n != 0 {
                    debug!("{name}: closed {n} held connections");
                }
                return;
            }
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!("{name}: accept failed: {e}");
                        continue;
                    }
                };

                if let Some(backend) = rr.next(&backends(&ctx.lb, &name)) {
                    tokio::spawn(forward(conn, backend, name.to_string()));
                    continue;
                }

                debug!("{name}: holding connection from {peer}");
                if held.add(conn, Instant::now()).is_some() {
                    warn!("{name}: too many held connections, closed the oldest one");
                }

                if deadline.is_none() {
                    spawn_need_pods(&ctx.signaler, &name);
                    deadline = Some(Instant::now() + ctx.wait_timeout);
                }
            }
            changed = ctx.lb.changed() => {
                if changed.is_err() {
                    return;
                }
                let backends = backends(&ctx.lb, &name);
                if backends.is_empty() || held.is_empty() {
                    continue;
                }

                info!("{name}: endpoints available, forwarding {} held connections", held.len());
                for conn in held.take() {
                    if let Some(backend) = rr.next(&backends) {
                        tokio::spawn(forward(conn, backend, name.to_string()));
                    }
                }
                deadline = None;
            }
            _ = until(deadline) => {
                let n = held.clear();
                warn!("{name}: no endpoints after {:?}, closed {n} held connections", ctx.wait_timeout);
                deadline = None;
            }
        }
    }
}

async fn forward(mut conn: TcpStream, backend: SocketAddr, name: String) {
    let mut upstream = match TcpStream::connect(backend).await {
        Ok(v) => v,
        Err(e) => {
            error!("{name}: failed to connect to {backend}: {e}");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
        Ok((tx, rx)) => debug!("{name}: connection to {backend} done ({tx} bytes sent, {rx} received)"),
        Err(e) => debug!("{name}: connection to {backend} failed: {e}"),
    }
}

/// Signal on the first datagram of a wait window. Each datagram extends the window; the next
/// datagram after it closes signals again.
pub async fn serve_udp<S: NeedPodsSignaler>(
    socket: UdpSocket,
    ctx: PortalContext<S>,
    stop: CancellationToken,
) {
    let name = ctx.name.clone();
    let mut buf = vec![0u8; 64 * 1024];
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            received = socket.recv_from(&mut buf) => {
                let peer = match received {
                    Ok((_, peer)) => peer,
                    Err(e) => {
                        error!("{name}: receive failed: {e}");
                        continue;
                    }
                };
                debug!("{name}: dropped datagram from {peer}");

                if deadline.is_none() && !has_endpoints(&ctx.lb, &name) {
                    spawn_need_pods(&ctx.signaler, &name);
                }
                deadline = Some(Instant::now() + ctx.wait_timeout);
            }
            _ = until(deadline) => {
                deadline = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{sleep, timeout};

    #[test]
    fn test_connection_list() {
        let now = Instant::now();
        let mut list = ConnectionList::new(2);
        assert_eq!(list.add(1, now), None);
        assert_eq!(list.add(2, now), None);
        assert_eq!(list.add(3, now), Some(1));
        assert_eq!(list.len(), 2);
        assert_eq!(list.take(), vec![2, 3]);
        assert!(list.is_empty());

        list.add(4, now);
        assert_eq!(list.clear(), 1);
    }

    #[test]
    fn test_round_robin() {
        let a: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let mut rr = RoundRobin::default();
        assert_eq!(rr.next(&[]), None);
        assert_eq!(rr.next(&[a, b]), Some(a));
        assert_eq!(rr.next(&[a, b]), Some(b));
        assert_eq!(rr.next(&[a, b]), Some(a));
    }

    #[derive(Default)]
    struct Counter(Mutex<Vec<String>>);
    impl NeedPodsSignaler for Counter {
        async fn need_pods(&self, service: &ServicePortName) -> eyre::Result<()> {
            self.0.lock().push(service.to_string());
            Ok(())
        }
    }

    fn name() -> ServicePortName {
        ServicePortName::new(keys::Object::new("ns1", "web"), "http")
    }

    fn context(
        signaler: &Arc<Counter>,
        wait_timeout: Duration,
    ) -> (watch::Sender<LoadBalancer>, PortalContext<Counter>) {
        let (tx, rx) = watch::channel(LoadBalancer::new());
        let ctx = PortalContext {
            name: name(),
            lb: rx,
            signaler: signaler.clone(),
            max_held_connections: 16,
            wait_timeout,
        };
        (tx, ctx)
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_tcp_hold_and_replay() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            loop {
                let (mut conn, _) = backend.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 5];
                    if conn.read_exact(&mut buf).await.is_ok() {
                        let _ = conn.write_all(&buf).await;
                    }
                });
            }
        });

        let portal = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let portal_addr = portal.local_addr().unwrap();

        let signaler = Arc::new(Counter::default());
        let (lb, ctx) = context(&signaler, Duration::from_secs(30));
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve_tcp(portal, ctx, stop.clone()));

        let mut client = TcpStream::connect(portal_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let _second = TcpStream::connect(portal_addr).await.unwrap();
        settle().await;

        // one signal for the whole wait window
        assert_eq!(*signaler.0.lock(), vec!["ns1/web:http"]);

        lb.send_replace([(name(), vec![backend_addr])].into());

        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");
        echo.abort();

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_replay_when_closed_on_wake_up() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            loop {
                let (mut conn, _) = backend.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 5];
                    if conn.read_exact(&mut buf).await.is_ok() {
                        let _ = conn.write_all(&buf).await;
                    }
                });
            }
        });

        for _ in 0..20 {
            let portal = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let portal_addr = portal.local_addr().unwrap();

            let signaler = Arc::new(Counter::default());
            let (lb, ctx) = context(&signaler, Duration::from_secs(30));
            let stop = CancellationToken::new();
            let task = tokio::spawn(serve_tcp(portal, ctx, stop.clone()));

            let mut client = TcpStream::connect(portal_addr).await.unwrap();
            client.write_all(b"hello").await.unwrap();
            settle().await;

            // endpoints and portal closing come in the same update
            lb.send_replace([(name(), vec![backend_addr])].into());
            stop.cancel();
            task.await.unwrap();

            let mut buf = [0u8; 5];
            timeout(Duration::from_secs(5), client.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf, b"hello");
        }

        echo.abort();
    }

    #[tokio::test]
    async fn test_tcp_wait_timeout() {
        let portal = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let portal_addr = portal.local_addr().unwrap();

        let signaler = Arc::new(Counter::default());
        let (_lb, ctx) = context(&signaler, Duration::from_millis(100));
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve_tcp(portal, ctx, stop.clone()));

        let mut client = TcpStream::connect(portal_addr).await.unwrap();

        // the held connection gets closed
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // a new window, a new signal
        let _client = TcpStream::connect(portal_addr).await.unwrap();
        settle().await;
        assert_eq!(signaler.0.lock().len(), 2);

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_signals_once_per_window() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let signaler = Arc::new(Counter::default());
        let (_lb, ctx) = context(&signaler, Duration::from_millis(200));
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve_udp(socket, ctx, stop.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..3 {
            client.send_to(b"ping", addr).await.unwrap();
        }
        settle().await;
        assert_eq!(signaler.0.lock().len(), 1);

        sleep(Duration::from_millis(400)).await;
        client.send_to(b"ping", addr).await.unwrap();
        settle().await;
        assert_eq!(signaler.0.lock().len(), 2);

        stop.cancel();
        task.await.unwrap();
    }
}
