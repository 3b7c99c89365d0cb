//! Packets held while an idled service wakes up.

use std::collections::BTreeMap as Map;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::time::{Duration, Instant};

use crate::proxy::Protocol;

#[derive(Debug)]
struct Held<T> {
    packet: T,
    since: Instant,
}

/// Outcome of [`PacketHolder::hold`].
#[derive(Debug, PartialEq, Eq)]
pub struct Hold<T> {
    /// previous packet of the same source, now replaced
    pub replaced: Option<T>,
    /// the destination had nothing held before: a wake-up is due
    pub first: bool,
}

/// Held packets by destination, then source. Only the latest packet of a source is kept.
#[derive(Debug)]
pub struct PacketHolder<T> {
    held: Map<SocketAddr, Map<SocketAddr, Held<T>>>,
}

impl<T> Default for PacketHolder<T> {
    fn default() -> Self {
        Self { held: Map::new() }
    }
}

impl<T> PacketHolder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn len(&self) -> usize {
        self.held.values().map(Map::len).sum()
    }

    pub fn hold(&mut self, src: SocketAddr, dst: SocketAddr, packet: T, now: Instant) -> Hold<T> {
        let by_src = self.held.entry(dst).or_default();
        let first = by_src.is_empty();
        let replaced = by_src.insert(src, Held { packet, since: now });
        Hold {
            replaced: replaced.map(|h| h.packet),
            first,
        }
    }

    /// Release everything held for `dst`.
    pub fn pop(&mut self, dst: &SocketAddr) -> Vec<T> {
        let Some(by_src) = self.held.remove(dst) else {
            return Vec::new();
        };
        by_src.into_values().map(|h| h.packet).collect()
    }

    /// Release everything.
    pub fn drain(&mut self) -> Vec<T> {
        let held = std::mem::take(&mut self.held);
        (held.into_values())
            .flat_map(|by_src| by_src.into_values().map(|h| h.packet))
            .collect()
    }

    /// Remove packets held for longer than `max_age`.
    pub fn tick(&mut self, now: Instant, max_age: Duration) -> Vec<T> {
        let mut aged = Vec::new();
        self.held.retain(|_, by_src| {
            let old: Vec<_> = (by_src.iter())
                .filter(|(_, h)| now.duration_since(h.since) >= max_age)
                .map(|(src, _)| *src)
                .collect();
            for src in old {
                if let Some(h) = by_src.remove(&src) {
                    aged.push(h.packet);
                }
            }
            !by_src.is_empty()
        });
        aged
    }
}

/// Verdict on a queued packet, with its netfilter value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
    /// re-inject the packet in the hook chain
    Repeat = 4,
}

/// Outcome of one queued packet.
#[derive(Debug, PartialEq, Eq)]
pub struct Step<N> {
    pub verdicts: Vec<(u32, Verdict)>,
    /// service port to wake up
    pub need_pods: Option<N>,
}

impl<N> Step<N> {
    fn verdict(id: u32, verdict: Verdict) -> Self {
        Self {
            verdicts: vec![(id, verdict)],
            need_pods: None,
        }
    }
}

/// Queued packet decisions: TCP SYNs to idled destinations are held until the destination is
/// removed, UDP to idled destinations is dropped, everything else is accepted.
pub struct QueueFilter<N> {
    holder: PacketHolder<u32>,
    destinations: Map<(Protocol, SocketAddr), N>,
}

impl<N> Default for QueueFilter<N> {
    fn default() -> Self {
        Self {
            holder: PacketHolder::new(),
            destinations: Map::new(),
        }
    }
}

impl<N: Clone> QueueFilter<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> usize {
        self.holder.len()
    }

    /// Decide on a queued packet. `has_endpoints` tells whether a service port is awake.
    pub fn packet<F>(&mut self, id: u32, payload: &[u8], has_endpoints: F, now: Instant) -> Step<N>
    where
        F: Fn(&N) -> bool,
    {
        let target = parse_packet(payload)
            .and_then(|info| Some((self.destinations.get(&(info.protocol, info.dst))?, info)));
        let Some((name, info)) = target else {
            return Step::verdict(id, Verdict::Accept);
        };

        // established connections are not ours
        if info.protocol == Protocol::TCP && !info.syn {
            return Step::verdict(id, Verdict::Accept);
        }

        let wake = !has_endpoints(name);
        let name = name.clone();

        if info.protocol == Protocol::UDP {
            return Step {
                verdicts: vec![(id, Verdict::Drop)],
                need_pods: wake.then_some(name),
            };
        }

        let hold = self.holder.hold(info.src, info.dst, id, now);
        Step {
            verdicts: (hold.replaced.into_iter())
                .map(|replaced| (replaced, Verdict::Drop))
                .collect(),
            need_pods: (hold.first && wake).then_some(name),
        }
    }

    /// Replace the idled destinations. Packets held for removed ones are re-injected.
    pub fn set_destinations(&mut self, next: Map<(Protocol, SocketAddr), N>) -> Vec<(u32, Verdict)> {
        let removed: Vec<SocketAddr> = (self.destinations.keys())
            .filter(|key| key.0 == Protocol::TCP && !next.contains_key(*key))
            .map(|(_, dst)| *dst)
            .collect();
        self.destinations = next;

        (removed.iter())
            .flat_map(|dst| self.holder.pop(dst))
            .map(|id| (id, Verdict::Repeat))
            .collect()
    }

    /// Drop packets held for longer than `max_age`.
    pub fn tick(&mut self, now: Instant, max_age: Duration) -> Vec<(u32, Verdict)> {
        (self.holder.tick(now, max_age).into_iter())
            .map(|id| (id, Verdict::Drop))
            .collect()
    }

    /// Drop everything held.
    pub fn drain(&mut self) -> Vec<(u32, Verdict)> {
        (self.holder.drain().into_iter())
            .map(|id| (id, Verdict::Drop))
            .collect()
    }
}

/// Addresses of an intercepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// TCP SYN without ACK
    pub syn: bool,
}

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Parse the IP and TCP/UDP headers of a packet.
pub fn parse_packet(data: &[u8]) -> Option<PacketInfo> {
    let version = data.first()? >> 4;
    let (src_ip, dst_ip, proto, l4): (IpAddr, IpAddr, u8, &[u8]) = match version {
        4 => {
            let ihl = usize::from(data[0] & 0x0f) * 4;
            if ihl < 20 || data.len() < ihl {
                return None;
            }
            let src: [u8; 4] = data[12..16].try_into().ok()?;
            let dst: [u8; 4] = data[16..20].try_into().ok()?;
            (Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into(), data[9], &data[ihl..])
        }
        6 => {
            if data.len() < 40 {
                return None;
            }
            let src: [u8; 16] = data[8..24].try_into().ok()?;
            let dst: [u8; 16] = data[24..40].try_into().ok()?;
            // extension headers are not followed
            (Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into(), data[6], &data[40..])
        }
        _ => return None,
    };

    let protocol = match proto {
        IPPROTO_TCP => Protocol::TCP,
        IPPROTO_UDP => Protocol::UDP,
        _ => return None,
    };
    if l4.len() < 4 || (protocol == Protocol::TCP && l4.len() < 14) {
        return None;
    }

    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
    let syn = protocol == Protocol::TCP && l4[13] & 0x12 == 0x02;

    Some(PacketInfo {
        protocol,
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
        syn,
    })
}
