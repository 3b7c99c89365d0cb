//! Minimal netfilter queue client: bind a queue, receive packets, give verdicts.

use log::{debug, warn};
use netlink_sys::{Socket, SocketAddr};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::unix::AsyncFd;

const NETLINK_NETFILTER: isize = 12;

const NFNL_SUBSYS_QUEUE: u16 = 3;
const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_PAYLOAD: u16 = 10;

const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_UNBIND: u8 = 2;
const NFQNL_COPY_PACKET: u8 = 2;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLMSG_ERROR: u16 = 0x2;
const NLA_TYPE_MASK: u16 = 0x3fff;

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;

/// Enough for the IP and TCP/UDP headers.
const COPY_RANGE: u32 = 128;
const RECV_BUFFER: usize = 64 * 1024;

pub use super::holder::Verdict;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub payload: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("netlink I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("netfilter queue request failed (errno {0})")]
    Request(i32),
    #[error("truncated netlink message")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Packet(Packet),
    /// `errno` is 0 for an acknowledgement
    Ack { errno: i32 },
    Other(u16),
}

fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn message(msg_type: u16, flags: u16, seq: u32, queue: u16, attrs: &[(u16, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);

    // nlmsghdr, length set at the end
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&((NFNL_SUBSYS_QUEUE << 8) | msg_type).to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | flags).to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());

    // nfgenmsg: AF_UNSPEC, NFNETLINK_V0, queue number
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&queue.to_be_bytes());

    for (attr_type, data) in attrs {
        let len = (4 + data.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&attr_type.to_ne_bytes());
        buf.extend_from_slice(data);
        buf.resize(align(buf.len()), 0);
    }

    let len = buf.len() as u32;
    buf[..4].copy_from_slice(&len.to_ne_bytes());
    buf
}

pub fn config_cmd(seq: u32, queue: u16, cmd: u8, ack: bool) -> Vec<u8> {
    let flags = if ack { NLM_F_ACK } else { 0 };
    // command, padding, protocol family (unused)
    message(NFQNL_MSG_CONFIG, flags, seq, queue, &[(NFQA_CFG_CMD, &[cmd, 0, 0, 0])])
}

pub fn config_params(seq: u32, queue: u16, copy_range: u32) -> Vec<u8> {
    let mut params = copy_range.to_be_bytes().to_vec();
    params.push(NFQNL_COPY_PACKET);
    message(NFQNL_MSG_CONFIG, NLM_F_ACK, seq, queue, &[(NFQA_CFG_PARAMS, &params)])
}

pub fn verdict_msg(seq: u32, queue: u16, id: u32, verdict: Verdict) -> Vec<u8> {
    let mut hdr = (verdict as u32).to_be_bytes().to_vec();
    hdr.extend_from_slice(&id.to_be_bytes());
    message(NFQNL_MSG_VERDICT, 0, seq, queue, &[(NFQA_VERDICT_HDR, &hdr)])
}

fn attributes(mut data: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    std::iter::from_fn(move || {
        if data.len() < 4 {
            return None;
        }
        let len = usize::from(u16::from_ne_bytes([data[0], data[1]]));
        let attr_type = u16::from_ne_bytes([data[2], data[3]]) & NLA_TYPE_MASK;
        if len < 4 || len > data.len() {
            return None;
        }
        let value = &data[4..len];
        data = &data[align(len).min(data.len())..];
        Some((attr_type, value))
    })
}

pub fn parse_messages(mut buf: &[u8]) -> Result<Vec<Message>> {
    let mut messages = Vec::new();

    while buf.len() >= NLMSG_HDRLEN {
        let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Err(Error::Truncated);
        }
        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        let body = &buf[NLMSG_HDRLEN..len];

        let message = if msg_type == NLMSG_ERROR {
            let errno = body.get(..4).ok_or(Error::Truncated)?;
            let errno = i32::from_ne_bytes([errno[0], errno[1], errno[2], errno[3]]);
            Message::Ack { errno: -errno }
        } else if msg_type == (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET {
            let attrs = body.get(NFGENMSG_LEN..).ok_or(Error::Truncated)?;
            let mut id = None;
            let mut payload = Vec::new();
            for (attr_type, value) in attributes(attrs) {
                match attr_type {
                    NFQA_PACKET_HDR if value.len() >= 4 => {
                        id = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                    }
                    NFQA_PAYLOAD => payload = value.to_vec(),
                    _ => {}
                }
            }
            let id = id.ok_or(Error::Truncated)?;
            Message::Packet(Packet { id, payload })
        } else {
            Message::Other(msg_type)
        };
        messages.push(message);

        buf = &buf[align(len).min(buf.len())..];
    }

    Ok(messages)
}

fn kernel() -> SocketAddr {
    SocketAddr::new(0, 0)
}

/// A bound netfilter queue.
pub struct Queue {
    fd: AsyncFd<Socket>,
    num: u16,
    seq: AtomicU32,
}

impl Queue {
    /// Bind queue `num`. Fails if another process already holds it or the kernel lacks support.
    pub fn bind(num: u16) -> Result<Self> {
        let mut socket = Socket::new(NETLINK_NETFILTER)?;
        socket.bind_auto()?;

        request(&socket, &config_cmd(1, num, NFQNL_CFG_CMD_BIND, true))?;
        request(&socket, &config_params(2, num, COPY_RANGE))?;

        socket.set_non_blocking(true)?;
        debug!("bound netfilter queue {num}");

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            num,
            seq: AtomicU32::new(3),
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Wait for the next batch of queued packets.
    pub async fn recv(&self) -> Result<Vec<Packet>> {
        loop {
            let mut guard = self.fd.readable().await?;

            let mut buf = Vec::with_capacity(RECV_BUFFER);
            let n = match guard.try_io(|fd| fd.get_ref().recv(&mut buf, 0)) {
                Ok(res) => res?,
                Err(_would_block) => continue,
            };
            buf.truncate(n);

            let packets: Vec<_> = (parse_messages(&buf)?.into_iter())
                .filter_map(|m| match m {
                    Message::Packet(p) => Some(p),
                    Message::Ack { errno } if errno != 0 => {
                        warn!("netfilter queue {}: {}", self.num, io::Error::from_raw_os_error(errno));
                        None
                    }
                    _ => None,
                })
                .collect();

            if !packets.is_empty() {
                return Ok(packets);
            }
        }
    }

    pub fn verdict(&self, id: u32, verdict: Verdict) -> Result<()> {
        let msg = verdict_msg(self.next_seq(), self.num, id, verdict);
        self.fd.get_ref().send_to(&msg, &kernel(), 0)?;
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let msg = config_cmd(self.next_seq(), self.num, NFQNL_CFG_CMD_UNBIND, false);
        if let Err(e) = self.fd.get_ref().send_to(&msg, &kernel(), 0) {
            warn!("failed to unbind netfilter queue {}: {e}", self.num);
        }
    }
}

/// Send a request and wait for its acknowledgement (blocking socket).
fn request(socket: &Socket, msg: &[u8]) -> Result<()> {
    socket.send_to(msg, &kernel(), 0)?;

    loop {
        let mut buf = Vec::with_capacity(RECV_BUFFER);
        let n = socket.recv(&mut buf, 0)?;
        buf.truncate(n);

        for message in parse_messages(&buf)? {
            if let Message::Ack { errno } = message {
                if errno != 0 {
                    return Err(Error::Request(errno));
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_msg() {
        let msg = verdict_msg(7, 3, 42, Verdict::Repeat);
        assert_eq!(msg.len(), 16 + 4 + 4 + 8);
        assert_eq!(u32::from_ne_bytes(msg[0..4].try_into().unwrap()), msg.len() as u32);
        assert_eq!(u16::from_ne_bytes(msg[4..6].try_into().unwrap()), 0x0301);
        assert_eq!(u16::from_ne_bytes(msg[6..8].try_into().unwrap()), NLM_F_REQUEST);
        assert_eq!(&msg[18..20], &3u16.to_be_bytes());
        assert_eq!(u16::from_ne_bytes(msg[22..24].try_into().unwrap()), NFQA_VERDICT_HDR);
        assert_eq!(&msg[24..28], &4u32.to_be_bytes());
        assert_eq!(&msg[28..32], &42u32.to_be_bytes());
    }

    #[test]
    fn test_config_params_padding() {
        let msg = config_params(1, 0, 128);
        // 5 bytes of params padded to 8
        assert_eq!(msg.len(), 16 + 4 + 4 + 8);
        assert_eq!(u16::from_ne_bytes(msg[20..22].try_into().unwrap()), 9);
        assert_eq!(msg[28], NFQNL_COPY_PACKET);
        assert_eq!(u16::from_ne_bytes(msg[6..8].try_into().unwrap()), NLM_F_REQUEST | NLM_F_ACK);
    }

    #[test]
    fn test_parse_messages() {
        // a queued packet, as the kernel sends it
        let mut hdr = 99u32.to_be_bytes().to_vec();
        hdr.extend_from_slice(&[0x08, 0x00, 1]); // hw_protocol, hook
        let payload = [0x45u8, 0, 0, 20, 1, 2];
        let mut packet = message(NFQNL_MSG_PACKET, 0, 0, 0, &[(NFQA_PACKET_HDR, &hdr), (NFQA_PAYLOAD, &payload)]);

        // followed by an error
        let mut error = Vec::new();
        error.extend_from_slice(&36u32.to_ne_bytes());
        error.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
        error.extend_from_slice(&[0; 10]);
        error.extend_from_slice(&(-16i32).to_ne_bytes());
        error.extend_from_slice(&[0; 16]);
        packet.extend_from_slice(&error);

        let messages = parse_messages(&packet).unwrap();
        assert_eq!(
            messages,
            vec![
                Message::Packet(Packet {
                    id: 99,
                    payload: payload.to_vec()
                }),
                Message::Ack { errno: 16 },
            ]
        );

        assert!(matches!(parse_messages(&packet[..20]), Err(Error::Truncated)));
    }
}
