//! The `nat` table chain catching traffic to idled services.

use log::{debug, info, warn};
use std::net::IpAddr;

use crate::actions;
use crate::proxy::{Protocol, ServicePort};

pub const TABLE: &str = "nat";
pub const CHAIN: &str = "ORIGIN-UNIDLING-CONTAINER";
pub const JUMP_COMMENT: &str = "handle ClusterIPs of idled services";
pub const JUMP_FROM: [&str; 2] = ["PREROUTING", "OUTPUT"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}
impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn cmd(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// Where a portal rule sends the traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// to a local listener
    Redirect { to_port: u16 },
    /// to a netfilter queue
    Queue { num: u16 },
}

/// A rule of [`CHAIN`], without the add/delete operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub family: Family,
    pub args: Vec<String>,
}

fn args<const N: usize>(v: [&str; N]) -> Vec<String> {
    v.into_iter().map(String::from).collect()
}

pub fn jump_rule() -> Vec<String> {
    args(["-m", "comment", "--comment", JUMP_COMMENT, "-j", CHAIN])
}

pub fn portal_rule(port: &ServicePort, target: Target) -> Rule {
    let proto = port.protocol.to_string();
    let prefix = match port.ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let dst = format!("{}/{prefix}", port.ip);
    let dport = port.port.to_string();
    let comment = port.name.to_string();

    let mut rule = args(["-p", proto.as_str(), "-d", dst.as_str(), "--dport", dport.as_str()]);
    if port.protocol == Protocol::TCP && matches!(target, Target::Queue { .. }) {
        rule.push("--syn".into());
    }
    rule.extend(args(["-m", "comment", "--comment", comment.as_str()]));

    match target {
        Target::Redirect { to_port } => {
            let to_port = to_port.to_string();
            rule.extend(args(["-j", "REDIRECT", "--to-ports", to_port.as_str()]));
        }
        Target::Queue { num } => {
            let num = num.to_string();
            rule.extend(args(["-j", "NFQUEUE", "--queue-num", num.as_str()]));
        }
    }

    Rule {
        family: Family::of(&port.ip),
        args: rule,
    }
}

fn command(op: &str, chain: &str, rule: &[String]) -> Vec<String> {
    let mut cmd = args(["-w", "-t", TABLE, op, chain]);
    cmd.extend(rule.iter().cloned());
    cmd
}

async fn run(family: Family, args: &[String]) -> actions::Result {
    actions::run(family.cmd(), args).await
}

/// Create the chain and its jumps, after removing leftovers of a previous run.
pub async fn setup() -> eyre::Result<()> {
    cleanup().await;

    for family in Family::ALL {
        let res = setup_family(family).await;
        match (family, res) {
            (_, Ok(())) => {}
            (Family::V4, Err(e)) => return Err(e.into()),
            (Family::V6, Err(e)) => warn!("{} setup failed, IPv6 services won't be unidled: {e}", family.cmd()),
        }
    }
    Ok(())
}

async fn setup_family(family: Family) -> actions::Result {
    run(family, &args(["-w", "-t", TABLE, "-N", CHAIN])).await?;
    for from in JUMP_FROM {
        run(family, &command("-I", from, &jump_rule())).await?;
    }
    info!("{}: created chain {CHAIN}", family.cmd());
    Ok(())
}

/// Remove the chain and its jumps. Missing parts are fine.
pub async fn cleanup() {
    for family in Family::ALL {
        for from in JUMP_FROM {
            // a jump may have been added more than once
            while run(family, &command("-D", from, &jump_rule())).await.is_ok() {
                debug!("{}: removed jump from {from}", family.cmd());
            }
        }
        let _ = run(family, &args(["-w", "-t", TABLE, "-F", CHAIN])).await;
        if run(family, &args(["-w", "-t", TABLE, "-X", CHAIN])).await.is_ok() {
            info!("{}: removed chain {CHAIN}", family.cmd());
        }
    }
}

pub async fn add(rule: &Rule) -> actions::Result {
    run(rule.family, &command("-A", CHAIN, &rule.args)).await
}

pub async fn delete(rule: &Rule) -> actions::Result {
    run(rule.family, &command("-D", CHAIN, &rule.args)).await
}
