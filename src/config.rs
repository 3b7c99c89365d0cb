use eyre::{Result, format_err};
use tokio::time::Duration;

use crate::{egress_dns, proxy, unidler};

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Namespace to watch services and endpoints in, instead of the whole cluster.
    pub namespace: Option<String>,

    /// Kubernetes API server URL
    pub cluster_url: Option<String>,

    /// Kubernetes watch events buffer size
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Period of the forced proxy synchronizations.
    #[serde(default = "default_sync_period_secs")]
    pub sync_period_secs: u64,

    /// Resolution of the DNS names used in egress network policies.
    #[serde(default)]
    pub egress_dns: egress_dns::Config,

    /// Main proxier, applying the rules of services that are not idled.
    pub proxy: proxy::exec::Config,

    /// Proxier of idled services.
    #[serde(default)]
    pub unidling: unidler::Config,
}
fn default_event_buffer() -> usize {
    100
}
fn default_sync_period_secs() -> u64 {
    30
}

impl Config {
    /// parse the cluster_url
    pub fn cluster_url(&self) -> Result<Option<http::Uri>> {
        match self.cluster_url {
            None => Ok(None),
            Some(ref v) => Ok(Some(v.parse()?)),
        }
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs.max(1))
    }

    /// Reject values the proxy can't run with.
    pub fn validate(&self) -> Result<()> {
        self.cluster_url()
            .map_err(|e| format_err!("invalid cluster_url: {e}"))?;

        let periods = [
            ("sync_period_secs", self.sync_period_secs),
            ("egress_dns.ttl_secs", self.egress_dns.ttl_secs),
            ("egress_dns.retry_secs", self.egress_dns.retry_secs),
            (
                "unidling.need_pods_wait_timeout_secs",
                self.unidling.need_pods_wait_timeout_secs,
            ),
        ];
        for (name, secs) in periods {
            if secs == 0 {
                return Err(format_err!("{name} must be at least 1"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_minimal_config() {
        let cfg: Config = serde_yaml::from_str("proxy: {cmd: /usr/local/bin/apply-rules}").unwrap();
        assert_eq!(cfg.event_buffer, 100);
        assert_eq!(cfg.sync_period(), Duration::from_secs(30));
        assert_eq!(cfg.proxy.cmd, "/usr/local/bin/apply-rules");
        assert!(cfg.proxy.args.is_empty());
        assert_eq!(cfg.unidling.max_held_connections, 16);
        assert!(cfg.cluster_url().unwrap().is_none());
    }

    #[test]
    fn test_full_config() {
        let cfg: Config = serde_yaml::from_str(
            r#"
namespace: team-a
cluster_url: https://10.0.0.1:6443
sync_period_secs: 5
egress_dns: {ttl_secs: 60}
proxy: {cmd: sh, args: [-c, "cat > /run/rules.json"]}
unidling: {interception: queue, queue_num: 3, signaler: idler}
"#,
        )
        .unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("team-a"));
        assert_eq!(cfg.egress_dns.ttl_secs, 60);
        assert_eq!(cfg.proxy.args, ["-c", "cat > /run/rules.json"]);
        assert_eq!(cfg.unidling.interception, unidler::Interception::Queue);
        assert_eq!(cfg.unidling.queue_num, 3);
        assert!(cfg.cluster_url().unwrap().is_some());

        assert!(cfg.validate().is_ok());

        let bad: Config = serde_yaml::from_str("{cluster_url: 'not a url', proxy: {cmd: x}}").unwrap();
        assert!(bad.cluster_url().is_err());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_zero_periods() {
        for yaml in [
            "{sync_period_secs: 0, proxy: {cmd: x}}",
            "{egress_dns: {ttl_secs: 0}, proxy: {cmd: x}}",
            "{egress_dns: {retry_secs: 0}, proxy: {cmd: x}}",
            "{unidling: {need_pods_wait_timeout_secs: 0}, proxy: {cmd: x}}",
        ] {
            let cfg: Config = serde_yaml::from_str(yaml).unwrap();
            let err = cfg.validate().unwrap_err().to_string();
            assert!(err.contains("must be at least 1"), "{yaml}: {err}");
        }

        // still usable when not validated
        let cfg: Config = serde_yaml::from_str(
            "{sync_period_secs: 0, unidling: {need_pods_wait_timeout_secs: 0}, proxy: {cmd: x}}",
        )
        .unwrap();
        assert_eq!(cfg.sync_period(), Duration::from_secs(1));
        assert_eq!(cfg.unidling.need_pods_wait_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_sync_period_ticks() {
        let cfg: Config = serde_yaml::from_str("{sync_period_secs: 0, proxy: {cmd: x}}").unwrap();
        let stop = CancellationToken::new();
        let mut ticks = 0;
        crate::proxy::every(cfg.sync_period(), &stop, || {
            ticks += 1;
            stop.cancel();
        })
        .await;
        assert_eq!(ticks, 1);
    }
}
