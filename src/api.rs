//! Cluster resources consumed by the proxy, and the wire constants shared with their controllers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Network ID of namespaces sharing the flat, unisolated network.
pub const GLOBAL_VNID: u32 = 0;

/// Annotation set on Endpoints by the idler, holding the time the service was idled.
pub const IDLED_AT_ANNOTATION: &str = "idling.alpha.openshift.io/idled-at";

/// Event reason emitted when an idled service receives traffic.
pub const NEED_PODS_REASON: &str = "NeedPods";

/// JSON patches (RFC 6902) understood by the Idler controller. Kept byte-for-byte.
const IDLE_PATCH: &str = r#"[{"op":"replace","path":"/spec/wantIdle","value":true}]"#;
const UNIDLE_PATCH: &str = r#"[{"op":"replace","path":"/spec/wantIdle","value":false}]"#;

pub fn want_idle_patch(want_idle: bool) -> &'static str {
    if want_idle { IDLE_PATCH } else { UNIDLE_PATCH }
}

#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "network.openshift.io",
    version = "v1",
    kind = "EgressNetworkPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EgressNetworkPolicySpec {
    #[serde(default)]
    pub egress: Vec<EgressNetworkPolicyRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct EgressNetworkPolicyRule {
    #[serde(rename = "type")]
    pub type_: EgressNetworkPolicyRuleType,
    pub to: EgressNetworkPolicyPeer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EgressNetworkPolicyRuleType {
    Allow,
    Deny,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressNetworkPolicyPeer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

impl EgressNetworkPolicy {
    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    /// DNS names referenced by the policy's rules, in rule order.
    pub fn dns_names(&self) -> impl Iterator<Item = &str> {
        (self.spec.egress.iter()).filter_map(|rule| rule.to.dns_name.as_deref().filter(|n| !n.is_empty()))
    }
}

/// Maps a namespace to its network ID. Fields are at the top level, not under a spec.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NetNamespace {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub netname: String,
    #[serde(default)]
    pub netid: u32,
    #[serde(default, rename = "egressIPs")]
    pub egress_ips: Vec<String>,
}

impl k8s_openapi::Resource for NetNamespace {
    const API_VERSION: &'static str = "network.openshift.io/v1";
    const GROUP: &'static str = "network.openshift.io";
    const KIND: &'static str = "NetNamespace";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "netnamespaces";
    type Scope = k8s_openapi::ClusterResourceScope;
}

impl k8s_openapi::Metadata for NetNamespace {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Cluster-wide network configuration; the one named `default` is authoritative.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ClusterNetwork {
    pub metadata: ObjectMeta,
    /// legacy single cluster network
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default, rename = "serviceNetwork")]
    pub service_network: String,
    #[serde(default, rename = "clusterNetworks")]
    pub cluster_networks: Vec<ClusterNetworkEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ClusterNetworkEntry {
    #[serde(rename = "CIDR")]
    pub cidr: String,
    #[serde(default, rename = "hostSubnetLength")]
    pub host_subnet_length: u32,
}

impl k8s_openapi::Resource for ClusterNetwork {
    const API_VERSION: &'static str = "network.openshift.io/v1";
    const GROUP: &'static str = "network.openshift.io";
    const KIND: &'static str = "ClusterNetwork";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "clusternetworks";
    type Scope = k8s_openapi::ClusterResourceScope;
}

impl k8s_openapi::Metadata for ClusterNetwork {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "idling.openshift.io",
    version = "v1alpha2",
    kind = "Idler",
    status = "IdlerStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IdlerSpec {
    pub want_idle: bool,
    #[serde(default)]
    pub target_scalables: Vec<CrossGroupObjectReference>,
    #[serde(default)]
    pub trigger_service_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CrossGroupObjectReference {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdlerStatus {
    #[serde(default)]
    pub idled: bool,
    #[serde(default)]
    pub inactive_service_names: Vec<String>,
}

impl Idler {
    pub fn is_triggered_by(&self, service_name: &str) -> bool {
        (self.spec.trigger_service_names.iter()).any(|name| name == service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_egress_network_policy() {
        let policy: EgressNetworkPolicy = serde_json::from_value(json!({
            "apiVersion": "network.openshift.io/v1",
            "kind": "EgressNetworkPolicy",
            "metadata": {"name": "default", "namespace": "ns1", "uid": "u1"},
            "spec": {
                "egress": [
                    {"type": "Allow", "to": {"dnsName": "www.example.com"}},
                    {"type": "Deny", "to": {"cidrSelector": "0.0.0.0/0"}}
                ]
            }
        }))
        .unwrap();

        assert_eq!(policy.uid(), Some("u1"));
        assert_eq!(policy.spec.egress[1].type_, EgressNetworkPolicyRuleType::Deny);
        assert_eq!(policy.dns_names().collect::<Vec<_>>(), vec!["www.example.com"]);
    }

    #[test]
    fn test_net_namespace() {
        let netns: NetNamespace = serde_json::from_value(json!({
            "apiVersion": "network.openshift.io/v1",
            "kind": "NetNamespace",
            "metadata": {"name": "default"},
            "netname": "default",
            "netid": 0
        }))
        .unwrap();

        assert_eq!(netns.netid, GLOBAL_VNID);
        assert_eq!(netns.netname, "default");
    }

    #[test]
    fn test_cluster_network() {
        let cn: ClusterNetwork = serde_json::from_value(json!({
            "metadata": {"name": "default"},
            "network": "10.128.0.0/14",
            "hostsubnetlength": 9,
            "serviceNetwork": "172.30.0.0/16",
            "clusterNetworks": [{"CIDR": "10.128.0.0/14", "hostSubnetLength": 9}]
        }))
        .unwrap();

        assert_eq!(cn.cluster_networks[0].cidr, "10.128.0.0/14");
        assert_eq!(cn.service_network, "172.30.0.0/16");
    }

    #[test]
    fn test_patches() {
        assert_eq!(
            want_idle_patch(false),
            "[{\"op\":\"replace\",\"path\":\"/spec/wantIdle\",\"value\":false}]"
        );
        assert_eq!(
            want_idle_patch(true),
            "[{\"op\":\"replace\",\"path\":\"/spec/wantIdle\",\"value\":true}]"
        );
    }
}
