use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AkkaCluster is the schema for the akkaclusters API.
///
/// `spec` is a Kubernetes `DeploymentSpec` verbatim, flattened so that the CRD's spec block
/// has no wrapper field: an `AkkaCluster` is a Deployment description plus gossip-membership
/// status, the way the upstream API embeds `apps.DeploymentSpec` into its spec struct.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "app.lightbend.com",
    version = "v1alpha1",
    kind = "AkkaCluster",
    namespaced,
    status = "AkkaClusterStatus",
    shortname = "akka",
    printcolumn = r#"{"name":"Leader", "type":"string", "jsonPath":".status.cluster.leader"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AkkaClusterSpec {
    #[serde(flatten)]
    pub deployment: DeploymentSpec,
}

/// AkkaClusterMemberStatus corresponds to a single entry in the Akka Management member list.
///
/// ref <https://github.com/akka/akka-management/blob/master/cluster-http/src/main/scala/akka/management/cluster/ClusterHttpManagementProtocol.scala>
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct MemberStatus {
    pub node: String,
    pub status: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Reports node(s)-to-node reachability problems observed by the gossip layer.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct UnreachableMemberStatus {
    pub node: String,
    #[serde(default, rename = "observedBy")]
    pub observed_by: Vec<String>,
}

/// Membership snapshot as returned verbatim by the gossip-management endpoint.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterMembership {
    #[serde(default)]
    pub members: Vec<MemberStatus>,
    #[serde(default)]
    pub unreachable: Vec<UnreachableMemberStatus>,
    #[serde(default)]
    pub leader: String,
    #[serde(default)]
    pub oldest: String,
    #[serde(default, rename = "oldestPerRole")]
    pub oldest_per_role: BTreeMap<String, String>,
}

/// AkkaClusterStatus defines the observed state of an AkkaCluster.
///
/// `managementHost`, `managementPort` and `lastUpdate` are operator-owned bookkeeping used to
/// resume polling against the last known leader; `cluster` comes verbatim from the gossip
/// endpoint and is never interpreted by the operator itself.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AkkaClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Time>,
    #[serde(default)]
    pub cluster: ClusterMembership,
}
