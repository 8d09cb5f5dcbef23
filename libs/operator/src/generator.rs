use crate::crd::akkacluster::AkkaCluster;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{EnvVar, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

/// Container port name the status actor looks for to derive the management endpoint port.
pub const MANAGEMENT_PORT_NAME: &str = "management";
/// Fallback management port when no container declares a `management` port.
pub const DEFAULT_MANAGEMENT_PORT: i32 = 8558;

const BOOTSTRAP_ENV_NAME: &str = "AKKA_CLUSTER_BOOTSTRAP_SERVICE_NAME";
/// Label key the generator defaults `spec.selector`/`spec.template.labels` to when the CR
/// doesn't already specify a selector. Also used to map pod-watch events back to their CR.
pub const SELECTOR_LABEL_KEY: &str = "app";

/// A single desired child resource, in the order the reconciler must converge them.
#[derive(Debug, Clone)]
pub enum ChildResource {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Deployment(Deployment),
}

impl ChildResource {
    pub fn kind(&self) -> &'static str {
        match self {
            ChildResource::ServiceAccount(_) => "ServiceAccount",
            ChildResource::Role(_) => "Role",
            ChildResource::RoleBinding(_) => "RoleBinding",
            ChildResource::Deployment(_) => "Deployment",
        }
    }

    pub fn name(&self) -> String {
        match self {
            ChildResource::ServiceAccount(r) => r.name_any(),
            ChildResource::Role(r) => r.name_any(),
            ChildResource::RoleBinding(r) => r.name_any(),
            ChildResource::Deployment(r) => r.name_any(),
        }
    }
}

/// Produces the ordered list of desired child resources for `cluster`.
///
/// Defaults are filled onto `cluster.spec` in place (service account, selector, strategy,
/// bootstrap env var), mirroring the upstream generator which mutates the CR it is handed so
/// that the chosen defaults are visible to the caller afterwards. RBAC resources, when
/// produced, always precede the Deployment: its pods need the ServiceAccount to exist at
/// admission time.
pub fn generate_resources(cluster: &mut AkkaCluster) -> Vec<ChildResource> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let mut resources = Vec::with_capacity(4);

    let owner_meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace.clone()),
        ..Default::default()
    };

    let has_service_account = cluster
        .spec
        .deployment
        .template
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.as_deref())
        .is_some_and(|s| !s.is_empty());

    if !has_service_account {
        let service_account = ServiceAccount {
            metadata: owner_meta.clone(),
            ..Default::default()
        };

        let role = Role {
            metadata: owner_meta.clone(),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["".to_owned()]),
                resources: Some(vec!["pods".to_owned()]),
                verbs: vec!["get".to_owned(), "watch".to_owned(), "list".to_owned()],
                ..Default::default()
            }]),
        };

        let role_binding = RoleBinding {
            metadata: owner_meta.clone(),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_owned(),
                kind: "Role".to_owned(),
                name: name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_owned(),
                name: name.clone(),
                namespace: Some(namespace.clone()),
                ..Default::default()
            }]),
        };

        if let Some(pod_spec) = cluster.spec.deployment.template.spec.as_mut() {
            pod_spec.service_account_name = Some(name.clone());
        }

        resources.push(ChildResource::ServiceAccount(service_account));
        resources.push(ChildResource::Role(role));
        resources.push(ChildResource::RoleBinding(role_binding));
    }

    let selector = &mut cluster.spec.deployment.selector;
    if selector.match_labels.is_none() && selector.match_expressions.is_none() {
        let mut match_labels = std::collections::BTreeMap::new();
        match_labels.insert(SELECTOR_LABEL_KEY.to_owned(), name.clone());
        selector.match_labels = Some(match_labels);

        let template_labels = cluster
            .spec
            .deployment
            .template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(Default::default);
        template_labels.insert(SELECTOR_LABEL_KEY.to_owned(), name.clone());
    }

    let needs_strategy = cluster
        .spec
        .deployment
        .strategy
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("")
        .is_empty();
    if needs_strategy {
        cluster.spec.deployment.strategy = Some(DeploymentStrategy {
            type_: Some("RollingUpdate".to_owned()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: Some(IntOrString::Int(1)),
                max_unavailable: Some(IntOrString::Int(0)),
            }),
        });
    }

    if let Some(pod_spec) = cluster.spec.deployment.template.spec.as_mut() {
        for container in pod_spec.containers.iter_mut() {
            container.env.get_or_insert_with(Vec::new).push(EnvVar {
                name: BOOTSTRAP_ENV_NAME.to_owned(),
                value: Some(name.clone()),
                ..Default::default()
            });
        }
    }

    let deployment = Deployment {
        metadata: owner_meta,
        spec: Some(cluster.spec.deployment.clone()),
        ..Default::default()
    };
    resources.push(ChildResource::Deployment(deployment));

    resources
}
