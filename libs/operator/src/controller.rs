//! The per-`AkkaCluster` convergence loop: fetch, ensure children exist and match the desired
//! projection, mirror the status actor's latest known membership onto the CR, then arm polling.

use crate::crd::akkacluster::AkkaCluster;
use crate::error::{Error, Result};
use crate::generator::{self, ChildResource};
use crate::metrics::Metrics;
use crate::status::{ClusterKey, StatusActorHandle};
use crate::subset::subset_equal;
use crate::telemetry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::{
    api::{Api, Patch, PatchParams, PostParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::Reporter,
        watcher::Config,
    },
    Resource,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::*;

/// Field manager used on every server-side apply patch this operator issues.
const FIELD_MANAGER: &str = "akkacluster-operator";
/// Resync interval once a reconcile pass completed with no outstanding drift.
const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// Requeue delay used to re-enter the loop after a create/update, giving the watch cache a
/// moment to observe the write before the next pass re-reads it.
const CONVERGE_REQUEUE: Duration = Duration::from_secs(0);

#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub status_actor: StatusActorHandle,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Arc<Metrics>,
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
async fn reconcile(cluster: Arc<AkkaCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));

    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = cluster.namespace().ok_or_else(|| {
        Error::UserInputError(
            "Expected AkkaCluster resource to be namespaced. Can't deploy to an unknown namespace."
                .to_owned(),
        )
    })?;
    let name = cluster.name_any();
    let key: ClusterKey = (namespace.clone(), name.clone());

    // Step 1: re-fetch by name rather than trusting the triggering object, since it may be a
    // stale cache entry or not the CR at all (an owned child, a labeled pod, a change event).
    let api: Api<AkkaCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(mut current) = api.get_opt(&name).await? else {
        ctx.status_actor.stop_polling(key).await;
        return Ok(Action::await_change());
    };

    info!("Reconciling AkkaCluster \"{name}\" in {namespace}");

    // Step 2: converge children in generator order, returning early on the first divergence.
    let resources = generator::generate_resources(&mut current);
    for child in resources {
        let converged = match child {
            ChildResource::ServiceAccount(desired) => {
                ensure_child::<ServiceAccount>(&ctx.client, &namespace, &current, desired, false)
                    .await?
            }
            ChildResource::Role(desired) => {
                ensure_child::<Role>(&ctx.client, &namespace, &current, desired, false).await?
            }
            ChildResource::RoleBinding(desired) => {
                ensure_child::<RoleBinding>(&ctx.client, &namespace, &current, desired, false)
                    .await?
            }
            ChildResource::Deployment(desired) => {
                ensure_child::<Deployment>(&ctx.client, &namespace, &current, desired, true).await?
            }
        };
        if !converged {
            return Ok(Action::requeue(CONVERGE_REQUEUE));
        }
    }

    // Step 3: mirror the status actor's latest known membership onto the CR's status.
    if let Some(status) = ctx.status_actor.get_status(key).await {
        if current.status.as_ref() != Some(&status) {
            let patch = serde_json::json!({ "status": status });
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
                .await?;
        }
        current.status = Some(status);
    }

    // Step 4: unconditionally (re)arm polling, regardless of whether status changed above.
    ctx.status_actor.start_polling(current).await;

    // Step 5.
    Ok(Action::requeue(STEADY_STATE_REQUEUE))
}

/// Ensures one owned child of kind `K` matches `desired`: creates it if absent, patches it if
/// `subsetEqual(desired, live)` is false, and otherwise leaves it untouched. Returns whether the
/// child was already converged (`false` signals the caller to requeue and try again next pass).
async fn ensure_child<K>(
    client: &Client,
    namespace: &str,
    owner: &AkkaCluster,
    mut desired: K,
    controller: bool,
) -> Result<bool, Error>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    let owner_ref = if controller {
        owner.controller_owner_ref(&())
    } else {
        owner.owner_ref(&())
    };
    if let Some(owner_ref) = owner_ref {
        desired.owner_references_mut().push(owner_ref);
    }

    let name = desired.name_any();
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), &desired).await?;
            Ok(false)
        }
        Some(live) => {
            if subset_equal(&desired, &live)? {
                Ok(true)
            } else {
                api.patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&desired),
                )
                .await?;
                Ok(false)
            }
        }
    }
}

/// Maps an observed pod back to the `AkkaCluster` whose default selector (`app=<cr-name>`)
/// labeled it, so pod-level events can trigger a reconcile even though pods aren't owned by
/// the CR directly.
fn pod_to_cluster(
    pod: k8s_openapi::api::core::v1::Pod,
) -> Option<kube::runtime::reflector::ObjectRef<AkkaCluster>> {
    let namespace = pod.namespace()?;
    let name = pod.labels().get(generator::SELECTOR_LABEL_KEY)?.clone();
    Some(kube::runtime::reflector::ObjectRef::new(&name).within(&namespace))
}

fn error_policy(cluster: Arc<AkkaCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile.set_failure(&cluster, error);
    Action::requeue(Duration::from_secs(60))
}

/// Diagnostics read by the web server.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "akkacluster-controller".into(),
        }
    }
}

/// State shared between the controller and the web server.
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
    status_actor: StatusActorHandle,
}

impl State {
    pub fn new(status_actor: StatusActorHandle, metrics: Metrics) -> Self {
        Self {
            diagnostics: Arc::default(),
            metrics: Arc::new(metrics),
            status_actor,
        }
    }

    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry).unwrap();
        buffer
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            status_actor: self.status_actor.clone(),
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// Initialize the controller and run it to completion (given the CRD is installed).
///
/// `changes` is the status actor's outbound change-event stream: every emitted event causes
/// every cached `AkkaCluster` to be reconciled: a generic reconcile trigger built the same
/// way `Controller::reconcile_all_on` exposes any externally driven change stream.
pub async fn run(state: State, client: Client, changes: futures::channel::mpsc::Receiver<()>) {
    let clusters = Api::<AkkaCluster>::all(client.clone());
    if let Err(e) = clusters.list(&Default::default()).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let deployments = Api::<Deployment>::all(client.clone());
    let service_accounts = Api::<ServiceAccount>::all(client.clone());
    let roles = Api::<Role>::all(client.clone());
    let role_bindings = Api::<RoleBinding>::all(client.clone());
    let pods = Api::<k8s_openapi::api::core::v1::Pod>::all(client.clone());

    trace!("Init controller");
    Controller::new(clusters, Config::default().any_semantic())
        .owns(deployments, Config::default())
        .owns(service_accounts, Config::default())
        .owns(roles, Config::default())
        .owns(role_bindings, Config::default())
        // Pods aren't owned by the CR directly (ReplicaSet sits in between), so this maps each
        // observed pod back to the AkkaCluster the generator's default selector labeled it for,
        // rather than relying on an owner-reference lookup.
        .watches(pods, Config::default(), pod_to_cluster)
        .reconcile_all_on(changes)
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::akkacluster::AkkaClusterSpec;
    use crate::status::StatusActor;

    use http::{Request, Response};
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kube::client::Body;

    fn test_cluster(name: &str) -> AkkaCluster {
        let mut cluster = AkkaCluster::new(
            name,
            AkkaClusterSpec {
                deployment: DeploymentSpec {
                    replicas: Some(3),
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: "akka".to_owned(),
                                image: Some("akka-cluster:1.0.0".to_owned()),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                },
            },
        );
        cluster.meta_mut().namespace = Some("default".to_owned());
        cluster
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    impl Context {
        fn test() -> (Arc<Self>, ApiServerHandle) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, "default");
            let (status_actor, _changes) = StatusActor::spawn(mock_client.clone());
            let ctx = Self {
                client: mock_client,
                status_actor,
                diagnostics: Arc::default(),
                metrics: Arc::default(),
            };
            (Arc::new(ctx), handle)
        }
    }

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario completed")
    }

    #[tokio::test]
    async fn reconcile_of_a_missing_cr_stops_polling_and_issues_no_writes() {
        let (ctx, mut handle) = Context::test();
        let cluster = Arc::new(test_cluster("gone"));

        let mock = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert!(request
                .uri()
                .to_string()
                .starts_with("/apis/app.lightbend.com/v1alpha1/namespaces/default/akkaclusters/gone"));
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(
                        serde_json::to_vec(&serde_json::json!({
                            "apiVersion": "v1",
                            "kind": "Status",
                            "status": "Failure",
                            "reason": "NotFound",
                            "code": 404
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            );
        });

        let action = reconcile(cluster, ctx).await.expect("reconcile succeeds");
        timeout_after_1s(mock).await;
        assert_eq!(format!("{action:?}"), format!("{:?}", Action::await_change()));
    }

    #[tokio::test]
    async fn reconcile_creates_the_first_missing_child_and_requeues() {
        let (ctx, mut handle) = Context::test();
        let cluster = Arc::new(test_cluster("fresh"));
        let cluster_for_mock = (*cluster).clone();

        let mock = tokio::spawn(async move {
            // 1. re-fetch the CR by name.
            let (request, send) = handle.next_request().await.expect("get cr");
            assert_eq!(request.method(), http::Method::GET);
            let response = serde_json::to_vec(&cluster_for_mock).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());

            // 2. generator order with no preexisting ServiceAccount produces one first; the
            // reconciler checks for it, finds none, and creates it.
            let (request, send) = handle.next_request().await.expect("get service account");
            assert_eq!(request.method(), http::Method::GET);
            assert!(request
                .uri()
                .to_string()
                .starts_with("/api/v1/namespaces/default/serviceaccounts/fresh"));
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(
                        serde_json::to_vec(&serde_json::json!({
                            "apiVersion": "v1",
                            "kind": "Status",
                            "status": "Failure",
                            "reason": "NotFound",
                            "code": 404
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("create service account");
            assert_eq!(request.method(), http::Method::POST);
            assert_eq!(
                request.uri().to_string(),
                "/api/v1/namespaces/default/serviceaccounts?"
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let response = req_body.to_vec();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
        });

        let action = reconcile(cluster, ctx).await.expect("reconcile succeeds");
        timeout_after_1s(mock).await;
        assert_eq!(
            format!("{action:?}"),
            format!("{:?}", Action::requeue(CONVERGE_REQUEUE))
        );
    }
}
