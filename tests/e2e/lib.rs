#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use akkacluster_operator::crd::{AkkaCluster, AkkaClusterSpec};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::api::core::v1::ServiceAccount;
    use kube::api::{Api, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use tokio::time::timeout;

    fn is_deployment_ready() -> impl Condition<Deployment> {
        |obj: Option<&Deployment>| {
            if let Some(deployment) = &obj {
                if let Some(status) = &deployment.status {
                    return status.replicas == status.updated_replicas
                        && status.replicas == status.ready_replicas;
                }
            }
            false
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(30),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    fn test_spec(replicas: i32) -> AkkaClusterSpec {
        AkkaClusterSpec {
            deployment: DeploymentSpec {
                replicas: Some(replicas),
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
        }
    }

    async fn setup(name: &str) -> (Api<AkkaCluster>, Api<Deployment>) {
        let cluster = AkkaCluster::new(name, test_spec(1));

        let client = Client::try_default().await.unwrap();
        let cluster_api = Api::<AkkaCluster>::namespaced(client.clone(), "default");

        cluster_api
            .create(&PostParams::default(), &cluster)
            .await
            .unwrap();

        let deployment_api = Api::<Deployment>::namespaced(client.clone(), "default");
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        (cluster_api, deployment_api)
    }

    #[tokio::test]
    async fn akkacluster_create_materializes_rbac_and_deployment() {
        let name = "test-create";
        let (cluster_api, deployment_api) = setup(name).await;

        let client = Client::try_default().await.unwrap();
        let sa_api = Api::<ServiceAccount>::namespaced(client.clone(), "default");
        let sa = sa_api.get(name).await.unwrap();
        assert_eq!(sa.name_any(), name);

        let deployment = deployment_api.get(name).await.unwrap();
        let pod_spec = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        assert_eq!(pod_spec.service_account_name.as_deref(), Some(name));

        let cluster = cluster_api.get(name).await.unwrap();
        assert_eq!(cluster.name_any(), name);
    }

    #[tokio::test]
    async fn akkacluster_delete_cascades_to_deployment_via_owner_reference() {
        let name = "test-delete-cluster";
        let (cluster_api, deployment_api) = setup(name).await;

        let deploy = deployment_api.get(name).await.unwrap();
        cluster_api.delete(name, &Default::default()).await.unwrap();

        wait_for(
            deployment_api.clone(),
            name,
            conditions::is_deleted(&deploy.uid().unwrap()),
        )
        .await;
    }

    #[tokio::test]
    async fn akkacluster_recreates_an_externally_deleted_deployment() {
        let name = "test-delete-deployment";
        let (cluster_api, deployment_api) = setup(name).await;

        let deploy = deployment_api.get(name).await.unwrap();
        deployment_api
            .delete(name, &Default::default())
            .await
            .unwrap();

        wait_for(
            deployment_api.clone(),
            name,
            conditions::is_deleted(&deploy.uid().unwrap()),
        )
        .await;
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;

        cluster_api.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn akkacluster_reverts_manual_drift_on_the_owned_deployment() {
        let name = "test-change-deployment";
        let (cluster_api, deployment_api) = setup(name).await;

        let mut deploy = deployment_api.get(name).await.unwrap();
        deploy.spec.as_mut().unwrap().replicas = Some(2);
        deploy.metadata.managed_fields = None;
        deployment_api
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&deploy),
            )
            .await
            .unwrap();

        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        let reverted = deployment_api.get(name).await.unwrap();
        assert_eq!(reverted.spec.unwrap().replicas.unwrap(), 1);

        cluster_api.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn akkacluster_scale_propagates_to_the_deployment() {
        let name = "test-change-cluster";
        let (cluster_api, deployment_api) = setup(name).await;

        let mut cluster = cluster_api.get(name).await.unwrap();
        cluster.spec.deployment.replicas = Some(2);
        cluster.metadata.managed_fields = None;
        cluster_api
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&cluster),
            )
            .await
            .unwrap();

        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        let scaled = deployment_api.get(name).await.unwrap();
        assert_eq!(scaled.spec.unwrap().replicas.unwrap(), 2);

        cluster_api.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn akkacluster_adopts_a_preexisting_deployment_of_the_same_name() {
        let name = "test-deployment-already-exists";
        let deployment = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": {
                        "containers": [
                            { "name": "akka", "image": "akka-cluster:1.0.0" }
                        ]
                    }
                }
            }
        });
        let client = Client::try_default().await.unwrap();
        let deployment_api = Api::<Deployment>::namespaced(client.clone(), "default");
        deployment_api
            .create(
                &PostParams::default(),
                &serde_json::from_value(deployment).unwrap(),
            )
            .await
            .unwrap();

        let (cluster_api, _) = setup(name).await;
        cluster_api.delete(name, &Default::default()).await.unwrap();
    }
}
