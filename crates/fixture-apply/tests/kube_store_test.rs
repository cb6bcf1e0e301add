//! Integration tests for the Kubernetes-backed store using a mock API server.

use std::sync::Arc;

use assert_matches::assert_matches;
use fixture_apply::{
	apply::Outcome, backend::BackendError, testing::config_map_resource, with_teardown, Applier,
	DirBundle, HarnessConfig, KubeStore, LiveStore, NamespaceLabels, ResourceKey,
};
use k8s_mock::{HttpMockK8sServer, RunningHttpMockK8sServer};

fn applier() -> Applier {
	let bundle = DirBundle::new(
		std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/testdata/manifests"),
	);
	Applier::from_config(&HarnessConfig::default(), Arc::new(bundle)).with_namespace_labels(
		NamespaceLabels::from([("env".to_string(), "test".to_string())]),
	)
}

async fn connect(server: &RunningHttpMockK8sServer) -> Arc<dyn LiveStore> {
	let store = KubeStore::from_kubeconfig(server.kubeconfig(), None)
		.await
		.expect("failed to create connection");
	Arc::new(store)
}

#[tokio::test]
async fn test_create_then_update() {
	let server = HttpMockK8sServer::builder().build().start().await;
	let store = connect(&server).await;
	let applier = applier();

	let first = applier
		.apply_with_cleanup(&store, None, "namespace-and-config.yaml")
		.await
		.unwrap();
	assert!(first.iter().all(|a| a.outcome == Outcome::Created));

	let namespace = server.object("/api/v1/namespaces/fixture-demo").unwrap();
	assert_eq!(namespace["metadata"]["labels"]["env"], "test");
	let settings = server
		.object("/api/v1/namespaces/fixture-demo/configmaps/settings")
		.unwrap();
	assert_eq!(settings["data"]["mode"], "strict");

	let second = applier
		.apply_with_cleanup(&store, None, "namespace-and-config.yaml")
		.await
		.unwrap();
	assert!(second.iter().all(|a| a.outcome == Outcome::Updated));
	assert_eq!(server.request_count("POST").await, 2);
	assert_eq!(server.request_count("PUT").await, 2);
}

#[tokio::test]
async fn test_status_codes_map_to_backend_errors() {
	let server = HttpMockK8sServer::builder().build().start().await;
	let store = connect(&server).await;
	let missing = ResourceKey::new("v1", "ConfigMap", Some("demo"), "missing");

	assert_matches!(
		store.get(&missing).await,
		Err(BackendError::NotFound { key }) if key == missing
	);
	assert_matches!(
		store.delete(&missing).await,
		Err(BackendError::NotFound { .. })
	);

	let settings = config_map_resource("demo", "settings", &[("mode", "strict")]);
	let created = store.create(&settings).await.unwrap();
	assert!(created.resource_version().is_some());
	assert_matches!(
		store.create(&settings).await,
		Err(BackendError::AlreadyExists { .. })
	);

	let mut stale = created.clone();
	stale.set_resource_version(Some("0"));
	assert_matches!(
		store.update(&stale).await,
		Err(BackendError::Conflict { .. })
	);

	let updated = store.update(&created).await.unwrap();
	assert_ne!(updated.resource_version(), created.resource_version());
}

#[tokio::test]
async fn test_namespace_defaults_to_context() {
	let server = HttpMockK8sServer::builder().build().start().await;
	let store = connect(&server).await;

	let unscoped = config_map_resource("", "settings", &[]);
	store.create(&unscoped).await.unwrap();

	assert!(server
		.object("/api/v1/namespaces/default/configmaps/settings")
		.is_some());
}

#[tokio::test]
async fn test_teardown_removes_gateway_resources() {
	let server = HttpMockK8sServer::builder().build().start().await;
	let store = connect(&server).await;

	let (applied, report) = with_teardown(move |registry| async move {
		applier()
			.apply_with_cleanup(&store, Some(&*registry), "gateway.yaml")
			.await
	})
	.await;

	assert_eq!(applied.unwrap().len(), 2);
	assert!(report.is_clean());
	assert_eq!(report.deleted.len(), 2);
	assert_eq!(report.deleted[0].kind, "HTTPRoute");
	assert!(server
		.object("/apis/gateway.networking.k8s.io/v1/namespaces/fixture-demo/gateways/same-namespace")
		.is_none());
	assert_eq!(server.request_count("DELETE").await, 2);
}
