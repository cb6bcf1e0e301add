//! Reconciliation tests against the recording in-memory backends.
//!
//! Manifests come from `tests/testdata/manifests`, read through a [`DirBundle`].

use std::sync::Arc;

use assert_matches::assert_matches;
use fixture_apply::{
	apply::{ApplyError, Outcome},
	backend::{BackendError, ConfigCenter, LiveStore},
	testing::{config_map_resource, ConfigCall, MemoryConfigCenter, MemoryStore, StoreCall, StoreOp},
	with_teardown, Applier, DirBundle, HarnessConfig, NamespaceLabels, Resource, ResourceKey,
	TeardownRegistry,
};
use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use rstest::rstest;

const NAMESPACE_AND_CONFIG: &str = "namespace-and-config.yaml";

fn bundle() -> Arc<DirBundle> {
	Arc::new(DirBundle::new(
		std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/testdata/manifests"),
	))
}

fn applier() -> Applier {
	let labels = NamespaceLabels::from([("env".to_string(), "test".to_string())]);
	Applier::from_config(&HarnessConfig::default(), bundle()).with_namespace_labels(labels)
}

fn store() -> (Arc<MemoryStore>, Arc<dyn LiveStore>) {
	let memory = Arc::new(MemoryStore::new());
	let store: Arc<dyn LiveStore> = memory.clone();
	(memory, store)
}

fn namespace_key() -> ResourceKey {
	ResourceKey::new("v1", "Namespace", None, "fixture-demo")
}

fn settings_key() -> ResourceKey {
	ResourceKey::new("v1", "ConfigMap", Some("fixture-demo"), "settings")
}

#[tokio::test]
async fn test_fresh_apply_creates_and_registers_teardown() {
	let (memory, store) = store();
	let registry = TeardownRegistry::new();
	let applier = applier();

	let resources = applier.load(NAMESPACE_AND_CONFIG).await.unwrap();
	assert_eq!(resources.len(), 2);
	let labels = resources[0].labels().unwrap().unwrap();
	assert_eq!(labels.get("env").map(String::as_str), Some("test"));
	assert_eq!(resources[1].labels().unwrap(), None);

	let applied = applier
		.apply_with_cleanup(&store, Some(&registry), NAMESPACE_AND_CONFIG)
		.await
		.unwrap();

	assert!(applied.iter().all(|a| a.outcome == Outcome::Created));
	assert_eq!(memory.count(StoreOp::Create), 2);
	assert_eq!(memory.count(StoreOp::Update), 0);
	assert_eq!(registry.keys(), vec![namespace_key(), settings_key()]);

	registry.run_all().await;
	assert!(memory.is_empty());
}

#[tokio::test]
async fn test_second_apply_updates() {
	let (memory, store) = store();
	let applier = applier();

	applier
		.apply_with_cleanup(&store, None, NAMESPACE_AND_CONFIG)
		.await
		.unwrap();
	let live_versions: Vec<_> = [namespace_key(), settings_key()]
		.iter()
		.map(|key| {
			memory
				.object(key)
				.and_then(|o| o.resource_version().map(str::to_string))
		})
		.collect();

	let applied = applier
		.apply_with_cleanup(&store, None, NAMESPACE_AND_CONFIG)
		.await
		.unwrap();

	assert!(applied.iter().all(|a| a.outcome == Outcome::Updated));
	assert_eq!(memory.count(StoreOp::Get), 4);
	assert_eq!(memory.count(StoreOp::Create), 2);
	assert_eq!(memory.count(StoreOp::Update), 2);

	let sent_versions: Vec<_> = memory
		.calls()
		.into_iter()
		.filter_map(|call| match call {
			StoreCall::Update(resource) => resource.resource_version().map(str::to_string),
			_ => None,
		})
		.collect();
	assert_eq!(sent_versions, live_versions.into_iter().flatten().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_update_carries_live_token() {
	let (memory, store) = store();
	let live = memory.seed(&config_map_resource("demo", "settings", &[]));

	let mut desired = config_map_resource("demo", "settings", &[("mode", "strict")]);
	desired.set_resource_version(Some("999"));

	let applied = applier()
		.apply_resources_with_cleanup(&store, None, vec![desired])
		.await
		.unwrap();

	assert_eq!(applied[0].outcome, Outcome::Updated);
	let calls = memory.calls();
	assert_eq!(calls.len(), 2);
	assert_matches!(&calls[0], StoreCall::Get(key) if key.name == "settings");
	assert_matches!(
		&calls[1],
		StoreCall::Update(sent) if sent.resource_version() == live.resource_version()
	);
}

#[tokio::test]
async fn test_version_bump_updates_the_same_object() {
	let (memory, store) = store();
	let gateway = |api_version: &str| {
		Resource::from_object(&serde_json::json!({
			"apiVersion": api_version,
			"kind": "Gateway",
			"metadata": { "name": "edge", "namespace": "demo" }
		}))
		.unwrap()
	};
	memory.seed(&gateway("gateway.networking.k8s.io/v1beta1"));

	let applied = applier()
		.apply_resources_with_cleanup(&store, None, vec![gateway("gateway.networking.k8s.io/v1")])
		.await
		.unwrap();

	assert_eq!(applied[0].outcome, Outcome::Updated);
	assert_eq!(memory.len(), 1);
}

#[tokio::test]
async fn test_blind_create_tolerates_existing_object() {
	let (memory, store) = store();
	memory.seed(&config_map_resource("demo", "settings", &[]));
	let registry = TeardownRegistry::new();

	let object = ConfigMap {
		metadata: ObjectMeta {
			name: Some("settings".to_string()),
			namespace: Some("demo".to_string()),
			..ObjectMeta::default()
		},
		..ConfigMap::default()
	};

	let applied = applier()
		.apply_objects_with_cleanup(&store, Some(&registry), &[object])
		.await
		.unwrap();

	assert_eq!(applied[0].outcome, Outcome::AlreadyExists);
	assert_eq!(memory.count(StoreOp::Get), 0);
	assert_eq!(memory.count(StoreOp::Create), 1);
	assert_eq!(
		registry.keys(),
		vec![ResourceKey::new("v1", "ConfigMap", Some("demo"), "settings")]
	);
}

#[tokio::test]
async fn test_create_race_is_tolerated_without_teardown() {
	let (memory, store) = store();
	memory.inject(
		StoreOp::Create,
		BackendError::AlreadyExists {
			key: settings_key(),
		},
	);
	let registry = TeardownRegistry::new();

	let applied = applier()
		.apply_resources_with_cleanup(
			&store,
			Some(&registry),
			vec![config_map_resource("fixture-demo", "settings", &[])],
		)
		.await
		.unwrap();

	assert_eq!(applied[0].outcome, Outcome::AlreadyExists);
	assert!(registry.is_empty());
}

#[tokio::test]
async fn test_teardown_runs_in_reverse_order() {
	let (memory, store) = store();
	let registry = TeardownRegistry::new();
	let resources = ["r1", "r2", "r3"]
		.iter()
		.map(|name| config_map_resource("demo", name, &[]))
		.collect();

	applier()
		.apply_resources_with_cleanup(&store, Some(&registry), resources)
		.await
		.unwrap();
	let report = registry.run_all().await;

	assert!(report.is_clean());
	let deleted: Vec<_> = memory
		.calls()
		.into_iter()
		.filter_map(|call| match call {
			StoreCall::Delete(key) => Some(key.name),
			_ => None,
		})
		.collect();
	assert_eq!(deleted, ["r3", "r2", "r1"]);
}

#[tokio::test]
async fn test_failure_keeps_earlier_resources() {
	let (memory, store) = store();
	memory.seed(&config_map_resource("demo", "b", &[]));
	memory.inject(StoreOp::Update, BackendError::Invalid("rejected".into()));
	let registry = TeardownRegistry::new();

	let err = applier()
		.apply_resources_with_cleanup(
			&store,
			Some(&registry),
			vec![
				config_map_resource("demo", "a", &[]),
				config_map_resource("demo", "b", &[]),
				config_map_resource("demo", "c", &[]),
			],
		)
		.await
		.unwrap_err();

	assert_matches!(err, ApplyError::UpdateFailed { ref key, .. } if key.name == "b");
	let a = ResourceKey::new("v1", "ConfigMap", Some("demo"), "a");
	let c = ResourceKey::new("v1", "ConfigMap", Some("demo"), "c");
	assert!(memory.object(&a).is_some());
	assert!(memory.object(&c).is_none());
	assert_eq!(registry.keys(), vec![a]);
}

#[tokio::test]
async fn test_explicit_delete() {
	let (memory, store) = store();
	let applier = applier();
	applier
		.apply_with_cleanup(&store, None, NAMESPACE_AND_CONFIG)
		.await
		.unwrap();

	let deleted = applier.delete(&store, NAMESPACE_AND_CONFIG).await.unwrap();
	assert_eq!(deleted, vec![namespace_key(), settings_key()]);
	assert!(memory.is_empty());

	assert_matches!(
		applier.delete(&store, NAMESPACE_AND_CONFIG).await,
		Err(ApplyError::DeleteFailed { ref key, .. }) if *key == namespace_key()
	);
}

#[tokio::test]
async fn test_publish_and_delete_config() {
	let memory = Arc::new(MemoryConfigCenter::new());
	let center: Arc<dyn ConfigCenter> = memory.clone();
	let applier = applier();

	let published = applier
		.publish_config(&center, None, "wasm-plugin.json")
		.await
		.unwrap();
	assert_eq!(published.len(), 1);

	let calls = memory.calls();
	assert_eq!(calls.len(), 1);
	let ConfigCall::Publish {
		kind,
		name,
		namespace,
		payload,
	} = &calls[0]
	else {
		panic!("expected a publish call, got {:?}", calls[0]);
	};
	assert_eq!(kind, "WasmPlugin");
	assert_eq!(name, "request-block");
	assert_eq!(namespace, "higress-system");
	let payload: serde_json::Value = serde_json::from_str(payload).unwrap();
	assert_eq!(payload["spec"]["defaultConfig"]["block_urls"][0], "swagger.html");

	applier
		.delete_config(&center, "wasm-plugin.json")
		.await
		.unwrap();
	assert_eq!(
		memory.calls()[1],
		ConfigCall::Delete {
			kind: "WasmPlugin".to_string(),
			name: "request-block".to_string(),
			namespace: "higress-system".to_string(),
		}
	);
	assert!(memory.is_empty());
}

#[tokio::test]
async fn test_publish_failure() {
	let memory = Arc::new(MemoryConfigCenter::new());
	memory.inject(BackendError::Invalid("unavailable".into()));
	let center: Arc<dyn ConfigCenter> = memory.clone();
	let registry = TeardownRegistry::new();

	assert_matches!(
		applier()
			.publish_config(&center, Some(&registry), "wasm-plugin.json")
			.await,
		Err(ApplyError::PublishFailed { .. })
	);
	assert!(registry.is_empty());
}

#[tokio::test]
async fn test_published_config_is_torn_down() {
	let memory = Arc::new(MemoryConfigCenter::new());
	let center: Arc<dyn ConfigCenter> = memory.clone();

	let (published, report) = with_teardown(move |registry| async move {
		applier()
			.publish_config(&center, Some(&*registry), "wasm-plugin.json")
			.await
	})
	.await;

	assert_eq!(published.unwrap().len(), 1);
	assert!(report.is_clean());
	assert!(memory.is_empty());
	assert_matches!(memory.calls().last(), Some(ConfigCall::Delete { .. }));
}

#[rstest]
#[case::yaml_with_empty_documents("gateway.yaml", &["Gateway", "HTTPRoute"])]
#[case::json("wasm-plugin.json", &["WasmPlugin"])]
#[tokio::test]
async fn test_load(#[case] location: &str, #[case] kinds: &[&str]) {
	let resources = applier().load(location).await.unwrap();
	let loaded: Vec<_> = resources.iter().map(|r| r.kind()).collect();
	assert_eq!(loaded, kinds);
}
