//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. Objects live in shared in-memory state; every write bumps a
//! server-wide resourceVersion counter.

use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	discovery::MockDiscovery,
	helpers::{parse_resource_path, status_response, ResourcePath},
};

const RESOURCE_PATHS: &str = r"^/apis?/";

#[derive(Default)]
struct ClusterState {
	/// Objects keyed by (collection path, name).
	objects: BTreeMap<(String, String), Value>,
	resource_version: u64,
}

impl ClusterState {
	fn next_version(&mut self) -> String {
		self.resource_version += 1;
		self.resource_version.to_string()
	}
}

#[derive(Clone, Default)]
struct SharedState(Arc<Mutex<ClusterState>>);

impl SharedState {
	fn lock(&self) -> MutexGuard<'_, ClusterState> {
		self.0.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery: MockDiscovery,
	/// Objects present when the server starts. The server derives API paths
	/// from apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	state: SharedState,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "Started mock K8s server");

		let state = SharedState::default();
		{
			let mut cluster = state.lock();
			let default_namespace = json!({
				"apiVersion": "v1",
				"kind": "Namespace",
				"metadata": { "name": "default" }
			});
			for manifest in self.resources.into_iter().chain([default_namespace]) {
				seed(&mut cluster, &self.discovery, manifest);
			}
		}

		mount_version(&server).await;
		mount_discovery(&server, &self.discovery).await;
		mount_resources(&server, &state).await;

		RunningHttpMockK8sServer { server, state }
	}
}

fn seed(cluster: &mut ClusterState, discovery: &MockDiscovery, mut manifest: Value) {
	let api_version = manifest["apiVersion"].as_str().unwrap_or_default();
	let kind = manifest["kind"].as_str().unwrap_or_default();
	let name = manifest["metadata"]["name"].as_str().unwrap_or_default().to_string();
	let namespace = manifest["metadata"]["namespace"].as_str();

	let Some(collection) = discovery.collection_path(api_version, kind, namespace) else {
		debug!(api_version, kind, "Skipping resource of unknown type");
		return;
	};
	if cluster.objects.contains_key(&(collection.clone(), name.clone())) {
		return;
	}

	trace!(collection = %collection, name = %name, "Registered resource");
	let version = cluster.next_version();
	set_metadata(&mut manifest, "resourceVersion", &version);
	cluster.objects.insert((collection, name), manifest);
}

fn set_metadata(object: &mut Value, field: &str, value: &str) {
	if let Some(object) = object.as_object_mut() {
		let metadata = object.entry("metadata").or_insert_with(|| json!({}));
		if let Some(metadata) = metadata.as_object_mut() {
			metadata.insert(field.to_string(), Value::String(value.to_string()));
		}
	}
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Current object at an object path such as `/api/v1/namespaces/demo/configmaps/a`.
	pub fn object(&self, object_path: &str) -> Option<Value> {
		let ResourcePath {
			collection, name, ..
		} = parse_resource_path(object_path)?;
		self.state.lock().objects.get(&(collection, name?)).cloned()
	}

	/// Snapshot of every stored object.
	pub fn objects(&self) -> Vec<Value> {
		self.state.lock().objects.values().cloned().collect()
	}

	/// The last resourceVersion handed out.
	pub fn resource_version(&self) -> u64 {
		self.state.lock().resource_version
	}

	/// Number of resource requests (discovery excluded) received with this HTTP method.
	pub async fn request_count(&self, http_method: &str) -> usize {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.iter()
			.filter(|req| req.method.as_str() == http_method)
			.filter(|req| parse_resource_path(req.url.path()).is_some())
			.count()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-01-01T00:00:00Z",
			"goVersion": "go1.22.0",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

/// Legacy discovery endpoints. Mounted before the resource handlers so they win.
async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery) {
	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<_> = discovery
		.group_resources
		.keys()
		.map(|gv| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	let core_resources: Vec<_> = discovery
		.core_resources
		.iter()
		.map(|r| r.to_json())
		.collect();

	Mock::given(method("GET"))
		.and(path("/api/v1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIResourceList",
			"apiVersion": "v1",
			"groupVersion": "v1",
			"resources": core_resources
		})))
		.mount(server)
		.await;

	for (gv, rs) in &discovery.group_resources {
		let resources: Vec<_> = rs.iter().map(|r| r.to_json()).collect();

		Mock::given(method("GET"))
			.and(path(format!("/apis/{}", gv)))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIResourceList",
				"apiVersion": "v1",
				"groupVersion": gv,
				"resources": resources
			})))
			.mount(server)
			.await;
	}
}

async fn mount_resources(server: &MockServer, state: &SharedState) {
	let get_state = state.clone();
	let post_state = state.clone();
	let put_state = state.clone();
	let delete_state = state.clone();

	// GET handles both single objects and lists
	Mock::given(method("GET"))
		.and(path_regex(RESOURCE_PATHS))
		.respond_with(move |req: &Request| {
			let Some(target) = parse_resource_path(req.url.path()) else {
				return not_found(req.url.path());
			};
			let cluster = get_state.lock();

			match target.name {
				Some(name) => match cluster.objects.get(&(target.collection, name.clone())) {
					Some(object) => ResponseTemplate::new(200).set_body_json(object),
					None => not_found(&name),
				},
				None => {
					let items: Vec<_> = cluster
						.objects
						.iter()
						.filter(|((collection, _), _)| *collection == target.collection)
						.map(|(_, object)| object.clone())
						.collect();
					ResponseTemplate::new(200).set_body_json(json!({
						"kind": "List",
						"apiVersion": "v1",
						"metadata": {"resourceVersion": cluster.resource_version.to_string()},
						"items": items
					}))
				}
			}
		})
		.mount(server)
		.await;

	// POST creates; an existing name is a conflict
	Mock::given(method("POST"))
		.and(path_regex(RESOURCE_PATHS))
		.respond_with(move |req: &Request| {
			let Some(target) = parse_resource_path(req.url.path()).filter(|t| t.name.is_none())
			else {
				return status_response(405, "MethodNotAllowed", "POST needs a collection".into());
			};
			let mut object: Value = match serde_json::from_slice(&req.body) {
				Ok(object) => object,
				Err(e) => return status_response(400, "BadRequest", e.to_string()),
			};
			let Some(name) = object["metadata"]["name"].as_str().map(str::to_string) else {
				return status_response(422, "Invalid", "metadata.name: Required value".into());
			};

			let mut cluster = post_state.lock();
			let key = (target.collection, name);
			if cluster.objects.contains_key(&key) {
				return status_response(409, "AlreadyExists", format!("\"{}\" already exists", key.1));
			}

			if let Some(namespace) = &target.namespace {
				set_metadata(&mut object, "namespace", namespace);
			}
			let version = cluster.next_version();
			set_metadata(&mut object, "resourceVersion", &version);
			debug!(collection = %key.0, name = %key.1, version = %version, "Created resource");
			cluster.objects.insert(key, object.clone());

			ResponseTemplate::new(201).set_body_json(object)
		})
		.mount(server)
		.await;

	// PUT replaces; a stale resourceVersion is a conflict
	Mock::given(method("PUT"))
		.and(path_regex(RESOURCE_PATHS))
		.respond_with(move |req: &Request| {
			let Some(ResourcePath {
				collection,
				name: Some(name),
				..
			}) = parse_resource_path(req.url.path())
			else {
				return status_response(405, "MethodNotAllowed", "PUT needs an object".into());
			};
			let mut object: Value = match serde_json::from_slice(&req.body) {
				Ok(object) => object,
				Err(e) => return status_response(400, "BadRequest", e.to_string()),
			};

			let mut cluster = put_state.lock();
			let key = (collection, name);
			let Some(live) = cluster.objects.get(&key) else {
				return not_found(&key.1);
			};
			let sent = object["metadata"]["resourceVersion"].as_str();
			let current = live["metadata"]["resourceVersion"].as_str();
			if sent.is_some() && sent != current {
				return status_response(
					409,
					"Conflict",
					format!(
						"Operation cannot be fulfilled on \"{}\": the object has been modified",
						key.1
					),
				);
			}

			let version = cluster.next_version();
			set_metadata(&mut object, "resourceVersion", &version);
			debug!(collection = %key.0, name = %key.1, version = %version, "Replaced resource");
			cluster.objects.insert(key, object.clone());

			ResponseTemplate::new(200).set_body_json(object)
		})
		.mount(server)
		.await;

	Mock::given(method("DELETE"))
		.and(path_regex(RESOURCE_PATHS))
		.respond_with(move |req: &Request| {
			let Some(ResourcePath {
				collection,
				name: Some(name),
				..
			}) = parse_resource_path(req.url.path())
			else {
				return status_response(405, "MethodNotAllowed", "DELETE needs an object".into());
			};

			let mut cluster = delete_state.lock();
			match cluster.objects.remove(&(collection, name.clone())) {
				Some(object) => {
					cluster.next_version();
					debug!(name = %name, "Deleted resource");
					ResponseTemplate::new(200).set_body_json(object)
				}
				None => not_found(&name),
			}
		})
		.mount(server)
		.await;
}

fn not_found(name: &str) -> ResponseTemplate {
	status_response(404, "NotFound", format!("\"{name}\" not found"))
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn send(
		method: reqwest::Method,
		url: String,
		body: Option<Value>,
	) -> (u16, Value) {
		let client = reqwest::Client::new();
		let mut request = client.request(method, url);
		if let Some(body) = body {
			request = request.json(&body);
		}
		let response = request.send().await.unwrap();
		let status = response.status().as_u16();
		(status, response.json().await.unwrap())
	}

	fn config_map(name: &str) -> Value {
		json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": { "name": name, "namespace": "demo" },
			"data": { "key": "value" }
		})
	}

	#[tokio::test]
	async fn test_create_get_replace_delete() {
		let server = HttpMockK8sServer::builder().build().start().await;
		let collection = format!("{}/api/v1/namespaces/demo/configmaps", server.uri());
		let object = format!("{collection}/settings");

		let (status, _) = send(reqwest::Method::GET, object.clone(), None).await;
		assert_eq!(status, 404);

		let (status, created) =
			send(reqwest::Method::POST, collection.clone(), Some(config_map("settings"))).await;
		assert_eq!(status, 201);
		let version = created["metadata"]["resourceVersion"].clone();

		let (status, body) =
			send(reqwest::Method::POST, collection, Some(config_map("settings"))).await;
		assert_eq!(status, 409);
		assert_eq!(body["reason"], "AlreadyExists");

		let mut stale = config_map("settings");
		stale["metadata"]["resourceVersion"] = json!("0");
		let (status, body) = send(reqwest::Method::PUT, object.clone(), Some(stale)).await;
		assert_eq!(status, 409);
		assert_eq!(body["reason"], "Conflict");

		let mut fresh = config_map("settings");
		fresh["metadata"]["resourceVersion"] = version.clone();
		let (status, replaced) = send(reqwest::Method::PUT, object.clone(), Some(fresh)).await;
		assert_eq!(status, 200);
		assert_ne!(replaced["metadata"]["resourceVersion"], version);

		let (status, _) = send(reqwest::Method::DELETE, object.clone(), None).await;
		assert_eq!(status, 200);
		let (status, _) = send(reqwest::Method::DELETE, object, None).await;
		assert_eq!(status, 404);

		assert_eq!(server.request_count("POST").await, 2);
		assert_eq!(server.request_count("DELETE").await, 2);
	}

	#[tokio::test]
	async fn test_seeded_objects_have_versions() {
		let server = HttpMockK8sServer::builder()
			.resources(vec![config_map("seeded")])
			.build()
			.start()
			.await;

		let seeded = server
			.object("/api/v1/namespaces/demo/configmaps/seeded")
			.unwrap();
		assert!(seeded["metadata"]["resourceVersion"].is_string());
		assert!(server.object("/api/v1/namespaces/default").is_some());
	}
}
