//! Mock Kubernetes API discovery types.

use std::collections::BTreeMap;

const VERBS: &[&str] = &["create", "delete", "get", "list", "update"];

/// Resource types the server knows about, keyed by group version.
pub struct MockDiscovery {
	pub core_resources: Vec<MockApiResource>,
	pub group_resources: BTreeMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("secrets", "Secret"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::namespaced("pods", "Pod"),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: BTreeMap::from([
				(
					"apps/v1".to_string(),
					vec![MockApiResource::namespaced("deployments", "Deployment")],
				),
				(
					"gateway.networking.k8s.io/v1".to_string(),
					vec![
						MockApiResource::cluster_scoped("gatewayclasses", "GatewayClass"),
						MockApiResource::namespaced("gateways", "Gateway"),
						MockApiResource::namespaced("httproutes", "HTTPRoute"),
					],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Look up a resource type by apiVersion and kind.
	pub fn find(&self, api_version: &str, kind: &str) -> Option<&MockApiResource> {
		let resources = if api_version.contains('/') {
			self.group_resources.get(api_version)?
		} else if api_version == "v1" {
			&self.core_resources
		} else {
			return None;
		};
		resources.iter().find(|r| r.kind == kind)
	}

	/// Collection path for objects of this type, e.g. `/apis/apps/v1/namespaces/demo/deployments`.
	pub fn collection_path(
		&self,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
	) -> Option<String> {
		let resource = self.find(api_version, kind)?;
		let base = if api_version.contains('/') {
			format!("/apis/{api_version}")
		} else {
			format!("/api/{api_version}")
		};
		Some(if resource.namespaced {
			format!(
				"{base}/namespaces/{}/{}",
				namespace.unwrap_or("default"),
				resource.name
			)
		} else {
			format!("{base}/{}", resource.name)
		})
	}
}

/// A mock API resource definition.
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self::new(name, kind, true)
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self::new(name, kind, false)
	}

	fn new(name: &str, kind: &str, namespaced: bool) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced,
			verbs: VERBS.iter().map(|v| (*v).to_string()).collect(),
		}
	}

	pub(crate) fn to_json(&self) -> serde_json::Value {
		serde_json::json!({
			"name": self.name,
			"singularName": "",
			"namespaced": self.namespaced,
			"kind": self.kind,
			"verbs": self.verbs,
		})
	}
}
