//! Helper functions for mock Kubernetes testing.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use wiremock::ResponseTemplate;

/// A request path split into its collection and optional object name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
	/// Collection path, e.g. `/api/v1/namespaces/default/configmaps`.
	pub collection: String,
	pub namespace: Option<String>,
	pub name: Option<String>,
}

/// Parse a Kubernetes API path.
///
/// Examples:
/// - `/api/v1/namespaces/default/configmaps/my-config` -> (`/api/v1/namespaces/default/configmaps`, `my-config`)
/// - `/apis/apps/v1/namespaces/default/deployments` -> (`/apis/apps/v1/namespaces/default/deployments`, none)
/// - `/api/v1/namespaces/my-ns` -> (`/api/v1/namespaces`, `my-ns`)
///
/// Discovery paths such as `/api/v1` yield `None`.
pub fn parse_resource_path(path: &str) -> Option<ResourcePath> {
	let path = path.trim_end_matches('/');
	let (base, rest) = if let Some(rest) = path.strip_prefix("/api/") {
		let (version, rest) = rest.split_once('/')?;
		(format!("/api/{version}"), rest)
	} else if let Some(rest) = path.strip_prefix("/apis/") {
		let mut parts = rest.splitn(3, '/');
		let group = parts.next()?;
		let version = parts.next()?;
		(format!("/apis/{group}/{version}"), parts.next()?)
	} else {
		return None;
	};

	let segments: Vec<&str> = rest.split('/').collect();
	if segments.iter().any(|s| s.is_empty()) {
		return None;
	}

	let (collection, namespace, name) = match segments.as_slice() {
		["namespaces", namespace, plural] => (
			format!("{base}/namespaces/{namespace}/{plural}"),
			Some(*namespace),
			None,
		),
		["namespaces", namespace, plural, name] => (
			format!("{base}/namespaces/{namespace}/{plural}"),
			Some(*namespace),
			Some(*name),
		),
		[plural] => (format!("{base}/{plural}"), None, None),
		[plural, name] => (format!("{base}/{plural}"), None, Some(*name)),
		_ => return None,
	};

	Some(ResourcePath {
		collection,
		namespace: namespace.map(str::to_string),
		name: name.map(str::to_string),
	})
}

/// Failure response in the shape of a `meta/v1` Status.
pub(crate) fn status_response(code: u16, reason: &str, message: String) -> ResponseTemplate {
	let status = Status {
		code: Some(i32::from(code)),
		message: Some(message),
		reason: Some(reason.to_string()),
		status: Some("Failure".to_string()),
		..Status::default()
	};
	ResponseTemplate::new(code).set_body_json(status)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_namespaced_object() {
		assert_eq!(
			parse_resource_path("/api/v1/namespaces/default/configmaps/my-config"),
			Some(ResourcePath {
				collection: "/api/v1/namespaces/default/configmaps".to_string(),
				namespace: Some("default".to_string()),
				name: Some("my-config".to_string()),
			})
		);
	}

	#[test]
	fn test_group_collection() {
		assert_eq!(
			parse_resource_path("/apis/apps/v1/namespaces/demo/deployments"),
			Some(ResourcePath {
				collection: "/apis/apps/v1/namespaces/demo/deployments".to_string(),
				namespace: Some("demo".to_string()),
				name: None,
			})
		);
	}

	#[test]
	fn test_namespace_object() {
		assert_eq!(
			parse_resource_path("/api/v1/namespaces/my-ns"),
			Some(ResourcePath {
				collection: "/api/v1/namespaces".to_string(),
				namespace: None,
				name: Some("my-ns".to_string()),
			})
		);
	}

	#[test]
	fn test_discovery_paths_are_not_resources() {
		assert_eq!(parse_resource_path("/api/v1"), None);
		assert_eq!(parse_resource_path("/apis/apps/v1"), None);
		assert_eq!(parse_resource_path("/version"), None);
	}
}
