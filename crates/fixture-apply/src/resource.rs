//! Loosely-typed resource documents.
//!
//! Manifests may contain any kind of object, so resources are kept as a JSON
//! attribute map. Only the identity fields (apiVersion, kind, metadata.name,
//! metadata.namespace) and a few metadata fields get typed accessors; the rest
//! of the document is carried through untouched.

use std::{
	cmp::Ordering,
	collections::BTreeMap,
	fmt,
	hash::{Hash, Hasher},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A field exists but does not have the expected shape.
#[derive(Debug, Error)]
#[error("field {path} is not a map of strings")]
pub struct FieldTypeError {
	pub path: String,
}

/// Split an apiVersion string into its group and version parts.
///
/// The core group has no prefix, so `v1` yields `("", "v1")`.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
	api_version.split_once('/').unwrap_or(("", api_version))
}

/// Identity of a resource inside a backend.
///
/// Two resources refer to the same backend object when group, kind, namespace
/// and name match. The version part of apiVersion is kept alongside so clients
/// that address objects by versioned paths can build a request from the key
/// alone, but it takes no part in comparison or hashing.
#[derive(Debug, Clone)]
pub struct ResourceKey {
	pub api_version: String,
	pub kind: String,
	pub namespace: Option<String>,
	pub name: String,
}

impl ResourceKey {
	pub fn new(
		api_version: impl Into<String>,
		kind: impl Into<String>,
		namespace: Option<&str>,
		name: impl Into<String>,
	) -> Self {
		Self {
			api_version: api_version.into(),
			kind: kind.into(),
			namespace: namespace.map(str::to_string),
			name: name.into(),
		}
	}

	pub fn group(&self) -> &str {
		split_api_version(&self.api_version).0
	}

	pub fn version(&self) -> &str {
		split_api_version(&self.api_version).1
	}

	/// Namespace as the config center expects it, empty for cluster-scoped objects.
	pub fn namespace_or_empty(&self) -> &str {
		self.namespace.as_deref().unwrap_or_default()
	}

	fn identity(&self) -> (&str, &str, Option<&str>, &str) {
		(
			self.group(),
			&self.kind,
			self.namespace.as_deref(),
			&self.name,
		)
	}
}

impl PartialEq for ResourceKey {
	fn eq(&self, other: &Self) -> bool {
		self.identity() == other.identity()
	}
}

impl Eq for ResourceKey {}

impl Hash for ResourceKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.identity().hash(state);
	}
}

impl PartialOrd for ResourceKey {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for ResourceKey {
	fn cmp(&self, other: &Self) -> Ordering {
		self.identity().cmp(&other.identity())
	}
}

impl fmt::Display for ResourceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(namespace) => write!(f, "{} {}/{}", self.kind, namespace, self.name),
			None => write!(f, "{} {}", self.kind, self.name),
		}
	}
}

/// A single decoded manifest document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Map<String, Value>);

impl Resource {
	pub fn from_map(map: Map<String, Value>) -> Self {
		Self(map)
	}

	/// Convert a typed object (for example a `k8s_openapi` struct) into a resource.
	///
	/// The object must serialize to a JSON mapping.
	pub fn from_object<T: Serialize>(object: &T) -> Result<Self, serde_json::Error> {
		match serde_json::to_value(object)? {
			Value::Object(map) => Ok(Self(map)),
			other => Err(<serde_json::Error as serde::de::Error>::custom(format!(
				"expected an object, got {}",
				json_type_name(&other)
			))),
		}
	}

	/// Convert this resource into a typed object.
	pub fn to_object<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_value(Value::Object(self.0.clone()))
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_map(&self) -> &Map<String, Value> {
		&self.0
	}

	pub fn into_map(self) -> Map<String, Value> {
		self.0
	}

	pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(&self.0)
	}

	pub fn api_version(&self) -> &str {
		self.str_field(&["apiVersion"]).unwrap_or_default()
	}

	pub fn group(&self) -> &str {
		split_api_version(self.api_version()).0
	}

	pub fn kind(&self) -> &str {
		self.str_field(&["kind"]).unwrap_or_default()
	}

	pub fn name(&self) -> &str {
		self.str_field(&["metadata", "name"]).unwrap_or_default()
	}

	pub fn namespace(&self) -> Option<&str> {
		self.str_field(&["metadata", "namespace"])
			.filter(|namespace| !namespace.is_empty())
	}

	/// The optimistic-concurrency token assigned by the backend.
	pub fn resource_version(&self) -> Option<&str> {
		self.str_field(&["metadata", "resourceVersion"])
	}

	/// Overwrite (or clear) the optimistic-concurrency token.
	pub fn set_resource_version(&mut self, version: Option<&str>) {
		match version {
			Some(version) => {
				self.object_mut(&["metadata"])
					.insert("resourceVersion".to_string(), Value::String(version.to_string()));
			}
			None => {
				if let Some(Value::Object(metadata)) = self.0.get_mut("metadata") {
					metadata.remove("resourceVersion");
				}
			}
		}
	}

	pub fn labels(&self) -> Result<Option<BTreeMap<String, String>>, FieldTypeError> {
		self.string_map(&["metadata", "labels"])
	}

	pub fn key(&self) -> ResourceKey {
		ResourceKey::new(self.api_version(), self.kind(), self.namespace(), self.name())
	}

	/// Look up a nested field.
	pub fn field(&self, path: &[&str]) -> Option<&Value> {
		let (first, rest) = path.split_first()?;
		rest.iter()
			.try_fold(self.0.get(*first)?, |value, segment| value.get(*segment))
	}

	fn str_field(&self, path: &[&str]) -> Option<&str> {
		self.field(path).and_then(Value::as_str)
	}

	/// Read a nested map whose values must all be strings.
	///
	/// A missing or null field yields `None`.
	pub fn string_map(
		&self,
		path: &[&str],
	) -> Result<Option<BTreeMap<String, String>>, FieldTypeError> {
		let map = match self.field(path) {
			None | Some(Value::Null) => return Ok(None),
			Some(Value::Object(map)) => map,
			Some(_) => return Err(field_type_error(path)),
		};
		map.iter()
			.map(|(key, value)| match value {
				Value::String(value) => Ok((key.clone(), value.clone())),
				_ => Err(field_type_error(path)),
			})
			.collect::<Result<_, _>>()
			.map(Some)
	}

	/// Write a nested string map, creating intermediate objects as needed.
	pub fn set_string_map(&mut self, path: &[&str], map: BTreeMap<String, String>) {
		let Some((last, parents)) = path.split_last() else {
			return;
		};
		let value = map.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
		self.object_mut(parents)
			.insert((*last).to_string(), Value::Object(value));
	}

	/// Walk to a nested object, replacing anything in the way that is not one.
	fn object_mut(&mut self, path: &[&str]) -> &mut Map<String, Value> {
		let mut current = &mut self.0;
		for segment in path {
			let slot = current
				.entry((*segment).to_string())
				.or_insert_with(|| Value::Object(Map::new()));
			if !slot.is_object() {
				*slot = Value::Object(Map::new());
			}
			current = match slot {
				Value::Object(map) => map,
				_ => unreachable!("slot was just replaced with an object"),
			};
		}
		current
	}
}

impl From<Resource> for Value {
	fn from(resource: Resource) -> Self {
		Value::Object(resource.0)
	}
}

fn field_type_error(path: &[&str]) -> FieldTypeError {
	FieldTypeError {
		path: path.join("."),
	}
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "sequence",
		Value::Object(_) => "mapping",
	}
}
