//! Manifest decoding.
//!
//! A manifest is a stream of documents, either YAML (separated by `---`) or
//! concatenated JSON values. Each non-empty document becomes one [`Resource`],
//! with namespace labels injected on the way out.
//!
//! Input starting with `{` is read as JSON first. Once the JSON reader hits
//! something that is not JSON (a `---` separator, a YAML flow mapping), the
//! rest of the input is read as YAML.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{de::SliceRead, StreamDeserializer, Value};
use thiserror::Error;

use crate::resource::{json_type_name, FieldTypeError, Resource};

/// Labels added to every core `Namespace` object in a manifest.
pub type NamespaceLabels = BTreeMap<String, String>;

const LABELS_PATH: &[&str] = &["metadata", "labels"];

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("document {index}: invalid YAML")]
	Yaml {
		index: usize,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("document {index}: invalid JSON")]
	Json {
		index: usize,
		#[source]
		source: serde_json::Error,
	},

	#[error("document {index}: expected a mapping, got {found}")]
	NotAnObject { index: usize, found: &'static str },

	#[error("namespace {name}: existing labels can not be extended")]
	Labels {
		name: String,
		#[source]
		source: FieldTypeError,
	},
}

/// Decoding stopped early; everything decoded before the failure is kept.
#[derive(Debug, Error)]
#[error("decoding stopped after {} resources", resources.len())]
pub struct PartialDecode {
	pub resources: Vec<Resource>,
	#[source]
	pub error: DecodeError,
}

/// Add `labels` to a core `Namespace` resource. Other resources are left untouched.
///
/// Existing labels with the same key are overwritten, so applying the same set
/// twice gives the same result.
pub fn apply_namespace_labels(
	resource: &mut Resource,
	labels: &NamespaceLabels,
) -> Result<(), DecodeError> {
	if resource.kind() != "Namespace" || !resource.group().is_empty() {
		return Ok(());
	}

	let mut merged = resource
		.string_map(LABELS_PATH)
		.map_err(|source| DecodeError::Labels {
			name: resource.name().to_string(),
			source,
		})?
		.unwrap_or_default();
	merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));

	if !merged.is_empty() {
		resource.set_string_map(LABELS_PATH, merged);
	}
	Ok(())
}

enum Documents<'a> {
	Json(StreamDeserializer<'a, SliceRead<'a>, Value>),
	Yaml(serde_yaml::Deserializer<'a>),
}

/// Lazily decodes resources from a manifest.
///
/// The stream yields at most one error, after which it is exhausted.
pub struct ResourceStream<'a> {
	bytes: &'a [u8],
	documents: Documents<'a>,
	labels: &'a NamespaceLabels,
	index: usize,
	failed: bool,
}

/// Start decoding `bytes`.
///
/// Input whose first non-whitespace byte is `{` is read as concatenated JSON
/// values up to the first syntax error, anything else as a YAML stream.
pub fn decode<'a>(bytes: &'a [u8], labels: &'a NamespaceLabels) -> ResourceStream<'a> {
	let documents = if looks_like_json(bytes) {
		Documents::Json(serde_json::Deserializer::from_slice(bytes).into_iter())
	} else {
		Documents::Yaml(serde_yaml::Deserializer::from_slice(bytes))
	};
	ResourceStream {
		bytes,
		documents,
		labels,
		index: 0,
		failed: false,
	}
}

/// Decode everything, keeping the successfully decoded prefix on failure.
pub fn decode_all(bytes: &[u8], labels: &NamespaceLabels) -> Result<Vec<Resource>, PartialDecode> {
	let mut resources = Vec::new();
	for item in decode(bytes, labels) {
		match item {
			Ok(resource) => resources.push(resource),
			Err(error) => return Err(PartialDecode { resources, error }),
		}
	}
	Ok(resources)
}

fn looks_like_json(bytes: &[u8]) -> bool {
	bytes
		.iter()
		.find(|b| !b.is_ascii_whitespace())
		.is_some_and(|b| *b == b'{')
}

impl ResourceStream<'_> {
	fn next_document(&mut self) -> Option<Result<Value, DecodeError>> {
		let index = self.index;
		let offset = match &mut self.documents {
			Documents::Json(stream) => match stream.next()? {
				Ok(doc) => return Some(Ok(doc)),
				Err(e) if e.is_syntax() => stream.byte_offset(),
				Err(source) => return Some(Err(DecodeError::Json { index, source })),
			},
			Documents::Yaml(stream) => {
				return stream.next().map(|doc| {
					Value::deserialize(doc).map_err(|source| DecodeError::Yaml { index, source })
				})
			}
		};

		tracing::trace!(offset, "reading the rest of the manifest as YAML");
		let bytes = self.bytes;
		let rest = &bytes[offset..];
		self.documents = Documents::Yaml(serde_yaml::Deserializer::from_slice(rest));
		self.next_document()
	}
}

impl Iterator for ResourceStream<'_> {
	type Item = Result<Resource, DecodeError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		loop {
			let document = match self.next_document()? {
				Ok(document) => document,
				Err(e) => {
					self.failed = true;
					return Some(Err(e));
				}
			};
			let index = self.index;
			self.index += 1;

			let map = match document {
				Value::Null => continue,
				Value::Object(map) if map.is_empty() => continue,
				Value::Object(map) => map,
				other => {
					self.failed = true;
					return Some(Err(DecodeError::NotAnObject {
						index,
						found: json_type_name(&other),
					}));
				}
			};

			let mut resource = Resource::from_map(map);
			if let Err(e) = apply_namespace_labels(&mut resource, self.labels) {
				self.failed = true;
				return Some(Err(e));
			}
			return Some(Ok(resource));
		}
	}
}
