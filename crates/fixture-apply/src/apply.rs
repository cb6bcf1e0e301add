//! Fixture reconciliation engine.
//!
//! Every entry point either takes a manifest location (fetched and decoded
//! first) or resources that were decoded already. Resources are reconciled one
//! at a time in manifest order; the first failure is returned and nothing done
//! before it is rolled back.

use std::{error::Error as StdError, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::{
	backend::{with_deadline, Backend, BackendError, ConfigCenter, LiveStore},
	config::{HarnessConfig, TimeoutConfig},
	decode::{decode_all, DecodeError, NamespaceLabels},
	fetch::{FetchError, ManifestBundle, ManifestFetcher},
	resource::{FieldTypeError, Resource, ResourceKey},
	teardown::{TeardownAction, TeardownRegistry},
};

/// Kind under which a patched ConfigMap is republished to a config center.
const CONFIG_MAP_CONFIG_KIND: &str = "configmap";

#[derive(Debug, Error)]
pub enum ApplyError {
	#[error(transparent)]
	Fetch(#[from] FetchError),

	#[error("decoding manifest {location} (decoded {decoded} resources before the error)")]
	DecodeFailed {
		location: String,
		/// Raw manifest text, for diagnosing the failure.
		manifest: String,
		decoded: usize,
		#[source]
		source: Box<DecodeError>,
	},

	#[error("reading {key}")]
	ReadFailed {
		key: ResourceKey,
		#[source]
		source: Box<BackendError>,
	},

	#[error("creating {key}")]
	CreateFailed {
		key: ResourceKey,
		#[source]
		source: Box<BackendError>,
	},

	#[error("updating {key}")]
	UpdateFailed {
		key: ResourceKey,
		#[source]
		source: Box<BackendError>,
	},

	#[error("deleting {key}")]
	DeleteFailed {
		key: ResourceKey,
		#[source]
		source: Box<BackendError>,
	},

	#[error("publishing {key}")]
	PublishFailed {
		key: ResourceKey,
		#[source]
		source: Box<BackendError>,
	},

	#[error("{key} can not be patched")]
	InvalidField {
		key: ResourceKey,
		#[source]
		source: FieldTypeError,
	},

	#[error("encoding {what}")]
	Encode {
		what: String,
		#[source]
		source: Box<dyn StdError + Send + Sync>,
	},
}

impl ApplyError {
	/// The backend error behind a failed backend call, if that is what failed.
	pub fn backend_error(&self) -> Option<&BackendError> {
		match self {
			Self::ReadFailed { source, .. }
			| Self::CreateFailed { source, .. }
			| Self::UpdateFailed { source, .. }
			| Self::DeleteFailed { source, .. }
			| Self::PublishFailed { source, .. } => Some(source),
			_ => None,
		}
	}
}

/// How a single resource was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Created,
	Updated,
	/// A blind create found the object already there.
	AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
	pub key: ResourceKey,
	pub outcome: Outcome,
}

/// Where [`Applier::patch_config_value`] writes the patched ConfigMap.
#[derive(Clone, Copy)]
pub enum PatchTarget<'a> {
	/// Update the object in the store it was read from.
	LiveStore,
	/// Republish the whole object as YAML through a config center.
	ConfigCenter(&'a Arc<dyn ConfigCenter>),
}

/// Reconciles manifests against a backend.
#[derive(Debug, Clone)]
pub struct Applier {
	fetcher: ManifestFetcher,
	namespace_labels: NamespaceLabels,
	timeouts: TimeoutConfig,
}

impl Applier {
	pub fn new(fetcher: ManifestFetcher, timeouts: TimeoutConfig) -> Self {
		Self {
			fetcher,
			namespace_labels: NamespaceLabels::new(),
			timeouts,
		}
	}

	/// Build an applier reading manifests from `bundle`, with timeouts and labels from `config`.
	pub fn from_config(config: &HarnessConfig, bundle: Arc<dyn ManifestBundle>) -> Self {
		let fetcher = ManifestFetcher::new(bundle, config.timeouts.manifest_fetch_timeout);
		Self::new(fetcher, config.timeouts).with_namespace_labels(config.namespace_labels.clone())
	}

	#[must_use]
	pub fn with_namespace_labels(mut self, labels: NamespaceLabels) -> Self {
		self.namespace_labels = labels;
		self
	}

	pub fn timeouts(&self) -> &TimeoutConfig {
		&self.timeouts
	}

	pub fn namespace_labels(&self) -> &NamespaceLabels {
		&self.namespace_labels
	}

	/// Fetch and decode a manifest, with namespace labels applied.
	#[instrument(skip(self))]
	pub async fn load(&self, location: &str) -> Result<Vec<Resource>, ApplyError> {
		let manifest = self.fetcher.fetch(location).await?;
		decode_all(manifest.bytes(), &self.namespace_labels).map_err(|partial| {
			let text = manifest.text().into_owned();
			tracing::error!(
				location,
				error = %partial.error,
				manifest = %text,
				"failed to decode manifest"
			);
			ApplyError::DecodeFailed {
				location: location.to_string(),
				manifest: text,
				decoded: partial.resources.len(),
				source: Box::new(partial.error),
			}
		})
	}

	/// Create or update every resource of the manifest at `location`.
	///
	/// With a registry, every created or updated object gets a teardown action.
	#[instrument(skip(self, store, teardown), fields(cleanup = teardown.is_some()))]
	pub async fn apply_with_cleanup(
		&self,
		store: &Arc<dyn LiveStore>,
		teardown: Option<&TeardownRegistry>,
		location: &str,
	) -> Result<Vec<Applied>, ApplyError> {
		let resources = self.load(location).await?;
		self.apply_resources_with_cleanup(store, teardown, resources)
			.await
	}

	#[instrument(skip_all, fields(count = resources.len(), cleanup = teardown.is_some()))]
	pub async fn apply_resources_with_cleanup(
		&self,
		store: &Arc<dyn LiveStore>,
		teardown: Option<&TeardownRegistry>,
		resources: Vec<Resource>,
	) -> Result<Vec<Applied>, ApplyError> {
		let mut applied = Vec::with_capacity(resources.len());
		for resource in resources {
			applied.push(self.apply_one(store, teardown, resource).await?);
		}
		Ok(applied)
	}

	async fn apply_one(
		&self,
		store: &Arc<dyn LiveStore>,
		teardown: Option<&TeardownRegistry>,
		mut desired: Resource,
	) -> Result<Applied, ApplyError> {
		let key = desired.key();
		let deadline = self.timeouts.create_timeout;

		let outcome = match with_deadline(deadline, store.get(&key)).await {
			Ok(live) => {
				// Overwrite whatever token the manifest carried with the live one.
				desired.set_resource_version(live.resource_version());
				log_step("updating", &key);
				with_deadline(deadline, store.update(&desired))
					.await
					.map_err(|source| ApplyError::UpdateFailed {
						key: key.clone(),
						source: Box::new(source),
					})?;
				Outcome::Updated
			}
			Err(e) if e.is_not_found() => {
				log_step("creating", &key);
				match with_deadline(deadline, store.create(&desired)).await {
					Ok(_) => Outcome::Created,
					Err(e) if e.is_already_exists() => {
						tracing::debug!(key = %key, "created concurrently, leaving it alone");
						Outcome::AlreadyExists
					}
					Err(source) => {
						return Err(ApplyError::CreateFailed {
							key,
							source: Box::new(source),
						})
					}
				}
			}
			Err(source) => {
				return Err(ApplyError::ReadFailed {
					key,
					source: Box::new(source),
				})
			}
		};

		if outcome != Outcome::AlreadyExists {
			self.schedule_teardown(teardown, Backend::Live(Arc::clone(store)), &key);
		}
		Ok(Applied { key, outcome })
	}

	/// Create typed objects without checking whether they exist.
	///
	/// An object that already exists is left as is, but still gets a teardown action.
	#[instrument(skip_all, fields(count = objects.len(), cleanup = teardown.is_some()))]
	pub async fn apply_objects_with_cleanup<T: Serialize>(
		&self,
		store: &Arc<dyn LiveStore>,
		teardown: Option<&TeardownRegistry>,
		objects: &[T],
	) -> Result<Vec<Applied>, ApplyError> {
		let mut applied = Vec::with_capacity(objects.len());
		for object in objects {
			let resource = Resource::from_object(object).map_err(|e| ApplyError::Encode {
				what: std::any::type_name::<T>().to_string(),
				source: Box::new(e),
			})?;
			let key = resource.key();

			log_step("creating", &key);
			let outcome = match with_deadline(self.timeouts.create_timeout, store.create(&resource))
				.await
			{
				Ok(_) => Outcome::Created,
				Err(e) if e.is_already_exists() => Outcome::AlreadyExists,
				Err(source) => {
					return Err(ApplyError::CreateFailed {
						key,
						source: Box::new(source),
					})
				}
			};

			self.schedule_teardown(teardown, Backend::Live(Arc::clone(store)), &key);
			applied.push(Applied { key, outcome });
		}
		Ok(applied)
	}

	/// Delete every resource of the manifest at `location`.
	#[instrument(skip(self, store))]
	pub async fn delete(
		&self,
		store: &Arc<dyn LiveStore>,
		location: &str,
	) -> Result<Vec<ResourceKey>, ApplyError> {
		let resources = self.load(location).await?;
		self.delete_resources(store, &resources).await
	}

	#[instrument(skip_all, fields(count = resources.len()))]
	pub async fn delete_resources(
		&self,
		store: &Arc<dyn LiveStore>,
		resources: &[Resource],
	) -> Result<Vec<ResourceKey>, ApplyError> {
		let mut deleted = Vec::with_capacity(resources.len());
		for resource in resources {
			let key = resource.key();
			log_step("deleting", &key);
			with_deadline(self.timeouts.delete_timeout, store.delete(&key))
				.await
				.map_err(|source| ApplyError::DeleteFailed {
					key: key.clone(),
					source: Box::new(source),
				})?;
			deleted.push(key);
		}
		Ok(deleted)
	}

	/// Publish every resource of the manifest at `location` as JSON.
	#[instrument(skip(self, center, teardown), fields(cleanup = teardown.is_some()))]
	pub async fn publish_config(
		&self,
		center: &Arc<dyn ConfigCenter>,
		teardown: Option<&TeardownRegistry>,
		location: &str,
	) -> Result<Vec<ResourceKey>, ApplyError> {
		let resources = self.load(location).await?;
		self.publish_resources(center, teardown, &resources).await
	}

	#[instrument(skip_all, fields(count = resources.len(), cleanup = teardown.is_some()))]
	pub async fn publish_resources(
		&self,
		center: &Arc<dyn ConfigCenter>,
		teardown: Option<&TeardownRegistry>,
		resources: &[Resource],
	) -> Result<Vec<ResourceKey>, ApplyError> {
		let mut published = Vec::with_capacity(resources.len());
		for resource in resources {
			let key = resource.key();
			let payload = resource.to_json_string().map_err(|e| ApplyError::Encode {
				what: key.to_string(),
				source: Box::new(e),
			})?;

			log_step("publishing", &key);
			with_deadline(
				self.timeouts.create_timeout,
				center.publish_config(&key.kind, &key.name, key.namespace_or_empty(), &payload),
			)
			.await
			.map_err(|source| ApplyError::PublishFailed {
				key: key.clone(),
				source: Box::new(source),
			})?;

			self.schedule_teardown(teardown, Backend::Config(Arc::clone(center)), &key);
			published.push(key);
		}
		Ok(published)
	}

	/// Remove every resource of the manifest at `location` from the config center.
	#[instrument(skip(self, center))]
	pub async fn delete_config(
		&self,
		center: &Arc<dyn ConfigCenter>,
		location: &str,
	) -> Result<Vec<ResourceKey>, ApplyError> {
		let resources = self.load(location).await?;
		self.delete_config_resources(center, &resources).await
	}

	#[instrument(skip_all, fields(count = resources.len()))]
	pub async fn delete_config_resources(
		&self,
		center: &Arc<dyn ConfigCenter>,
		resources: &[Resource],
	) -> Result<Vec<ResourceKey>, ApplyError> {
		let mut deleted = Vec::with_capacity(resources.len());
		for resource in resources {
			let key = resource.key();
			log_step("deleting", &key);
			with_deadline(
				self.timeouts.delete_timeout,
				center.delete_config(&key.kind, &key.name, key.namespace_or_empty()),
			)
			.await
			.map_err(|source| ApplyError::DeleteFailed {
				key: key.clone(),
				source: Box::new(source),
			})?;
			deleted.push(key);
		}
		Ok(deleted)
	}

	/// Set `data[key]` of a ConfigMap to `value` rendered as YAML.
	///
	/// The ConfigMap is read from `store` and written to `target`. There is no
	/// protection against concurrent modification between the read and the write.
	#[instrument(skip(self, store, value, target))]
	pub async fn patch_config_value<V: Serialize>(
		&self,
		store: &Arc<dyn LiveStore>,
		namespace: &str,
		name: &str,
		key: &str,
		value: &V,
		target: PatchTarget<'_>,
	) -> Result<Resource, ApplyError> {
		let cm_key = ResourceKey::new("v1", "ConfigMap", Some(namespace), name);
		let deadline = self.timeouts.create_timeout;

		let mut cm = with_deadline(deadline, store.get(&cm_key))
			.await
			.map_err(|source| ApplyError::ReadFailed {
				key: cm_key.clone(),
				source: Box::new(source),
			})?;

		let rendered = serde_yaml::to_string(value).map_err(|e| ApplyError::Encode {
			what: format!("value for {cm_key} data key {key}"),
			source: Box::new(e),
		})?;
		let mut data = cm
			.string_map(&["data"])
			.map_err(|source| ApplyError::InvalidField {
				key: cm_key.clone(),
				source,
			})?
			.unwrap_or_default();
		data.insert(key.to_string(), rendered);
		cm.set_string_map(&["data"], data);

		match target {
			PatchTarget::LiveStore => {
				log_step("updating", &cm_key);
				with_deadline(deadline, store.update(&cm))
					.await
					.map_err(|source| ApplyError::UpdateFailed {
						key: cm_key,
						source: Box::new(source),
					})
			}
			PatchTarget::ConfigCenter(center) => {
				let payload = serde_yaml::to_string(&cm).map_err(|e| ApplyError::Encode {
					what: cm_key.to_string(),
					source: Box::new(e),
				})?;
				log_step("publishing", &cm_key);
				with_deadline(
					deadline,
					center.publish_config(CONFIG_MAP_CONFIG_KIND, name, namespace, &payload),
				)
				.await
				.map_err(|source| ApplyError::PublishFailed {
					key: cm_key,
					source: Box::new(source),
				})?;
				Ok(cm)
			}
		}
	}

	fn schedule_teardown(
		&self,
		teardown: Option<&TeardownRegistry>,
		backend: Backend,
		key: &ResourceKey,
	) {
		if let Some(registry) = teardown {
			registry.register(TeardownAction::new(
				backend,
				key.clone(),
				self.timeouts.delete_timeout,
			));
		}
	}
}

fn log_step(step: &str, key: &ResourceKey) {
	tracing::info!(
		kind = %key.kind,
		name = %key.name,
		namespace = key.namespace_or_empty(),
		"{step}"
	);
}
