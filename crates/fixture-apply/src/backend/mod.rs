//! Backends that fixtures are reconciled against.
//!
//! A [`LiveStore`] is a cluster-style API with read access and optimistic
//! concurrency. A [`ConfigCenter`] only accepts whole-object publishes and
//! deletes keyed by kind, name and namespace. Callers pick one through
//! [`Backend`].

use std::{error::Error as StdError, fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::{Resource, ResourceKey};

pub mod kube_store;

#[derive(Debug, Error)]
pub enum BackendError {
	#[error("{key} not found")]
	NotFound { key: ResourceKey },

	#[error("{key} already exists")]
	AlreadyExists { key: ResourceKey },

	#[error("{key} was modified concurrently")]
	Conflict { key: ResourceKey },

	#[error("backend call did not finish within {0:?}")]
	Timeout(Duration),

	#[error("invalid resource: {0}")]
	Invalid(String),

	#[error("backend request failed")]
	Api(#[source] Box<dyn StdError + Send + Sync>),
}

impl BackendError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound { .. })
	}

	pub fn is_already_exists(&self) -> bool {
		matches!(self, Self::AlreadyExists { .. })
	}
}

/// Cluster-style store with read access and optimistic concurrency.
#[async_trait]
pub trait LiveStore: Send + Sync {
	/// Fetch the live object. Missing objects are [`BackendError::NotFound`].
	async fn get(&self, key: &ResourceKey) -> Result<Resource, BackendError>;

	/// Create the object. An existing object is [`BackendError::AlreadyExists`].
	async fn create(&self, resource: &Resource) -> Result<Resource, BackendError>;

	/// Replace the object. `metadata.resourceVersion` must match the live one.
	async fn update(&self, resource: &Resource) -> Result<Resource, BackendError>;

	async fn delete(&self, key: &ResourceKey) -> Result<(), BackendError>;
}

/// Configuration distribution store. Publishing an existing key overwrites it.
#[async_trait]
pub trait ConfigCenter: Send + Sync {
	async fn publish_config(
		&self,
		kind: &str,
		name: &str,
		namespace: &str,
		payload: &str,
	) -> Result<(), BackendError>;

	async fn delete_config(&self, kind: &str, name: &str, namespace: &str)
		-> Result<(), BackendError>;
}

/// Backend chosen by the caller for a reconcile call.
#[derive(Clone)]
pub enum Backend {
	Live(Arc<dyn LiveStore>),
	Config(Arc<dyn ConfigCenter>),
}

impl fmt::Debug for Backend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl Backend {
	pub fn name(&self) -> &'static str {
		match self {
			Self::Live(_) => "live-store",
			Self::Config(_) => "config-center",
		}
	}

	/// Delete by identity on whichever backend this is.
	pub async fn delete(&self, key: &ResourceKey) -> Result<(), BackendError> {
		match self {
			Self::Live(store) => store.delete(key).await,
			Self::Config(center) => {
				center
					.delete_config(&key.kind, &key.name, key.namespace_or_empty())
					.await
			}
		}
	}
}

/// Run a backend call under a deadline. Expiry is a failure, never retried.
pub(crate) async fn with_deadline<T, F>(timeout: Duration, call: F) -> Result<T, BackendError>
where
	F: Future<Output = Result<T, BackendError>>,
{
	tokio::time::timeout(timeout, call)
		.await
		.unwrap_or(Err(BackendError::Timeout(timeout)))
}
