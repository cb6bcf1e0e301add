//! [`LiveStore`] over a Kubernetes API server.

use std::{
	collections::HashMap,
	sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use kube::{
	api::{Api, DeleteParams, DynamicObject, PostParams},
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	core::GroupVersionKind,
	discovery::{oneshot::pinned_kind, ApiResource, Scope},
	Client, Config,
};
use thiserror::Error;
use tracing::instrument;

use super::{BackendError, LiveStore};
use crate::resource::{Resource, ResourceKey};

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectError {
	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

#[derive(Clone)]
struct Discovered {
	api_resource: ApiResource,
	namespaced: bool,
}

/// Dynamic-object client that resolves each kind through discovery once.
pub struct KubeStore {
	client: Client,
	discovered: Mutex<HashMap<GroupVersionKind, Discovered>>,
}

impl std::fmt::Debug for KubeStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KubeStore")
			.field("default_namespace", &self.client.default_namespace())
			.finish_non_exhaustive()
	}
}

impl KubeStore {
	pub fn new(client: Client) -> Self {
		Self {
			client,
			discovered: Mutex::new(HashMap::new()),
		}
	}

	/// Connect using the ambient kubeconfig or in-cluster environment.
	#[instrument]
	pub async fn infer() -> Result<Self, ConnectError> {
		Ok(Self::new(Client::try_default().await?))
	}

	/// Connect using an explicit kubeconfig, optionally overriding its current context.
	#[instrument(skip(kubeconfig))]
	pub async fn from_kubeconfig(
		kubeconfig: Kubeconfig,
		context: Option<String>,
	) -> Result<Self, ConnectError> {
		let config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context,
				..Default::default()
			},
		)
		.await?;
		Ok(Self::new(Client::try_from(config)?))
	}

	pub fn client(&self) -> &Client {
		&self.client
	}

	async fn discover(&self, key: &ResourceKey) -> Result<Discovered, BackendError> {
		let gvk = GroupVersionKind::gvk(key.group(), key.version(), &key.kind);
		let cached = self.cache().get(&gvk).cloned();
		if let Some(found) = cached {
			return Ok(found);
		}

		tracing::debug!(
			api_version = %key.api_version,
			kind = %key.kind,
			"discovering resource"
		);
		let (api_resource, capabilities) = pinned_kind(&self.client, &gvk)
			.await
			.map_err(|e| BackendError::Api(Box::new(e)))?;
		let found = Discovered {
			api_resource,
			namespaced: matches!(capabilities.scope, Scope::Namespaced),
		};
		self.cache().insert(gvk, found.clone());
		Ok(found)
	}

	fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<GroupVersionKind, Discovered>> {
		self.discovered
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	async fn api_for(&self, key: &ResourceKey) -> Result<Api<DynamicObject>, BackendError> {
		if key.name.is_empty() {
			return Err(BackendError::Invalid(format!(
				"{} is missing metadata.name",
				key.kind
			)));
		}
		let discovered = self.discover(key).await?;
		let api = if discovered.namespaced {
			let namespace = key
				.namespace
				.as_deref()
				.unwrap_or_else(|| self.client.default_namespace());
			Api::namespaced_with(self.client.clone(), namespace, &discovered.api_resource)
		} else {
			Api::all_with(self.client.clone(), &discovered.api_resource)
		};
		Ok(api)
	}
}

fn to_dynamic(resource: &Resource) -> Result<DynamicObject, BackendError> {
	serde_json::from_value(resource.clone().into())
		.map_err(|e| BackendError::Invalid(format!("{}: {e}", resource.key())))
}

fn from_dynamic(object: &DynamicObject) -> Result<Resource, BackendError> {
	Resource::from_object(object).map_err(|e| BackendError::Api(Box::new(e)))
}

/// Map API status codes onto the backend error kinds callers branch on.
fn classify(
	err: kube::Error,
	key: &ResourceKey,
	on_conflict: fn(ResourceKey) -> BackendError,
) -> BackendError {
	match err {
		kube::Error::Api(ref status) if status.code == 404 => {
			BackendError::NotFound { key: key.clone() }
		}
		kube::Error::Api(ref status) if status.code == 409 => on_conflict(key.clone()),
		other => BackendError::Api(Box::new(other)),
	}
}

fn conflict(key: ResourceKey) -> BackendError {
	BackendError::Conflict { key }
}

fn already_exists(key: ResourceKey) -> BackendError {
	BackendError::AlreadyExists { key }
}

#[async_trait]
impl LiveStore for KubeStore {
	#[instrument(skip(self), fields(key = %key))]
	async fn get(&self, key: &ResourceKey) -> Result<Resource, BackendError> {
		let api = self.api_for(key).await?;
		let object = api
			.get(&key.name)
			.await
			.map_err(|e| classify(e, key, conflict))?;
		from_dynamic(&object)
	}

	#[instrument(skip_all, fields(key = %resource.key()))]
	async fn create(&self, resource: &Resource) -> Result<Resource, BackendError> {
		let key = resource.key();
		let api = self.api_for(&key).await?;
		let object = api
			.create(&PostParams::default(), &to_dynamic(resource)?)
			.await
			.map_err(|e| classify(e, &key, already_exists))?;
		from_dynamic(&object)
	}

	#[instrument(skip_all, fields(key = %resource.key()))]
	async fn update(&self, resource: &Resource) -> Result<Resource, BackendError> {
		let key = resource.key();
		let api = self.api_for(&key).await?;
		let object = api
			.replace(&key.name, &PostParams::default(), &to_dynamic(resource)?)
			.await
			.map_err(|e| classify(e, &key, conflict))?;
		from_dynamic(&object)
	}

	#[instrument(skip(self), fields(key = %key))]
	async fn delete(&self, key: &ResourceKey) -> Result<(), BackendError> {
		let api = self.api_for(key).await?;
		api.delete(&key.name, &DeleteParams::default())
			.await
			.map_err(|e| classify(e, key, conflict))?;
		Ok(())
	}
}
