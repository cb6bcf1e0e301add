//! In-memory backends that record every call.
//!
//! Used by this crate's tests and by downstream test suites that want to
//! assert on the exact sequence of backend calls without a cluster.

use std::{
	collections::{BTreeMap, HashMap, VecDeque},
	sync::{Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
	backend::{BackendError, ConfigCenter, LiveStore},
	resource::{Resource, ResourceKey},
};

/// Build a ConfigMap resource. An empty `data` slice leaves the data field out.
pub fn config_map_resource(namespace: &str, name: &str, data: &[(&str, &str)]) -> Resource {
	let mut object = json!({
		"apiVersion": "v1",
		"kind": "ConfigMap",
		"metadata": { "name": name, "namespace": namespace },
	});
	if !data.is_empty() {
		let entries: serde_json::Map<String, Value> = data
			.iter()
			.map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
			.collect();
		object["data"] = Value::Object(entries);
	}
	match object {
		Value::Object(map) => Resource::from_map(map),
		_ => Resource::default(),
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
	Get,
	Create,
	Update,
	Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
	Get(ResourceKey),
	Create(Resource),
	Update(Resource),
	Delete(ResourceKey),
}

impl StoreCall {
	pub fn op(&self) -> StoreOp {
		match self {
			Self::Get(_) => StoreOp::Get,
			Self::Create(_) => StoreOp::Create,
			Self::Update(_) => StoreOp::Update,
			Self::Delete(_) => StoreOp::Delete,
		}
	}
}

#[derive(Default)]
struct StoreState {
	objects: BTreeMap<ResourceKey, Resource>,
	calls: Vec<StoreCall>,
	last_version: u64,
	injected: HashMap<StoreOp, VecDeque<BackendError>>,
	latency: HashMap<StoreOp, Duration>,
}

impl StoreState {
	fn bump(&mut self, resource: &mut Resource) {
		self.last_version += 1;
		resource.set_resource_version(Some(&self.last_version.to_string()));
	}
}

/// [`LiveStore`] with optimistic concurrency on update.
///
/// Every stored object carries a resourceVersion from a store-wide counter.
#[derive(Default)]
pub struct MemoryStore {
	state: Mutex<StoreState>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Store an object without recording a call. Returns it with its resourceVersion.
	pub fn seed(&self, resource: &Resource) -> Resource {
		let mut state = self.state();
		let mut stored = resource.clone();
		state.bump(&mut stored);
		state.objects.insert(stored.key(), stored.clone());
		stored
	}

	/// Fail the next call of `op` with `error`. Injected errors queue up per operation.
	pub fn inject(&self, op: StoreOp, error: BackendError) {
		self.state().injected.entry(op).or_default().push_back(error);
	}

	/// Delay every call of `op`. Combine with paused tokio time to exercise deadlines.
	pub fn set_latency(&self, op: StoreOp, latency: Duration) {
		self.state().latency.insert(op, latency);
	}

	pub fn calls(&self) -> Vec<StoreCall> {
		self.state().calls.clone()
	}

	pub fn count(&self, op: StoreOp) -> usize {
		self.state().calls.iter().filter(|c| c.op() == op).count()
	}

	pub fn object(&self, key: &ResourceKey) -> Option<Resource> {
		self.state().objects.get(key).cloned()
	}

	pub fn len(&self) -> usize {
		self.state().objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state().objects.is_empty()
	}

	fn state(&self) -> MutexGuard<'_, StoreState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Record the call, wait out any latency, then pop an injected error.
	async fn enter(&self, call: StoreCall) -> Result<(), BackendError> {
		let op = call.op();
		let latency = {
			let mut state = self.state();
			state.calls.push(call);
			state.latency.get(&op).copied()
		};
		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}
		match self
			.state()
			.injected
			.get_mut(&op)
			.and_then(VecDeque::pop_front)
		{
			Some(error) => Err(error),
			None => Ok(()),
		}
	}
}

#[async_trait]
impl LiveStore for MemoryStore {
	async fn get(&self, key: &ResourceKey) -> Result<Resource, BackendError> {
		self.enter(StoreCall::Get(key.clone())).await?;
		self.object(key)
			.ok_or_else(|| BackendError::NotFound { key: key.clone() })
	}

	async fn create(&self, resource: &Resource) -> Result<Resource, BackendError> {
		self.enter(StoreCall::Create(resource.clone())).await?;
		let key = resource.key();
		let mut state = self.state();
		if state.objects.contains_key(&key) {
			return Err(BackendError::AlreadyExists { key });
		}
		let mut stored = resource.clone();
		state.bump(&mut stored);
		state.objects.insert(key, stored.clone());
		Ok(stored)
	}

	async fn update(&self, resource: &Resource) -> Result<Resource, BackendError> {
		self.enter(StoreCall::Update(resource.clone())).await?;
		let key = resource.key();
		let mut state = self.state();
		let Some(live) = state.objects.get(&key) else {
			return Err(BackendError::NotFound { key });
		};
		if live.resource_version() != resource.resource_version() {
			return Err(BackendError::Conflict { key });
		}
		let mut stored = resource.clone();
		state.bump(&mut stored);
		state.objects.insert(key, stored.clone());
		Ok(stored)
	}

	async fn delete(&self, key: &ResourceKey) -> Result<(), BackendError> {
		self.enter(StoreCall::Delete(key.clone())).await?;
		self.state()
			.objects
			.remove(key)
			.map(drop)
			.ok_or_else(|| BackendError::NotFound { key: key.clone() })
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCall {
	Publish {
		kind: String,
		name: String,
		namespace: String,
		payload: String,
	},
	Delete {
		kind: String,
		name: String,
		namespace: String,
	},
}

#[derive(Default)]
struct CenterState {
	entries: BTreeMap<(String, String, String), String>,
	calls: Vec<ConfigCall>,
	injected: VecDeque<BackendError>,
}

/// [`ConfigCenter`] keeping the last payload published per (kind, name, namespace).
#[derive(Default)]
pub struct MemoryConfigCenter {
	state: Mutex<CenterState>,
}

impl MemoryConfigCenter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fail the next call, whichever it is.
	pub fn inject(&self, error: BackendError) {
		self.state().injected.push_back(error);
	}

	pub fn calls(&self) -> Vec<ConfigCall> {
		self.state().calls.clone()
	}

	pub fn published(&self, kind: &str, name: &str, namespace: &str) -> Option<String> {
		self.state()
			.entries
			.get(&(kind.to_string(), name.to_string(), namespace.to_string()))
			.cloned()
	}

	pub fn len(&self) -> usize {
		self.state().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state().entries.is_empty()
	}

	fn state(&self) -> MutexGuard<'_, CenterState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[async_trait]
impl ConfigCenter for MemoryConfigCenter {
	async fn publish_config(
		&self,
		kind: &str,
		name: &str,
		namespace: &str,
		payload: &str,
	) -> Result<(), BackendError> {
		let mut state = self.state();
		state.calls.push(ConfigCall::Publish {
			kind: kind.to_string(),
			name: name.to_string(),
			namespace: namespace.to_string(),
			payload: payload.to_string(),
		});
		if let Some(error) = state.injected.pop_front() {
			return Err(error);
		}
		state.entries.insert(
			(kind.to_string(), name.to_string(), namespace.to_string()),
			payload.to_string(),
		);
		Ok(())
	}

	async fn delete_config(
		&self,
		kind: &str,
		name: &str,
		namespace: &str,
	) -> Result<(), BackendError> {
		let mut state = self.state();
		state.calls.push(ConfigCall::Delete {
			kind: kind.to_string(),
			name: name.to_string(),
			namespace: namespace.to_string(),
		});
		if let Some(error) = state.injected.pop_front() {
			return Err(error);
		}
		state
			.entries
			.remove(&(kind.to_string(), name.to_string(), namespace.to_string()));
		Ok(())
	}
}
