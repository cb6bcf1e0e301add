//! Deferred cleanup of fixtures.
//!
//! Reconcile calls register a [`TeardownAction`] for every object they create
//! or update. The registry runs them in reverse registration order once the
//! test body is done, whatever its outcome.

use std::{
	future::Future,
	mem,
	panic,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use thiserror::Error;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::instrument;

use crate::{
	backend::{with_deadline, Backend, BackendError},
	resource::ResourceKey,
};

/// Delete one object from one backend, bounded by its own deadline.
#[derive(Debug, Clone)]
pub struct TeardownAction {
	backend: Backend,
	key: ResourceKey,
	timeout: Duration,
}

impl TeardownAction {
	pub fn new(backend: Backend, key: ResourceKey, timeout: Duration) -> Self {
		Self {
			backend,
			key,
			timeout,
		}
	}

	pub fn key(&self) -> &ResourceKey {
		&self.key
	}

	pub fn backend(&self) -> &Backend {
		&self.backend
	}

	pub async fn run(&self) -> Result<(), BackendError> {
		tracing::debug!(
			backend = self.backend.name(),
			kind = %self.key.kind,
			name = %self.key.name,
			namespace = self.key.namespace_or_empty(),
			"deleting"
		);
		with_deadline(self.timeout, self.backend.delete(&self.key)).await
	}
}

#[derive(Debug, Error)]
#[error("tearing down {key}")]
pub struct TeardownFailed {
	pub key: ResourceKey,
	#[source]
	pub source: BackendError,
}

/// What happened during a teardown pass.
#[derive(Debug, Default)]
pub struct TeardownReport {
	/// Objects deleted, in the order they were deleted.
	pub deleted: Vec<ResourceKey>,
	pub failures: Vec<TeardownFailed>,
}

impl TeardownReport {
	pub fn is_clean(&self) -> bool {
		self.failures.is_empty()
	}
}

/// Stack of pending teardown actions. Safe to share between concurrent reconcile calls.
#[derive(Debug, Default)]
pub struct TeardownRegistry {
	actions: Mutex<Vec<TeardownAction>>,
}

impl TeardownRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, action: TeardownAction) {
		tracing::trace!(key = %action.key, "registered teardown");
		self.pending().push(action);
	}

	pub fn len(&self) -> usize {
		self.pending().len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending().is_empty()
	}

	/// Keys of pending actions in registration order.
	pub fn keys(&self) -> Vec<ResourceKey> {
		self.pending().iter().map(|a| a.key.clone()).collect()
	}

	/// Run every pending action, most recent first.
	///
	/// Each action runs exactly once. Failures are logged and collected, they
	/// never stop the remaining actions.
	#[instrument(skip(self), fields(pending = self.len()))]
	pub async fn run_all(&self) -> TeardownReport {
		let actions = mem::take(&mut *self.pending());
		let mut report = TeardownReport::default();

		for action in actions.into_iter().rev() {
			match action.run().await {
				Ok(()) => report.deleted.push(action.key),
				Err(source) => {
					tracing::error!(key = %action.key, error = %source, "teardown failed");
					report.failures.push(TeardownFailed {
						key: action.key,
						source,
					});
				}
			}
		}
		report
	}

	fn pending(&self) -> MutexGuard<'_, Vec<TeardownAction>> {
		self.actions.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Drop for TeardownRegistry {
	fn drop(&mut self) {
		let pending = self
			.actions
			.get_mut()
			.unwrap_or_else(PoisonError::into_inner);
		if !pending.is_empty() {
			tracing::warn!(
				pending = pending.len(),
				"teardown registry dropped with actions that never ran"
			);
		}
	}
}

/// Run a test body, then tear down everything it registered.
///
/// The body runs as its own task so a panic inside it still reaches the
/// teardown pass; the panic is resumed once teardown is done. Dropping the
/// returned future aborts the body and tears down in the background.
pub async fn with_teardown<F, Fut, T>(body: F) -> (T, TeardownReport)
where
	F: FnOnce(Arc<TeardownRegistry>) -> Fut,
	Fut: Future<Output = T> + Send + 'static,
	T: Send + 'static,
{
	let registry = Arc::new(TeardownRegistry::new());
	let mut scope = Scope {
		body: tokio::spawn(body(Arc::clone(&registry))),
		registry: Some(registry),
	};
	let outcome = (&mut scope.body).await;
	let report = match scope.registry.take() {
		Some(registry) => registry.run_all().await,
		None => TeardownReport::default(),
	};

	match outcome {
		Ok(value) => (value, report),
		Err(err) => match err.try_into_panic() {
			Ok(payload) => panic::resume_unwind(payload),
			Err(err) => {
				panic::resume_unwind(Box::new(format!("test body did not finish: {err}")))
			}
		},
	}
}

/// Body task of [`with_teardown`], with the registry it still has to drain.
struct Scope<T> {
	body: JoinHandle<T>,
	registry: Option<Arc<TeardownRegistry>>,
}

impl<T> Drop for Scope<T> {
	fn drop(&mut self) {
		self.body.abort();
		let Some(registry) = self.registry.take() else {
			return;
		};
		match Handle::try_current() {
			Ok(handle) => {
				tracing::warn!(
					pending = registry.len(),
					"test scope cancelled, tearing down in the background"
				);
				handle.spawn(async move { registry.run_all().await });
			}
			Err(_) => tracing::error!(
				pending = registry.len(),
				"test scope cancelled outside a runtime, teardown skipped"
			),
		}
	}
}
