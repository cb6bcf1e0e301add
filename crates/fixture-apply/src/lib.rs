//! Manifest-driven fixtures for cluster conformance tests.
//!
//! A manifest is fetched from a bundle or over HTTPS ([`fetch`]), decoded into
//! resources ([`decode`]) and reconciled against a [`backend`] by an
//! [`Applier`]. Objects it creates can be torn down again through a
//! [`TeardownRegistry`] once the test is over.

pub mod apply;
pub mod backend;
pub mod config;
pub mod decode;
pub mod fetch;
pub mod resource;
pub mod teardown;
pub mod testing;

pub use apply::{Applied, Applier, ApplyError, Outcome, PatchTarget};
pub use backend::{kube_store::KubeStore, Backend, BackendError, ConfigCenter, LiveStore};
pub use config::{HarnessConfig, TimeoutConfig};
pub use decode::NamespaceLabels;
pub use fetch::{DirBundle, ManifestBundle, ManifestFetcher, StaticBundle};
pub use resource::{Resource, ResourceKey};
pub use teardown::{with_teardown, TeardownAction, TeardownRegistry, TeardownReport};
