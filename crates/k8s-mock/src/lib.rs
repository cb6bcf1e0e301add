//! Mock Kubernetes API server for testing.
//!
//! Provides a stateful HTTP server that can be used with kubeconfig-based
//! connections. Objects are kept in memory and go through create, get,
//! replace and delete with the status codes a real API server returns.

pub mod discovery;
mod helpers;
pub mod http;

pub use discovery::{MockApiResource, MockDiscovery};
pub use helpers::{parse_resource_path, ResourcePath};
pub use http::{HttpMockK8sServer, RunningHttpMockK8sServer};
