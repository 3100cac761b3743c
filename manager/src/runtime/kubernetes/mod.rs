//! Kubernetes Runtime Module
//!
//! Cluster implementation of the RuntimeAdapter trait. Agents run as bare
//! pods in a configured namespace, identified by the same identity scheme
//! as the engine backend.

pub mod adapter;

pub use adapter::KubernetesAdapter;
