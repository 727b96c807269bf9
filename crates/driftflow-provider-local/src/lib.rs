//! Local provider for DriftFlow
//!
//! This crate implements the Provider trait against a directory on disk,
//! simulating a cloud with four resource kinds. It is the default provider
//! of the `drift` CLI and is handy for trying out plans without credentials.
//!
//! # Resource types
//!
//! - `storage_account`: requires `location`; outputs `id`, `primary_blob_endpoint`
//! - `application`: outputs `id`, `client_id`
//! - `federated_credential`: requires `application_id`, `issuer`, `subject`;
//!   at most one credential per trust triple, so replacements destroy first
//! - `role_assignment`: requires `principal_id`, `role`, `scope`; immutable
//!
//! # Example
//!
//! ```ignore
//! use driftflow_engine::{Provider, ProviderRegistry};
//! use driftflow_provider_local::LocalProvider;
//! use std::sync::Arc;
//!
//! let registry = ProviderRegistry::new().with(Arc::new(LocalProvider::new(".driftflow/local-cloud")));
//! ```

pub mod error;
pub mod provider;

pub use error::{LocalProviderError, Result};
pub use provider::{LocalObject, LocalProvider, PROVIDER_NAME};
