//! Keyward — a credential vault and sandboxed install-job service.
//!
//! Secrets are envelope-encrypted at rest and only ever leave the vault
//! as job-scoped credential bundles, injected into hardened Docker
//! sandboxes through the environment. Every sensitive operation is
//! authorized per secret and audited synchronously, fail-closed.
//!
//! Authentication and the transport layer (HTTP, RPC) live outside this
//! crate; embedders call [`service::Keyward`] with verified subjects.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod audit;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub mod storage;
pub mod vault;

pub mod sandbox;
pub mod scheduler;

pub mod service;

pub use error::Error;
pub use service::Keyward;
