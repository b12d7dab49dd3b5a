//! warden-core: shared types and pure policy for the Warden failover engine.
//!
//! Holds everything the other crates agree on: stable backend identities,
//! the candidate registry, the target resolution policy, and the
//! `warden.toml` configuration surface.
//!
//! # Data flow
//!
//! ```text
//! HealthProber ──upsert──► BackendRegistry ──snapshot──► resolve()
//!                                                          │
//!                          Reconciler ◄── Resolution ──────┘
//! ```
//!
//! Nothing in this crate performs I/O apart from reading the config file.

pub mod config;
pub mod duration;
pub mod error;
pub mod identity;
pub mod registry;
pub mod resolver;
pub mod types;

pub use config::{ListenSection, PoolSection, ProbeSection, ReconcileSection, WardenConfig};
pub use error::{ConfigError, IdentityError};
pub use identity::BackendIdentity;
pub use registry::BackendRegistry;
pub use resolver::{Resolution, ResolveError, resolve};
pub use types::{BackendCandidate, Health, Role};
