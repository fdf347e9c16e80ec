//! Envelope-encrypted, versioned project storage.
//!
//! Projects are persisted as an immutable chain of encrypted snapshots plus
//! an append-only log of encrypted patch events. Writers are serialized per
//! project and guarded by optimistic version checks; changes are expressed
//! as RFC 6902 patches whose applied form records enough to be undone.

pub mod config;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod io;
pub mod keys;
pub mod locks;
pub mod model;
pub mod observability;
pub mod patch;
pub mod service;
pub mod store;
pub mod validation;

pub use error::{ErrorKind, Result, VaultError};
pub use model::{AggregateMetadata, PatchEvent, Project, VersionedAggregate};
pub use patch::{PatchError, PatchErrorKind, PatchOp, PatchOperation};
pub use service::{PatchOutcome, ProjectService};
pub use store::{DocumentStore, UpdateOutcome};
