//! # soloist-engine
//!
//! The supervision engine behind the `soloist` daemon: keeps a statically
//! configured set of long-running processes alive while guaranteeing that at
//! most one live instance of each exists, across crashes and restarts of the
//! supervisor itself.
//!
//! The moving parts, leaves first:
//!
//! - [`registry`]: in-memory record of last-observed process identities
//! - [`probe`]: liveness checks that verify identity, not just PID equality
//! - [`marker`]: persisted per-process uniqueness markers with atomic
//!   create-if-absent acquisition
//! - [`supervisor`]: the probe, decide, act, record loop
//!
//! [`output`] captures child stdout/stderr into per-process log files and
//! [`events`] fans out state transitions to whoever is displaying them.

pub mod events;
pub mod marker;
pub mod output;
pub mod probe;
pub mod registry;
pub mod supervisor;

pub use events::{Event, EventBus};
pub use marker::{Marker, MarkerError, MarkerStore, MarkerToken};
pub use probe::{Liveness, ProcessIdent};
pub use registry::Registry;
pub use supervisor::{Supervisor, SupervisorConfig};
