//! # triage-core
//!
//! Core abstractions shared across the triage pipeline components:
//!
//! - **Identifiers**: Strongly-typed ULID ids for logs, incidents, actions,
//!   and outbox events
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap and span constructors
//!
//! ## Crate Boundary
//!
//! `triage-core` is the only crate allowed to define shared primitives.
//! Domain logic lives in `triage-pipeline`; this crate must stay free of
//! pipeline-specific types.
//!
//! ## Example
//!
//! ```rust
//! use triage_core::prelude::*;
//!
//! let incident = IncidentId::generate();
//! let action = ActionId::generate();
//! assert_ne!(incident.to_string(), action.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{ActionId, EventId, IncidentId, LogId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use triage_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ActionId, EventId, IncidentId, LogId};
    pub use crate::observability::{init_logging, LogFormat};
}
