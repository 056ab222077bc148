//! Core types, errors, validation and configuration for rolesync.
//!
//! Everything the gateway and the reconciler agree on lives here:
//!
//! - **Errors**: one [`Error`] taxonomy with transient/permanent classification
//! - **Domain types**: [`UserSpec`], [`DesiredState`], [`ObservedState`],
//!   [`AppliedSnapshot`], [`Password`]
//! - **Validation**: identifier rules and the desired-state document parser
//! - **Configuration**: [`Config`] loaded from TOML and `ROLESYNC_*` variables

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod desired;
pub mod error;
pub mod ident;
pub mod result;
pub mod types;

pub use config::Config;
pub use desired::parse_desired_yaml;
pub use error::{Error, ErrorKind};
pub use ident::validate_identifier;
pub use result::{Result, ResultExt};
pub use types::{AppliedSnapshot, AppliedUser, DesiredState, ObservedState, Password, UserSpec};
