//! Core types and utilities for tiller.
//!
//! This crate provides the foundational types used throughout the tiller
//! state layer:
//!
//! - **Identifiers**: Strongly-typed ids for machines, units, applications
//!   and relations, validated before any store access
//! - **Lifecycle**: The shared `Life` enum (Alive, Dying, Dead) with its
//!   monotonic ordering
//!
//! # Example
//!
//! ```
//! use tiller_core::{ApplicationName, Life, MachineId, UnitName};
//!
//! // Validate an application name supplied by a caller
//! let app = ApplicationName::new("wordpress").unwrap();
//!
//! // Unit names are application-scoped
//! let unit = UnitName::new("wordpress/0").unwrap();
//! assert_eq!(unit.application().as_str(), "wordpress");
//!
//! // Machine ids are numeric and carry their presence key
//! let machine = MachineId::new(3);
//! assert_eq!(machine.global_key(), "m#3");
//!
//! // Life only ever advances
//! assert!(Life::Alive.can_advance_to(Life::Dead));
//! assert!(!Life::Dead.can_advance_to(Life::Dying));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;
pub mod life;

pub use ids::{ApplicationName, IdError, MachineId, RelationId, UnitName};
pub use life::Life;
