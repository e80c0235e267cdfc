//! Transforge-Common: Shared types, identifiers and the error taxonomy.
//!
//! This crate provides common functionality used across transforge:
//!
//! - **Typed IDs**: database-assigned job identifiers and owner keys
//! - **Core Types**: job status, sanitized failure codes and the allow-listed
//!   transform parameter enums
//! - **Error Handling**: the unified error type, validation subtypes and
//!   result alias
//!
//! # Examples
//!
//! ```
//! use transforge_common::{Error, JobStatus, OwnerKey, Result, ValidationError};
//!
//! let owner = OwnerKey::new("studio-a").unwrap();
//! assert_eq!(owner.as_str(), "studio-a");
//! assert!(JobStatus::Completed.is_terminal());
//!
//! fn example() -> Result<()> {
//!     Err(ValidationError::InvalidFilename("a/b".into()).into())
//! }
//! assert!(matches!(example(), Err(Error::Validation(_))));
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result, ValidationError};
pub use ids::*;
pub use types::*;
