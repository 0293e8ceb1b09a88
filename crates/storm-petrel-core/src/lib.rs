//! # Storm Petrel Core
//!
//! Shared domain types for the Storm Petrel file-transfer gateway:
//! user records with per-path permissions, the identity-provider contract
//! consumed by the SFTP front end, and source-address predicates.

pub mod error;
pub mod net;
pub mod provider;
pub mod user;

pub use error::AuthError;
pub use net::CidrBlock;
pub use provider::{IdentityProvider, StaticAccount, StaticProvider};
pub use user::{LoginMethod, Permission, StorageKind, User};
