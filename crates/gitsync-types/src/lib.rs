//! Shared types for gitsync

mod access;
mod commit;
mod validate;

pub use access::{
    AccessData, AccessDataBuilder, Authentication, PlainSecrets, Secret, SecretDecoder,
};
pub use commit::{CommitBatch, CommitFile, CommitRecord};
pub use validate::{ValidationError, validate_access, validate_ref};
