//! Dependency declarations: manifest, lockfile, versions and resolution.

mod lockfile;
mod manifest;
mod native;
mod resolve;
mod version;

pub use lockfile::{LockedPackage, Lockfile};
pub use manifest::Manifest;
pub use native::{NativePackage, NativeTable};
pub use resolve::{
    Resolution, ResolvedPackage, package_set_digest, resolve, resolve_from_index, resolve_frozen,
    verify_lock,
};
pub use version::{Requirement, Specifier, SpecifierSet, Version, normalize_name};
