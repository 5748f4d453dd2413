//! Image-side building blocks: stage roots, identity, environment, layers
//! and the OCI layout.

mod env;
mod identity;
mod layer;
mod oci;
mod rootfs;

pub use env::{DEFAULT_SETTINGS_MODULE, EnvironmentOptions, RuntimeEnvironment, SYSTEM_PATH};
pub use identity::{PasswdEntry, RuntimeIdentity, parse_passwd};
pub use layer::{Layer, LayerBuilder, Owner, sha256_digest};
pub use oci::{
    ANNOTATION_BASE_NAME, ANNOTATION_BUILD_MODE, ANNOTATION_CREATED, ANNOTATION_REF_NAME,
    ANNOTATION_REPRODUCIBLE, ANNOTATION_TOOLCHAIN, ImageSpec, OciImage, OciLayoutWriter,
    WrittenImage,
};
pub use rootfs::{REGISTRY_PATH, StageRoot, SystemPackages, image_relative};
