//! OCI image layout output and inspection.
//!
//! ```text
//! <dir>/
//!   oci-layout
//!   index.json
//!   blobs/sha256/<hex>   (layers, config, manifest)
//! ```

use super::layer::{Layer, sha256_digest};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use oci_spec::image::{
    Arch, ConfigBuilder, Descriptor, DescriptorBuilder, Digest, ImageConfiguration,
    ImageConfigurationBuilder, ImageIndex, ImageIndexBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Os, RootFsBuilder,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";
pub const ANNOTATION_BUILD_MODE: &str = "dev.image-assembler.build-mode";
/// Comma-separated toolchain packages that must not reach the final image.
pub const ANNOTATION_TOOLCHAIN: &str = "dev.image-assembler.toolchain";
pub const ANNOTATION_REPRODUCIBLE: &str = "dev.image-assembler.reproducible";

const LAYOUT_VERSION: &str = "1.0.0";

/// Everything the image config and manifest carry besides layers.
#[derive(Debug, Clone, Default)]
pub struct ImageSpec {
    pub reference: String,
    pub user: String,
    pub env: Vec<String>,
    pub working_dir: String,
    pub cmd: Vec<String>,
    pub created_epoch: u64,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct WrittenImage {
    pub manifest_digest: String,
    pub config_digest: String,
    pub layer_digests: Vec<String>,
}

fn oci_err(context: &str) -> impl Fn(oci_spec::OciSpecError) -> AssemblerError + '_ {
    move |e| AssemblerError::Image(format!("{}: {}", context, e))
}

fn parse_digest(digest: &str) -> AssemblerResult<Digest> {
    Digest::from_str(digest)
        .map_err(|e| AssemblerError::Image(format!("invalid digest {}: {}", digest, e)))
}

fn rfc3339(epoch: u64) -> String {
    chrono::DateTime::from_timestamp(epoch as i64, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Serialize with object keys sorted; annotation maps are unordered.
fn canonical_json<T: serde::Serialize>(value: &T, what: &str) -> AssemblerResult<Vec<u8>> {
    serde_json::to_value(value)
        .and_then(|v| serde_json::to_vec(&v))
        .map_err(|e| AssemblerError::Image(format!("serialize {}: {}", what, e)))
}

/// Writes one image into an OCI layout directory.
pub struct OciLayoutWriter {
    root: PathBuf,
}

impl OciLayoutWriter {
    pub fn create(root: &Path) -> AssemblerResult<Self> {
        std::fs::create_dir_all(root.join("blobs").join("sha256")).map_err(|e| {
            AssemblerError::Storage(format!(
                "Failed to create image layout at {}: {}",
                root.display(),
                e
            ))
        })?;
        let layout = serde_json::json!({ "imageLayoutVersion": LAYOUT_VERSION });
        std::fs::write(root.join("oci-layout"), layout.to_string())?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.trim_start_matches("sha256:");
        self.root.join("blobs").join("sha256").join(hex)
    }

    /// Store `bytes` and return their `sha256:` digest.
    pub fn write_blob(&self, bytes: &[u8]) -> AssemblerResult<String> {
        let digest = sha256_digest(bytes);
        let path = self.blob_path(&digest);
        if !path.exists() {
            std::fs::write(&path, bytes)?;
        }
        Ok(digest)
    }

    fn descriptor(&self, media_type: MediaType, digest: &str, size: u64) -> AssemblerResult<Descriptor> {
        DescriptorBuilder::default()
            .media_type(media_type)
            .digest(parse_digest(digest)?)
            .size(size)
            .build()
            .map_err(oci_err("descriptor"))
    }

    /// Write layers, config, manifest and index.
    pub fn write_image(&self, spec: &ImageSpec, layers: &[Layer]) -> AssemblerResult<WrittenImage> {
        let mut layer_descriptors = Vec::with_capacity(layers.len());
        let mut diff_ids = Vec::with_capacity(layers.len());
        for layer in layers {
            let digest = self.write_blob(&layer.blob)?;
            layer_descriptors.push(self.descriptor(MediaType::ImageLayerGzip, &digest, layer.size())?);
            diff_ids.push(layer.diff_id.clone());
        }

        let mut config_builder = ConfigBuilder::default()
            .user(spec.user.clone())
            .env(spec.env.clone())
            .working_dir(spec.working_dir.clone());
        if !spec.cmd.is_empty() {
            config_builder = config_builder.cmd(spec.cmd.clone());
        }
        let config = config_builder.build().map_err(oci_err("image config"))?;

        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(diff_ids)
            .build()
            .map_err(oci_err("rootfs"))?;

        let configuration = ImageConfigurationBuilder::default()
            .created(rfc3339(spec.created_epoch))
            .architecture(Arch::Amd64)
            .os(Os::Linux)
            .config(config)
            .rootfs(rootfs)
            .build()
            .map_err(oci_err("image configuration"))?;
        let config_bytes = canonical_json(&configuration, "config")?;
        let config_digest = self.write_blob(&config_bytes)?;

        let mut annotations: HashMap<String, String> = spec
            .annotations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        annotations.insert(ANNOTATION_CREATED.to_string(), rfc3339(spec.created_epoch));

        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(self.descriptor(MediaType::ImageConfig, &config_digest, config_bytes.len() as u64)?)
            .layers(layer_descriptors)
            .annotations(annotations)
            .build()
            .map_err(oci_err("image manifest"))?;
        let manifest_bytes = canonical_json(&manifest, "manifest")?;
        let manifest_digest = self.write_blob(&manifest_bytes)?;

        let manifest_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(parse_digest(&manifest_digest)?)
            .size(manifest_bytes.len() as u64)
            .annotations(HashMap::from([(
                ANNOTATION_REF_NAME.to_string(),
                spec.reference.clone(),
            )]))
            .build()
            .map_err(oci_err("manifest descriptor"))?;

        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![manifest_descriptor])
            .build()
            .map_err(oci_err("image index"))?;
        let index_bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| AssemblerError::Image(format!("serialize index: {}", e)))?;
        std::fs::write(self.root.join("index.json"), index_bytes)?;

        tracing::info!(
            reference = %spec.reference,
            manifest = %manifest_digest,
            layers = layers.len(),
            "Wrote OCI image layout"
        );

        Ok(WrittenImage {
            manifest_digest,
            config_digest,
            layer_digests: layers.iter().map(|l| l.digest.clone()).collect(),
        })
    }
}

/// Read side of an OCI layout directory holding a single image.
#[derive(Debug, Clone)]
pub struct OciImage {
    root: PathBuf,
    manifest_digest: String,
    manifest: ImageManifest,
    config: ImageConfiguration,
}

impl OciImage {
    pub fn open(root: &Path) -> AssemblerResult<Self> {
        if !root.join("oci-layout").is_file() {
            return Err(AssemblerError::Image(format!(
                "{} is not an OCI image layout",
                root.display()
            )));
        }
        let index_bytes = std::fs::read(root.join("index.json"))?;
        let index: ImageIndex = serde_json::from_slice(&index_bytes)
            .map_err(|e| AssemblerError::Image(format!("invalid index.json: {}", e)))?;
        let descriptor = index
            .manifests()
            .first()
            .ok_or_else(|| AssemblerError::Image("index.json lists no manifests".into()))?;
        let manifest_digest = descriptor.digest().to_string();

        let manifest: ImageManifest = serde_json::from_slice(&read_blob(root, &manifest_digest)?)
            .map_err(|e| AssemblerError::Image(format!("invalid manifest: {}", e)))?;
        let config_digest = manifest.config().digest().to_string();
        let config: ImageConfiguration = serde_json::from_slice(&read_blob(root, &config_digest)?)
            .map_err(|e| AssemblerError::Image(format!("invalid image config: {}", e)))?;

        Ok(Self {
            root: root.to_path_buf(),
            manifest_digest,
            manifest,
            config,
        })
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn user(&self) -> Option<&str> {
        self.config.config().as_ref()?.user().as_deref()
    }

    pub fn env(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.env().clone())
            .unwrap_or_default()
    }

    pub fn env_var(&self, key: &str) -> Option<String> {
        self.env().into_iter().find_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.config.config().as_ref()?.working_dir().as_deref()
    }

    pub fn cmd(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.cmd().clone())
            .unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.manifest
            .annotations()
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }

    pub fn layer_count(&self) -> usize {
        self.manifest.layers().len()
    }

    /// Compressed layer blobs in manifest order, digests checked.
    pub fn layer_blobs(&self) -> AssemblerResult<Vec<Vec<u8>>> {
        self.manifest
            .layers()
            .iter()
            .map(|d| read_blob(&self.root, &d.digest().to_string()))
            .collect()
    }
}

fn read_blob(root: &Path, digest: &str) -> AssemblerResult<Vec<u8>> {
    let hex = digest.trim_start_matches("sha256:");
    let path = root.join("blobs").join("sha256").join(hex);
    let bytes = std::fs::read(&path).map_err(|e| {
        AssemblerError::Image(format!("missing blob {}: {}", digest, e))
    })?;
    let actual = sha256_digest(&bytes);
    if actual != digest {
        return Err(AssemblerError::Image(format!(
            "blob {} is corrupt (content digest {})",
            digest, actual
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::layer::{LayerBuilder, Owner};

    fn layer() -> Layer {
        let mut b = LayerBuilder::new("app", 0);
        b.add_file_bytes(Path::new("/app/main.py"), b"print()".to_vec(), Owner::new(1000, 1000), 0o644)
            .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_write_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OciLayoutWriter::create(dir.path()).unwrap();
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_BASE_NAME.to_string(), "python:3.12-slim".to_string());

        let spec = ImageSpec {
            reference: "app:latest".into(),
            user: "app".into(),
            env: vec!["PYTHONUNBUFFERED=1".into()],
            working_dir: "/app".into(),
            cmd: vec!["gunicorn".into()],
            created_epoch: 0,
            annotations,
        };
        let written = writer.write_image(&spec, &[layer()]).unwrap();

        let image = OciImage::open(dir.path()).unwrap();
        assert_eq!(image.manifest_digest(), written.manifest_digest);
        assert_eq!(image.user(), Some("app"));
        assert_eq!(image.working_dir(), Some("/app"));
        assert_eq!(image.env_var("PYTHONUNBUFFERED").as_deref(), Some("1"));
        assert_eq!(image.annotation(ANNOTATION_BASE_NAME), Some("python:3.12-slim"));
        assert_eq!(image.layer_blobs().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_blob_detected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OciLayoutWriter::create(dir.path()).unwrap();
        let l = layer();
        let digest = l.digest.clone();
        writer.write_image(&ImageSpec::default(), &[l]).unwrap();

        let hex = digest.trim_start_matches("sha256:");
        std::fs::write(dir.path().join("blobs/sha256").join(hex), b"tampered").unwrap();

        let image = OciImage::open(dir.path()).unwrap();
        assert!(image.layer_blobs().is_err());
    }

    #[test]
    fn test_open_rejects_plain_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OciImage::open(dir.path()).is_err());
    }
}
