//! Flattened view of an image's layers.

use crate::image::{OciImage, REGISTRY_PATH, SystemPackages};
use crate::installer::RUNTIME_LIBS_FILE;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    contents: Option<Vec<u8>>,
}

/// Union of all layers: later layers replace earlier entries at the same
/// path. Contents are retained only for the small metadata files the
/// checks read.
#[derive(Debug, Clone, Default)]
pub struct ImageTree {
    nodes: BTreeMap<PathBuf, Node>,
}

impl ImageTree {
    pub fn from_image(image: &OciImage) -> AssemblerResult<Self> {
        let mut tree = Self::default();
        for (index, blob) in image.layer_blobs()?.iter().enumerate() {
            tree.apply_layer(blob)
                .map_err(|e| AssemblerError::Image(format!("layer {}: {}", index, e)))?;
        }
        Ok(tree)
    }

    fn apply_layer(&mut self, blob: &[u8]) -> std::io::Result<()> {
        let mut archive = tar::Archive::new(GzDecoder::new(blob));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = absolute(&entry.path()?);
            let header = entry.header();
            let kind = match header.entry_type() {
                tar::EntryType::Directory => NodeKind::Dir,
                tar::EntryType::Regular => NodeKind::File,
                tar::EntryType::Symlink => NodeKind::Symlink,
                _ => NodeKind::Other,
            };
            let uid = header.uid()? as u32;
            let gid = header.gid()? as u32;
            let mode = header.mode()?;

            let contents = if kind == NodeKind::File && retains_contents(&path) {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                Some(buf)
            } else {
                None
            };

            self.nodes.insert(
                path,
                Node {
                    kind,
                    uid,
                    gid,
                    mode,
                    contents,
                },
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn read_to_string(&self, path: &Path) -> Option<String> {
        let bytes = self.nodes.get(path)?.contents.as_ref()?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Entries strictly below `prefix`.
    pub fn entries_under<'a>(
        &'a self,
        prefix: &'a Path,
    ) -> impl Iterator<Item = (&'a PathBuf, &'a Node)> + 'a {
        self.nodes
            .range(prefix.to_path_buf()..)
            .skip_while(move |(p, _)| p.as_path() == prefix)
            .take_while(move |(p, _)| p.starts_with(prefix))
    }

    /// System package registry shipped in the image.
    pub fn system_packages(&self) -> SystemPackages {
        self.read_to_string(&Path::new("/").join(REGISTRY_PATH))
            .map(|c| SystemPackages::parse(&c))
            .unwrap_or_default()
    }
}

fn absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

fn retains_contents(path: &Path) -> bool {
    if path.starts_with("/etc") || path == Path::new("/").join(REGISTRY_PATH) {
        return true;
    }
    let in_dist_info = path
        .parent()
        .and_then(Path::extension)
        .is_some_and(|ext| ext == "dist-info");
    in_dist_info
        && path
            .file_name()
            .is_some_and(|n| n == "METADATA" || n == RUNTIME_LIBS_FILE)
}
