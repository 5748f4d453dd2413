//! Deterministic filesystem layers.
//!
//! Entries are written in path order with a fixed mtime and explicit
//! ownership on every header, then gzip-compressed with a zeroed header
//! timestamp. The same inputs always produce the same blob digest.

use super::rootfs::image_relative;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Numeric owner recorded in tar headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub const ROOT: Owner = Owner { uid: 0, gid: 0 };

    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

#[derive(Debug, Clone)]
enum EntryKind {
    Dir,
    HostFile(PathBuf),
    Inline(Vec<u8>),
    Symlink(PathBuf),
}

#[derive(Debug, Clone)]
struct LayerEntry {
    kind: EntryKind,
    owner: Owner,
    mode: u32,
}

/// A finished, compressed layer blob.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub blob: Vec<u8>,
    /// `sha256:` digest of the compressed blob
    pub digest: String,
    /// `sha256:` digest of the uncompressed tar
    pub diff_id: String,
    pub entries: usize,
}

impl Layer {
    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }
}

pub struct LayerBuilder {
    name: String,
    mtime: u64,
    entries: BTreeMap<PathBuf, LayerEntry>,
}

impl LayerBuilder {
    pub fn new(name: &str, mtime: u64) -> Self {
        Self {
            name: name.to_string(),
            mtime,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_dir(&mut self, path: &Path, owner: Owner, mode: u32) -> AssemblerResult<()> {
        let rel = image_relative(path)?;
        self.ensure_parents(&rel);
        self.insert(rel, EntryKind::Dir, owner, mode);
        Ok(())
    }

    pub fn add_file_bytes(
        &mut self,
        path: &Path,
        contents: Vec<u8>,
        owner: Owner,
        mode: u32,
    ) -> AssemblerResult<()> {
        let rel = image_relative(path)?;
        self.ensure_parents(&rel);
        self.insert(rel, EntryKind::Inline(contents), owner, mode);
        Ok(())
    }

    /// Copy the host tree `src` to the in-image path `dest`, every entry
    /// owned by `owner`. `exclude` receives paths relative to `src`; an
    /// excluded directory is pruned with everything below it.
    pub fn add_tree(
        &mut self,
        src: &Path,
        dest: &Path,
        owner: Owner,
        exclude: &dyn Fn(&Path) -> bool,
    ) -> AssemblerResult<usize> {
        if !src.is_dir() {
            return Err(AssemblerError::Image(format!(
                "layer source is not a directory: {}",
                src.display()
            )));
        }

        let dest_rel = image_relative(dest)?;
        self.ensure_parents(&dest_rel);

        let mut added = 0;
        let walker = WalkDir::new(src)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .path()
                    .strip_prefix(src)
                    .map(|rel| rel.as_os_str().is_empty() || !exclude(rel))
                    .unwrap_or(false)
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                AssemblerError::Image(format!("failed to walk {}: {}", src.display(), e))
            })?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| AssemblerError::Internal(e.to_string()))?;
            let target = dest_rel.join(rel);
            let metadata = entry.metadata().map_err(|e| {
                AssemblerError::Image(format!("failed to stat {}: {}", entry.path().display(), e))
            })?;
            let mode = metadata.permissions().mode() & 0o7777;

            let kind = if metadata.is_dir() {
                EntryKind::Dir
            } else if metadata.file_type().is_symlink() {
                EntryKind::Symlink(std::fs::read_link(entry.path())?)
            } else if metadata.is_file() {
                EntryKind::HostFile(entry.path().to_path_buf())
            } else {
                tracing::debug!(path = %entry.path().display(), "Skipping special file");
                continue;
            };

            self.insert(target, kind, owner, mode);
            added += 1;
        }

        Ok(added)
    }

    fn ensure_parents(&mut self, rel: &Path) {
        let mut parent = rel.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            self.entries
                .entry(dir.to_path_buf())
                .or_insert_with(|| LayerEntry {
                    kind: EntryKind::Dir,
                    owner: Owner::ROOT,
                    mode: 0o755,
                });
            parent = dir.parent();
        }
    }

    fn insert(&mut self, rel: PathBuf, kind: EntryKind, owner: Owner, mode: u32) {
        if rel.as_os_str().is_empty() {
            return;
        }
        self.entries.insert(rel, LayerEntry { kind, owner, mode });
    }

    /// Serialize, compress and digest the layer.
    pub fn build(self) -> AssemblerResult<Layer> {
        let count = self.entries.len();
        let mut tar = tar::Builder::new(Vec::new());
        tar.mode(tar::HeaderMode::Deterministic);

        for (path, entry) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_mtime(self.mtime);
            header.set_uid(entry.owner.uid as u64);
            header.set_gid(entry.owner.gid as u64);
            header.set_mode(entry.mode);

            let result = match &entry.kind {
                EntryKind::Dir => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    tar.append_data(&mut header, path, std::io::empty())
                }
                EntryKind::HostFile(source) => {
                    let file = std::fs::File::open(source)?;
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(file.metadata()?.len());
                    tar.append_data(&mut header, path, file)
                }
                EntryKind::Inline(bytes) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(bytes.len() as u64);
                    tar.append_data(&mut header, path, bytes.as_slice())
                }
                EntryKind::Symlink(target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    tar.append_link(&mut header, path, target)
                }
            };
            result.map_err(|e| {
                AssemblerError::Image(format!(
                    "failed to append {} to layer '{}': {}",
                    path.display(),
                    self.name,
                    e
                ))
            })?;
        }

        let raw = tar
            .into_inner()
            .map_err(|e| AssemblerError::Image(format!("failed to finish layer tar: {}", e)))?;
        let diff_id = sha256_digest(&raw);

        let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let blob = encoder.finish()?;
        let digest = sha256_digest(&blob);

        tracing::debug!(
            layer = %self.name,
            entries = count,
            digest = %digest,
            size = blob.len(),
            "Built layer"
        );

        Ok(Layer {
            name: self.name,
            blob,
            digest,
            diff_id,
            entries: count,
        })
    }
}

/// `sha256:<hex>` of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;

    fn entries(layer: &Layer) -> Vec<(String, u64, u64)> {
        let mut archive = tar::Archive::new(GzDecoder::new(layer.blob.as_slice()));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let h = e.header();
                (
                    e.path().unwrap().display().to_string(),
                    h.uid().unwrap(),
                    h.gid().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_tree_ownership_and_excludes() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("pkg")).unwrap();
        fs::write(src.path().join("pkg/mod.py"), "x = 1\n").unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();

        let mut builder = LayerBuilder::new("app", 0);
        builder
            .add_tree(src.path(), Path::new("/app"), Owner::new(1000, 1000), &|rel| {
                rel.starts_with(".git")
            })
            .unwrap();
        let layer = builder.build().unwrap();
        let listed = entries(&layer);

        assert!(listed.iter().all(|(p, _, _)| !p.contains(".git")));
        let module = listed.iter().find(|(p, _, _)| p == "app/pkg/mod.py").unwrap();
        assert_eq!((module.1, module.2), (1000, 1000));
        let app = listed.iter().find(|(p, _, _)| p.trim_end_matches('/') == "app").unwrap();
        assert_eq!(app.1, 1000);
    }

    #[test]
    fn test_parents_default_to_root() {
        let mut builder = LayerBuilder::new("system", 0);
        builder
            .add_file_bytes(Path::new("/etc/passwd"), b"root".to_vec(), Owner::ROOT, 0o644)
            .unwrap();
        builder
            .add_dir(Path::new("/home/app"), Owner::new(1000, 1000), 0o755)
            .unwrap();
        let listed = entries(&builder.build().unwrap());

        let home = listed.iter().find(|(p, _, _)| p.trim_end_matches('/') == "home").unwrap();
        assert_eq!(home.1, 0);
        let app = listed
            .iter()
            .find(|(p, _, _)| p.trim_end_matches('/') == "home/app")
            .unwrap();
        assert_eq!(app.1, 1000);
    }

    #[test]
    fn test_same_inputs_same_digest() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.py"), "print(1)\n").unwrap();

        let build = || {
            let mut b = LayerBuilder::new("app", 0);
            b.add_tree(src.path(), Path::new("/app"), Owner::new(1000, 1000), &|_| false)
                .unwrap();
            b.build().unwrap()
        };
        let first = build();
        let second = build();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.diff_id, second.diff_id);
        assert_ne!(first.digest, first.diff_id);
    }
}
