//! Startup probe: what the kernel and the interpreter would check when the
//! image's process starts as its configured user.

use super::tree::{ImageTree, NodeKind};
use crate::deps::normalize_name;
use crate::image::{PasswdEntry, SystemPackages, parse_passwd};
use crate::installer::RUNTIME_LIBS_FILE;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::path::{Path, PathBuf};

pub struct StartupProbe<'a> {
    tree: &'a ImageTree,
    user: PasswdEntry,
    registry: SystemPackages,
}

impl<'a> StartupProbe<'a> {
    /// Resolve `user` (name or numeric uid) against the image's
    /// `/etc/passwd`.
    pub fn new(tree: &'a ImageTree, user: &str) -> AssemblerResult<Self> {
        let passwd = tree
            .read_to_string(Path::new("/etc/passwd"))
            .ok_or_else(|| AssemblerError::Image("image has no /etc/passwd".into()))?;
        let user = parse_passwd(&passwd)
            .into_iter()
            .find(|e| e.name == user || e.uid.to_string() == user)
            .ok_or_else(|| {
                AssemblerError::Image(format!("user '{}' does not resolve in /etc/passwd", user))
            })?;
        Ok(Self {
            tree,
            user,
            registry: tree.system_packages(),
        })
    }

    pub fn user(&self) -> &PasswdEntry {
        &self.user
    }

    /// Every installed distribution's runtime libraries must be present in
    /// the final system registry.
    pub fn check_runtime_libraries(&self, site_packages: &Path) -> AssemblerResult<usize> {
        let mut checked = 0;
        for (path, node) in self.tree.entries_under(site_packages) {
            if node.kind != NodeKind::File
                || path.file_name().is_none_or(|n| n != RUNTIME_LIBS_FILE)
            {
                continue;
            }
            let Some(dist_info) = path.parent() else {
                continue;
            };
            let package = self.dist_name(dist_info);
            let libs = self.tree.read_to_string(path).unwrap_or_default();
            for library in libs.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if !self.registry.contains(library) {
                    return Err(AssemblerError::MissingRuntimeLibrary {
                        package,
                        library: library.to_string(),
                    });
                }
                checked += 1;
            }
        }
        Ok(checked)
    }

    fn dist_name(&self, dist_info: &Path) -> String {
        self.tree
            .read_to_string(&dist_info.join("METADATA"))
            .and_then(|m| {
                m.lines()
                    .find_map(|l| l.strip_prefix("Name:").map(|v| normalize_name(v.trim())))
            })
            .unwrap_or_else(|| dist_info.display().to_string())
    }

    /// Whether the runtime user may create or overwrite `path`: an existing
    /// file needs its write bit, a new file needs write and search on the
    /// parent directory.
    pub fn probe_write(&self, path: &Path) -> AssemblerResult<()> {
        if self.user.uid == 0 {
            return Ok(());
        }
        let (target, bits) = match self.tree.get(path) {
            Some(node) if node.kind == NodeKind::Dir => (path.to_path_buf(), 0o3),
            Some(_) => (path.to_path_buf(), 0o2),
            None => {
                let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"));
                (parent, 0o3)
            }
        };
        let node = self.tree.get(&target).ok_or_else(|| {
            AssemblerError::PermissionDenied(format!("{}: no such directory", target.display()))
        })?;

        let class = if node.uid == self.user.uid {
            (node.mode >> 6) & 0o7
        } else if node.gid == self.user.gid {
            (node.mode >> 3) & 0o7
        } else {
            node.mode & 0o7
        };
        if class & bits != bits {
            return Err(AssemblerError::PermissionDenied(format!(
                "{} cannot write {} (owner {}:{}, mode {:o})",
                self.user.name,
                path.display(),
                node.uid,
                node.gid,
                node.mode & 0o7777
            )));
        }
        Ok(())
    }
}
