//! Non-privileged runtime identity.

use super::rootfs::StageRoot;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ROOT_PASSWD: &str = "root:x:0:0:root:/root:/bin/sh\n";
const ROOT_GROUP: &str = "root:x:0:\n";

/// User and group the application process runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: String,
}

impl Default for RuntimeIdentity {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/app"),
            shell: "/bin/bash".to_string(),
        }
    }
}

/// One parsed `/etc/passwd` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect()
}

impl RuntimeIdentity {
    /// Reject identities that would run the application privileged.
    pub fn validate(&self) -> AssemblerResult<()> {
        if self.name.is_empty()
            || self.name == "root"
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(AssemblerError::Config(format!(
                "invalid runtime user name '{}'",
                self.name
            )));
        }
        if self.uid == 0 || self.gid == 0 {
            return Err(AssemblerError::Config(format!(
                "runtime identity '{}' must not use uid/gid 0",
                self.name
            )));
        }
        if !self.home.is_absolute() {
            return Err(AssemblerError::Config(format!(
                "home directory must be absolute: {}",
                self.home.display()
            )));
        }
        Ok(())
    }

    /// `--chown` argument form.
    pub fn chown_spec(&self) -> String {
        format!("{}:{}", self.name, self.name)
    }

    pub fn passwd_entry(&self) -> String {
        format!(
            "{}:x:{}:{}::{}:{}\n",
            self.name,
            self.uid,
            self.gid,
            self.home.display(),
            self.shell
        )
    }

    pub fn group_entry(&self) -> String {
        format!("{}:x:{}:\n", self.name, self.gid)
    }

    /// Register the identity in the stage root's `/etc/passwd` and
    /// `/etc/group` and create its home directory.
    ///
    /// Re-running with the same identity is a no-op; a clashing name or id
    /// is an error.
    pub fn create_in(&self, root: &StageRoot) -> AssemblerResult<()> {
        self.validate()?;

        let etc = root.path().join("etc");
        std::fs::create_dir_all(&etc)?;

        let passwd_path = etc.join("passwd");
        let mut passwd = read_or(&passwd_path, ROOT_PASSWD)?;
        let entries = parse_passwd(&passwd);
        match entries
            .iter()
            .find(|e| e.name == self.name || e.uid == self.uid)
        {
            Some(existing) if existing.name == self.name && existing.uid == self.uid => {
                tracing::debug!(user = %self.name, "Runtime identity already present");
            }
            Some(existing) => {
                return Err(AssemblerError::Config(format!(
                    "runtime identity {}:{} clashes with existing user {}:{}",
                    self.name, self.uid, existing.name, existing.uid
                )));
            }
            None => passwd.push_str(&self.passwd_entry()),
        }
        std::fs::write(&passwd_path, passwd)?;

        let group_path = etc.join("group");
        let mut group = read_or(&group_path, ROOT_GROUP)?;
        let has_group = group
            .lines()
            .any(|l| l.split(':').next() == Some(self.name.as_str()));
        if !has_group {
            group.push_str(&self.group_entry());
        }
        std::fs::write(&group_path, group)?;

        let home = root.resolve(&self.home)?;
        std::fs::create_dir_all(&home)?;
        self.chown_on_host(&home)?;

        tracing::info!(
            user = %self.name,
            uid = self.uid,
            gid = self.gid,
            stage = root.name(),
            "Created runtime identity"
        );
        Ok(())
    }

    /// Apply ownership to a host path when the assembler itself runs as
    /// root. Unprivileged runs skip this; layer headers carry the ownership
    /// that matters in the image.
    pub fn chown_on_host(&self, path: &Path) -> AssemblerResult<()> {
        if !nix::unistd::geteuid().is_root() {
            return Ok(());
        }
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(self.uid)),
            Some(nix::unistd::Gid::from_raw(self.gid)),
        )
        .map_err(|e| {
            AssemblerError::Storage(format!("chown {} failed: {}", path.display(), e))
        })
    }
}

fn read_or(path: &Path, default: &str) -> AssemblerResult<String> {
    if path.exists() {
        Ok(std::fs::read_to_string(path)?)
    } else {
        Ok(default.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_root() {
        let mut id = RuntimeIdentity::default();
        assert!(id.validate().is_ok());

        id.uid = 0;
        assert!(id.validate().is_err());

        let id = RuntimeIdentity {
            name: "root".into(),
            ..Default::default()
        };
        assert!(id.validate().is_err());
    }

    #[test]
    fn test_create_in_writes_entries_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = StageRoot::create(dir.path(), "final", "python:3.12-slim").unwrap();
        let id = RuntimeIdentity::default();

        id.create_in(&root).unwrap();
        id.create_in(&root).unwrap();

        let passwd = std::fs::read_to_string(root.path().join("etc/passwd")).unwrap();
        let users = parse_passwd(&passwd);
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].name, "app");
        assert_eq!(users[1].uid, 1000);
        assert!(root.path().join("home/app").is_dir());

        let group = std::fs::read_to_string(root.path().join("etc/group")).unwrap();
        assert_eq!(group.matches("app:x:1000:").count(), 1);
    }

    #[test]
    fn test_create_in_rejects_uid_clash() {
        let dir = tempfile::tempdir().unwrap();
        let root = StageRoot::create(dir.path(), "final", "python:3.12-slim").unwrap();
        RuntimeIdentity::default().create_in(&root).unwrap();

        let other = RuntimeIdentity {
            name: "web".into(),
            ..Default::default()
        };
        assert!(other.create_in(&root).is_err());
    }
}
