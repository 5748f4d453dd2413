//! Runtime environment configuration set.
//!
//! Built once from options and handed to the image exporter; the process
//! environment of the assembler never feeds into it.

use assembler_shared::errors::{AssemblerError, AssemblerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Debian/python base image default search path.
pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Settings module of the bundled Django project.
pub const DEFAULT_SETTINGS_MODULE: &str = "etc.settings";

/// User-facing knobs for the environment set.
///
/// `PYTHONUNBUFFERED` and `PYTHONDONTWRITEBYTECODE` are always set; only the
/// settings module and extra variables are configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentOptions {
    /// `DJANGO_SETTINGS_MODULE`
    pub settings_module: String,
    /// Additional variables, appended after the managed ones.
    pub extra: BTreeMap<String, String>,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            settings_module: DEFAULT_SETTINGS_MODULE.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl EnvironmentOptions {
    pub fn validate(&self) -> AssemblerResult<()> {
        let module = self.settings_module.trim();
        let well_formed = !module.is_empty()
            && module.split('.').all(|part| {
                !part.is_empty()
                    && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !well_formed {
            return Err(AssemblerError::Config(format!(
                "environment.settings_module must be a dotted module path, got '{}'",
                self.settings_module
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    settings_module: String,
    venv: PathBuf,
    site_packages: PathBuf,
    workdir: PathBuf,
    extra: BTreeMap<String, String>,
}

impl RuntimeEnvironment {
    pub fn new(options: &EnvironmentOptions, venv: &Path, python: &str, workdir: &Path) -> Self {
        Self {
            settings_module: options.settings_module.clone(),
            venv: venv.to_path_buf(),
            site_packages: venv
                .join("lib")
                .join(format!("python{}", python))
                .join("site-packages"),
            workdir: workdir.to_path_buf(),
            extra: options.extra.clone(),
        }
    }

    pub fn search_path(&self) -> String {
        format!("{}:{}", self.venv.join("bin").display(), SYSTEM_PATH)
    }

    pub fn python_path(&self) -> String {
        format!("{}:{}", self.site_packages.display(), self.workdir.display())
    }

    /// Ordered `(name, value)` pairs.
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("DJANGO_SETTINGS_MODULE".to_string(), self.settings_module.clone()),
        ];
        vars.push(("VIRTUAL_ENV".to_string(), self.venv.display().to_string()));
        vars.push(("PATH".to_string(), self.search_path()));
        vars.push(("PYTHONPATH".to_string(), self.python_path()));
        for (key, value) in &self.extra {
            if vars.iter().any(|(k, _)| k == key) {
                tracing::warn!(variable = %key, "Ignoring extra variable that shadows a managed one");
                continue;
            }
            vars.push((key.clone(), value.clone()));
        }
        vars
    }

    /// `KEY=value` strings for the image config.
    pub fn to_env(&self) -> Vec<String> {
        self.vars()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_environment() {
        let env = RuntimeEnvironment::new(
            &EnvironmentOptions::default(),
            Path::new("/app/.venv"),
            "3.12",
            Path::new("/app"),
        );
        let vars = env.to_env();
        assert_eq!(vars[0], "PYTHONUNBUFFERED=1");
        assert_eq!(vars[1], "PYTHONDONTWRITEBYTECODE=1");
        assert_eq!(vars[2], "DJANGO_SETTINGS_MODULE=etc.settings");
        assert!(vars.contains(&format!("PATH=/app/.venv/bin:{}", SYSTEM_PATH)));
        assert!(vars.contains(
            &"PYTHONPATH=/app/.venv/lib/python3.12/site-packages:/app".to_string()
        ));
    }

    #[test]
    fn test_extra_cannot_shadow_managed_vars() {
        let mut options = EnvironmentOptions::default();
        options.extra.insert("PATH".into(), "/usr/bin".into());
        options.extra.insert("PYTHONUNBUFFERED".into(), "0".into());
        options.extra.insert("PORT".into(), "8000".into());

        let env = RuntimeEnvironment::new(&options, Path::new("/app/.venv"), "3.12", Path::new("/app"));
        let vars = env.vars();
        assert_eq!(vars.iter().filter(|(k, _)| k == "PATH").count(), 1);
        assert!(vars.iter().any(|(k, v)| k == "PYTHONUNBUFFERED" && v == "1"));
        assert!(!vars.iter().any(|(k, v)| k == "PYTHONUNBUFFERED" && v == "0"));
        assert!(vars.iter().any(|(k, v)| k == "PORT" && v == "8000"));
    }

    #[test]
    fn test_settings_module_validation() {
        assert!(EnvironmentOptions::default().validate().is_ok());
        for bad in ["", "  ", "etc..settings", "etc/settings"] {
            let options = EnvironmentOptions {
                settings_module: bad.to_string(),
                ..Default::default()
            };
            assert!(matches!(options.validate(), Err(AssemblerError::Config(_))), "{bad:?}");
        }
    }
}
