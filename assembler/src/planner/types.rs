//! Build plan types.

use crate::image::RuntimeIdentity;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

pub const BUILDER_STAGE: &str = "builder";
pub const TEST_STAGE: &str = "test";
pub const FINAL_STAGE: &str = "final";

/// Requested stage layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanMode {
    /// Two-stage when any dependency needs native compilation.
    #[default]
    Auto,
    SingleStage,
    TwoStage,
}

/// Stage layout actually chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    SingleStage,
    TwoStage,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::SingleStage => write!(f, "single-stage"),
            BuildMode::TwoStage => write!(f, "two-stage"),
        }
    }
}

impl std::str::FromStr for BuildMode {
    type Err = AssemblerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-stage" => Ok(BuildMode::SingleStage),
            "two-stage" => Ok(BuildMode::TwoStage),
            other => Err(AssemblerError::Config(format!(
                "unknown build mode '{}' (expected single-stage or two-stage)",
                other
            ))),
        }
    }
}

/// Ownership of files copied into the final stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipPolicy {
    /// Copies are owned by the runtime identity.
    #[default]
    Explicit,
    /// Copies keep uid/gid 0. The application cannot write to its own tree.
    Inherit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageRole {
    Builder,
    Test,
    Final,
}

/// One step of a stage, in Dockerfile-instruction granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum StageOp {
    SystemInstall {
        packages: Vec<String>,
    },
    CopyFromContext {
        sources: Vec<String>,
        dest: PathBuf,
        chown: Option<String>,
    },
    InstallDependencies {
        frozen: bool,
        dev: bool,
        venv: PathBuf,
    },
    CreateIdentity {
        name: String,
        uid: u32,
        gid: u32,
        home: PathBuf,
        shell: String,
        /// Directories handed to the identity at creation time.
        owned_dirs: Vec<PathBuf>,
    },
    SwitchUser {
        user: String,
    },
    CopyFromStage {
        stage: String,
        src: PathBuf,
        dest: PathBuf,
        chown: Option<String>,
    },
    Env {
        vars: Vec<(String, String)>,
    },
    Workdir {
        path: PathBuf,
    },
    RunTests {
        command: Vec<String>,
    },
    Cmd {
        argv: Vec<String>,
    },
}

impl StageOp {
    pub fn kind(&self) -> &'static str {
        match self {
            StageOp::SystemInstall { .. } => "system-install",
            StageOp::CopyFromContext { .. } => "copy-from-context",
            StageOp::InstallDependencies { .. } => "install-dependencies",
            StageOp::CreateIdentity { .. } => "create-identity",
            StageOp::SwitchUser { .. } => "switch-user",
            StageOp::CopyFromStage { .. } => "copy-from-stage",
            StageOp::Env { .. } => "env",
            StageOp::Workdir { .. } => "workdir",
            StageOp::RunTests { .. } => "run-tests",
            StageOp::Cmd { .. } => "cmd",
        }
    }

    /// Needs uid 0 inside the stage.
    pub fn requires_privilege(&self) -> bool {
        matches!(
            self,
            StageOp::SystemInstall { .. } | StageOp::CreateIdentity { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    pub name: String,
    pub role: StageRole,
    /// Base image reference, or the name of an earlier stage.
    pub base: String,
    pub ops: Vec<StageOp>,
}

impl StagePlan {
    pub fn new(name: &str, role: StageRole, base: &str) -> Self {
        Self {
            name: name.to_string(),
            role,
            base: base.to_string(),
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: StageOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Packages installed by this stage's system-install steps.
    pub fn system_packages(&self) -> BTreeSet<String> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                StageOp::SystemInstall { packages } => Some(packages.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// User active at the end of the stage, if switched.
    pub fn final_user(&self) -> Option<&str> {
        self.ops.iter().rev().find_map(|op| match op {
            StageOp::SwitchUser { user } => Some(user.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub mode: BuildMode,
    pub ownership: OwnershipPolicy,
    pub frozen: bool,
    pub identity: RuntimeIdentity,
    /// Toolchain and header packages that belong to the builder domain only.
    pub build_only: BTreeSet<String>,
    /// Shared libraries the final domain ships for native extensions.
    pub runtime_libs: BTreeSet<String>,
    pub native_packages: Vec<String>,
    pub stages: Vec<StagePlan>,
}

impl BuildPlan {
    pub fn stage(&self, name: &str) -> Option<&StagePlan> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn final_stage(&self) -> Option<&StagePlan> {
        self.stages.iter().find(|s| s.role == StageRole::Final)
    }

    pub fn has_test_stage(&self) -> bool {
        self.stages.iter().any(|s| s.role == StageRole::Test)
    }

    /// Structural checks: stage references, privilege ordering, the final
    /// user, and isolation of the final domain.
    pub fn validate(&self) -> AssemblerResult<()> {
        let final_stage = self
            .final_stage()
            .ok_or_else(|| AssemblerError::Plan("plan has no final stage".into()))?;
        if self.stages.last().map(|s| &s.name) != Some(&final_stage.name) {
            return Err(AssemblerError::Plan("final stage must be last".into()));
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(AssemblerError::Plan(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            self.validate_stage(stage, &seen)?;
        }

        match final_stage.final_user() {
            Some(user) if user != "root" && user != "0" => {}
            _ => {
                return Err(AssemblerError::Plan(
                    "final stage must switch to a non-privileged user".into(),
                ));
            }
        }

        if self.mode == BuildMode::TwoStage {
            let leaked: Vec<String> = final_stage
                .system_packages()
                .intersection(&self.build_only)
                .cloned()
                .collect();
            if !leaked.is_empty() {
                return Err(AssemblerError::Isolation(leaked.join(", ")));
            }
        }
        Ok(())
    }

    fn validate_stage(&self, stage: &StagePlan, earlier: &BTreeSet<&str>) -> AssemblerResult<()> {
        let mut switched = false;
        for op in &stage.ops {
            if switched && op.requires_privilege() {
                return Err(AssemblerError::PlanOrder {
                    stage: stage.name.clone(),
                    step: op.kind().to_string(),
                });
            }
            match op {
                StageOp::SwitchUser { .. } => switched = true,
                StageOp::CopyFromStage { stage: from, .. } => {
                    if from == &stage.name || !earlier.contains(from.as_str()) {
                        return Err(AssemblerError::Plan(format!(
                            "stage '{}' copies from unknown or later stage '{}'",
                            stage.name, from
                        )));
                    }
                }
                _ => {}
            }
        }
        let base_is_stage = self.stages.iter().any(|s| s.name == stage.base);
        if base_is_stage && (stage.base == stage.name || !earlier.contains(stage.base.as_str())) {
            return Err(AssemblerError::Plan(format!(
                "stage '{}' builds on later stage '{}'",
                stage.name, stage.base
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mode_round_trips_display() {
        for mode in [BuildMode::SingleStage, BuildMode::TwoStage] {
            assert_eq!(mode.to_string().parse::<BuildMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_build_mode_is_config_error() {
        let err = "three-stage".parse::<BuildMode>().unwrap_err();
        assert!(matches!(err, AssemblerError::Config(_)));
        assert!(err.to_string().contains("three-stage"));
    }
}
