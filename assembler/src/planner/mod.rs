//! Stage planning.
//!
//! Turns options plus a resolved package set into an ordered, validated
//! `BuildPlan`. The plan drives both the assembly pipeline and the rendered
//! Dockerfile.

pub mod dockerfile;
mod types;

pub use types::{
    BUILDER_STAGE, BuildMode, BuildPlan, FINAL_STAGE, OwnershipPolicy, PlanMode, StageOp,
    StagePlan, StageRole, TEST_STAGE,
};

use crate::deps::{NativeTable, Resolution};
use crate::image::RuntimeEnvironment;
use crate::runtime::AssemblerOptions;
use assembler_shared::errors::AssemblerResult;
use std::collections::BTreeSet;

pub struct StagePlanner<'a> {
    options: &'a AssemblerOptions,
    native: &'a NativeTable,
}

impl<'a> StagePlanner<'a> {
    pub fn new(options: &'a AssemblerOptions, native: &'a NativeTable) -> Self {
        Self { options, native }
    }

    pub fn choose_mode(&self, resolution: &Resolution) -> BuildMode {
        match self.options.pipeline.mode {
            PlanMode::SingleStage => BuildMode::SingleStage,
            PlanMode::TwoStage => BuildMode::TwoStage,
            PlanMode::Auto if resolution.has_native() => BuildMode::TwoStage,
            PlanMode::Auto => BuildMode::SingleStage,
        }
    }

    pub fn plan(&self, resolution: &Resolution) -> AssemblerResult<BuildPlan> {
        let options = self.options;
        let mode = self.choose_mode(resolution);
        let native_packages: Vec<String> = resolution
            .native_names()
            .into_iter()
            .map(String::from)
            .collect();

        let toolchain: BTreeSet<String> = options.toolchain.packages.iter().cloned().collect();
        let headers = self
            .native
            .build_packages(native_packages.iter().map(String::as_str));
        let runtime_libs = self
            .native
            .runtime_packages(native_packages.iter().map(String::as_str));
        let build_only: BTreeSet<String> = toolchain.union(&headers).cloned().collect();

        let ownership = options.pipeline.ownership;
        if ownership == OwnershipPolicy::Inherit {
            tracing::warn!(
                "Ownership policy 'inherit' leaves copied files owned by root; the application will not be able to write to its own tree"
            );
        }

        let identity = &options.identity;
        let chown = match ownership {
            OwnershipPolicy::Explicit => Some(identity.chown_spec()),
            OwnershipPolicy::Inherit => None,
        };
        let workdir = options.image.workdir.clone();
        let venv = options.image.venv_path.clone();
        let mut context_files = vec![options.project.manifest_name()];
        if resolution.frozen {
            context_files.push(options.project.lockfile_name());
        }

        let environment = RuntimeEnvironment::new(
            &options.environment,
            &venv,
            &options.image.python,
            &workdir,
        );

        let identity_op = StageOp::CreateIdentity {
            name: identity.name.clone(),
            uid: identity.uid,
            gid: identity.gid,
            home: identity.home.clone(),
            shell: identity.shell.clone(),
            owned_dirs: vec![workdir.clone()],
        };
        let switch_user = StageOp::SwitchUser {
            user: identity.name.clone(),
        };
        let copy_source = StageOp::CopyFromContext {
            sources: vec![".".to_string()],
            dest: workdir.clone(),
            chown: chown.clone(),
        };
        let copy_manifests = |chown: Option<String>| StageOp::CopyFromContext {
            sources: context_files.clone(),
            dest: workdir.clone(),
            chown,
        };
        let install = |dev: bool| StageOp::InstallDependencies {
            frozen: resolution.frozen,
            dev,
            venv: venv.clone(),
        };
        let tail = [
            StageOp::Env {
                vars: environment.vars(),
            },
            StageOp::Workdir {
                path: workdir.clone(),
            },
            StageOp::Cmd {
                argv: options.image.cmd.clone(),
            },
        ];

        let mut stages = Vec::new();
        match mode {
            BuildMode::TwoStage => {
                let mut builder =
                    StagePlan::new(BUILDER_STAGE, StageRole::Builder, options.image.builder_base());
                builder
                    .push(StageOp::SystemInstall {
                        packages: build_only.iter().cloned().collect(),
                    })
                    .push(StageOp::Workdir {
                        path: workdir.clone(),
                    })
                    .push(copy_manifests(None))
                    .push(install(false));
                stages.push(builder);

                if options.pipeline.test_stage {
                    let mut test = StagePlan::new(TEST_STAGE, StageRole::Test, BUILDER_STAGE);
                    test.push(install(true))
                        .push(copy_source_plain(&workdir))
                        .push(StageOp::RunTests {
                            command: options.pipeline.test_command.clone(),
                        });
                    stages.push(test);
                }

                let mut final_stage =
                    StagePlan::new(FINAL_STAGE, StageRole::Final, &options.image.base);
                if !runtime_libs.is_empty() {
                    final_stage.push(StageOp::SystemInstall {
                        packages: runtime_libs.iter().cloned().collect(),
                    });
                }
                final_stage
                    .push(identity_op)
                    .push(switch_user)
                    .push(StageOp::CopyFromStage {
                        stage: BUILDER_STAGE.to_string(),
                        src: venv.clone(),
                        dest: venv.clone(),
                        chown: chown.clone(),
                    })
                    .push(copy_source);
                final_stage.ops.extend(tail);
                stages.push(final_stage);
            }
            BuildMode::SingleStage => {
                let mut packages: BTreeSet<String> = runtime_libs.clone();
                if !native_packages.is_empty() {
                    packages.extend(build_only.iter().cloned());
                }

                if options.pipeline.test_stage {
                    let mut test = StagePlan::new(TEST_STAGE, StageRole::Test, &options.image.base);
                    if !packages.is_empty() {
                        test.push(StageOp::SystemInstall {
                            packages: packages.iter().cloned().collect(),
                        });
                    }
                    test.push(StageOp::Workdir {
                        path: workdir.clone(),
                    })
                    .push(copy_manifests(None))
                    .push(install(true))
                    .push(copy_source_plain(&workdir))
                    .push(StageOp::RunTests {
                        command: options.pipeline.test_command.clone(),
                    });
                    stages.push(test);
                }

                let mut final_stage =
                    StagePlan::new(FINAL_STAGE, StageRole::Final, &options.image.base);
                if !packages.is_empty() {
                    final_stage.push(StageOp::SystemInstall {
                        packages: packages.iter().cloned().collect(),
                    });
                }
                final_stage
                    .push(identity_op)
                    .push(switch_user)
                    .push(copy_manifests(chown.clone()))
                    .push(install(false))
                    .push(copy_source);
                final_stage.ops.extend(tail);
                stages.push(final_stage);
            }
        }

        let plan = BuildPlan {
            mode,
            ownership,
            frozen: resolution.frozen,
            identity: identity.clone(),
            build_only,
            runtime_libs,
            native_packages,
            stages,
        };
        plan.validate()?;

        tracing::info!(
            mode = %plan.mode,
            stages = ?plan.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            native = ?plan.native_packages,
            frozen = plan.frozen,
            "Planned build"
        );
        Ok(plan)
    }
}

fn copy_source_plain(workdir: &std::path::Path) -> StageOp {
    StageOp::CopyFromContext {
        sources: vec![".".to_string()],
        dest: workdir.to_path_buf(),
        chown: None,
    }
}
