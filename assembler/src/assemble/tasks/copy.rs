//! Task: Runtime copy.
//!
//! Hard barrier behind dependency install: turns the finished venv and the
//! application source tree into image layers. Ownership of every entry
//! follows the plan's ownership policy.

use super::{AssemblyCtx, log_task_error, task_start};
use crate::assemble::types::{CopyInput, CopyOutput};
use crate::image::{LayerBuilder, Owner};
use crate::pipeline::PipelineTask;
use crate::planner::OwnershipPolicy;
use crate::runtime::STATE_DIR;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Never copied into the image, at any depth.
const EXCLUDED_NAMES: &[&str] = &[".git", ".venv", "__pycache__", STATE_DIR];

pub struct RuntimeCopyTask;

#[async_trait]
impl PipelineTask<AssemblyCtx> for RuntimeCopyTask {
    async fn run(self: Box<Self>, ctx: AssemblyCtx) -> AssemblerResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, plan, venv_source, excludes) = {
            let ctx = ctx.lock().await;
            if ctx.install_output.is_none() {
                return Err(AssemblerError::Internal(
                    "dependency install must complete before the runtime copy".into(),
                ));
            }
            if !ctx.identity_created {
                return Err(AssemblerError::Internal(
                    "runtime identity must exist before the runtime copy".into(),
                ));
            }
            let venv_source = ctx
                .roots()?
                .install_domain()
                .resolve(&ctx.options.image.venv_path)?;
            let excludes = project_excludes(
                &ctx.options.project.root,
                &[
                    ctx.output.clone(),
                    ctx.work_dir.clone(),
                    ctx.options.project.index_path(),
                ],
            );
            (ctx.options.clone(), ctx.plan.clone(), venv_source, excludes)
        };

        let output = tokio::task::spawn_blocking(move || {
            run_copy(CopyInput {
                options: &options,
                plan: &plan,
                venv_source,
                excludes,
            })
        })
        .await
        .map_err(|e| AssemblerError::Internal(format!("Copy task failed: {}", e)))?
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        ctx.lock().await.copy_output = Some(output);
        Ok(())
    }

    fn name(&self) -> &str {
        "runtime_copy"
    }
}

/// Paths under the project root that must not be copied, relative to it.
fn project_excludes(root: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    paths
        .iter()
        .filter_map(|p| {
            let p = match p.canonicalize() {
                Ok(c) => c,
                Err(_) => p.parent()?.canonicalize().ok()?.join(p.file_name()?),
            };
            p.strip_prefix(&root).ok().map(Path::to_path_buf)
        })
        .filter(|rel| !rel.as_os_str().is_empty())
        .collect()
}

fn is_excluded(rel: &Path, excludes: &[PathBuf]) -> bool {
    if rel
        .components()
        .any(|c| EXCLUDED_NAMES.iter().any(|name| c.as_os_str() == OsStr::new(name)))
    {
        return true;
    }
    if rel.extension().is_some_and(|ext| ext == "pyc") {
        return true;
    }
    excludes.iter().any(|e| rel.starts_with(e))
}

fn run_copy(input: CopyInput<'_>) -> AssemblerResult<CopyOutput> {
    let CopyInput {
        options,
        plan,
        venv_source,
        mut excludes,
    } = input;

    let owner = match plan.ownership {
        OwnershipPolicy::Explicit => Owner::new(plan.identity.uid, plan.identity.gid),
        OwnershipPolicy::Inherit => Owner::ROOT,
    };
    let epoch = options.image.source_date_epoch;

    if !venv_source.is_dir() {
        return Err(AssemblerError::Install(format!(
            "venv artifact missing at {}",
            venv_source.display()
        )));
    }
    let mut venv = LayerBuilder::new("venv", epoch);
    let venv_entries = venv.add_tree(&venv_source, &options.image.venv_path, owner, &|rel| {
        rel.components().any(|c| c.as_os_str() == OsStr::new("__pycache__"))
            || rel.extension().is_some_and(|ext| ext == "pyc")
    })?;

    if let Ok(rel) = options.image.venv_path.strip_prefix(&options.image.workdir) {
        excludes.push(rel.to_path_buf());
    }
    let mut app = LayerBuilder::new("app", epoch);
    let app_entries = app.add_tree(
        &options.project.root,
        &options.image.workdir,
        owner,
        &|rel| is_excluded(rel, &excludes),
    )?;

    tracing::info!(
        venv_entries,
        app_entries,
        uid = owner.uid,
        gid = owner.gid,
        "Copied runtime artifacts"
    );

    Ok(CopyOutput {
        venv_layer: venv.build()?,
        app_layer: app.build()?,
    })
}
