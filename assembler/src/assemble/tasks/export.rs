//! Task: Image export.
//!
//! Adds the system layer (identity records, package registry, owned
//! directories), composes the environment set, checks final-domain
//! isolation and writes the OCI layout to a staging directory that is
//! renamed over the output only once complete.

use super::{AssemblyCtx, log_task_error, task_start};
use crate::assemble::types::{CopyOutput, ExportOutput};
use crate::image::{
    ANNOTATION_BASE_NAME, ANNOTATION_BUILD_MODE, ANNOTATION_REPRODUCIBLE, ANNOTATION_TOOLCHAIN,
    ImageSpec, Layer, LayerBuilder, OciLayoutWriter, Owner, REGISTRY_PATH, RuntimeEnvironment,
    StageRoot,
};
use crate::pipeline::PipelineTask;
use crate::planner::{BuildMode, BuildPlan, OwnershipPolicy, StageOp};
use crate::runtime::{AssemblerOptions, staging_path};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub struct ImageExportTask;

#[async_trait]
impl PipelineTask<AssemblyCtx> for ImageExportTask {
    async fn run(self: Box<Self>, ctx: AssemblyCtx) -> AssemblerResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, plan, final_root, copy, reproducible, output, staging) = {
            let mut ctx = ctx.lock().await;
            let copy = ctx.copy_output.take().ok_or_else(|| {
                AssemblerError::Internal("runtime copy task must run first".into())
            })?;
            let reproducible = ctx
                .install_output
                .as_ref()
                .map(|r| r.reproducible)
                .unwrap_or(false);
            let staging = staging_path(&ctx.output, &build_id);
            ctx.guard.set_staging(staging.clone());
            (
                ctx.options.clone(),
                ctx.plan.clone(),
                ctx.roots()?.final_root.clone(),
                copy,
                reproducible,
                ctx.output.clone(),
                staging,
            )
        };

        let export_build_id = build_id.clone();
        let output = tokio::task::spawn_blocking(move || {
            run_export(
                &export_build_id,
                &options,
                &plan,
                &final_root,
                copy,
                reproducible,
                &staging,
                &output,
            )
        })
        .await
        .map_err(|e| AssemblerError::Internal(format!("Export task failed: {}", e)))?
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.guard.take_staging();
        ctx.export_output = Some(output);
        Ok(())
    }

    fn name(&self) -> &str {
        "image_export"
    }
}

#[allow(clippy::too_many_arguments)]
fn run_export(
    build_id: &str,
    options: &AssemblerOptions,
    plan: &BuildPlan,
    final_root: &StageRoot,
    copy: CopyOutput,
    reproducible: bool,
    staging: &Path,
    output: &Path,
) -> AssemblerResult<ExportOutput> {
    check_isolation(plan, final_root)?;

    let system = system_layer(options, plan, final_root)?;
    let environment = RuntimeEnvironment::new(
        &options.environment,
        &options.image.venv_path,
        &options.image.python,
        &options.image.workdir,
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_BASE_NAME.to_string(),
        final_root.base_image().to_string(),
    );
    annotations.insert(ANNOTATION_BUILD_MODE.to_string(), plan.mode.to_string());
    annotations.insert(ANNOTATION_REPRODUCIBLE.to_string(), reproducible.to_string());
    if plan.mode == BuildMode::TwoStage {
        let toolchain: Vec<&str> = plan.build_only.iter().map(String::as_str).collect();
        annotations.insert(ANNOTATION_TOOLCHAIN.to_string(), toolchain.join(","));
    }

    let spec = ImageSpec {
        reference: options.image.name.clone(),
        user: plan.identity.name.clone(),
        env: environment.to_env(),
        working_dir: options.image.workdir.display().to_string(),
        cmd: options.image.cmd.clone(),
        created_epoch: options.image.source_date_epoch,
        annotations,
    };

    if staging.exists() {
        std::fs::remove_dir_all(staging)?;
    }
    let layers: [Layer; 3] = [system, copy.venv_layer, copy.app_layer];
    let image = OciLayoutWriter::create(staging)?.write_image(&spec, &layers)?;

    publish(staging, output)?;
    tracing::info!(
        build_id = %build_id,
        output = %output.display(),
        manifest = %image.manifest_digest,
        "Exported image"
    );

    Ok(ExportOutput {
        image,
        output: output.to_path_buf(),
    })
}

/// Two-stage final domains must not carry any build-only package.
fn check_isolation(plan: &BuildPlan, final_root: &StageRoot) -> AssemblerResult<()> {
    if plan.mode != BuildMode::TwoStage {
        return Ok(());
    }
    let leaked = final_root.system_packages()?.overlap(&plan.build_only);
    if !leaked.is_empty() {
        return Err(AssemblerError::Isolation(leaked.join(", ")));
    }
    Ok(())
}

fn system_layer(
    options: &AssemblerOptions,
    plan: &BuildPlan,
    final_root: &StageRoot,
) -> AssemblerResult<Layer> {
    let identity = &plan.identity;
    let identity_owner = Owner::new(identity.uid, identity.gid);
    let mut layer = LayerBuilder::new("system", options.image.source_date_epoch);

    for file in ["etc/passwd", "etc/group", REGISTRY_PATH] {
        let content = std::fs::read(final_root.path().join(file))?;
        layer.add_file_bytes(&Path::new("/").join(file), content, Owner::ROOT, 0o644)?;
    }
    layer.add_dir(&identity.home, identity_owner, 0o755)?;

    let owned_dirs: Vec<PathBuf> = plan
        .final_stage()
        .into_iter()
        .flat_map(|s| s.ops.iter())
        .filter_map(|op| match op {
            StageOp::CreateIdentity { owned_dirs, .. } => Some(owned_dirs.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    let dir_owner = match plan.ownership {
        OwnershipPolicy::Explicit => identity_owner,
        OwnershipPolicy::Inherit => Owner::ROOT,
    };
    for dir in owned_dirs {
        layer.add_dir(&dir, dir_owner, 0o755)?;
    }

    layer.build()
}

/// Move `staging` to `output`, replacing a previous image layout there.
fn publish(staging: &Path, output: &Path) -> AssemblerResult<()> {
    if output.exists() {
        if !output.join("oci-layout").is_file() {
            return Err(AssemblerError::Storage(format!(
                "refusing to replace {}: not an image layout",
                output.display()
            )));
        }
        std::fs::remove_dir_all(output)?;
    }
    std::fs::rename(staging, output).map_err(|e| {
        AssemblerError::Storage(format!(
            "Failed to move image into place at {}: {}",
            output.display(),
            e
        ))
    })
}
