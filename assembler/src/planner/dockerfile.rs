//! Dockerfile rendering of a build plan.

use super::types::{BuildPlan, StageOp, StagePlan};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::fmt::{self, Write};

const UV_IMAGE: &str = "ghcr.io/astral-sh/uv:latest";

/// Render `plan` as a BuildKit Dockerfile.
pub fn render(plan: &BuildPlan) -> AssemblerResult<String> {
    let mut out = String::new();
    render_plan(&mut out, plan)
        .map_err(|e| AssemblerError::Internal(format!("failed to render Dockerfile: {}", e)))?;
    Ok(out)
}

fn render_plan(out: &mut String, plan: &BuildPlan) -> fmt::Result {
    writeln!(out, "# syntax=docker/dockerfile:1")?;
    writeln!(
        out,
        "# mode: {}, ownership: {:?}, frozen: {}",
        plan.mode, plan.ownership, plan.frozen
    )?;
    for stage in &plan.stages {
        out.write_char('\n')?;
        render_stage(out, stage)?;
    }
    Ok(())
}

fn render_stage(out: &mut String, stage: &StagePlan) -> fmt::Result {
    writeln!(out, "FROM {} AS {}", stage.base, stage.name)?;
    for op in &stage.ops {
        render_op(out, op)?;
    }
    Ok(())
}

fn render_op(out: &mut String, op: &StageOp) -> fmt::Result {
    match op {
        StageOp::SystemInstall { packages } => writeln!(
            out,
            "RUN apt-get update \\\n    && apt-get install -y --no-install-recommends {} \\\n    && rm -rf /var/lib/apt/lists/*",
            packages.join(" ")
        ),
        StageOp::CopyFromContext {
            sources,
            dest,
            chown,
        } => writeln!(
            out,
            "COPY {}{} {}/",
            chown_flag(chown),
            sources.join(" "),
            dest.display()
        ),
        StageOp::InstallDependencies { frozen, dev, venv } => {
            let mut args = vec!["sync", "--no-install-project"];
            if *frozen {
                args.push("--frozen");
            }
            if !*dev {
                args.push("--no-dev");
            }
            writeln!(
                out,
                "RUN --mount=from={},source=/uv,target=/bin/uv \\\n    UV_PROJECT_ENVIRONMENT={} uv {}",
                UV_IMAGE,
                venv.display(),
                args.join(" ")
            )
        }
        StageOp::CreateIdentity {
            name,
            uid,
            gid,
            home,
            shell,
            owned_dirs,
        } => {
            write!(
                out,
                "RUN groupadd --gid {gid} {name} \\\n    && useradd --uid {uid} --gid {gid} --home-dir {} --create-home --shell {shell} {name}",
                home.display()
            )?;
            for dir in owned_dirs {
                write!(
                    out,
                    " \\\n    && mkdir -p {dir} && chown {uid}:{gid} {dir}",
                    dir = dir.display()
                )?;
            }
            out.write_char('\n')
        }
        StageOp::SwitchUser { user } => writeln!(out, "USER {}", user),
        StageOp::CopyFromStage {
            stage,
            src,
            dest,
            chown,
        } => writeln!(
            out,
            "COPY --from={} {}{} {}",
            stage,
            chown_flag(chown),
            src.display(),
            dest.display()
        ),
        StageOp::Env { vars } => {
            let lines: Vec<String> = vars
                .iter()
                .map(|(k, v)| format!("{}={}", k, quote(v)))
                .collect();
            writeln!(out, "ENV {}", lines.join(" \\\n    "))
        }
        StageOp::Workdir { path } => writeln!(out, "WORKDIR {}", path.display()),
        StageOp::RunTests { command } => writeln!(out, "RUN {}", exec_form(command)?),
        StageOp::Cmd { argv } => writeln!(out, "CMD {}", exec_form(argv)?),
    }
}

fn chown_flag(chown: &Option<String>) -> String {
    chown
        .as_ref()
        .map(|c| format!("--chown={} ", c))
        .unwrap_or_default()
}

fn exec_form(argv: &[String]) -> Result<String, fmt::Error> {
    serde_json::to_string(argv).map_err(|_| fmt::Error)
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{NativeTable, Resolution, ResolvedPackage, Version};
    use crate::planner::{OwnershipPolicy, StagePlanner};
    use crate::runtime::AssemblerOptions;

    fn resolution(native: bool) -> Resolution {
        let name = if native { "psycopg2" } else { "django" };
        Resolution {
            packages: vec![ResolvedPackage {
                name: name.into(),
                version: Version::parse("1.0").unwrap(),
                native,
            }],
            frozen: true,
        }
    }

    #[test]
    fn test_two_stage_dockerfile() {
        let options = AssemblerOptions::default();
        let native = NativeTable::builtin();
        let plan = StagePlanner::new(&options, &native)
            .plan(&resolution(true))
            .unwrap();
        let text = render(&plan).unwrap();

        assert!(text.contains("FROM python:3.12-slim AS builder"));
        assert!(text.contains("FROM python:3.12-slim AS final"));
        assert!(text.contains("COPY --from=builder --chown=app:app /app/.venv /app/.venv"));
        assert!(text.contains("COPY --chown=app:app . /app/"));
        assert!(text.contains("--frozen --no-dev"));
        assert!(text.contains("ENV PYTHONUNBUFFERED=\"1\""));
        assert!(text.contains("DJANGO_SETTINGS_MODULE=\"etc.settings\""));

        let user_at = text.find("USER app").unwrap();
        let final_at = text.find("AS final").unwrap();
        let useradd_at = text.rfind("useradd").unwrap();
        assert!(final_at < useradd_at && useradd_at < user_at);
        assert!(!text[final_at..].contains("libpq-dev"));
    }

    #[test]
    fn test_inherit_drops_chown() {
        let mut options = AssemblerOptions::default();
        options.pipeline.ownership = OwnershipPolicy::Inherit;
        let native = NativeTable::builtin();
        let plan = StagePlanner::new(&options, &native)
            .plan(&resolution(false))
            .unwrap();
        let text = render(&plan).unwrap();
        assert!(!text.contains("--chown"));
        assert!(text.contains("COPY . /app/"));
    }

    #[test]
    fn test_identity_uses_configured_shell() {
        let mut options = AssemblerOptions::default();
        options.identity.shell = "/usr/sbin/nologin".into();
        let native = NativeTable::builtin();
        let plan = StagePlanner::new(&options, &native)
            .plan(&resolution(false))
            .unwrap();
        let text = render(&plan).unwrap();
        assert!(text.contains("--shell /usr/sbin/nologin app"));
        assert!(!text.contains("/bin/bash"));
        assert!(text.contains("chown 1000:1000 /app"));
    }
}
