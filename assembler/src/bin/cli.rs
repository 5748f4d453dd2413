//! `image-assembler` command-line front end.

use anyhow::{Context, Result};
use assembler::{
    Assembler, AssemblerOptions, OwnershipPolicy, PlanMode, StateLayout, init_logging,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "image-assembler",
    version,
    about = "Assemble least-privilege container images for Python applications"
)]
struct Cli {
    /// Configuration file (default: <root>/assembler.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Build root holding the manifest, lockfile and source tree
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// State directory for build history, logs and scratch space
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the build plan
    Plan {
        #[arg(long)]
        json: bool,
    },
    /// Print the plan as a multi-stage Dockerfile
    Dockerfile,
    /// Assemble the image into an OCI layout directory
    Build {
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long, value_enum)]
        ownership: Option<OwnershipArg>,
        /// Run the dev-dependency test stage
        #[arg(long)]
        with_tests: bool,
    },
    /// Check ownership, isolation and startup of a built image
    Verify { image: PathBuf },
    /// List recorded builds
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Auto,
    SingleStage,
    TwoStage,
}

impl From<ModeArg> for PlanMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Auto => PlanMode::Auto,
            ModeArg::SingleStage => PlanMode::SingleStage,
            ModeArg::TwoStage => PlanMode::TwoStage,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OwnershipArg {
    Explicit,
    Inherit,
}

impl From<OwnershipArg> for OwnershipPolicy {
    fn from(arg: OwnershipArg) -> Self {
        match arg {
            OwnershipArg::Explicit => OwnershipPolicy::Explicit,
            OwnershipArg::Inherit => OwnershipPolicy::Inherit,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_options(cli: &Cli) -> Result<AssemblerOptions> {
    let mut options = match &cli.config {
        Some(path) => AssemblerOptions::load(path)?,
        None => AssemblerOptions::discover(cli.root.as_deref().unwrap_or(Path::new(".")))?,
    };
    if let Some(root) = &cli.root {
        options.project.root = root.clone();
    }
    Ok(options)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut options = load_options(&cli)?;
    if let Command::Build {
        mode,
        ownership,
        with_tests,
        ..
    } = &cli.command
    {
        if let Some(mode) = mode {
            options.pipeline.mode = (*mode).into();
        }
        if let Some(ownership) = ownership {
            options.pipeline.ownership = (*ownership).into();
        }
        if *with_tests {
            options.pipeline.test_stage = true;
        }
    }

    let state = match &cli.state_dir {
        Some(dir) => StateLayout::new(dir.clone()),
        None => StateLayout::for_project(&options.project.root),
    };
    state.prepare()?;
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _log_guard = init_logging(&state.logs_dir(), level)?;

    let assembler = Assembler::new(options, state).context("failed to initialize assembler")?;

    match cli.command {
        Command::Plan { json } => {
            let plan = assembler.plan()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("mode: {}", plan.mode);
                println!("ownership: {:?}", plan.ownership);
                println!("frozen: {}", plan.frozen);
                for stage in &plan.stages {
                    println!("stage {} ({:?}) from {}", stage.name, stage.role, stage.base);
                    for op in &stage.ops {
                        println!("  {}", op.kind());
                    }
                }
            }
        }
        Command::Dockerfile => {
            print!("{}", assembler.dockerfile()?);
        }
        Command::Build { output, .. } => {
            let result = assembler
                .build(&output)
                .await
                .with_context(|| format!("build into {} failed", output.display()))?;
            println!("build:    {}", result.build_id);
            println!("mode:     {}", result.plan.mode);
            println!("packages: {}", result.install.packages.len());
            println!("image:    {}", result.image.manifest_digest);
            println!("output:   {}", result.output.display());
            if !result.install.reproducible {
                println!("warning:  no lockfile; package set is not reproducible");
            }
        }
        Command::Verify { image } => {
            let report = assembler.verify(&image)?;
            println!("image:    {}", report.manifest_digest);
            println!("user:     {} (uid {})", report.user, report.uid);
            println!("layers:   {}", report.layers);
            println!("entries:  {}", report.entries);
            if report.is_ok() {
                println!("ok");
                return Ok(ExitCode::SUCCESS);
            }
            report.into_result()?;
        }
        Command::History { limit } => {
            for record in assembler.history(limit)? {
                println!(
                    "{}  {}  {:<12}  {:>3} pkgs  reproducible={}  {}",
                    record.id,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.mode.to_string(),
                    record.packages.len(),
                    record.reproducible,
                    record.image_digest
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
