//! End-to-end assembly against a fixture project and a local package index.

use assembler::assemble::TestRunner;
use assembler::deps::{NativePackage, NativeTable};
use assembler::image::{ANNOTATION_TOOLCHAIN, OciImage};
use assembler::installer::{IndexInstaller, PackageIndex, VenvLayout};
use assembler::runtime::InstallerKind;
use assembler::verify::{ImageTree, StartupProbe};
use assembler::{
    Assembler, AssemblerError, AssemblerOptions, AssemblerResult, BuildMode, OwnershipPolicy,
    PlanMode, StateLayout,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const PYPROJECT: &str = r#"
[project]
name = "kyc"
version = "0.1.0"
requires-python = ">=3.12"
dependencies = ["django>=5.0", "psycopg2>=2.9"]

[dependency-groups]
dev = ["pytest>=8"]
"#;

const PYPROJECT_PURE: &str = r#"
[project]
name = "kyc"
version = "0.1.0"
dependencies = ["django>=5.0"]
"#;

const LOCK: &str = r#"
version = 1
requires-python = ">=3.12"

[[package]]
name = "kyc"
version = "0.1.0"
source = { virtual = "." }
dependencies = [{ name = "django" }, { name = "psycopg2" }]

[[package]]
name = "django"
version = "5.0.6"
source = { registry = "https://pypi.org/simple" }
dependencies = [{ name = "asgiref" }, { name = "sqlparse" }]

[[package]]
name = "asgiref"
version = "3.8.1"
source = { registry = "https://pypi.org/simple" }

[[package]]
name = "sqlparse"
version = "0.5.0"
source = { registry = "https://pypi.org/simple" }

[[package]]
name = "psycopg2"
version = "2.9.9"
source = { registry = "https://pypi.org/simple" }

[[package]]
name = "pytest"
version = "8.2.0"
source = { registry = "https://pypi.org/simple" }
"#;

const PYPROJECT_PURE_DEV: &str = r#"
[project]
name = "kyc"
version = "0.1.0"
dependencies = ["django>=5.0"]

[dependency-groups]
dev = ["pytest>=8"]
"#;

/// Stand-in for `uv sync`: installs the locked django closure, plus pytest
/// unless `--no-dev` is passed.
const PINNED_INSTALL: &str = r#"
s="$UV_PROJECT_ENVIRONMENT/lib/python3.12/site-packages"
for p in django:5.0.6 asgiref:3.8.1 sqlparse:0.5.0; do
  n=${p%%:*}; v=${p#*:}
  mkdir -p "$s/$n-$v.dist-info" && printf 'Name: %s\nVersion: %s\n' "$n" "$v" > "$s/$n-$v.dist-info/METADATA"
done
case "$0 $*" in *--no-dev*) ;; *) mkdir -p "$s/pytest" ;; esac
"#;

struct Fixture {
    project: TempDir,
    state: TempDir,
    out: TempDir,
}

impl Fixture {
    fn new(pyproject: &str, lock: Option<&str>) -> Self {
        let project = TempDir::new().unwrap();
        let root = project.path();

        write(root, "pyproject.toml", pyproject);
        if let Some(lock) = lock {
            write(root, "uv.lock", lock);
        }
        write(root, "manage.py", "import sys\n");
        write(root, "etc/__init__.py", "");
        write(root, "etc/settings.py", "DEBUG = False\n");
        write(root, "etc/wsgi.py", "application = None\n");
        write(root, "etc/__pycache__/settings.cpython-312.pyc", "junk");
        write(root, ".git/HEAD", "ref: refs/heads/main\n");

        let index = root.join("index");
        write(&index, "django/5.0.6/django/__init__.py", "VERSION = (5, 0, 6)\n");
        write(&index, "django/5.0.6/bin/django-admin", "#!/usr/bin/env python\n");
        write(&index, "django/5.0.6/requires.txt", "asgiref>=3.7\nsqlparse>=0.3.1\n");
        write(&index, "django/4.2.0/django/__init__.py", "VERSION = (4, 2, 0)\n");
        write(&index, "asgiref/3.8.1/asgiref/__init__.py", "");
        write(&index, "sqlparse/0.5.0/sqlparse/__init__.py", "");
        write(&index, "psycopg2/2.9.9/psycopg2/__init__.py", "");
        write(&index, "pytest/8.2.0/pytest/__init__.py", "");

        Self {
            project,
            state: TempDir::new().unwrap(),
            out: TempDir::new().unwrap(),
        }
    }

    fn root(&self) -> &Path {
        self.project.path()
    }

    fn options(&self) -> AssemblerOptions {
        AssemblerOptions::discover(self.root()).unwrap()
    }

    fn assembler(&self, options: AssemblerOptions) -> Assembler {
        Assembler::new(options, StateLayout::new(self.state.path())).unwrap()
    }

    fn output(&self, name: &str) -> PathBuf {
        self.out.path().join(name)
    }
}

fn write(base: &Path, rel: &str, content: &str) {
    let path = base.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn read_image(output: &Path) -> (OciImage, ImageTree) {
    let image = OciImage::open(output).unwrap();
    let tree = ImageTree::from_image(&image).unwrap();
    (image, tree)
}

fn locked_set() -> BTreeMap<String, String> {
    [
        ("asgiref", "3.8.1"),
        ("django", "5.0.6"),
        ("psycopg2", "2.9.9"),
        ("sqlparse", "0.5.0"),
    ]
    .into_iter()
    .map(|(n, v)| (n.to_string(), v.to_string()))
    .collect()
}

#[tokio::test]
async fn test_lockfile_builds_are_reproducible() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let assembler = fx.assembler(fx.options());

    let first = assembler.build(&fx.output("one")).await.unwrap();
    let second = assembler.build(&fx.output("two")).await.unwrap();

    assert_eq!(first.install.packages, second.install.packages);
    assert_eq!(first.image.layer_digests, second.image.layer_digests);
    assert_eq!(first.image.manifest_digest, second.image.manifest_digest);
    assert!(first.install.reproducible);

    let history = assembler.history(10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].package_digest, history[1].package_digest);
    assert_eq!(history[0].lock_digest, history[1].lock_digest);
}

#[tokio::test]
async fn test_installed_set_equals_lock() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let result = fx.assembler(fx.options()).build(&fx.output("image")).await.unwrap();

    // pytest is locked but only reachable from the dev group
    assert_eq!(result.install.packages, locked_set());

    let (_, tree) = read_image(&result.output);
    let site = VenvLayout::new("/app/.venv", "3.12").site_packages();
    assert!(tree.get(&site.join("django-5.0.6.dist-info/METADATA")).is_some());
    assert!(tree.get(&site.join("django/__init__.py")).is_some());
    assert!(tree.get(Path::new("/app/.venv/bin/django-admin")).is_some());
    assert!(tree.get(&site.join("pytest")).is_none());
}

#[tokio::test]
async fn test_explicit_ownership_owns_venv_and_app() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let assembler = fx.assembler(fx.options());
    let result = assembler.build(&fx.output("image")).await.unwrap();

    let (image, tree) = read_image(&result.output);
    assert_eq!(image.user(), Some("app"));
    assert_eq!(image.working_dir(), Some("/app"));

    let under_app: Vec<_> = tree.entries_under(Path::new("/app")).collect();
    assert!(!under_app.is_empty());
    for (path, node) in under_app {
        assert_eq!(node.uid, 1000, "{} is owned by {}", path.display(), node.uid);
        assert_eq!(node.gid, 1000);
    }
    assert!(tree.get(Path::new("/app/manage.py")).is_some());
    assert!(tree.get(Path::new("/app/.git/HEAD")).is_none());
    assert!(tree.get(Path::new("/app/etc/__pycache__")).is_none());
    assert!(tree.get(Path::new("/app/index")).is_none());

    let report = assembler.verify(&result.output).unwrap();
    assert!(report.is_ok(), "{:?}", report);
    assert_eq!(report.runtime_libraries_checked, 1);
}

#[tokio::test]
async fn test_two_stage_final_has_no_toolchain() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let result = fx.assembler(fx.options()).build(&fx.output("image")).await.unwrap();
    assert_eq!(result.plan.mode, BuildMode::TwoStage);

    let (image, tree) = read_image(&result.output);
    let registry = tree.system_packages();
    assert!(registry.contains("libpq5"));
    assert!(!registry.contains("build-essential"));
    assert!(!registry.contains("libpq-dev"));

    let toolchain = image.annotation(ANNOTATION_TOOLCHAIN).unwrap();
    assert!(toolchain.split(',').any(|p| p == "build-essential"));
    assert!(toolchain.split(',').any(|p| p == "libpq-dev"));
}

#[tokio::test]
async fn test_native_package_missing_from_lock_fails_before_final_stage() {
    let lock = LOCK.replace(
        "[[package]]\nname = \"psycopg2\"\nversion = \"2.9.9\"\nsource = { registry = \"https://pypi.org/simple\" }\n",
        "",
    );
    let fx = Fixture::new(PYPROJECT, Some(&lock));
    let assembler = fx.assembler(fx.options());

    let err = assembler.build(&fx.output("image")).await.unwrap_err();
    assert!(err.is_dependency_failure(), "{}", err);
    assert!(matches!(err, AssemblerError::Resolution(_)));
    assert!(!fx.output("image").exists());
    assert!(assembler.history(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_native_package_without_toolchain_fails_in_builder() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let mut options = fx.options();
    options.toolchain.packages.clear();
    let assembler = fx.assembler(options);

    let err = assembler.build(&fx.output("image")).await.unwrap_err();
    assert!(err.is_dependency_failure(), "{}", err);
    match &err {
        AssemblerError::NativeBuild { package, .. } => assert_eq!(package, "psycopg2"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fx.output("image").exists());
    assert!(fs::read_dir(fx.out.path()).unwrap().next().is_none());
    assert!(fs::read_dir(fx.state.path().join("work")).unwrap().next().is_none());
    assert!(assembler.history(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_frozen_install_drift_is_rejected() {
    let fx = Fixture::new(PYPROJECT_PURE, Some(LOCK));
    let mut options = fx.options();
    // Installs django 9.9.9 although the lockfile pins 5.0.6
    options.project.installer = InstallerKind::Command;
    options.project.installer_command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "d=\"$UV_PROJECT_ENVIRONMENT/lib/python3.12/site-packages/django-9.9.9.dist-info\" && mkdir -p \"$d\" && printf 'Name: django\\nVersion: 9.9.9\\n' > \"$d/METADATA\"".to_string(),
    ];
    let assembler = fx.assembler(options);

    let err = assembler.build(&fx.output("image")).await.unwrap_err();
    match &err {
        AssemblerError::Install(msg) => assert!(msg.contains("django: 5.0.6 -> 9.9.9"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fx.output("image").exists());
    assert!(assembler.history(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_environment_always_carries_managed_vars() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let mut options = fx.options();
    options.environment.settings_module = "kyc.settings".to_string();
    options
        .environment
        .extra
        .insert("PYTHONUNBUFFERED".to_string(), "0".to_string());
    let result = fx.assembler(options).build(&fx.output("image")).await.unwrap();

    let (image, _) = read_image(&result.output);
    let env = image.env();
    for expected in [
        "PYTHONUNBUFFERED=1",
        "PYTHONDONTWRITEBYTECODE=1",
        "DJANGO_SETTINGS_MODULE=kyc.settings",
    ] {
        assert!(env.iter().any(|e| e == expected), "{expected} missing from {env:?}");
    }
    assert!(!env.iter().any(|e| e == "PYTHONUNBUFFERED=0"));
}

#[tokio::test]
async fn test_inherit_ownership_leaves_root_owned_files() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let mut options = fx.options();
    options.pipeline.ownership = OwnershipPolicy::Inherit;
    let assembler = fx.assembler(options);

    // Not rejected at build time
    let result = assembler.build(&fx.output("image")).await.unwrap();

    let (image, tree) = read_image(&result.output);
    assert_eq!(image.user(), Some("app"));
    assert_eq!(tree.get(Path::new("/app/manage.py")).unwrap().uid, 0);
    assert_eq!(tree.get(Path::new("/app/.venv/pyvenv.cfg")).unwrap().uid, 0);

    let probe = StartupProbe::new(&tree, "app").unwrap();
    assert!(matches!(
        probe.probe_write(Path::new("/app/db.sqlite3")),
        Err(AssemblerError::PermissionDenied(_))
    ));

    let report = assembler.verify(&result.output).unwrap();
    assert!(!report.foreign_owned.is_empty());
    assert!(matches!(
        report.into_result(),
        Err(AssemblerError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let fx = Fixture::new(PYPROJECT_PURE, None);
    let mut options = fx.options();
    options.pipeline.mode = PlanMode::Auto;
    let assembler = fx.assembler(options);

    let first = assembler.build(&fx.output("image")).await.unwrap();
    let second = assembler.build(&fx.output("image")).await.unwrap();

    assert_eq!(first.plan.mode, BuildMode::SingleStage);
    assert_eq!(first.install.packages, second.install.packages);
    assert_eq!(first.install.packages["django"], "5.0.6");
    assert!(!first.install.reproducible);
    assert_eq!(
        OciImage::open(&fx.output("image")).unwrap().manifest_digest(),
        second.image.manifest_digest
    );
}

#[tokio::test]
async fn test_missing_runtime_library_surfaces_at_start() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let mut options = fx.options();
    // The final domain no longer ships libpq5, while the installed
    // distribution still declares it.
    options.native.insert(
        "psycopg2".to_string(),
        NativePackage {
            build: vec!["libpq-dev".to_string()],
            runtime: Vec::new(),
        },
    );
    let installer = IndexInstaller::new(
        PackageIndex::open(&fx.root().join("index")).unwrap(),
        NativeTable::builtin(),
    );
    let assembler = fx.assembler(options).with_installer(Arc::new(installer));
    let result = assembler.build(&fx.output("image")).await.unwrap();

    let (_, tree) = read_image(&result.output);
    let probe = StartupProbe::new(&tree, "app").unwrap();
    let site = VenvLayout::new("/app/.venv", "3.12").site_packages();
    let err = probe.check_runtime_libraries(&site).unwrap_err();
    assert!(matches!(
        err,
        AssemblerError::MissingRuntimeLibrary { ref package, ref library }
            if package == "psycopg2" && library == "libpq5"
    ));

    let report = assembler.verify(&result.output).unwrap();
    assert!(report.startup_error.is_some());
}

#[derive(Default)]
struct RecordingRunner {
    fail: bool,
    calls: Mutex<Vec<(Vec<String>, PathBuf)>>,
}

#[async_trait]
impl TestRunner for RecordingRunner {
    async fn run(&self, command: &[String], workdir: &Path, venv: &VenvLayout) -> AssemblerResult<()> {
        assert!(venv.site_packages().join("pytest").is_dir());
        self.calls
            .lock()
            .unwrap()
            .push((command.to_vec(), workdir.to_path_buf()));
        if self.fail {
            return Err(AssemblerError::TestFailure("1 failed".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_test_stage_runs_with_dev_dependencies() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let mut options = fx.options();
    options.pipeline.test_stage = true;
    let runner = Arc::new(RecordingRunner::default());
    let assembler = fx.assembler(options).with_test_runner(runner.clone());

    let result = assembler.build(&fx.output("image")).await.unwrap();
    assert!(result.tests_ran);
    assert!(!result.metrics.was_skipped("test"));

    let calls = runner.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, vec!["python", "-m", "pytest"]);
    assert_eq!(calls[0].1, fx.root());

    // Dev dependencies never reach the image
    assert_eq!(result.install.packages, locked_set());
}

#[tokio::test]
async fn test_failing_test_stage_leaves_no_output() {
    let fx = Fixture::new(PYPROJECT, Some(LOCK));
    let mut options = fx.options();
    options.pipeline.test_stage = true;
    let runner = Arc::new(RecordingRunner {
        fail: true,
        ..Default::default()
    });
    let assembler = fx.assembler(options).with_test_runner(runner);

    let err = assembler.build(&fx.output("image")).await.unwrap_err();
    assert!(matches!(err, AssemblerError::TestFailure(_)));
    assert!(!fx.output("image").exists());
    let leftovers: Vec<_> = fs::read_dir(fx.out.path()).unwrap().collect();
    assert!(leftovers.is_empty());
    assert!(fs::read_dir(fx.state.path().join("work")).unwrap().next().is_none());
}

#[tokio::test]
async fn test_test_stage_with_lock_needs_no_index() {
    let fx = Fixture::new(PYPROJECT_PURE_DEV, Some(LOCK));
    fs::remove_dir_all(fx.root().join("index")).unwrap();
    let mut options = fx.options();
    options.pipeline.test_stage = true;
    options.project.installer = InstallerKind::Command;
    options.project.installer_command =
        vec!["sh".to_string(), "-c".to_string(), PINNED_INSTALL.to_string()];
    let runner = Arc::new(RecordingRunner::default());
    let assembler = fx.assembler(options).with_test_runner(runner.clone());

    let result = assembler.build(&fx.output("image")).await.unwrap();
    assert!(result.tests_ran);
    assert!(result.install.reproducible);
    assert_eq!(result.install.packages["django"], "5.0.6");
    assert!(!result.install.packages.contains_key("pytest"));
    assert_eq!(runner.calls.lock().unwrap().len(), 1);
}
