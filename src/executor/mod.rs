//! Execution of a single module inside a container.
//!
//! [`Executor::run`] turns `(module, bindings)` into exactly one container
//! run and reports a [`ModuleOutcome`]. It never returns an error: start
//! failures, I/O problems, non-zero exits, and unusable output all become a
//! failed outcome carrying the reason.

pub mod normalize;

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ModuleOutcome, OutputFormat, Scan, ScanId, TargetOs, ToolVariant};
use crate::runtime::{ContainerRuntime, Mount, UnitSpec};
use normalize::{extract_json, find_error_marker, normalize_output, Preamble};

static UNSAFE_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_.-]").expect("unit name regex should compile"));

/// Strips characters the container runtime rejects in names.
pub fn sanitize_module(module: &str) -> String {
    UNSAFE_NAME_CHARS.replace_all(module, "").to_string()
}

/// Deterministic unit name for one module of one scan.
///
/// The reconciler reconstructs this name to find the unit again.
pub fn unit_name(variant: ToolVariant, scan_id: &ScanId, module: &str) -> String {
    format!(
        "{}-{}-{}",
        variant.as_str(),
        scan_id.simple(),
        sanitize_module(module)
    )
}

/// Path of the captured output artifact of a module.
pub fn output_path(output_dir: &Path, module: &str, format: OutputFormat) -> PathBuf {
    output_dir.join(format!("{}_output.{}", module, format.extension()))
}

/// Path the unit's logs stream to before they become the artifact.
pub fn capture_path(output_dir: &Path, module: &str, format: OutputFormat) -> PathBuf {
    output_dir.join(format!("{}_output.{}.partial", module, format.extension()))
}

/// Moves a finished log capture into place as the module artifact.
///
/// The artifact appears atomically and already normalized, so readers never
/// see a raw or half-written file. Returns the raw capture and the artifact
/// text, or `None` when another caller finalized it first. Safe to race:
/// every caller writes the same bytes.
pub async fn finalize_capture(
    capture: &Path,
    artifact: &Path,
    preamble: Option<Preamble>,
) -> Result<Option<(String, String)>> {
    let raw = match tokio::fs::read(capture).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let content = String::from_utf8_lossy(&raw).into_owned();
    let normalized = match preamble {
        Some(preamble) => normalize_output(&content, preamble),
        None => content.clone(),
    };

    let staging = artifact.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&staging, &normalized).await?;
    tokio::fs::rename(&staging, artifact).await?;
    match tokio::fs::remove_file(capture).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    Ok(Some((content, normalized)))
}

/// Rewrites a local path onto the host filesystem for Docker-outside-of-Docker.
///
/// Paths below `cwd` are re-rooted at `host_path`; everything else is
/// returned unchanged.
pub fn translate_host_path(path: &Path, cwd: &Path, host_path: Option<&Path>) -> PathBuf {
    match host_path {
        Some(host) => match path.strip_prefix(cwd) {
            Ok(rel) => host.join(rel),
            Err(_) => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    }
}

/// Per-scan inputs shared by every module run.
#[derive(Debug, Clone)]
pub struct ScanBindings {
    pub scan_id: ScanId,
    pub variant: ToolVariant,
    pub os: TargetOs,
    pub image: String,
    pub dump_path: PathBuf,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub profile: Option<String>,
    pub fetch_symbols: bool,
}

impl ScanBindings {
    pub fn for_scan(scan: &Scan) -> Self {
        let request = scan.request();
        Self {
            scan_id: scan.id,
            variant: scan.variant,
            os: scan.os,
            image: scan.image.clone(),
            dump_path: scan.dump_path.clone(),
            output_dir: scan.output_dir.clone(),
            format: scan.format,
            profile: request.as_ref().and_then(|r| r.profile.clone()),
            fetch_symbols: request
                .as_ref()
                .map(|r| r.fetch_symbols())
                .unwrap_or(scan.os == TargetOs::Linux),
        }
    }
}

/// Runs modules as containers on a [`ContainerRuntime`].
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<Config>,
}

impl Executor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<Config>) -> Self {
        Self { runtime, config }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Runs one module to completion and reports whether it succeeded.
    pub async fn run(&self, module: &str, bindings: &ScanBindings) -> ModuleOutcome {
        match self.try_run(module, bindings).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(scan_id = %bindings.scan_id, module, error = %e, "Module run failed");
                ModuleOutcome::failed(module, e.to_string())
            }
        }
    }

    async fn try_run(&self, module: &str, bindings: &ScanBindings) -> Result<ModuleOutcome> {
        let spec = self.build_spec(module, bindings)?;
        let out_path = output_path(&bindings.output_dir, module, bindings.format);
        let capture = capture_path(&bindings.output_dir, module, bindings.format);

        if let Err(e) = self.runtime.remove(&spec.name).await {
            debug!(unit = %spec.name, error = %e, "No stale unit removed");
        }

        tokio::fs::create_dir_all(&bindings.output_dir).await?;
        for stale in [&capture, &out_path] {
            match tokio::fs::remove_file(stale).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }

        info!(scan_id = %bindings.scan_id, module, unit = %spec.name, "Starting module");
        self.runtime.run(&spec).await?;

        if let Err(e) = self.runtime.capture_logs(&spec.name, &capture).await {
            warn!(unit = %spec.name, error = %e, "Log capture interrupted");
        }
        let exit_code = self.runtime.wait(&spec.name).await?;

        if let Err(e) = self.runtime.remove(&spec.name).await {
            warn!(unit = %spec.name, error = %e, "Failed to remove unit");
        }

        let outcome = self
            .evaluate(module, bindings, &capture, &out_path, exit_code)
            .await?;
        info!(
            scan_id = %bindings.scan_id,
            module,
            exit_code,
            success = outcome.success,
            "Module finished"
        );
        Ok(outcome)
    }

    /// Finalizes the captured logs into the artifact and decides success.
    async fn evaluate(
        &self,
        module: &str,
        bindings: &ScanBindings,
        capture: &Path,
        out_path: &Path,
        exit_code: i64,
    ) -> Result<ModuleOutcome> {
        let preamble = match bindings.format {
            OutputFormat::Json => Some(Preamble::for_variant(
                bindings.variant,
                self.config.vol3.banner_lines,
            )),
            OutputFormat::Text => None,
        };

        let (content, normalized) = match finalize_capture(capture, out_path, preamble).await? {
            Some(captured) => captured,
            None => {
                // A status query finalized the artifact first.
                let artifact = tokio::fs::read(out_path).await?;
                let artifact = String::from_utf8_lossy(&artifact).into_owned();
                (artifact.clone(), artifact)
            }
        };

        if exit_code != 0 {
            return Ok(ModuleOutcome::failed(
                module,
                format!("Exited with code {}", exit_code),
            ));
        }

        if let Some(marker) = find_error_marker(&content, self.config.error_markers(bindings.variant)) {
            return Ok(ModuleOutcome::failed(
                module,
                format!("Tool reported an error ({})", marker),
            ));
        }

        if bindings.format == OutputFormat::Json && extract_json(&normalized).is_none() {
            return Ok(ModuleOutcome::failed(module, "Output is not valid JSON"));
        }

        Ok(ModuleOutcome::succeeded(module))
    }

    /// Builds the container description for one module.
    pub fn build_spec(&self, module: &str, bindings: &ScanBindings) -> Result<UnitSpec> {
        let dump = std::path::absolute(&bindings.dump_path)?;
        let dump_file = dump
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| {
                Error::InvalidRequest(format!("Dump path has no file name: {}", dump.display()))
            })?
            .to_string();

        let (command, mounts) = match bindings.variant {
            ToolVariant::Vol3 => {
                let dump_dir = dump.parent().unwrap_or(Path::new("/")).to_path_buf();
                let mut command = vec![
                    "vol".to_string(),
                    "-q".to_string(),
                    "-f".to_string(),
                    format!("/dump_dir/{}", dump_file),
                    "-s".to_string(),
                    "/symbols".to_string(),
                    "-p".to_string(),
                    "/plugins".to_string(),
                ];
                if bindings.fetch_symbols {
                    command.push("--remote-isf-url".to_string());
                    command.push(self.config.vol3.remote_isf_url.clone());
                }
                if bindings.format == OutputFormat::Json {
                    command.push("-r".to_string());
                    command.push("json".to_string());
                }
                command.push(module.to_string());

                let mounts = vec![
                    Mount::ro(self.host(&dump_dir)?, "/dump_dir"),
                    Mount::rw(self.host(&self.config.symbols_dir())?, "/symbols"),
                    Mount::rw(
                        self.host(&self.config.cache_dir())?,
                        "/root/.cache/volatility3",
                    ),
                    Mount::ro(self.host(&self.config.plugins_dir())?, "/plugins"),
                    Mount::rw(self.host(&bindings.output_dir)?, "/output"),
                ];
                (command, mounts)
            }
            ToolVariant::Vol2 => {
                let profile = bindings.profile.as_deref().ok_or_else(|| {
                    Error::InvalidRequest("Volatility 2 scans require a profile".to_string())
                })?;
                let command = vec![
                    "--plugins=/home/vol/profiles".to_string(),
                    "-f".to_string(),
                    format!("/dumps/{}", dump_file),
                    format!("--profile={}", profile),
                    format!("--output={}", bindings.format.as_str()),
                    module.to_string(),
                ];
                let mounts = vec![
                    Mount::rw(self.host(&dump)?, format!("/dumps/{}", dump_file)),
                    Mount::rw(
                        self.host(&self.config.profiles_dir())?,
                        "/home/vol/profiles",
                    ),
                    Mount::rw(self.host(&bindings.output_dir)?, "/output"),
                ];
                (command, mounts)
            }
        };

        Ok(UnitSpec {
            name: unit_name(bindings.variant, &bindings.scan_id, module),
            image: bindings.image.clone(),
            command,
            mounts,
            tty: self.config.tty,
        })
    }

    fn host(&self, path: &Path) -> Result<PathBuf> {
        let path = std::path::absolute(path)?;
        let cwd = std::env::current_dir()?;
        Ok(translate_host_path(
            &path,
            &cwd,
            self.config.host_path.as_deref(),
        ))
    }
}
