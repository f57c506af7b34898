//! Command-line options and startup validation.
//!
//! `Config` mirrors the options a real deployment needs on the command line;
//! clap handles parsing and `--help`/`--version`, `validate()` enforces the
//! cross-field invariants clap cannot express declaratively.

use std::fs;
use std::path::PathBuf;

use clap::Parser;

use crate::error::AppError;

/// Fixed internal loopback port the supervisor's workers register against.
///
/// Distinct from `--port`; the two may never coincide (checked in
/// [`Config::validate`]).
pub const INTERNAL_PORT: u16 = 9981;

/// Default bounded wait for [`crate::pool::WorkerPool::acquire`].
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Master front-end for a collaborative document-editing server.
#[derive(Parser, Debug, Clone)]
#[command(name = "loolwsd", version, about)]
pub struct Config {
    /// Public HTTPS port.
    #[arg(long, default_value_t = 9980)]
    pub port: u16,

    /// Persistent tile-cache root; must exist and be read/write/execute.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// System template used to seed each jail.
    #[arg(long)]
    pub systemplate: PathBuf,

    /// Editor install copied into each jail.
    #[arg(long)]
    pub lotemplate: PathBuf,

    /// Root directory under which worker jails are created.
    #[arg(long)]
    pub childroot: PathBuf,

    /// Relative path where the editor install lands inside a jail.
    #[arg(long, default_value = "lo")]
    pub losubpath: String,

    /// Static asset root for `/loleaflet`. Defaults to the binary's
    /// grandparent directory when omitted.
    #[arg(long)]
    pub fileserverroot: Option<PathBuf>,

    /// Steady-state number of pre-spawned ready workers.
    #[arg(long, default_value_t = 10)]
    pub numprespawns: usize,

    /// Interactive test mode: forces `numprespawns = 1` and runs a
    /// line-by-line stdin driver instead of binding the public listener.
    #[arg(long, default_value_t = false)]
    pub test: bool,

    /// Path to the forking supervisor binary. When omitted (always the
    /// case in `--test` mode), the process runs with no supervisor child:
    /// workers must register against the internal endpoint by some other
    /// means (a test harness, or a supervisor launched independently).
    #[arg(long)]
    pub supervisor_bin: Option<PathBuf>,
}

impl Config {
    /// Parse `std::env::args`, then run [`Config::validate`].
    ///
    /// # Errors
    /// Returns [`AppError::Config`] on any validation failure; the caller
    /// maps this to exit code 64 before binding any socket.
    pub fn parse_and_validate() -> Result<Self, AppError> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Enforce the invariants clap's declarative parser cannot express.
    fn validate(&mut self) -> Result<(), AppError> {
        if nix::unistd::Uid::effective().is_root() {
            return Err(AppError::Config("refusing to run as root".to_string()));
        }

        if self.port == INTERNAL_PORT {
            return Err(AppError::Config(format!(
                "--port must not equal the fixed internal port {INTERNAL_PORT}"
            )));
        }

        if let Some(cache) = &self.cache {
            check_rwx(cache).map_err(|e| AppError::Config(format!("--cache {e}")))?;
        }

        check_dir_exists(&self.systemplate)
            .map_err(|e| AppError::Config(format!("--systemplate {e}")))?;
        check_dir_exists(&self.lotemplate)
            .map_err(|e| AppError::Config(format!("--lotemplate {e}")))?;
        check_dir_exists(&self.childroot)
            .map_err(|e| AppError::Config(format!("--childroot {e}")))?;

        if !self.childroot.to_string_lossy().ends_with(std::path::MAIN_SEPARATOR) {
            self.childroot.push("");
        }

        if self.fileserverroot.is_none() {
            let exe = std::env::current_exe()
                .map_err(|e| AppError::Config(format!("cannot resolve binary path: {e}")))?;
            let root = exe
                .parent()
                .and_then(std::path::Path::parent)
                .map(std::path::Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            self.fileserverroot = Some(root);
        }

        if self.test {
            self.numprespawns = 1;
        }

        Ok(())
    }

    /// Path under `childroot` holding the supervisor command/event FIFOs.
    pub fn pipe_dir(&self) -> PathBuf {
        self.childroot.join("pipe")
    }
}

fn check_dir_exists(path: &std::path::Path) -> Result<(), String> {
    if !path.is_dir() {
        return Err(format!("does not exist or is not a directory: {}", path.display()));
    }
    Ok(())
}

fn check_rwx(path: &std::path::Path) -> Result<(), String> {
    check_dir_exists(path)?;
    let meta = fs::metadata(path).map_err(|e| format!("cannot stat {}: {e}", path.display()))?;
    if meta.permissions().readonly() {
        return Err(format!("is not writable: {}", path.display()));
    }
    Ok(())
}
