//! Layered configuration discovery.
//!
//! Layers apply in a fixed order: requirements, system, user, project, cwd,
//! runtime files, then `ENCLAVE_<SECTION>_<KEY>` variables. Each file is
//! schema-checked on its own before it is overlaid, so a typo is reported
//! against the file that contains it. Keys set by the requirements layer are
//! locked and later layers cannot change them.

mod env;
mod merge;
mod schema;


use crate::{ConfigError, EnclaveConfig};
use directories::BaseDirs;
use log::{debug, info};
use schema::Strictness;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name looked up in the project root and the working directory.
const CONFIG_FILE: &str = "enclave.json5";
/// Directory under `$HOME` holding the user layer.
const USER_DIR: &str = ".enclave";
/// Entry marking the root of a project checkout.
const PROJECT_MARKER: &str = ".git";
const ENV_PREFIX: &str = "ENCLAVE_";

#[cfg(unix)]
const SYSTEM_CONFIG: &str = "/etc/enclave/enclave.json5";
#[cfg(unix)]
const SYSTEM_REQUIREMENTS: &str = "/etc/enclave/requirements.json5";

/// Position of a layer in the stack, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerKind {
    /// Locks keys for every later layer.
    Requirements,
    System,
    User,
    /// `enclave.json5` in the nearest ancestor holding `.git`.
    Project,
    Cwd,
    /// Files passed explicitly by the caller.
    Runtime,
    Environment,
}

impl LayerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Requirements => "requirements",
            LayerKind::System => "system",
            LayerKind::User => "user",
            LayerKind::Project => "project",
            LayerKind::Cwd => "cwd",
            LayerKind::Runtime => "runtime",
            LayerKind::Environment => "environment",
        }
    }
}

/// A layer that contributed to the effective config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub kind: LayerKind,
    /// `None` for the environment layer.
    pub path: Option<PathBuf>,
}

/// Effective config and the layers it was built from, in applied order.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: EnclaveConfig,
    pub layers: Vec<Layer>,
}

/// Where each layer is looked up.
///
/// [`ConfigSources::discover`] fills in the host locations; tests point
/// every field at a scratch directory instead.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    pub requirements: Option<PathBuf>,
    pub system: Option<PathBuf>,
    pub user: Option<PathBuf>,
    /// Start of the project-root search and home of the cwd layer.
    pub cwd: PathBuf,
    /// Must exist; applied in order after the cwd layer.
    pub runtime: Vec<PathBuf>,
    /// Candidate variables; only `ENCLAVE_*` names are considered.
    pub env: Vec<(String, String)>,
}

impl ConfigSources {
    /// Host locations for a process running in `cwd`.
    pub fn discover(cwd: impl Into<PathBuf>) -> Self {
        Self {
            requirements: system_file(SystemFile::Requirements),
            system: system_file(SystemFile::Config),
            user: BaseDirs::new().map(|dirs| dirs.home_dir().join(USER_DIR).join(CONFIG_FILE)),
            cwd: cwd.into(),
            runtime: Vec::new(),
            env: std::env::vars()
                .filter(|(key, _)| key.starts_with(ENV_PREFIX))
                .collect(),
        }
    }

    pub fn with_runtime_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime.push(path.into());
        self
    }

    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    /// Read, check and overlay every layer that exists.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let cwd = self.cwd.canonicalize().unwrap_or_else(|_| self.cwd.clone());
        let mut stack = Stack::default();

        if let Some(path) = &self.requirements
            && let Some(value) = read_layer(LayerKind::Requirements, path)?
        {
            stack.lock(path, value);
        }
        for (kind, path) in [(LayerKind::System, &self.system), (LayerKind::User, &self.user)] {
            if let Some(path) = path {
                stack.apply_file(kind, path)?;
            }
        }
        match project_root(&cwd) {
            Some(root) => stack.apply_file(LayerKind::Project, &root.join(CONFIG_FILE))?,
            None => debug!("no project root above cwd (cwd={})", cwd.display()),
        }
        stack.apply_file(LayerKind::Cwd, &cwd.join(CONFIG_FILE))?;
        for path in &self.runtime {
            let value = read_layer(LayerKind::Runtime, path)?
                .ok_or_else(|| ConfigError::Missing { path: path.clone() })?;
            stack.apply(LayerKind::Runtime, Some(path.clone()), value);
        }
        if let Some(value) = env::overrides_from_vars(&self.env) {
            schema::check(&value, Strictness::Layer, LayerKind::Environment.as_str())?;
            stack.apply(LayerKind::Environment, None, value);
        }

        let config = decode(stack.merged, "effective")?;
        info!("config loaded (layers={})", stack.applied.len());
        Ok(LoadedConfig {
            config,
            layers: stack.applied,
        })
    }
}

/// Merged document under construction.
struct Stack {
    merged: Value,
    locked: Option<Value>,
    applied: Vec<Layer>,
    seen: HashSet<PathBuf>,
}

impl Default for Stack {
    fn default() -> Self {
        Self {
            merged: Value::Object(Map::new()),
            locked: None,
            applied: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl Stack {
    fn lock(&mut self, path: &Path, value: Value) {
        merge::overlay(&mut self.merged, &value);
        self.locked = Some(value);
        self.applied.push(Layer {
            kind: LayerKind::Requirements,
            path: Some(path.to_path_buf()),
        });
    }

    /// Apply an optional file once; the project and cwd layers coincide
    /// when the process runs from the project root.
    fn apply_file(&mut self, kind: LayerKind, path: &Path) -> Result<(), ConfigError> {
        let identity = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.seen.contains(&identity) {
            debug!(
                "config file already applied (layer={}, path={})",
                kind.as_str(),
                path.display()
            );
            return Ok(());
        }
        if let Some(value) = read_layer(kind, path)? {
            self.seen.insert(identity);
            self.apply(kind, Some(path.to_path_buf()), value);
        }
        Ok(())
    }

    fn apply(&mut self, kind: LayerKind, path: Option<PathBuf>, value: Value) {
        merge::overlay_unlocked(&mut self.merged, &value, self.locked.as_ref());
        debug!("config layer applied (layer={})", kind.as_str());
        self.applied.push(Layer { kind, path });
    }
}

impl EnclaveConfig {
    /// Parse one JSON5 document with no layering.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        decode(parse_json5(contents, "config")?, "config")
    }

    /// Read one JSON5 file with no layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("loading config file (path={})", path.display());
        let contents = read_to_string(path)?.ok_or_else(|| ConfigError::Missing {
            path: path.to_path_buf(),
        })?;
        let origin = path.display().to_string();
        decode(parse_json5(&contents, &origin)?, &origin)
    }

    /// Load every layer found from the host locations for `cwd`.
    pub fn discover(cwd: impl Into<PathBuf>) -> Result<LoadedConfig, ConfigError> {
        ConfigSources::discover(cwd).load()
    }

    /// Cross-field rules the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broken = |key: &str, reason: &str| ConfigError::Field {
            origin: "effective".to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if self.gc.default_gc_limit == 0 {
            return Err(broken("gc.default_gc_limit", "must be greater than zero"));
        }
        if self.gc.enabled && self.gc.interval == 0 {
            return Err(broken(
                "gc.interval",
                "must be greater than zero while gc is enabled",
            ));
        }
        if self
            .driver
            .default
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(broken("driver.default", "must not be empty"));
        }
        Ok(())
    }
}

enum SystemFile {
    Config,
    Requirements,
}

#[cfg(unix)]
fn system_file(file: SystemFile) -> Option<PathBuf> {
    Some(PathBuf::from(match file {
        SystemFile::Config => SYSTEM_CONFIG,
        SystemFile::Requirements => SYSTEM_REQUIREMENTS,
    }))
}

#[cfg(not(unix))]
fn system_file(_: SystemFile) -> Option<PathBuf> {
    None
}

/// Nearest ancestor of `cwd`, itself included, that holds `.git`.
fn project_root(cwd: &Path) -> Option<&Path> {
    cwd.ancestors()
        .find(|dir| dir.join(PROJECT_MARKER).exists())
}

/// File contents, or `None` when the file does not exist.
fn read_to_string(path: &Path) -> Result<Option<String>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A schema-checked layer, or `None` when its file does not exist.
fn read_layer(kind: LayerKind, path: &Path) -> Result<Option<Value>, ConfigError> {
    let Some(contents) = read_to_string(path)? else {
        debug!(
            "config layer absent (layer={}, path={})",
            kind.as_str(),
            path.display()
        );
        return Ok(None);
    };
    let origin = format!("{}({})", kind.as_str(), path.display());
    let value = parse_json5(&contents, &origin)?;
    schema::check(&value, Strictness::Layer, &origin)?;
    Ok(Some(value))
}

fn parse_json5(contents: &str, origin: &str) -> Result<Value, ConfigError> {
    json5::from_str(contents).map_err(|source| ConfigError::Syntax {
        origin: origin.to_string(),
        source,
    })
}

fn decode(value: Value, origin: &str) -> Result<EnclaveConfig, ConfigError> {
    schema::check(&value, Strictness::Effective, origin)?;
    let config: EnclaveConfig = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}
