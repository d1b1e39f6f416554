//! Gateway configuration: TOML file + CLI overrides.

use serde::Deserialize;
use sshgate_core::{ConnectionAuthenticatedMetadata, GateError, GateResult, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub local: LocalSection,
    /// Merged into every authenticated connection's metadata.
    #[serde(default)]
    pub metadata: Option<HashMap<String, ValueSpec>>,
    /// Merged into every authenticated connection's environment.
    #[serde(default)]
    pub environment: Option<HashMap<String, ValueSpec>>,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[local]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalSection {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Subsystem name to command: a whitespace-separated line or an argv array.
    #[serde(default)]
    pub subsystems: HashMap<String, CommandSpec>,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            shell: None,
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            subsystems: HashMap::new(),
        }
    }
}

/// A subsystem command.
///
/// The line form is split on whitespace with no quoting, so arguments that
/// contain spaces need the array form: `sftp = ["/opt/my tools/sftp", "-e"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn into_argv(self) -> Vec<String> {
        match self {
            CommandSpec::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandSpec::Argv(argv) => argv,
        }
    }
}

/// A metadata value: either a bare string or `{ value = "...", sensitive = true }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    Plain(String),
    Detailed {
        value: String,
        #[serde(default)]
        sensitive: bool,
    },
}

impl From<ValueSpec> for Value {
    fn from(spec: ValueSpec) -> Self {
        match spec {
            ValueSpec::Plain(value) => Value::new(value),
            ValueSpec::Detailed { value, sensitive } => Value { value, sensitive },
        }
    }
}

fn default_backend() -> String {
    "local".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    25
}

/// Resolved settings for the `local` backend.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub shell: PathBuf,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    /// Subsystem name to argv.
    pub subsystems: HashMap<String, Vec<String>>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self::from_section(LocalSection::default())
    }
}

impl LocalConfig {
    fn from_section(section: LocalSection) -> Self {
        let shell = section
            .shell
            .unwrap_or_else(|| std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()));
        Self {
            shell: expand_tilde_str(&shell),
            term: section.term,
            cols: section.cols,
            rows: section.rows,
            subsystems: section
                .subsystems
                .into_iter()
                .map(|(name, command)| (name, command.into_argv()))
                .collect(),
        }
    }
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub backend: String,
    pub max_sessions: usize,
    pub local: LocalConfig,
    pub metadata: Option<HashMap<String, Value>>,
    pub environment: Option<HashMap<String, Value>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_backend: Option<&str>,
        cli_max_sessions: Option<usize>,
        cli_shell: Option<&str>,
    ) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);

        // Merge CLI overrides
        if let Some(backend) = cli_backend {
            config.backend = backend.to_string();
        }
        if let Some(max_sessions) = cli_max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(shell) = cli_shell {
            config.local.shell = expand_tilde_str(shell);
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> GateResult<Self> {
        Ok(Self::from_file(parse(content)?))
    }

    fn from_file(file: ConfigFile) -> Self {
        let values = |table: Option<HashMap<String, ValueSpec>>| -> Option<HashMap<String, Value>> {
            table.map(|t| t.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
        };
        Self {
            backend: file.gateway.backend,
            max_sessions: file.gateway.max_sessions,
            local: LocalConfig::from_section(file.local),
            metadata: values(file.metadata),
            environment: values(file.environment),
        }
    }

    /// Overrides to merge into each authenticated connection. Tables missing
    /// from the file stay absent, so they leave the connection's maps alone.
    pub fn overrides(&self) -> ConnectionAuthenticatedMetadata {
        let mut meta = ConnectionAuthenticatedMetadata::default();
        meta.connection_mut().metadata = self.metadata.clone();
        meta.connection_mut().environment = self.environment.clone();
        meta
    }
}

fn parse(content: &str) -> GateResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GateError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
