//! Global configuration management for coderun
//!
//! Configuration is layered, highest priority first:
//! - CLI arguments (with `CODERUN_*` environment fallbacks)
//! - The `--config` document (JSON file path or inline JSON string)
//! - Built-in defaults
//!
//! The document deserializes into [`GlobalConfig`]; every key is optional.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::lang::ToolchainOverride;
use crate::logging::{LogFormat, TracingConfig};
use crate::prelude::parse_size_arg;

// ============================================================================
// Configuration Arguments
// ============================================================================

/// Common configuration arguments (used across CLI commands)
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigArgs {
    /// Global configuration file (JSON file path or JSON string).
    ///
    /// - A file path: --config /etc/coderun.json
    ///
    /// - Inline JSON: --config '{"max_concurrency":8,"limits":{"memory_mb":512}}'
    ///
    #[arg(long = "config", short = 'c', env = "CODERUN_CONFIG", value_name = "file.json or {json}", global = true)]
    pub config: Option<String>,

    /// Maximum number of sandboxes running at once
    #[arg(long, env = "CODERUN_MAX_CONCURRENCY", global = true)]
    pub max_concurrency: Option<usize>,

    /// Directory under which per-request scratch directories are created
    ///
    /// Anything already inside it is deleted at startup.
    ///
    #[arg(long, env = "CODERUN_SCRATCH_ROOT", value_name = "PATH", global = true)]
    pub scratch_root: Option<PathBuf>,

    /// Wall-clock limit for the run stage, in seconds
    #[arg(long, env = "CODERUN_RUN_TIMEOUT", value_name = "SECS", global = true)]
    pub run_timeout: Option<u64>,

    /// Memory ceiling for the run stage, in megabytes
    #[arg(long, env = "CODERUN_MEMORY_MB", value_name = "MB", global = true)]
    pub memory_mb: Option<u64>,

    /// Per-stream output cap (e.g. 64kb, 1mb)
    #[arg(long, env = "CODERUN_OUTPUT_LIMIT", value_parser = parse_size_arg, value_name = "SIZE", global = true)]
    pub output_limit: Option<usize>,

    /// Require full sandbox isolation (fail if unavailable)
    ///
    /// Without this flag, the sandbox gracefully degrades when kernel features
    /// are unavailable (e.g., in containers without user namespaces).
    ///
    /// With this flag, execution fails if full isolation cannot be established:
    /// - User namespace creation
    /// - PID, NET, IPC and UTS namespace isolation
    /// - Landlock filesystem restrictions
    ///
    #[arg(long, env = "CODERUN_REQUIRE_SANDBOX", global = true)]
    pub require_sandbox: bool,

    // -------------------------------------------------------------------------
    // Logging/Tracing Options
    // -------------------------------------------------------------------------

    /// Enable verbose output (INFO level logging)
    ///
    /// Default is WARN level. Use -v for INFO, -d for DEBUG.
    ///
    #[arg(short = 'v', long, env = "CODERUN_VERBOSE", global = true)]
    pub verbose: bool,

    /// Enable debug output (DEBUG level logging)
    #[arg(short = 'd', long, env = "CODERUN_DEBUG", conflicts_with = "verbose", global = true)]
    pub debug: bool,

    /// Quiet mode - only show errors
    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "debug"], global = true)]
    pub quiet: bool,

    /// Silent mode - suppress all terminal log output
    ///
    /// Log file output (if configured) is unaffected.
    ///
    #[arg(long, short = 's', conflicts_with_all = ["verbose", "debug", "quiet"], global = true)]
    pub silent: bool,

    /// Log output format
    #[arg(long, short = 'L', value_enum, env = "CODERUN_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    /// Write debug logs to file
    #[arg(long, short = 'l', env = "CODERUN_LOG_FILE", value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,
}

// ============================================================================
// Execution Limits
// ============================================================================

/// Default ceilings applied to every submission
///
/// Toolchains may override the per-stage values; see [`crate::lang::LimitOverrides`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    pub run_timeout_secs: u64,
    pub compile_timeout_secs: u64,
    pub memory_mb: u64,
    pub compile_memory_mb: u64,
    /// Per-stream cap on stdout and stderr
    pub output_limit_bytes: usize,
    /// Thread/process ceiling for the run stage
    pub max_processes: u64,
    pub compile_max_processes: u64,
    /// Delay between SIGTERM and SIGKILL once a limit is breached
    pub kill_grace_ms: u64,
    /// Watchdog sampling period
    pub poll_interval_ms: u64,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    /// Cap on the raw HTTP request body
    pub request_limit_bytes: usize,
    /// Scheduling priority of sandboxed commands
    pub nice: i32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            run_timeout_secs: 10,
            compile_timeout_secs: 20,
            memory_mb: 256,
            compile_memory_mb: 768,
            output_limit_bytes: 64 * 1024,
            max_processes: 64,
            compile_max_processes: 128,
            kill_grace_ms: 250,
            poll_interval_ms: 50,
            max_source_bytes: 256 * 1024,
            max_stdin_bytes: 256 * 1024,
            request_limit_bytes: 1024 * 1024,
            nice: 10,
        }
    }
}

impl ExecutionLimits {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ============================================================================
// Global Configuration
// ============================================================================

/// Global configuration structure (can be serialized/deserialized from JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Address the HTTP server binds to
    pub host: String,

    /// Port for server to listen on
    pub port: u16,

    /// Maximum simultaneous sandbox instances
    pub max_concurrency: usize,

    /// How long a request may wait for a free sandbox before it gets 503
    pub queue_timeout_ms: u64,

    /// Provisioning attempts per request before giving up
    pub provision_attempts: u32,

    /// Parent directory of all scratch directories
    pub scratch_root: PathBuf,

    /// First uid/gid of the dedicated sandbox identities (root mode only)
    pub sandbox_uid_base: u32,

    /// Require full sandbox isolation (fail if unavailable)
    pub require_sandbox: bool,

    /// Directories searched for toolchain programs
    pub search_path: Vec<PathBuf>,

    /// Host paths every sandbox may read and execute
    pub base_read_only_paths: Vec<PathBuf>,

    pub limits: ExecutionLimits,

    /// Toolchain overrides keyed by language id or alias
    pub toolchains: IndexMap<String, ToolchainOverride>,

    /// Enable verbose output (INFO level logging)
    pub verbose: bool,

    /// Enable debug output (DEBUG level logging)
    pub debug: bool,

    /// Quiet mode - only show errors
    pub quiet: bool,

    /// Silent mode - suppress all terminal log output
    pub silent: bool,

    /// Log output format (pretty, json, compact)
    pub log_format: LogFormat,

    /// Write debug logs to file
    pub log_file: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_concurrency: 4,
            queue_timeout_ms: 2000,
            provision_attempts: 3,
            scratch_root: PathBuf::from("/tmp/coderun"),
            sandbox_uid_base: 60000,
            require_sandbox: false,
            search_path: ["/usr/local/bin", "/usr/bin", "/bin"].iter().map(PathBuf::from).collect(),
            base_read_only_paths: ["/usr", "/lib", "/lib64", "/bin", "/etc"].iter().map(PathBuf::from).collect(),
            limits: ExecutionLimits::default(),
            toolchains: IndexMap::new(),
            verbose: false,
            debug: false,
            quiet: false,
            silent: false,
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

impl GlobalConfig {
    /// Load configuration from ConfigArgs, CLI args taking precedence over file config
    pub fn from_args(config: &ConfigArgs) -> Result<Self> {
        load_config(config)
    }

    /// Base uid for dedicated identities, set only when running as root
    pub fn dedicated_uid_base(&self) -> Option<u32> {
        (unsafe { libc::geteuid() } == 0).then_some(self.sandbox_uid_base)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Initialize tracing based on this config's logging settings
    pub fn init_tracing(&self) {
        crate::logging::init_tracing(TracingConfig {
            verbose: self.verbose,
            debug: self.debug,
            quiet: self.quiet,
            silent: self.silent,
            format: self.log_format.clone(),
            log_file: self.log_file.clone(),
        });
    }
}

/// Helper function to load JSON from either a file path or JSON string
fn load_json_string(input: &str) -> Result<String> {
    // Determine if input is a file path or JSON string
    if input.trim_start().starts_with('{') {
        return Ok(input.to_string());
    }
    let path = std::path::Path::new(input);
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read file '{}': {}", path.display(), e))
}

/// Load global configuration from ConfigArgs
///
/// Merges configuration from multiple sources with precedence:
/// 1. CLI args (highest priority)
/// 2. --config
/// 3. Built-in defaults (lowest priority)
fn load_config(config_args: &ConfigArgs) -> Result<GlobalConfig> {
    let mut global_config: GlobalConfig = if let Some(config_input) = &config_args.config {
        let json_str = load_json_string(config_input)?;
        serde_json::from_str(&json_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse global config JSON: {}", e))?
    } else {
        GlobalConfig::default()
    };

    if let Some(max_concurrency) = config_args.max_concurrency {
        global_config.max_concurrency = max_concurrency;
    }
    if let Some(scratch_root) = &config_args.scratch_root {
        global_config.scratch_root = scratch_root.clone();
    }
    if let Some(run_timeout) = config_args.run_timeout {
        global_config.limits.run_timeout_secs = run_timeout;
    }
    if let Some(memory_mb) = config_args.memory_mb {
        global_config.limits.memory_mb = memory_mb;
    }
    if let Some(output_limit) = config_args.output_limit {
        global_config.limits.output_limit_bytes = output_limit;
    }
    if config_args.require_sandbox {
        global_config.require_sandbox = true;
    }

    // Override logging settings from CLI args
    if config_args.verbose {
        global_config.verbose = true;
    }
    if config_args.debug {
        global_config.debug = true;
    }
    if config_args.quiet {
        global_config.quiet = true;
    }
    if config_args.silent {
        global_config.silent = true;
    }
    if let Some(log_format) = &config_args.log_format {
        global_config.log_format = log_format.clone();
    }
    if let Some(log_file) = &config_args.log_file {
        global_config.log_file = Some(log_file.clone());
    }

    if global_config.max_concurrency == 0 {
        anyhow::bail!("max_concurrency must be at least 1");
    }
    if global_config.provision_attempts == 0 {
        global_config.provision_attempts = 1;
    }

    Ok(global_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GlobalConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.limits.run_timeout_secs, 10);
        assert_eq!(config.limits.output_limit_bytes, 65536);
        assert_eq!(config.limits.kill_grace(), Duration::from_millis(250));
        assert_eq!(config.scratch_root, PathBuf::from("/tmp/coderun"));
    }

    #[test]
    fn test_inline_json_is_partial() {
        let args = ConfigArgs {
            config: Some(r#"{"port": 8080, "limits": {"memory_mb": 512}}"#.to_string()),
            ..Default::default()
        };
        let config = GlobalConfig::from_args(&args).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.limits.memory_mb, 512);
        // Unspecified keys keep their defaults
        assert_eq!(config.limits.run_timeout_secs, 10);
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn test_cli_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("coderun.json");
        std::fs::write(&path, r#"{"max_concurrency": 2, "limits": {"run_timeout_secs": 5}}"#).unwrap();

        let args = ConfigArgs {
            config: Some(path.display().to_string()),
            max_concurrency: Some(9),
            output_limit: Some(1024),
            verbose: true,
            ..Default::default()
        };
        let config = GlobalConfig::from_args(&args).unwrap();
        assert_eq!(config.max_concurrency, 9);
        assert_eq!(config.limits.run_timeout_secs, 5);
        assert_eq!(config.limits.output_limit_bytes, 1024);
        assert!(config.verbose);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let missing = ConfigArgs { config: Some("/nonexistent/coderun.json".to_string()), ..Default::default() };
        assert!(GlobalConfig::from_args(&missing).is_err());

        let malformed = ConfigArgs { config: Some("{not json".to_string()), ..Default::default() };
        assert!(GlobalConfig::from_args(&malformed).is_err());

        let zero = ConfigArgs { config: Some(r#"{"max_concurrency": 0}"#.to_string()), ..Default::default() };
        assert!(GlobalConfig::from_args(&zero).is_err());
    }

    #[test]
    fn test_toolchain_overrides_parse() {
        let args = ConfigArgs {
            config: Some(r#"{"toolchains": {"python3": {"limits": {"run_timeout_secs": 2}}}}"#.to_string()),
            ..Default::default()
        };
        let config = GlobalConfig::from_args(&args).unwrap();
        let registry = crate::lang::Registry::with_overrides(&config.toolchains).unwrap();
        assert_eq!(registry.lookup("python3").unwrap().limits.run_timeout_secs, Some(2));
    }
}
