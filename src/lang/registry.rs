use std::path::PathBuf;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

/// Languages with a built-in toolchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python3,
    Javascript,
    Typescript,
    Java,
    Cpp,
    C,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python3,
        Language::Javascript,
        Language::Typescript,
        Language::Java,
        Language::Cpp,
        Language::C,
    ];

    /// Canonical identifier
    pub fn id(self) -> &'static str {
        match self {
            Language::Python3 => "python3",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::C => "c",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Language::Python3 => &["python", "py"],
            Language::Javascript => &["js", "node"],
            Language::Typescript => &["ts"],
            Language::Java => &[],
            Language::Cpp => &["c++", "cxx"],
            Language::C => &[],
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Language::ALL.into_iter()
            .find(|lang| lang.id() == wanted || lang.aliases().contains(&wanted.as_str()))
            .ok_or_else(|| UnsupportedLanguage(s.to_string()))
    }
}

/// A program plus arguments; `{memory_mb}` in an argument expands to the stage's memory ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn render_args(&self, memory_mb: u64) -> Vec<String> {
        let memory = memory_mb.to_string();
        self.args.iter().map(|a| a.replace("{memory_mb}", &memory)).collect()
    }
}

/// Named set of host paths a toolchain needs read-only inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeImage {
    pub name: String,
    #[serde(default)]
    pub read_only_paths: Vec<PathBuf>,
}

impl RuntimeImage {
    fn new(name: &str, paths: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            read_only_paths: paths.iter().map(PathBuf::from).collect(),
        }
    }
}

/// How a submission becomes a running program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Pipeline {
    Interpreted { run: CommandTemplate },
    Compiled { compile: CommandTemplate, run: CommandTemplate },
}

impl Pipeline {
    pub fn compile(&self) -> Option<&CommandTemplate> {
        match self {
            Pipeline::Interpreted { .. } => None,
            Pipeline::Compiled { compile, .. } => Some(compile),
        }
    }

    pub fn run(&self) -> &CommandTemplate {
        match self {
            Pipeline::Interpreted { run } | Pipeline::Compiled { run, .. } => run,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Pipeline::Interpreted { .. } => "interpreted",
            Pipeline::Compiled { .. } => "compiled",
        }
    }
}

/// Per-toolchain deviations from the configured execution limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitOverrides {
    pub run_timeout_secs: Option<u64>,
    pub compile_timeout_secs: Option<u64>,
    pub memory_mb: Option<u64>,
    pub compile_memory_mb: Option<u64>,
    pub max_processes: Option<u64>,
    pub compile_max_processes: Option<u64>,
}

impl LimitOverrides {
    /// Fields set in `other` win, the rest are kept
    pub fn merge(&mut self, other: &LimitOverrides) {
        self.run_timeout_secs = other.run_timeout_secs.or(self.run_timeout_secs);
        self.compile_timeout_secs = other.compile_timeout_secs.or(self.compile_timeout_secs);
        self.memory_mb = other.memory_mb.or(self.memory_mb);
        self.compile_memory_mb = other.compile_memory_mb.or(self.compile_memory_mb);
        self.max_processes = other.max_processes.or(self.max_processes);
        self.compile_max_processes = other.compile_max_processes.or(self.compile_max_processes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toolchain {
    pub language: Language,
    pub runtime: RuntimeImage,
    /// Name the submission is written under in the scratch directory
    pub source_file: String,
    pub pipeline: Pipeline,
    pub env: IndexMap<String, String>,
    pub limits: LimitOverrides,
    /// RLIMIT_DATA breaks runtimes that reserve large address ranges up front
    pub enforce_data_rlimit: bool,
}

/// Partial toolchain from the config file, applied over a built-in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainOverride {
    pub runtime: Option<RuntimeImage>,
    pub source_file: Option<String>,
    pub pipeline: Option<Pipeline>,
    pub env: Option<IndexMap<String, String>>,
    pub limits: Option<LimitOverrides>,
    pub enforce_data_rlimit: Option<bool>,
}

impl Toolchain {
    fn builtin(language: Language) -> Self {
        let mut env = IndexMap::new();
        let mut limits = LimitOverrides::default();
        let mut enforce_data_rlimit = true;

        let (runtime, source_file, pipeline) = match language {
            Language::Python3 => {
                env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
                env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
                (
                    RuntimeImage::new("python3", &["/usr/local/lib"]),
                    "main.py",
                    Pipeline::Interpreted { run: CommandTemplate::new("python3", &["-B", "main.py"]) },
                )
            }
            Language::Javascript => {
                enforce_data_rlimit = false;
                (
                    RuntimeImage::new("node", &["/usr/local/lib/node_modules", "/opt/node", "/proc/self"]),
                    "main.js",
                    Pipeline::Interpreted { run: CommandTemplate::new("node", &["main.js"]) },
                )
            }
            Language::Typescript => {
                enforce_data_rlimit = false;
                limits.compile_timeout_secs = Some(30);
                (
                    RuntimeImage::new("node", &["/usr/local/lib/node_modules", "/opt/node", "/proc/self"]),
                    "main.ts",
                    Pipeline::Compiled {
                        compile: CommandTemplate::new(
                            "tsc",
                            &["--target", "ES2020", "--module", "commonjs", "--skipLibCheck", "--outDir", ".", "main.ts"],
                        ),
                        run: CommandTemplate::new("node", &["main.js"]),
                    },
                )
            }
            Language::Java => {
                enforce_data_rlimit = false;
                limits.max_processes = Some(128);
                limits.compile_timeout_secs = Some(30);
                (
                    RuntimeImage::new("jdk", &["/usr/lib/jvm", "/opt/java", "/proc/self"]),
                    "Main.java",
                    Pipeline::Compiled {
                        compile: CommandTemplate::new("javac", &["-encoding", "UTF-8", "-d", ".", "Main.java"]),
                        run: CommandTemplate::new(
                            "java",
                            &["-Xmx{memory_mb}m", "-Xss64m", "-XX:+UseSerialGC", "-Dfile.encoding=UTF-8", "-cp", ".", "Main"],
                        ),
                    },
                )
            }
            Language::Cpp => (
                RuntimeImage::new("gcc", &["/usr/include", "/usr/libexec/gcc", "/usr/lib/gcc"]),
                "main.cpp",
                Pipeline::Compiled {
                    compile: CommandTemplate::new("g++", &["-std=c++17", "-O2", "-pipe", "-o", "main", "main.cpp"]),
                    run: CommandTemplate::new("./main", &[]),
                },
            ),
            Language::C => (
                RuntimeImage::new("gcc", &["/usr/include", "/usr/libexec/gcc", "/usr/lib/gcc"]),
                "main.c",
                Pipeline::Compiled {
                    compile: CommandTemplate::new("gcc", &["-std=c17", "-O2", "-pipe", "-o", "main", "main.c", "-lm"]),
                    run: CommandTemplate::new("./main", &[]),
                },
            ),
        };

        Self {
            language,
            runtime,
            source_file: source_file.to_string(),
            pipeline,
            env,
            limits,
            enforce_data_rlimit,
        }
    }

    fn apply(&mut self, overrides: &ToolchainOverride) {
        if let Some(runtime) = &overrides.runtime {
            self.runtime = runtime.clone();
        }
        if let Some(source_file) = &overrides.source_file {
            self.source_file = source_file.clone();
        }
        if let Some(pipeline) = &overrides.pipeline {
            self.pipeline = pipeline.clone();
        }
        if let Some(env) = &overrides.env {
            self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(limits) = &overrides.limits {
            self.limits.merge(limits);
        }
        if let Some(enforce) = overrides.enforce_data_rlimit {
            self.enforce_data_rlimit = enforce;
        }
    }

    /// Every program the pipeline executes
    pub fn programs(&self) -> Vec<&str> {
        let mut programs: Vec<&str> = self.pipeline.compile().map(|c| c.program.as_str()).into_iter().collect();
        programs.push(self.pipeline.run().program.as_str());
        programs
    }
}

/// Immutable language → toolchain table
#[derive(Debug, Clone)]
pub struct Registry {
    toolchains: IndexMap<Language, Toolchain>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    pub fn builtin() -> Self {
        Self {
            toolchains: Language::ALL.into_iter().map(|l| (l, Toolchain::builtin(l))).collect(),
        }
    }

    /// Built-ins with config overrides applied, keyed by language id or alias
    pub fn with_overrides(overrides: &IndexMap<String, ToolchainOverride>) -> Result<Self, UnsupportedLanguage> {
        let mut registry = Self::builtin();
        for (id, toolchain_override) in overrides {
            let language: Language = id.parse()?;
            if let Some(toolchain) = registry.toolchains.get_mut(&language) {
                toolchain.apply(toolchain_override);
            }
        }
        Ok(registry)
    }

    /// Resolve a client-supplied identifier
    pub fn lookup(&self, id: &str) -> Result<&Toolchain, UnsupportedLanguage> {
        let language: Language = id.parse()?;
        self.toolchains.get(&language).ok_or_else(|| UnsupportedLanguage(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Toolchain> {
        self.toolchains.values()
    }
}
