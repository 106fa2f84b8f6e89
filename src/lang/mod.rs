//! Language registry: which toolchain compiles and runs each supported language.

pub mod registry;

pub use registry::{
    CommandTemplate, Language, LimitOverrides, Pipeline, Registry, RuntimeImage, Toolchain,
    ToolchainOverride, UnsupportedLanguage,
};
