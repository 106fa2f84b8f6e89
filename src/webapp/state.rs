use std::sync::Arc;
use std::time::Instant;

use crate::exec::Executor;
use crate::webapp::models::LanguageInfo;

#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
    /// Registry listing, computed once at startup
    pub languages: Arc<Vec<LanguageInfo>>,
    /// When the server was started (for uptime tracking)
    pub started_at: Instant,
    /// Maximum body size for run requests (bytes)
    pub request_limit: usize,
}

impl AppState {
    pub fn new(executor: Executor, search_path: &[std::path::PathBuf]) -> Self {
        let languages = executor.registry().iter()
            .map(|toolchain| LanguageInfo::from_toolchain(toolchain, search_path))
            .collect();
        let request_limit = executor.settings().limits.request_limit_bytes;

        Self {
            executor,
            languages: Arc::new(languages),
            started_at: Instant::now(),
            request_limit,
        }
    }
}
