use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::cache::Cache;
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// AnalysisContext
// ---------------------------------------------------------------------------

/// Per-run context shared read-only (via `Arc`) by every task of one
/// analysis. Owns the run's cancellation token.
#[derive(Clone)]
pub struct AnalysisContext {
    pub analysis_id: Uuid,
    pub project_id: String,
    pub project_path: PathBuf,
    /// `Some` in incremental mode: the files that changed since the last run.
    pub changed_files: Option<Vec<PathBuf>>,
    /// Optional cache collaborator; absence means "no cache", never an error.
    pub cache: Option<Arc<dyn Cache>>,
    pub config: Arc<EngineConfig>,
    pub token: CancellationToken,
}

impl AnalysisContext {
    pub fn new(project_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            analysis_id: Uuid::new_v4(),
            project_id: project_id.into(),
            project_path: project_path.into(),
            changed_files: None,
            cache: None,
            config: Arc::new(EngineConfig::default()),
            token: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: Arc<EngineConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_changed_files(mut self, files: Vec<PathBuf>) -> Self {
        self.changed_files = Some(files);
        self
    }

    /// Whether this run was started in incremental mode.
    pub fn is_incremental(&self) -> bool {
        self.changed_files.is_some()
    }
}

impl std::fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("analysis_id", &self.analysis_id)
            .field("project_id", &self.project_id)
            .field("project_path", &self.project_path)
            .field("changed_files", &self.changed_files)
            .field("has_cache", &self.cache.is_some())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
