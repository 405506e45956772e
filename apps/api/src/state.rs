use crate::config::Config;
use crate::versioning::service::VersionControlService;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Version engine. Holds its store explicitly; nothing reaches for a
    /// global database client.
    pub versions: VersionControlService,
    pub config: Config,
}
