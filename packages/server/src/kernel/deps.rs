//! Dependency container for the worker pipeline (traits for testability).
//!
//! All external collaborators sit behind trait objects so tests can swap
//! in mocks; production wiring happens once in main.

use std::path::PathBuf;
use std::sync::Arc;

use super::audit::AuditStore;
use super::catalog_client::BaseCatalog;
use super::file_explorer_client::BaseFileExplorer;
use super::model_client::BaseTagModel;
use super::notifier::Notifier;
use super::pipeline::BaseCheckout;

/// Dependencies accessible to the tagging pipeline.
pub struct TaggingDeps {
    pub store: Arc<AuditStore>,
    pub catalog: Arc<dyn BaseCatalog>,
    pub file_explorer: Arc<dyn BaseFileExplorer>,
    pub model: Arc<dyn BaseTagModel>,
    pub checkout: Arc<dyn BaseCheckout>,
    pub notifier: Arc<Notifier>,
    /// Prompt template location, loaded and cached on first use.
    pub prompt_template_path: PathBuf,
}

impl TaggingDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<AuditStore>,
        catalog: Arc<dyn BaseCatalog>,
        file_explorer: Arc<dyn BaseFileExplorer>,
        model: Arc<dyn BaseTagModel>,
        checkout: Arc<dyn BaseCheckout>,
        notifier: Arc<Notifier>,
        prompt_template_path: PathBuf,
    ) -> Self {
        Self {
            store,
            catalog,
            file_explorer,
            model,
            checkout,
            notifier,
            prompt_template_path,
        }
    }
}
