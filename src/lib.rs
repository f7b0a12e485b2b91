//! Client core for the CORA document approval workflow: the document
//! lifecycle (submit, review, archive, versioning) and streamed answers
//! from the generation endpoint.

pub mod api;
pub mod chat;
pub mod db;
pub mod error;
pub mod payload;
pub mod session;
pub mod settings;
pub mod workflow;

pub use error::{Result, WorkflowError};
pub use session::Session;

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cora_workflow=info"));
    // A subscriber may already be installed by the embedding application.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
