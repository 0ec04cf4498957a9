//! # creator-dl
//!
//! Backend library for bulk-downloading creator content from aggregator
//! sites (kemono.cr, coomer.st).
//!
//! ## Design Philosophy
//!
//! creator-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Resume-safe** - Re-running a target skips files already on disk
//! - **Fault-tolerant** - A failed post or file never aborts the run
//!
//! ## Quick Start
//!
//! ```no_run
//! use creator_dl::{Config, CreatorDownloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         base_directory: "/var/downloads".into(),
//!         ..Default::default()
//!     };
//!
//!     let downloader = CreatorDownloader::new(config);
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = downloader.run("https://kemono.cr/patreon/user/12345").await?;
//!     println!("{} files downloaded", summary.succeeded);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// HTTP client construction and JSON fetching
pub mod client;
/// Configuration types
pub mod config;
/// Run-scoped deduplication ledger
pub mod dedup;
/// Post discovery and file extraction
pub mod discovery;
/// Supported domains and target URL parsing
pub mod domain;
/// Error types
pub mod error;
/// Filename templating, sanitization, and folder placement
pub mod naming;
/// Retry logic with exponential backoff
pub mod retry;
/// Run controller
pub mod run;
/// Bounded-concurrency download scheduler
pub mod scheduler;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{
    Config, DedupMode, DownloadConfig, FolderStrategy, ProxyConfig, RetryConfig,
};
pub use domain::{DomainConfig, Target};
pub use error::{Error, Result};
pub use run::{Counts, CreatorDownloader, RunState};
pub use types::{Event, FileTask, RunStatus, RunSummary, SkipReason};

/// Helper function to run a download with graceful signal handling.
///
/// Starts the run and, if a termination signal arrives first, requests
/// cooperative cancellation and waits for the run to drain.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use creator_dl::{Config, CreatorDownloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = CreatorDownloader::new(Config::default());
///     let summary = run_with_shutdown(&downloader, "https://kemono.cr/patreon/user/12345").await?;
///     println!("{:?}", summary.status);
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(
    downloader: &CreatorDownloader,
    url: &str,
) -> Result<RunSummary> {
    let mut run = std::pin::pin!(downloader.run(url));
    tokio::select! {
        summary = &mut run => return summary,
        () = wait_for_signal() => {
            downloader.cancel();
        }
    }
    run.await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
