//! Runs one stress scenario and exits non-zero when it fails.
//!
//! Exit status is `1` when the run could not complete and `2` when the
//! parser's outcome did not match the expectation.

mod cli;

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// The requested upload directory, created if missing, or a fresh temporary
/// one that lives as long as the returned guard.
fn prepare_upload_dir(requested: Option<&Path>) -> io::Result<(PathBuf, Option<TempDir>)> {
    match requested {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Ok((dir.to_path_buf(), None))
        }
        None => {
            let scratch = tempfile::Builder::new()
                .prefix("multipart-stress-")
                .tempdir()?;
            Ok((scratch.path().to_path_buf(), Some(scratch)))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();

    // Held until the end of the run; dropping it removes the uploads.
    let (upload_dir, scratch) = match prepare_upload_dir(cli.upload_dir.as_deref()) {
        Ok(dirs) => dirs,
        Err(err) => {
            tracing::error!(error = %err, "cannot create upload directory");
            return ExitCode::from(1);
        }
    };
    tracing::debug!(dir = %upload_dir.display(), temporary = scratch.is_some(), "upload directory");

    let scenario = cli.scenario(upload_dir);
    let report = match scenario.run().await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            return ExitCode::from(1);
        }
    };

    match report.verify(&scenario.expected()) {
        Ok(()) => {
            tracing::info!(
                files_parsed = report.observed.files_parsed,
                aborted = report.observed.got_aborted,
                "outcome matches"
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            tracing::error!(%failure, errors = ?report.observed.errors, "outcome mismatch");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::prepare_upload_dir;

    #[test]
    fn default_upload_dir_is_fresh_and_removed() {
        let (first, guard) = prepare_upload_dir(None).unwrap();
        let (second, other) = prepare_upload_dir(None).unwrap();

        assert_ne!(first, second);
        assert!(first.is_dir());
        assert_eq!(std::fs::read_dir(&first).unwrap().count(), 0);

        std::fs::write(first.join("upload_0"), b"x").unwrap();
        drop(guard);
        drop(other);
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn requested_upload_dir_is_created_and_kept() {
        let parent = tempfile::tempdir().unwrap();
        let requested = parent.path().join("nested/uploads");

        let (dir, guard) = prepare_upload_dir(Some(&requested)).unwrap();

        assert_eq!(dir, requested);
        assert!(guard.is_none());
        assert!(requested.is_dir());
    }
}
