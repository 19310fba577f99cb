//! Command line interface for the `multipart-stress` binary.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use multipart_stress::{
    AbortTrigger, ExpectedOutcome, FormConfig, HashAlgorithm, Scenario, ServerConfig,
};

/// Command line arguments for the `multipart-stress` binary.
#[derive(Debug, Parser)]
#[command(
    name = "multipart-stress",
    version,
    about = "Stream a directory of files as one multipart upload and check what the parser saw"
)]
pub struct Cli {
    /// Directory whose files are uploaded.
    #[arg(long)]
    pub fixtures: PathBuf,

    /// Where the server stores uploads. Defaults to a fresh temporary directory.
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Address the harness server binds to.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub bind: SocketAddr,

    /// Number of files the parser must report.
    #[arg(long, default_value_t = 0)]
    pub expect_files: usize,

    /// Require the request to be reported as aborted.
    #[arg(long)]
    pub expect_aborted: bool,

    /// Close the connection after this many complete files.
    #[arg(long)]
    pub truncate_after: Option<usize>,

    /// Digest computed over each upload.
    #[arg(long, default_value_t = HashAlgorithm::Sha1, conflicts_with = "no_hash")]
    pub hash: HashAlgorithm,

    /// Do not hash uploads.
    #[arg(long)]
    pub no_hash: bool,

    /// Keep only the last file per field name.
    #[arg(long)]
    pub no_multiples: bool,

    /// Drop the original extension from stored file names.
    #[arg(long)]
    pub no_keep_extensions: bool,

    /// Fail the form once more files than this arrive.
    #[arg(long)]
    pub max_files: Option<usize>,

    /// Concurrent stat calls while sizing the fixtures.
    #[arg(long, default_value_t = 5)]
    pub stat_concurrency: usize,

    /// Seconds the server waits for body bytes before giving up on a request.
    #[arg(long, default_value_t = 30)]
    pub idle_timeout_secs: u64,

    /// Seconds the whole client exchange may take.
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

impl Cli {
    /// The oracle described by the flags.
    pub fn expected(&self) -> ExpectedOutcome {
        ExpectedOutcome {
            files_parsed: self.expect_files,
            aborted: self.expect_aborted,
        }
    }

    /// Build the scenario, storing uploads in `upload_dir`.
    pub fn scenario(&self, upload_dir: PathBuf) -> Scenario {
        let form = FormConfig::new(upload_dir.clone())
            .with_hash((!self.no_hash).then_some(self.hash))
            .with_multiples(!self.no_multiples)
            .with_keep_extensions(!self.no_keep_extensions)
            .with_max_files(self.max_files);
        let server =
            ServerConfig::new(form).with_idle_timeout(Duration::from_secs(self.idle_timeout_secs));
        let trigger = self
            .truncate_after
            .map_or(AbortTrigger::None, AbortTrigger::TruncateAfter);

        Scenario::new(&self.fixtures, upload_dir)
            .with_server(server)
            .with_bind(self.bind)
            .with_stat_concurrency(self.stat_concurrency)
            .with_abort_trigger(trigger)
            .with_client_timeout(Duration::from_secs(self.timeout_secs))
            .with_expected(self.expected())
    }
}
