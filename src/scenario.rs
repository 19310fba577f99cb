//! One run of the stress scenario.
//!
//! A run enumerates the fixtures, sums their sizes, frames them into one
//! multipart body, streams it at the harness server and collects what the
//! form reported. The order matches what the wire demands: the size is known
//! before the request head goes out, and the head goes out before any body
//! byte.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::{
    body::BodyAssembler,
    boundary::Boundary,
    client::{Driver, Exchange, DEFAULT_TIMEOUT},
    error::HarnessError,
    fixtures,
    form::{FormConfig, HashAlgorithm},
    outcome::{AssertionFailure, EventHarness, ExpectedOutcome, ObservedOutcome},
    server::{HarnessServer, ServerConfig},
    size::{self, DEFAULT_STAT_CONCURRENCY},
};

/// Default wait for the form's final event after the exchange finished.
pub const DEFAULT_SETTLE_GRACE: Duration = Duration::from_secs(5);

/// What makes the request end prematurely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortTrigger {
    /// Send the whole body.
    None,
    /// Close the connection after this many complete parts while the
    /// declared length still promises the rest.
    TruncateAfter(usize),
}

/// Configuration of one run.
#[derive(Debug, Clone)]
pub struct Scenario {
    fixtures_root: PathBuf,
    bind: SocketAddr,
    server: ServerConfig,
    stat_concurrency: usize,
    abort_trigger: AbortTrigger,
    expected: ExpectedOutcome,
    boundary: Option<Boundary>,
    client_timeout: Duration,
    settle_grace: Duration,
}

impl Scenario {
    /// Upload every file below `fixtures_root`, storing uploads in
    /// `upload_dir`.
    ///
    /// The form hashes uploads with SHA-1, keeps multiple files per field and
    /// keeps extensions. The server binds an ephemeral loopback port.
    pub fn new(fixtures_root: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        let form = FormConfig::new(upload_dir)
            .with_hash(Some(HashAlgorithm::Sha1))
            .with_multiples(true)
            .with_keep_extensions(true);

        Self {
            fixtures_root: fixtures_root.into(),
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            server: ServerConfig::new(form),
            stat_concurrency: DEFAULT_STAT_CONCURRENCY,
            abort_trigger: AbortTrigger::None,
            expected: ExpectedOutcome {
                files_parsed: 0,
                aborted: false,
            },
            boundary: None,
            client_timeout: DEFAULT_TIMEOUT,
            settle_grace: DEFAULT_SETTLE_GRACE,
        }
    }

    /// Bind the harness server to `addr`.
    #[must_use]
    pub fn with_bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    /// Replace the server settings.
    #[must_use]
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Keep at most `limit` stat calls in flight.
    #[must_use]
    pub fn with_stat_concurrency(mut self, limit: usize) -> Self {
        self.stat_concurrency = limit;
        self
    }

    /// Choose how the request ends prematurely, if at all.
    #[must_use]
    pub fn with_abort_trigger(mut self, trigger: AbortTrigger) -> Self {
        self.abort_trigger = trigger;
        self
    }

    /// The oracle checked by [`RunReport::verify`].
    #[must_use]
    pub fn with_expected(mut self, expected: ExpectedOutcome) -> Self {
        self.expected = expected;
        self
    }

    /// Use a fixed boundary instead of a random one.
    #[must_use]
    pub fn with_boundary(mut self, boundary: Boundary) -> Self {
        self.boundary = Some(boundary);
        self
    }

    /// Limit the whole client exchange.
    #[must_use]
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Wait this long for the form's final event.
    #[must_use]
    pub fn with_settle_grace(mut self, grace: Duration) -> Self {
        self.settle_grace = grace;
        self
    }

    /// Server settings.
    #[must_use]
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// The configured oracle.
    #[must_use]
    pub fn expected(&self) -> ExpectedOutcome {
        self.expected
    }

    /// Start a harness server, run against it, and stop it.
    ///
    /// # Errors
    ///
    /// See [`HarnessError`]. An oracle mismatch is not an error here; check
    /// it with [`RunReport::verify`].
    pub async fn run(&self) -> Result<RunReport, HarnessError> {
        let (server, mut harness) = HarnessServer::bind(self.bind, self.server.clone())
            .await
            .map_err(HarnessError::Bind)?;

        let report = self.run_against(server.local_addr(), &mut harness).await;
        server.shutdown().await;

        report
    }

    /// Run against an already running server whose events arrive at
    /// `harness`.
    ///
    /// Fixture enumeration and sizing complete before a connection is
    /// opened; if either fails, the server never sees a request.
    ///
    /// # Errors
    ///
    /// See [`HarnessError`].
    pub async fn run_against(
        &self,
        addr: SocketAddr,
        harness: &mut EventHarness,
    ) -> Result<RunReport, HarnessError> {
        let fixtures = fixtures::enumerate(&self.fixtures_root)?;
        let payload = size::total_size(&fixtures, self.stat_concurrency).await?;

        let boundary = self.boundary.clone().unwrap_or_else(Boundary::random);
        let assembler = BodyAssembler::new(boundary, fixtures);
        let content_length = assembler.content_length(payload);
        let body = match self.abort_trigger {
            AbortTrigger::None => assembler.stream(),
            AbortTrigger::TruncateAfter(frames) => assembler.truncated_stream(frames),
        };

        tracing::info!(
            files = assembler.fixtures().len(),
            payload,
            content_length,
            trigger = ?self.abort_trigger,
            "starting upload"
        );

        let exchange = Driver::new(addr)
            .with_timeout(self.client_timeout)
            .upload(assembler.boundary(), content_length, body)
            .await?;

        let observed = harness.settle(self.settle_grace).await;

        tracing::info!(
            files_parsed = observed.files_parsed,
            aborted = observed.got_aborted,
            ended = observed.ended,
            errors = observed.errors.len(),
            "run finished"
        );

        Ok(RunReport {
            fixtures: assembler.fixtures().len(),
            payload_bytes: payload,
            content_length,
            exchange,
            observed,
        })
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Number of fixtures found.
    pub fixtures: usize,
    /// Sum of fixture sizes.
    pub payload_bytes: u64,
    /// Declared `Content-Length`.
    pub content_length: u64,
    /// Client side of the exchange.
    pub exchange: Exchange,
    /// Server side of the exchange.
    pub observed: ObservedOutcome,
}

impl RunReport {
    /// Check the observed outcome against `expected`.
    ///
    /// # Errors
    ///
    /// The first mismatch.
    pub fn verify(&self, expected: &ExpectedOutcome) -> Result<(), AssertionFailure> {
        expected.check(&self.observed)
    }
}
