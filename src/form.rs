//! The parser under test, wrapped as an event source.
//!
//! [`IncomingForm`] drives a [`multer::Multipart`] over a request body,
//! persists every file part into an upload directory, and reports what
//! happened as [`FormEvent`]s on a channel. `End` is only reported once the
//! parser is done *and* the transport delivered the whole declared body;
//! if the transport ended early the request is reported as `Aborted`
//! instead. Exactly one of `End` and `Aborted` is sent for a request unless
//! a parse error ends it first.

use std::{
    collections::HashMap,
    convert::Infallible,
    fmt,
    future::Future,
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use bytes::Bytes;
use futures::Stream;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::{fs::File, io::AsyncWriteExt, sync::mpsc};

use crate::boundary::Boundary;

/// Content hash computed over each uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1, hex encoded.
    Sha1,
    /// SHA-256, hex encoded.
    Sha256,
}

/// Unknown hash algorithm name.
#[derive(Debug, thiserror::Error)]
#[error("unknown hash algorithm {0:?}, expected sha1 or sha256")]
pub struct UnknownHashAlgorithm(String);

impl FromStr for HashAlgorithm {
    type Err = UnknownHashAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(UnknownHashAlgorithm(s.to_owned())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha256"),
        }
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha1(h) => format!("{:x}", h.finalize()),
            Self::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// How an [`IncomingForm`] treats uploads.
#[derive(Debug, Clone)]
pub struct FormConfig {
    upload_dir: PathBuf,
    hash: Option<HashAlgorithm>,
    multiples: bool,
    keep_extensions: bool,
    max_files: Option<usize>,
}

impl FormConfig {
    /// Persist uploads into `upload_dir`, with hashing, multiples and
    /// extension preservation all off and no file limit.
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            hash: None,
            multiples: false,
            keep_extensions: false,
            max_files: None,
        }
    }

    /// Hash every upload with `algorithm`.
    #[must_use]
    pub fn with_hash(mut self, algorithm: Option<HashAlgorithm>) -> Self {
        self.hash = algorithm;
        self
    }

    /// Keep every file sent under the same field name, not just the last.
    #[must_use]
    pub fn with_multiples(mut self, multiples: bool) -> Self {
        self.multiples = multiples;
        self
    }

    /// Give stored uploads the extension of the original file name.
    #[must_use]
    pub fn with_keep_extensions(mut self, keep: bool) -> Self {
        self.keep_extensions = keep;
        self
    }

    /// Fail the request once more than `limit` files arrive.
    #[must_use]
    pub fn with_max_files(mut self, limit: Option<usize>) -> Self {
        self.max_files = limit;
        self
    }

    /// Directory uploads are written to.
    #[must_use]
    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Configured hash, if any.
    #[must_use]
    pub fn hash(&self) -> Option<HashAlgorithm> {
        self.hash
    }

    /// Whether multiple files per field are kept.
    #[must_use]
    pub fn multiples(&self) -> bool {
        self.multiples
    }

    /// Whether original extensions are kept.
    #[must_use]
    pub fn keep_extensions(&self) -> bool {
        self.keep_extensions
    }

    /// Upper bound on files per request.
    #[must_use]
    pub fn max_files(&self) -> Option<usize> {
        self.max_files
    }

    fn upload_path(&self, original: &str) -> PathBuf {
        let mut name = format!("upload_{:032x}", rand::random::<u128>());
        if self.keep_extensions {
            if let Some(ext) = Path::new(original).extension() {
                name.push('.');
                name.push_str(&ext.to_string_lossy());
            }
        }
        self.upload_dir.join(name)
    }
}

/// A file part that was received completely and written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Form field name.
    pub field: String,
    /// File name sent by the client.
    pub original_name: String,
    /// `Content-Type` of the part, if present.
    pub content_type: Option<String>,
    /// Where the content was stored.
    pub path: PathBuf,
    /// Content length in bytes.
    pub size: u64,
    /// Hex digest, when hashing is enabled.
    pub hash: Option<String>,
}

/// Errors reported by an [`IncomingForm`].
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    /// The multipart body could not be parsed.
    #[error("multipart parse failed: {0}")]
    Parse(#[from] multer::Error),

    /// An upload could not be written; the part is skipped.
    #[error("failed to persist upload {}: {source}", .path.display())]
    Persist {
        /// Target file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// More files arrived than [`FormConfig::with_max_files`] allows.
    #[error("too many files, limit is {0}")]
    TooManyFiles(usize),
}

impl FormError {
    /// Whether this error ends parsing of the request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Persist { .. })
    }
}

/// Everything a form reports while parsing one request.
#[derive(Debug)]
pub enum FormEvent {
    /// A non-file part.
    Field {
        /// Field name.
        name: String,
        /// Field value.
        value: String,
    },
    /// A file part was fully received and stored.
    File(UploadedFile),
    /// The transport ended before parsing completed.
    Aborted,
    /// Parsing completed and the whole body was received.
    End,
    /// Something went wrong; see [`FormError::is_terminal`].
    Error(FormError),
}

impl FormEvent {
    /// Whether no further events follow for this request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Aborted | Self::End => true,
            Self::Error(err) => err.is_terminal(),
            Self::Field { .. } | Self::File(_) => false,
        }
    }
}

/// How the transport delivered the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEnd {
    /// Every declared byte arrived.
    Complete,
    /// EOF, reset or idle timeout before the declared length.
    ClosedEarly,
}

/// How parsing of a request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormStatus {
    /// `End` was reported.
    Ended,
    /// `Aborted` was reported.
    Aborted,
    /// A terminal error was reported.
    Failed,
}

/// Summary of one parsed request.
#[derive(Debug)]
pub struct ParsedForm {
    /// How parsing finished.
    pub status: FormStatus,
    /// Non-file parts in arrival order.
    pub fields: Vec<(String, String)>,
    /// Stored files per field name. Holds only the last file of a field
    /// unless multiples are enabled.
    pub files: HashMap<String, Vec<UploadedFile>>,
}

/// One request's worth of multipart parsing.
#[derive(Debug)]
pub struct IncomingForm {
    config: FormConfig,
    events: mpsc::UnboundedSender<FormEvent>,
    received: usize,
}

impl IncomingForm {
    /// A form reporting to `events`.
    #[must_use]
    pub fn new(config: FormConfig, events: mpsc::UnboundedSender<FormEvent>) -> Self {
        Self {
            config,
            events,
            received: 0,
        }
    }

    /// Parse `body` delimited by `boundary`.
    ///
    /// `body_end` resolves once the transport stopped delivering the body;
    /// it is awaited after the parser released `body`.
    pub async fn parse<S, F>(mut self, body: S, boundary: &Boundary, body_end: F) -> ParsedForm
    where
        S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
        F: Future<Output = BodyEnd>,
    {
        let mut form = ParsedForm {
            status: FormStatus::Failed,
            fields: Vec::new(),
            files: HashMap::new(),
        };

        let mut multipart = multer::Multipart::new(body, boundary.as_ref());
        let outcome = loop {
            match multipart.next_field().await {
                Ok(Some(field)) => {
                    if let Err(err) = self.handle_field(field, &mut form).await {
                        break Err(err);
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(FormError::from(err)),
            }
        };
        drop(multipart);

        let transport = body_end.await;
        form.status = match (outcome, transport) {
            (Err(FormError::TooManyFiles(limit)), _) => {
                self.fail(FormError::TooManyFiles(limit));
                FormStatus::Failed
            }
            (_, BodyEnd::ClosedEarly) => {
                tracing::info!(files = self.received, "request aborted");
                self.emit(FormEvent::Aborted);
                FormStatus::Aborted
            }
            (Ok(()), BodyEnd::Complete) => {
                tracing::debug!(files = self.received, "request parsed");
                self.emit(FormEvent::End);
                FormStatus::Ended
            }
            (Err(err), BodyEnd::Complete) => {
                self.fail(err);
                FormStatus::Failed
            }
        };

        form
    }

    async fn handle_field(
        &mut self,
        field: multer::Field<'_>,
        form: &mut ParsedForm,
    ) -> Result<(), FormError> {
        let name = field.name().unwrap_or_default().to_owned();

        let Some(original) = field.file_name().map(str::to_owned) else {
            let value = field.text().await?;
            form.fields.push((name.clone(), value.clone()));
            self.emit(FormEvent::Field { name, value });
            return Ok(());
        };

        if let Some(limit) = self.config.max_files {
            if self.received >= limit {
                return Err(FormError::TooManyFiles(limit));
            }
        }
        self.received += 1;

        if let Some(file) = self.persist(name, original, field).await? {
            let slot = form.files.entry(file.field.clone()).or_default();
            if !self.config.multiples {
                slot.clear();
            }
            slot.push(file.clone());
            self.emit(FormEvent::File(file));
        }

        Ok(())
    }

    /// Stream one file part to disk.
    ///
    /// Returns `Ok(None)` when the part was consumed but could not be stored;
    /// the failure has already been reported.
    async fn persist(
        &self,
        field_name: String,
        original_name: String,
        mut field: multer::Field<'_>,
    ) -> Result<Option<UploadedFile>, FormError> {
        let path = self.config.upload_path(&original_name);
        let content_type = field.content_type().map(ToString::to_string);
        let mut hasher = self.config.hash.map(Hasher::new);
        let mut size = 0u64;

        let mut sink = match File::create(&path).await {
            Ok(file) => Some(file),
            Err(source) => {
                self.fail(FormError::Persist {
                    path: path.clone(),
                    source,
                });
                None
            }
        };

        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    drop(sink);
                    discard(&path).await;
                    return Err(err.into());
                }
            };

            size += chunk.len() as u64;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            if let Some(file) = sink.as_mut() {
                if let Err(source) = file.write_all(&chunk).await {
                    sink = None;
                    discard(&path).await;
                    self.fail(FormError::Persist {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }

        let Some(mut file) = sink else {
            return Ok(None);
        };
        if let Err(source) = file.flush().await {
            drop(file);
            discard(&path).await;
            self.fail(FormError::Persist { path, source });
            return Ok(None);
        }

        tracing::debug!(field = %field_name, path = %path.display(), size, "stored upload");

        Ok(Some(UploadedFile {
            field: field_name,
            original_name,
            content_type,
            path,
            size,
            hash: hasher.map(Hasher::finish),
        }))
    }

    fn fail(&self, err: FormError) {
        tracing::warn!(error = %err, "form error");
        self.emit(FormEvent::Error(err));
    }

    fn emit(&self, event: FormEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("form event receiver dropped");
        }
    }
}

/// Remove a partially written upload.
async fn discard(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %err, "failed to remove partial upload");
        }
    }
}
