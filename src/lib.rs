//! Stress harness for streaming `multipart/form-data` parsing.
//!
//! Every file below a fixture directory is framed into a single multipart
//! request and streamed at a local server that parses it with [`multer`].
//! The parser's events are collected and checked against an expected
//! outcome, most interestingly the number of files parsed before a request
//! was cut short.
//!
//! ```
//! # tokio_test::block_on(async {
//! use bytes::Bytes;
//! use futures::TryStreamExt;
//! use multipart_stress::{BodyAssembler, Boundary, FixtureSet};
//!
//! let assembler = BodyAssembler::new(Boundary::new("1234"), FixtureSet::default());
//! let body: Vec<Bytes> = assembler.stream().try_collect().await?;
//!
//! assert_eq!(body.concat(), b"\r\n--1234--\r\n");
//! assert_eq!(assembler.content_length(0), 12);
//! # Result::<(), multipart_stress::BodyError>::Ok(())
//! # });
//! ```
#![deny(
    unreachable_pub,
    missing_debug_implementations,
    missing_docs,
    clippy::pedantic
)]

pub mod body;
pub mod boundary;
pub mod client;
pub mod error;
pub mod fixtures;
pub mod form;
pub mod frame;
pub mod head;
pub mod outcome;
pub mod scenario;
pub mod server;
pub mod size;

pub use body::{BodyAssembler, BodyError, BodyStream};
pub use boundary::{Boundary, InvalidBoundary};
pub use client::{Driver, DriverError, Exchange, Response};
pub use error::HarnessError;
pub use fixtures::{enumerate, EnumerationError, FixturePath, FixtureSet};
pub use form::{
    BodyEnd, FormConfig, FormError, FormEvent, FormStatus, HashAlgorithm, IncomingForm,
    ParsedForm, UploadedFile,
};
pub use frame::FrameEnvelope;
pub use head::ParseHeadersError;
pub use outcome::{AssertionFailure, EventHarness, ExpectedOutcome, ObservedOutcome};
pub use scenario::{AbortTrigger, RunReport, Scenario};
pub use server::{HarnessServer, ServerConfig};
pub use size::{total_size, StatError};
