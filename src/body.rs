//! Streaming multipart body assembly.
//!
//! [`BodyStream`] yields the request body as a sequence of [`Bytes`]
//! chunks: an envelope, the file's content in bounded reads, the frame end,
//! and so on for every fixture, followed by the global terminator. A file is
//! only opened after the previous file's reader has reached EOF, so at most
//! one file is in flight and frames appear in [`FixtureSet`] order. The
//! consumer drives the pace; nothing is read ahead of what it polls.

use std::{
    fmt,
    io,
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{future::BoxFuture, ready, FutureExt, Stream};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::{
    boundary::Boundary,
    fixtures::FixtureSet,
    frame::{self, FrameEnvelope, FRAME_END},
};

/// Size of each read from a fixture file (64 KiB).
const READ_CHUNK: usize = 64 << 10;

/// A fixture could not be opened or read while streaming.
#[derive(Debug, thiserror::Error)]
#[error("failed to read fixture {}: {source}", .path.display())]
pub struct BodyError {
    /// The fixture being streamed.
    pub path: PathBuf,
    /// Underlying failure.
    #[source]
    pub source: io::Error,
}

/// Frames a [`FixtureSet`] as one `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct BodyAssembler {
    boundary: Boundary,
    fixtures: FixtureSet,
}

impl BodyAssembler {
    /// Frame `fixtures` using `boundary`.
    #[must_use]
    pub fn new(boundary: Boundary, fixtures: FixtureSet) -> Self {
        Self { boundary, fixtures }
    }

    /// The boundary used for every frame.
    #[must_use]
    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    /// The fixtures being framed.
    #[must_use]
    pub fn fixtures(&self) -> &FixtureSet {
        &self.fixtures
    }

    /// Exact length of the complete body, given the total fixture payload.
    #[must_use]
    pub fn content_length(&self, payload: u64) -> u64 {
        frame::content_length(&self.boundary, self.fixtures.len(), payload)
    }

    /// The complete body.
    #[must_use]
    pub fn stream(&self) -> BodyStream {
        BodyStream::new(self.boundary.clone(), self.fixtures.clone(), None)
    }

    /// A body cut short after `frames` complete parts.
    ///
    /// The last chunk is the opening delimiter of a part that never follows,
    /// which closes the final complete part for the receiver. `frames` is
    /// clamped to the fixture count.
    #[must_use]
    pub fn truncated_stream(&self, frames: usize) -> BodyStream {
        BodyStream::new(self.boundary.clone(), self.fixtures.clone(), Some(frames))
    }
}

enum State {
    /// Emit the next envelope, or the closing chunk.
    Envelope,
    Opening {
        path: PathBuf,
        open: BoxFuture<'static, io::Result<File>>,
    },
    Content {
        path: PathBuf,
        reader: ReaderStream<File>,
    },
    Done,
}

/// The outbound multipart body, see the [module docs](self).
pub struct BodyStream {
    boundary: Boundary,
    fixtures: FixtureSet,
    cut: Option<usize>,
    next: usize,
    state: State,
}

impl BodyStream {
    fn new(boundary: Boundary, fixtures: FixtureSet, cut: Option<usize>) -> Self {
        Self {
            boundary,
            fixtures,
            cut,
            next: 0,
            state: State::Envelope,
        }
    }

    /// Whether this body stops short of the global terminator.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.cut.is_some()
    }

    /// Number of parts whose content and frame end have been yielded.
    #[must_use]
    pub fn frames_completed(&self) -> usize {
        self.next
    }

    /// Number of parts this body will complete.
    #[must_use]
    pub fn frames_planned(&self) -> usize {
        self.cut
            .map_or(self.fixtures.len(), |cut| cut.min(self.fixtures.len()))
    }

    fn closing_chunk(&self) -> Bytes {
        if self.cut.is_some() {
            frame::delimiter(&self.boundary)
        } else {
            frame::tail(&self.boundary)
        }
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("boundary", &self.boundary)
            .field("files", &self.fixtures.len())
            .field("cut", &self.cut)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                State::Envelope => {
                    let fixture = match this.fixtures.get(this.next) {
                        Some(fixture) if this.next < this.frames_planned() => fixture,
                        _ => {
                            let last = this.closing_chunk();
                            this.state = State::Done;
                            return Poll::Ready(Some(Ok(last)));
                        }
                    };

                    let envelope = FrameEnvelope::for_position(&this.boundary, this.next);
                    let path = fixture.as_path().to_path_buf();

                    tracing::debug!(
                        file = %path.display(),
                        field = %envelope.field_name(),
                        "framing fixture"
                    );

                    this.state = State::Opening {
                        open: File::open(path.clone()).boxed(),
                        path,
                    };

                    return Poll::Ready(Some(Ok(envelope.to_bytes())));
                }
                State::Opening { path, open } => match ready!(open.as_mut().poll(cx)) {
                    Ok(file) => {
                        let path = std::mem::take(path);
                        this.state = State::Content {
                            path,
                            reader: ReaderStream::with_capacity(file, READ_CHUNK),
                        };
                    }
                    Err(source) => {
                        let path = std::mem::take(path);
                        this.state = State::Done;
                        return Poll::Ready(Some(Err(BodyError { path, source })));
                    }
                },
                State::Content { path, reader } => {
                    match ready!(Pin::new(reader).poll_next(cx)) {
                        Some(Ok(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                        Some(Err(source)) => {
                            let path = std::mem::take(path);
                            this.state = State::Done;
                            return Poll::Ready(Some(Err(BodyError { path, source })));
                        }
                        None => {
                            this.next += 1;
                            this.state = State::Envelope;
                            return Poll::Ready(Some(Ok(Bytes::from_static(FRAME_END))));
                        }
                    }
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}
