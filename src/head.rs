//! HTTP/1.1 head parsing shared by the driver and the server.

use http::{
    header::{HeaderName, InvalidHeaderName, InvalidHeaderValue},
    HeaderMap, HeaderValue,
};
use memchr::memmem;

/// Maximum number of headers accepted in one head.
pub const MAX_HEADERS: usize = 32;

/// Maximum size of a head section (16 KiB).
pub const MAX_HEADER_SECTION_SIZE: usize = 16 << 10;

/// Headers parsing error.
#[derive(Debug, thiserror::Error)]
pub enum ParseHeadersError {
    /// Failed to parse the HTTP header section.
    #[error("{0}")]
    Http(#[from] httparse::Error),

    /// Invalid header name.
    #[error("{0}")]
    InvalidName(#[from] InvalidHeaderName),

    /// Invalid header value.
    #[error("{0}")]
    InvalidValue(#[from] InvalidHeaderValue),

    /// The head exceeds [`MAX_HEADER_SECTION_SIZE`] or [`MAX_HEADERS`].
    #[error("header section too large")]
    HeaderOverflow,

    /// The head ended before `\r\n\r\n`.
    #[error("incomplete header section")]
    Incomplete,
}

/// Length of the head in `buf`, including the blank line, if it is complete.
pub(crate) fn head_len(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, b"\r\n\r\n").map(|idx| idx + 4)
}

/// Copy parsed `httparse` headers into a [`HeaderMap`].
pub(crate) fn header_map(hdrs: &[httparse::Header<'_>]) -> Result<HeaderMap, ParseHeadersError> {
    let mut headers = HeaderMap::with_capacity(hdrs.len());

    for h in hdrs {
        let name = HeaderName::try_from(h.name)?;
        let value = HeaderValue::try_from(h.value)?;

        headers.append(name, value);
    }

    Ok(headers)
}

/// The `Content-Length` header as a number.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
