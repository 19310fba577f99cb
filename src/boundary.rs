//! Multipart boundary tokens.

use http::{header, HeaderMap};
use mime::Mime;
use rand::Rng;

/// Boundary extraction error.
#[derive(Debug, thiserror::Error)]
pub enum InvalidBoundary {
    /// `Content-Type` header missing.
    #[error("missing content-type")]
    NoContentType,

    /// `Content-Type` could not be parsed.
    #[error("failed to parse the content-type header")]
    ParseContentType,

    /// Not a `multipart/form-data` body.
    #[error("not a multipart/form-data body")]
    NotFormData,

    /// No boundary specified.
    #[error("no boundary specified")]
    NoBoundary,
}

impl From<mime::FromStrError> for InvalidBoundary {
    fn from(_: mime::FromStrError) -> Self {
        Self::ParseContentType
    }
}

/// A multipart boundary.
///
/// One boundary is generated per run and threaded through everything that
/// frames or parses the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(String);

impl AsRef<str> for Boundary {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Boundary {
    /// Construct a new [`Boundary`].
    pub fn new(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    /// Generate a random, purely numeric boundary of 16 to 19 digits.
    #[must_use]
    pub fn random() -> Self {
        let token: u64 = rand::thread_rng().gen_range(10u64.pow(15)..10u64.pow(19));
        Self(token.to_string())
    }

    /// Convert a header into a [`Boundary`].
    ///
    /// # Errors
    ///
    /// - invalid mime type
    /// - mime is not `multipart/form-data`
    /// - mime has no boundary parameter
    pub fn try_from_header(h: &str) -> Result<Self, InvalidBoundary> {
        Self::try_from(&h.parse::<Mime>()?)
    }

    /// The `multipart/form-data` content type announcing this boundary.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("{}; boundary={}", mime::MULTIPART_FORM_DATA, self.0)
    }

    /// Get the length of the boundary in bytes.
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Get the boundary as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<&Mime> for Boundary {
    type Error = InvalidBoundary;

    fn try_from(value: &Mime) -> Result<Self, Self::Error> {
        if value.type_() != mime::MULTIPART || value.subtype() != mime::FORM_DATA {
            return Err(InvalidBoundary::NotFormData);
        }

        value
            .get_param(mime::BOUNDARY)
            .ok_or(InvalidBoundary::NoBoundary)
            .map(|n| Self::new(n.to_string()))
    }
}

impl TryFrom<&HeaderMap> for Boundary {
    type Error = InvalidBoundary;

    fn try_from(value: &HeaderMap) -> Result<Self, Self::Error> {
        let ct = value
            .get(header::CONTENT_TYPE)
            .ok_or(InvalidBoundary::NoContentType)?
            .to_str()
            .map_err(|_| InvalidBoundary::ParseContentType)?;

        Boundary::try_from_header(ct)
    }
}

#[cfg(test)]
mod tests {
    use http::{header, HeaderMap, HeaderValue};

    use super::{Boundary, InvalidBoundary};

    #[test]
    fn random_boundary_is_numeric() {
        let boundary = Boundary::random();
        assert!(boundary.len() >= 16);
        assert!(boundary.as_ref().bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn content_type_round_trips_through_headers() {
        let boundary = Boundary::new("123456");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&boundary.content_type()).unwrap(),
        );

        assert_eq!(Boundary::try_from(&headers).unwrap(), boundary);
    }

    #[test]
    fn rejects_missing_boundary() {
        assert!(matches!(
            Boundary::try_from_header("multipart/form-data"),
            Err(InvalidBoundary::NoBoundary)
        ));
    }

    #[test]
    fn rejects_other_content_types() {
        assert!(matches!(
            Boundary::try_from_header("text/plain; boundary=xoxo"),
            Err(InvalidBoundary::NotFormData)
        ));
        assert!(matches!(
            Boundary::try_from(&HeaderMap::new()),
            Err(InvalidBoundary::NoContentType)
        ));
    }
}
