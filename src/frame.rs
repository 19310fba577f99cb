//! Multipart framing for fixture uploads.
//!
//! Every fixture becomes one part:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: text/plain\r\n
//! Content-Disposition: form-data; name="my_file<N>"; filename="my_file<N>"\r\n
//! Content-Transfer-Encoding: binary\r\n
//! \r\n
//! <raw bytes>\r\n
//! ```
//!
//! and the body closes with `\r\n--<boundary>--\r\n`.

use bytes::Bytes;

use crate::boundary::Boundary;

/// File indices start above this offset; the first part is `my_file1001`.
pub const FILE_INDEX_OFFSET: u64 = 1000;

/// Bytes written after each file's content.
pub const FRAME_END: &[u8] = b"\r\n";

/// The header block that precedes one file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEnvelope {
    index: u64,
    header: Bytes,
}

impl FrameEnvelope {
    /// Build the envelope for the part numbered `index`.
    #[must_use]
    pub fn new(boundary: &Boundary, index: u64) -> Self {
        let header = format!(
            "--{boundary}\r\n\
             Content-Type: text/plain\r\n\
             Content-Disposition: form-data; name=\"my_file{index}\"; filename=\"my_file{index}\"\r\n\
             Content-Transfer-Encoding: binary\r\n\
             \r\n"
        );

        Self {
            index,
            header: Bytes::from(header),
        }
    }

    /// Build the envelope for the fixture at `position` in enumeration order.
    #[must_use]
    pub fn for_position(boundary: &Boundary, position: usize) -> Self {
        Self::new(boundary, file_index(position))
    }

    /// The numeric index used in the field and file name.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The field (and file) name, `my_file<N>`.
    #[must_use]
    pub fn field_name(&self) -> String {
        format!("my_file{}", self.index)
    }

    /// Length of the header block in bytes.
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.header.len()
    }

    /// The encoded header block.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.header.clone()
    }
}

/// Wire index of the fixture at `position`.
#[must_use]
pub fn file_index(position: usize) -> u64 {
    FILE_INDEX_OFFSET + position as u64 + 1
}

/// Global terminator, `\r\n--<boundary>--\r\n`.
#[must_use]
pub fn tail(boundary: &Boundary) -> Bytes {
    Bytes::from(format!("\r\n--{boundary}--\r\n"))
}

/// Opening delimiter of a part, `--<boundary>\r\n`.
///
/// Sent on its own this closes the preceding part without starting a
/// complete new one.
#[must_use]
pub fn delimiter(boundary: &Boundary) -> Bytes {
    Bytes::from(format!("--{boundary}\r\n"))
}

/// Exact body length for `files` parts carrying `payload` bytes in total.
#[must_use]
pub fn content_length(boundary: &Boundary, files: usize, payload: u64) -> u64 {
    let framing: u64 = (0..files)
        .map(|position| (FrameEnvelope::for_position(boundary, position).len() + FRAME_END.len()) as u64)
        .sum();

    payload + framing + tail(boundary).len() as u64
}

#[cfg(test)]
mod tests {
    use super::{content_length, delimiter, file_index, tail, FrameEnvelope, FRAME_END};
    use crate::boundary::Boundary;

    #[test]
    fn envelope_matches_wire_format() {
        let envelope = FrameEnvelope::for_position(&Boundary::new("42"), 0);

        assert_eq!(envelope.index(), 1001);
        assert_eq!(envelope.field_name(), "my_file1001");
        assert_eq!(
            &envelope.to_bytes()[..],
            b"--42\r\nContent-Type: text/plain\r\nContent-Disposition: form-data; name=\"my_file1001\"; filename=\"my_file1001\"\r\nContent-Transfer-Encoding: binary\r\n\r\n"
        );
    }

    #[test]
    fn terminators() {
        let boundary = Boundary::new("42");
        assert_eq!(&tail(&boundary)[..], b"\r\n--42--\r\n");
        assert_eq!(&delimiter(&boundary)[..], b"--42\r\n");
    }

    #[test]
    fn empty_body_is_only_the_tail() {
        let boundary = Boundary::new("0123456789");
        assert_eq!(
            content_length(&boundary, 0, 0),
            tail(&boundary).len() as u64
        );
    }

    #[test]
    fn length_accounts_for_every_envelope() {
        let boundary = Boundary::new("42");
        assert_eq!(FrameEnvelope::for_position(&boundary, 0).len(), 145);

        // 5 payload bytes + 145 envelope + 2 frame end + 10 tail
        assert_eq!(content_length(&boundary, 1, 5), 162);
        assert_eq!(
            content_length(&boundary, 2, 5),
            5 + 2 * (145 + FRAME_END.len() as u64) + 10
        );
    }

    #[test]
    fn index_width_changes_envelope_length() {
        let boundary = Boundary::new("b");
        let short = FrameEnvelope::new(&boundary, 9_999);
        let long = FrameEnvelope::new(&boundary, 10_000);

        // two occurrences of the index
        assert_eq!(long.len(), short.len() + 2);
        assert_eq!(file_index(8_998), 9_999);
    }
}
