//! `multipart/form-data` body encoding.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// One named part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub data: Bytes,
}

/// An ordered list of parts plus the boundary that separates them.
///
/// Encoding is deterministic for a fixed boundary, so the same form always
/// yields byte-identical bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<MultipartPart>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    /// A form with a random boundary.
    pub fn new() -> Self {
        Self::with_boundary(format!("netkit-{}", Uuid::new_v4().simple()))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    pub fn part(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            filename: None,
            mime_type: None,
            data: data.into(),
        });
        self
    }

    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.part(name, Bytes::from(value.into()))
    }

    pub fn file_part(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            filename: Some(filename.into()),
            mime_type: Some(mime_type.into()),
            data: data.into(),
        });
        self
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn encode(&self) -> Bytes {
        let size = self
            .parts
            .iter()
            .map(|p| p.data.len() + self.boundary.len() + 128)
            .sum::<usize>()
            + self.boundary.len()
            + 8;
        let mut out = BytesMut::with_capacity(size);

        for part in &self.parts {
            out.put_slice(b"--");
            out.put_slice(self.boundary.as_bytes());
            out.put_slice(b"\r\n");
            out.put_slice(b"Content-Disposition: form-data; name=\"");
            out.put_slice(part.name.as_bytes());
            out.put_slice(b"\"");
            if let Some(filename) = &part.filename {
                out.put_slice(b"; filename=\"");
                out.put_slice(filename.as_bytes());
                out.put_slice(b"\"");
            }
            out.put_slice(b"\r\n");
            if let Some(mime) = &part.mime_type {
                out.put_slice(b"Content-Type: ");
                out.put_slice(mime.as_bytes());
                out.put_slice(b"\r\n");
            }
            out.put_slice(b"\r\n");
            out.put_slice(&part.data);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"--");
        out.put_slice(self.boundary.as_bytes());
        out.put_slice(b"--\r\n");
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_parts_in_order() {
        let form = MultipartForm::with_boundary("B")
            .text("title", "cat")
            .file_part("photo", "cat.png", "image/png", &b"\x89PNG"[..]);

        let expected = b"--B\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
cat\r\n\
--B\r\n\
Content-Disposition: form-data; name=\"photo\"; filename=\"cat.png\"\r\n\
Content-Type: image/png\r\n\
\r\n\
\x89PNG\r\n\
--B--\r\n";
        assert_eq!(&form.encode()[..], &expected[..]);
    }

    #[test]
    fn encoding_is_deterministic_for_fixed_boundary() {
        let build = || {
            MultipartForm::with_boundary("fixed")
                .part("a", Bytes::from_static(b"1"))
                .file_part("b", "b.txt", "text/plain", Bytes::from_static(b"two"))
        };
        assert_eq!(build().encode(), build().encode());
        let form = build();
        assert_eq!(form.encode(), form.encode());
    }

    #[test]
    fn empty_form_is_just_the_closing_delimiter() {
        assert_eq!(&MultipartForm::with_boundary("x").encode()[..], b"--x--\r\n");
    }

    #[test]
    fn generated_boundaries_are_unique() {
        let a = MultipartForm::new();
        let b = MultipartForm::new();
        assert!(a.boundary().starts_with("netkit-"));
        assert_ne!(a.boundary(), b.boundary());
        assert_eq!(a.content_type(), format!("multipart/form-data; boundary={}", a.boundary()));
    }
}
