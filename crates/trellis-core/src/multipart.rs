//! `multipart/form-data` parsing.
//!
//! Bodies are already buffered by the time handlers run, so the whole form
//! is parsed in one pass into a [`MultipartForm`].

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use http::{header, HeaderMap};

use crate::error::{Error, Result};

/// Default maximum size of a single part (10 MB).
pub const DEFAULT_MAX_FIELD_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum number of parts.
pub const DEFAULT_MAX_FIELDS: usize = 100;

/// Limits applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartConfig {
    /// Maximum size per part in bytes.
    pub max_field_size: usize,
    /// Maximum number of parts.
    pub max_fields: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_fields: DEFAULT_MAX_FIELDS,
        }
    }
}

impl MultipartConfig {
    /// Sets the per-part limit.
    #[must_use]
    pub fn max_field_size(mut self, size: usize) -> Self {
        self.max_field_size = size;
        self
    }

    /// Sets the part count limit.
    #[must_use]
    pub fn max_fields(mut self, count: usize) -> Self {
        self.max_fields = count;
        self
    }
}

/// An uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Form field name.
    pub field: String,
    /// Client-supplied file name.
    pub filename: String,
    /// Declared content type, if any.
    pub content_type: Option<String>,
    /// File contents.
    pub data: Bytes,
}

impl FileHeader {
    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Writes the contents to `path`.
    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, &self.data).await?;
        Ok(())
    }
}

/// A parsed multipart form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    /// Text fields by name, in submission order.
    pub values: HashMap<String, Vec<String>>,
    /// File fields by name, in submission order.
    pub files: HashMap<String, Vec<FileHeader>>,
}

impl MultipartForm {
    /// Parses `body` using the boundary from `headers`.
    pub async fn parse(headers: &HeaderMap, body: Bytes, config: MultipartConfig) -> Result<Self> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::bad_request("missing multipart Content-Type"))?;
        let boundary = multer::parse_boundary(content_type)
            .map_err(|_| Error::bad_request("missing or invalid multipart boundary"))?;

        let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut form = Self::default();
        let mut count = 0;
        while let Some(field) = multipart.next_field().await? {
            count += 1;
            if count > config.max_fields {
                return Err(Error::Multipart(format!(
                    "too many fields (max {})",
                    config.max_fields
                )));
            }

            let name = field.name().unwrap_or_default().to_string();
            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(ToString::to_string);
            let data = field.bytes().await?;
            if data.len() > config.max_field_size {
                return Err(Error::new(
                    http::StatusCode::PAYLOAD_TOO_LARGE,
                    format!("field '{name}' exceeds {} bytes", config.max_field_size),
                ));
            }

            match filename {
                Some(filename) => form.files.entry(name.clone()).or_default().push(FileHeader {
                    field: name,
                    filename,
                    content_type,
                    data,
                }),
                None => {
                    let text = String::from_utf8(data.to_vec()).map_err(|_| {
                        Error::Multipart(format!("field '{name}' is not valid UTF-8"))
                    })?;
                    form.values.entry(name).or_default().push(text);
                }
            }
        }
        Ok(form)
    }

    /// First value of a text field.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// First file of a file field.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&FileHeader> {
        self.files.get(name).and_then(|v| v.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn form_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=XyZ"),
        );
        headers
    }

    fn body() -> Bytes {
        Bytes::from(
            "--XyZ\r\n\
             Content-Disposition: form-data; name=\"title\"\r\n\r\n\
             hello\r\n\
             --XyZ\r\n\
             Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             file body\r\n\
             --XyZ--\r\n",
        )
    }

    #[tokio::test]
    async fn test_parse_values_and_files() {
        let form = MultipartForm::parse(&form_headers(), body(), MultipartConfig::default())
            .await
            .unwrap();
        assert_eq!(form.value("title"), Some("hello"));
        let file = form.file("doc").unwrap();
        assert_eq!(file.filename, "a.txt");
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(&file.data[..], b"file body");
        assert_eq!(file.size(), 9);
    }

    #[tokio::test]
    async fn test_field_limit() {
        let config = MultipartConfig::default().max_fields(1);
        let err = MultipartForm::parse(&form_headers(), body(), config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Multipart(_)));
    }

    #[tokio::test]
    async fn test_missing_boundary() {
        let err = MultipartForm::parse(&HeaderMap::new(), body(), MultipartConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_save_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let form = MultipartForm::parse(&form_headers(), body(), MultipartConfig::default())
            .await
            .unwrap();
        let target = dir.path().join("upload.txt");
        form.file("doc").unwrap().save_to(&target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"file body");
    }
}
