// Replayable outbound request bodies

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::RequestBuilder;
use serde_json::Value;
use std::io;
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Body of an upstream request. Rebuilt for every attempt so retries and
/// token-refresh replays send exactly the same payload.
#[derive(Debug, Default)]
pub enum OutboundBody {
    #[default]
    Empty,
    Raw {
        bytes: Bytes,
        content_type: Option<String>,
    },
    Json(Value),
    Multipart(MultipartPayload),
}

impl OutboundBody {
    pub fn raw(bytes: Bytes, content_type: Option<String>) -> Self {
        if bytes.is_empty() {
            return OutboundBody::Empty;
        }
        OutboundBody::Raw {
            bytes,
            content_type,
        }
    }

    pub async fn apply(&self, builder: RequestBuilder) -> io::Result<RequestBuilder> {
        let builder = match self {
            OutboundBody::Empty => builder,
            OutboundBody::Raw {
                bytes,
                content_type,
            } => {
                let builder = match content_type {
                    Some(ct) => builder.header(CONTENT_TYPE, ct.as_str()),
                    None => builder,
                };
                builder.body(bytes.clone())
            }
            OutboundBody::Json(value) => builder.json(value),
            OutboundBody::Multipart(payload) => builder.multipart(payload.to_form().await?),
        };
        Ok(builder)
    }
}

#[derive(Debug)]
struct SpooledFile {
    field: String,
    file_name: Option<String>,
    content_type: Option<String>,
    len: u64,
    path: TempPath,
}

/// Multipart fields plus file parts spooled to temporary files.
///
/// Only the first value of a repeated scalar field is kept. File parts are
/// read back from disk as a stream each time a form is built, and the spool
/// files are removed when the payload is dropped.
#[derive(Debug, Default)]
pub struct MultipartPayload {
    fields: Vec<(String, String)>,
    files: Vec<SpooledFile>,
}

impl MultipartPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, name: &str, value: String) {
        if self.fields.iter().any(|(existing, _)| existing == name) {
            tracing::debug!(field = %name, "Dropping repeated multipart field");
            return;
        }
        self.fields.push((name.to_string(), value));
    }

    /// Spool a file part to disk without holding it in memory.
    pub async fn add_file<S, E>(
        &mut self,
        field: &str,
        file_name: Option<String>,
        content_type: Option<String>,
        chunks: S,
    ) -> io::Result<u64>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (file, path) = NamedTempFile::new()?.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut len = 0u64;

        let mut chunks = std::pin::pin!(chunks);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            file.write_all(&chunk).await?;
            len += chunk.len() as u64;
        }
        file.flush().await?;

        self.files.push(SpooledFile {
            field: field.to_string(),
            file_name,
            content_type,
            len,
            path,
        });
        Ok(len)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Assemble a fresh form (and therefore a fresh boundary).
    pub async fn to_form(&self) -> io::Result<Form> {
        let mut form = Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }

        for file in &self.files {
            let handle = tokio::fs::File::open(&file.path).await?;
            let stream = reqwest::Body::wrap_stream(ReaderStream::new(handle));
            let mut part = Part::stream_with_length(stream, file.len);
            if let Some(name) = &file.file_name {
                part = part.file_name(name.clone());
            }
            if let Some(content_type) = &file.content_type {
                part = part
                    .mime_str(content_type)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            }
            form = form.part(file.field.clone(), part);
        }
        Ok(form)
    }
}
