//! [`Transport`] over HTTP(S) using `reqwest`.

use std::collections::BTreeMap;

use reqwest::header::CONTENT_LENGTH;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method};
use tracing::trace;

use crate::error::TransportError;
use crate::transport::{ChunkRequest, ProgressSink, RequestBody, SendFuture, Transport, TransportResponse};

/// Body bytes handed to the connection per progress report.
const PIECE_SIZE: usize = 64 * 1024;

/// HTTP transport.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    /// Uses a preconfigured client (proxies, TLS roots, default headers).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn exchange(
        &self,
        request: ChunkRequest,
        progress: ProgressSink,
    ) -> Result<TransportResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::InvalidRequest(format!("method {}", request.method)))?;

        let mut builder = self.http.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        builder = match request.body {
            RequestBody::Binary(data) => {
                let len = data.len() as u64;
                builder
                    .header(CONTENT_LENGTH, len)
                    .body(streamed(data, progress))
            }
            RequestBody::Multipart {
                fields,
                file_field,
                file_name,
                mime_type,
                data,
            } => {
                let len = data.len() as u64;
                let part = Part::stream_with_length(streamed(data, progress), len)
                    .file_name(file_name)
                    .mime_str(&mime_type)?;
                let form = fields
                    .into_iter()
                    .fold(Form::new(), |form, (name, value)| form.text(name, value))
                    .part(file_field, part);
                builder.multipart(form)
            }
        };

        trace!(url = %request.url, seq = request.chunk.seq, "sending chunk");
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp.text().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: ChunkRequest, progress: ProgressSink) -> SendFuture<'_> {
        Box::pin(self.exchange(request, progress))
    }
}

/// Streams `data` in pieces, reporting the running total as each piece is
/// handed over.
fn streamed(data: Vec<u8>, progress: ProgressSink) -> Body {
    let total = data.len();
    let pieces = (0..total).step_by(PIECE_SIZE).map(move |offset| {
        let end = (offset + PIECE_SIZE).min(total);
        let piece = data[offset..end].to_vec();
        let _ = progress.send(end as u64);
        Ok::<_, std::io::Error>(piece)
    });
    Body::wrap_stream(futures_util::stream::iter(pieces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkDescriptor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Accepts one connection, captures the raw request and answers with
    /// `response`.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                if let Some(head_end) = find(&raw, b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&raw[..head_end]).to_lowercase();
                    let len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.unwrap();
            raw
        });
        (format!("http://{addr}/upload"), handle)
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn request(url: String, body: RequestBody) -> ChunkRequest {
        ChunkRequest {
            method: "POST".into(),
            url,
            headers: BTreeMap::from([("content-type".into(), "application/octet-stream".into())]),
            body,
            chunk: ChunkDescriptor::new(0, 0, 1, 5, "a.bin".into()),
        }
    }

    #[tokio::test]
    async fn binary_body_and_response_headers() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 200 OK\r\nX-Chunk: 0\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;
        let transport = HttpTransport::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let resp = transport
            .send(request(url, RequestBody::Binary(b"hello".to_vec())), tx)
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "ok");
        assert_eq!(resp.headers.get("x-chunk").map(String::as_str), Some("0"));
        assert_eq!(rx.recv().await, Some(5));

        let raw = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(raw.starts_with("POST /upload HTTP/1.1"));
        assert!(raw.ends_with("hello"));
    }

    #[tokio::test]
    async fn multipart_body_carries_fields() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let transport = HttpTransport::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let body = RequestBody::Multipart {
            fields: BTreeMap::from([("chunk".into(), "0".into())]),
            file_field: "file".into(),
            file_name: "a.bin".into(),
            mime_type: "application/octet-stream".into(),
            data: b"hello".to_vec(),
        };
        let mut req = request(url, body);
        req.headers.clear();
        let resp = transport.send(req, tx).await.unwrap();
        assert_eq!(resp.status, 500);

        let raw = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(raw.to_lowercase().contains("content-type: multipart/form-data"));
        assert!(raw.contains("name=\"chunk\""));
        assert!(raw.contains("name=\"file\"; filename=\"a.bin\""));
        assert!(raw.contains("hello"));
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport
            .send(
                request(format!("http://{addr}/"), RequestBody::Binary(vec![1])),
                tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}
