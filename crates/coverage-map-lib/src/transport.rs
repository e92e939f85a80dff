//! Chunk retrieval transport
//!
//! The scheduler is generic over [`ChunkTransport`] so the network edge stays
//! swappable: production uses [`HttpChunkTransport`] against the layer-data
//! endpoint, tests use in-memory mocks.

use crate::layer::{ChunkEnvelope, LayerId, ViewContext};
use crate::{FetchError, Result};

/// One paginated chunk request.
///
/// Priority is advisory (lower = more urgent): it shapes batch composition in
/// the loader and is deliberately excluded from the dedup key, since two
/// callers asking for the same chunk at different priorities still want the
/// same bytes.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub layer_id: LayerId,
    pub chunk_id: u32,
    pub bounds: String,
    pub zoom: u8,
    pub priority: i32,
}

impl ChunkRequest {
    pub fn new(layer_id: LayerId, chunk_id: u32, view: &ViewContext, priority: i32) -> Self {
        Self {
            layer_id,
            chunk_id,
            bounds: view.bounds_param(),
            zoom: view.zoom,
            priority,
        }
    }

    /// Dedup key: equivalent of url + query params.
    pub fn dedup_key(&self) -> String {
        format!(
            "layer/{}?chunk_id={}&bounds={}&zoom={}",
            self.layer_id, self.chunk_id, self.bounds, self.zoom
        )
    }
}

/// Transport seam for fetching one chunk.
#[allow(async_fn_in_trait)]
pub trait ChunkTransport: Send + Sync {
    async fn fetch(&self, req: &ChunkRequest) -> Result<ChunkEnvelope>;
}

/// HTTP transport against the layer-data endpoint:
/// `GET {base}/{layer_id}/?chunk_id=N&bounds=...&zoom=Z`.
pub struct HttpChunkTransport {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpChunkTransport {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("coverage-map-lib/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }
}

impl ChunkTransport for HttpChunkTransport {
    async fn fetch(&self, req: &ChunkRequest) -> Result<ChunkEnvelope> {
        let url = format!("{}/{}/", self.base_url, req.layer_id);
        let mut call = self.client.get(&url).query(&[
            ("chunk_id", req.chunk_id.to_string()),
            ("bounds", req.bounds.clone()),
            ("zoom", req.zoom.to_string()),
        ]);
        if let Some(token) = &self.access_token {
            call = call.bearer_auth(token);
        }

        let response = call
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .json::<ChunkEnvelope>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Coord, Rect};

    fn view() -> ViewContext {
        ViewContext {
            bounds: Rect::new(Coord { x: -1.0, y: -2.0 }, Coord { x: 3.0, y: 4.0 }),
            zoom: 9,
        }
    }

    #[test]
    fn dedup_key_covers_url_and_params() {
        let req = ChunkRequest::new(42, 3, &view(), 5);
        assert_eq!(req.dedup_key(), "layer/42?chunk_id=3&bounds=-1,-2,3,4&zoom=9");
    }

    #[test]
    fn dedup_key_ignores_priority() {
        let urgent = ChunkRequest::new(42, 3, &view(), 1);
        let relaxed = ChunkRequest::new(42, 3, &view(), 9);
        assert_eq!(urgent.dedup_key(), relaxed.dedup_key());
    }

    #[test]
    fn transport_normalizes_trailing_slash() {
        let transport = HttpChunkTransport::new("https://example.test/layers/", None).unwrap();
        assert_eq!(transport.base_url, "https://example.test/layers");
    }
}
