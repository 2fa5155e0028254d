//! StreamGateway - Vendor Video Source (go2rtc + playback API)
//!
//! ## Responsibilities
//!
//! - go2rtc API adapter (stream registration, listing, health)
//! - ResolveLocator: live -> relay restream URL, range -> playback API locator
//! - OpenFeed: relay / vendor MJPEG feed as discrete images

use crate::camera_directory::CameraSource;
use crate::error::{Error, Result};
use crate::frame_source::{FeedOpener, ImageStream, JpegDemuxer, LocatorResolver, TimeWindow};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Historical locator returned by the playback API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackLocator {
    pub url: String,
}

/// StreamGateway instance
pub struct StreamGateway {
    client: reqwest::Client,
    /// No overall timeout: feeds are long-lived bodies
    feed_client: reqwest::Client,
    base_url: String,
    rtsp_base: String,
    playback_url: Option<String>,
}

impl StreamGateway {
    /// Create new StreamGateway
    pub fn new(base_url: String, rtsp_base: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let feed_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            feed_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rtsp_base: rtsp_base.trim_end_matches('/').to_string(),
            playback_url: None,
        })
    }

    /// Enable historical windows via the vendor playback API
    pub fn with_playback(mut self, playback_url: Option<String>) -> Self {
        self.playback_url = playback_url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    /// Relay restream locator for a registered stream
    pub fn relay_locator(&self, name: &str) -> String {
        format!("{}/{}", self.rtsp_base, name)
    }

    /// Add a stream source to go2rtc
    ///
    /// Uses PUT /api/streams?name={name}&src={rtsp_url}
    pub async fn add_source(&self, name: &str, rtsp_url: &str) -> Result<()> {
        let url = format!(
            "{}/api/streams?name={}&src={}",
            self.base_url,
            urlencoding::encode(name),
            urlencoding::encode(rtsp_url)
        );

        let resp = self.client.put(&url).send().await?;

        // 400 can happen with yaml parse warnings but stream still added
        if resp.status().is_success() || resp.status().as_u16() == 400 {
            tracing::debug!(name = name, status = %resp.status(), "go2rtc stream add response");
            return Ok(());
        }

        Err(Error::SourceUnavailable(format!(
            "Failed to add stream source: {} - {}",
            resp.status(),
            resp.text().await.unwrap_or_default()
        )))
    }

    /// Add a stream source with retry
    pub async fn add_source_with_retry(&self, name: &str, rtsp_url: &str, retries: u32) -> Result<()> {
        let mut last_error = None;

        for attempt in 0..=retries {
            match self.add_source(name, rtsp_url).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < retries {
                        tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("Unknown error".to_string())))
    }

    /// Check if a stream exists in go2rtc
    pub async fn stream_exists(&self, name: &str) -> Result<bool> {
        let streams = self.list_streams().await?;
        Ok(streams.as_object().map(|o| o.contains_key(name)).unwrap_or(false))
    }

    /// Get all streams
    pub async fn list_streams(&self) -> Result<serde_json::Value> {
        let url = format!("{}/api/streams", self.base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::SourceUnavailable(format!(
                "Failed to list streams: {}",
                resp.status()
            )));
        }

        Ok(resp.json().await?)
    }

    /// Check go2rtc health
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api", self.base_url);
        let resp = self.client.get(&url).send().await?;
        Ok(resp.status().is_success())
    }

    async fn resolve_live(&self, camera: &CameraSource) -> Result<String> {
        let name = camera.camera_id.as_str();
        let registered = self.stream_exists(name).await.unwrap_or(false);

        if !registered {
            let Some(rtsp_url) = camera.rtsp_url.as_deref() else {
                return Err(Error::SourceUnavailable(format!(
                    "Camera {} has no stream source",
                    name
                )));
            };
            self.add_source_with_retry(name, rtsp_url, 2)
                .await
                .map_err(|e| Error::SourceUnavailable(format!("Relay registration failed: {}", e)))?;
            tracing::info!(camera_id = name, "Registered relay stream");
        }

        Ok(self.relay_locator(name))
    }

    async fn resolve_range(&self, camera: &CameraSource, window: &TimeWindow) -> Result<String> {
        let TimeWindow::Range { start, end } = window else {
            return self.resolve_live(camera).await;
        };
        let playback = self.playback_url.as_deref().ok_or_else(|| {
            Error::SourceUnavailable("No playback API configured for historical windows".to_string())
        })?;

        let mut query = vec![
            ("camera_id", camera.camera_id.clone()),
            ("start", start.to_rfc3339()),
        ];
        if let Some(end) = end {
            query.push(("end", end.to_rfc3339()));
        }

        let resp = self
            .client
            .get(format!("{}/api/playback/locator", playback))
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("Playback API unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::SourceUnavailable(format!(
                "No recording for {} from {}: {}",
                camera.camera_id,
                start,
                resp.status()
            )));
        }

        let locator: PlaybackLocator = resp
            .json()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("Invalid playback response: {}", e)))?;
        if locator.url.trim().is_empty() {
            return Err(Error::SourceUnavailable("Playback API returned an empty locator".to_string()));
        }
        Ok(locator.url)
    }
}

#[async_trait]
impl LocatorResolver for StreamGateway {
    async fn resolve_locator(&self, camera: &CameraSource, window: &TimeWindow) -> Result<String> {
        let locator = match window {
            TimeWindow::Live => self.resolve_live(camera).await?,
            TimeWindow::Range { .. } => self.resolve_range(camera, window).await?,
        };
        tracing::debug!(camera_id = %camera.camera_id, live = window.is_live(), "Locator resolved");
        Ok(locator)
    }
}

#[async_trait]
impl FeedOpener for StreamGateway {
    async fn open_feed(&self, camera: &CameraSource, window: &TimeWindow) -> Result<ImageStream> {
        if !window.is_live() {
            return Err(Error::SourceUnavailable(format!(
                "Camera {} has no historical image feed",
                camera.camera_id
            )));
        }

        let url = match &camera.feed_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/api/stream.mjpeg?src={}",
                self.base_url,
                urlencoding::encode(&camera.camera_id)
            ),
        };

        let resp = self
            .feed_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("Feed unreachable: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::SourceUnavailable(format!("Feed returned {}", resp.status())));
        }

        // Multipart part headers carry no SOI marker, so the demuxer skips them
        let mut demuxer = JpegDemuxer::default();
        let frames = resp
            .bytes_stream()
            .map(move |chunk| {
                let items: Vec<Result<bytes::Bytes>> = match chunk {
                    Ok(bytes) => demuxer.push(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(Error::Http(e))],
                };
                futures::stream::iter(items)
            })
            .flatten()
            .boxed();

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Streams = Arc<Mutex<HashMap<String, String>>>;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn relay(streams: Streams) -> Router {
        async fn list(State(s): State<Streams>) -> Json<serde_json::Value> {
            let names: serde_json::Map<String, serde_json::Value> = s
                .lock()
                .unwrap()
                .keys()
                .map(|k| (k.clone(), serde_json::json!({"producers": []})))
                .collect();
            Json(serde_json::Value::Object(names))
        }
        async fn add(State(s): State<Streams>, Query(q): Query<HashMap<String, String>>) {
            s.lock().unwrap().insert(q["name"].clone(), q["src"].clone());
        }
        async fn mjpeg() -> Vec<u8> {
            let mut body = Vec::new();
            for i in 0..2u8 {
                body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
                body.extend_from_slice(&[0xFF, 0xD8, i, 0xFF, 0xD9]);
                body.extend_from_slice(b"\r\n");
            }
            body
        }
        async fn playback(Query(q): Query<HashMap<String, String>>) -> axum::response::Response {
            use axum::response::IntoResponse;
            if q.get("camera_id").map(String::as_str) == Some("cam-001") {
                Json(PlaybackLocator {
                    url: format!("rtsp://nvr/playback/cam-001?start={}", q["start"]),
                })
                .into_response()
            } else {
                axum::http::StatusCode::NOT_FOUND.into_response()
            }
        }

        Router::new()
            .route("/api/streams", get(list).put(add))
            .route("/api/stream.mjpeg", get(mjpeg))
            .route("/api/playback/locator", get(playback))
            .with_state(streams)
    }

    fn camera() -> CameraSource {
        let mut camera = CameraSource::new("cam-001", "tapo");
        camera.rtsp_url = Some("rtsp://admin:x@192.168.1.20/stream1".to_string());
        camera
    }

    #[tokio::test]
    async fn test_live_registers_relay_source() {
        let streams: Streams = Arc::default();
        let base = serve(relay(streams.clone())).await;
        let gateway = StreamGateway::new(base, "rtsp://relay:8554".to_string()).unwrap();

        let locator = gateway.resolve_locator(&camera(), &TimeWindow::Live).await.unwrap();
        assert_eq!(locator, "rtsp://relay:8554/cam-001");
        assert_eq!(
            streams.lock().unwrap().get("cam-001").map(String::as_str),
            Some("rtsp://admin:x@192.168.1.20/stream1")
        );
    }

    #[tokio::test]
    async fn test_live_without_source_is_unavailable() {
        let base = serve(relay(Arc::default())).await;
        let gateway = StreamGateway::new(base, "rtsp://relay:8554".to_string()).unwrap();

        let bare = CameraSource::new("cam-404", "tapo");
        let result = gateway.resolve_locator(&bare, &TimeWindow::Live).await;
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_range_uses_playback_api() {
        let base = serve(relay(Arc::default())).await;
        let window = TimeWindow::Range {
            start: "2026-01-05T10:00:00Z".parse().unwrap(),
            end: None,
        };

        let without = StreamGateway::new(base.clone(), "rtsp://relay:8554".to_string()).unwrap();
        assert!(matches!(
            without.resolve_locator(&camera(), &window).await,
            Err(Error::SourceUnavailable(_))
        ));

        let gateway = StreamGateway::new(base.clone(), "rtsp://relay:8554".to_string())
            .unwrap()
            .with_playback(Some(base));
        let locator = gateway.resolve_locator(&camera(), &window).await.unwrap();
        assert!(locator.starts_with("rtsp://nvr/playback/cam-001?start=2026-01-05T10:00:00"));

        let other = CameraSource::new("cam-002", "tapo");
        assert!(matches!(
            gateway.resolve_locator(&other, &window).await,
            Err(Error::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_unavailable() {
        let gateway = StreamGateway::new("http://127.0.0.1:9".to_string(), "rtsp://relay:8554".to_string()).unwrap();
        let result = gateway.resolve_locator(&camera(), &TimeWindow::Live).await;
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_mjpeg_feed_yields_discrete_images() {
        let base = serve(relay(Arc::default())).await;
        let gateway = StreamGateway::new(base, "rtsp://relay:8554".to_string()).unwrap();

        let feed = gateway.open_feed(&camera(), &TimeWindow::Live).await.unwrap();
        let frames: Vec<_> = feed.collect().await;
        assert_eq!(frames.len(), 2);
        for (i, frame) in frames.into_iter().enumerate() {
            assert_eq!(&frame.unwrap()[..], &[0xFF, 0xD8, i as u8, 0xFF, 0xD9]);
        }
    }
}
