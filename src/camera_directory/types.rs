//! CameraDirectory data types

use serde::{Deserialize, Serialize};

/// How a start request names its camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraSelector {
    /// Camera config ID (camera_id in the camera registry)
    ConfigId(String),
    /// Vendor-facing camera reference (LacisID)
    Ref(String),
}

impl std::fmt::Display for CameraSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraSelector::ConfigId(id) => write!(f, "config:{}", id),
            CameraSelector::Ref(r) => write!(f, "ref:{}", r),
        }
    }
}

/// Camera record as served by the camera registry
///
/// Only the fields this gateway reads; the registry serves many more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraRecord {
    pub camera_id: String,
    /// Vendor family (e.g. "tapo", "hikvision", "nest")
    pub family: String,
    #[serde(default)]
    pub lacis_id: Option<String>,
    #[serde(default)]
    pub rtsp_main: Option<String>,
    #[serde(default)]
    pub rtsp_sub: Option<String>,
    #[serde(default)]
    pub rtsp_username: Option<String>,
    #[serde(default)]
    pub rtsp_password: Option<String>,
    /// Discrete-image feed URL for direct-feed vendors
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Resolved camera source handed to frame source adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSource {
    pub camera_id: String,
    pub family: String,
    /// RTSP URL with credentials applied
    pub rtsp_url: Option<String>,
    pub feed_url: Option<String>,
}

impl CameraSource {
    /// Minimal source for a camera known only by ID and family
    pub fn new(camera_id: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            family: family.into(),
            rtsp_url: None,
            feed_url: None,
        }
    }
}

impl From<CameraRecord> for CameraSource {
    fn from(record: CameraRecord) -> Self {
        let rtsp_url = record
            .rtsp_main
            .or(record.rtsp_sub)
            .map(|url| with_credentials(&url, record.rtsp_username.as_deref(), record.rtsp_password.as_deref()));

        Self {
            camera_id: record.camera_id,
            family: record.family.to_lowercase(),
            rtsp_url,
            feed_url: record.feed_url,
        }
    }
}

/// Insert RTSP credentials unless the URL already carries userinfo
pub fn with_credentials(url: &str, username: Option<&str>, password: Option<&str>) -> String {
    let Some(user) = username.filter(|u| !u.is_empty()) else {
        return url.to_string();
    };
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.contains('@') {
        return url.to_string();
    }

    let userinfo = match password.filter(|p| !p.is_empty()) {
        Some(pass) => format!("{}:{}", urlencoding::encode(user), urlencoding::encode(pass)),
        None => urlencoding::encode(user).into_owned(),
    };
    format!("{}://{}@{}", scheme, userinfo, rest)
}
