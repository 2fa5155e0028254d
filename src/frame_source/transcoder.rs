//! Supervised transcoding process (ffmpeg)
//!
//! Spawns the transcoder with its argument contract (input locator, target
//! frame rate, MJPEG image2pipe output) and owns the process handle and its
//! output pipes until `shutdown`.

use super::types::{Resolution, StartParams};
use crate::error::{Error, Result};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default target frame rate
pub const DEFAULT_FPS: u32 = 15;
/// Default per-read timeout on transcoder output (10 seconds)
pub const DEFAULT_READ_TIMEOUT_SEC: u64 = 10;
/// Default wait after SIGTERM before SIGKILL
pub const DEFAULT_STOP_GRACE_MS: u64 = 2000;

/// Transcoder configuration
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Executable (ffmpeg)
    pub program: String,
    /// Argument template replacing the ffmpeg defaults
    ///
    /// Placeholders: `{input}`, `{fps}`, `{filter}`
    pub args: Option<Vec<String>>,
    pub fps: u32,
    pub read_timeout: Duration,
    pub stop_grace: Duration,
    pub read_chunk: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: None,
            fps: DEFAULT_FPS,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SEC),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            read_chunk: 64 * 1024,
        }
    }
}

impl TranscoderConfig {
    /// Video filter chain: speed, frame rate, optional scale
    pub fn filter(&self, speed: f32, resolution: Option<Resolution>) -> String {
        let mut chain = Vec::new();
        if (speed - 1.0).abs() > f32::EPSILON && speed > 0.0 {
            chain.push(format!("setpts=PTS/{}", speed));
        }
        chain.push(format!("fps={}", self.fps));
        if let Some(r) = resolution {
            chain.push(format!("scale={}:{}", r.width, r.height));
        }
        chain.join(",")
    }

    /// Full argument list for one locator
    pub fn build_args(&self, locator: &str, params: &StartParams) -> Vec<String> {
        let filter = self.filter(params.speed, params.resolution);
        let fps = self.fps.to_string();

        if let Some(template) = &self.args {
            return template
                .iter()
                .map(|a| {
                    a.replace("{input}", locator)
                        .replace("{fps}", &fps)
                        .replace("{filter}", &filter)
                })
                .collect();
        }

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if locator.starts_with("rtsp://") || locator.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        }
        args.extend([
            "-i".to_string(),
            locator.to_string(),
            "-an".to_string(),
            "-vf".to_string(),
            filter,
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "mjpeg".to_string(),
            "-q:v".to_string(),
            "5".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }
}

/// How the process ended
#[derive(Debug)]
pub(crate) struct ExitSummary {
    pub status: Option<ExitStatus>,
    /// Last stderr line, for error reporting
    pub last_error: Option<String>,
}

impl ExitSummary {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn describe(&self) -> String {
        let status = match self.status {
            Some(s) => s.to_string(),
            None => "unknown exit".to_string(),
        };
        match &self.last_error {
            Some(line) => format!("{} ({})", status, line),
            None => status,
        }
    }
}

/// A running transcoder; dropping it kills the process
pub(crate) struct TranscoderProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<Option<String>>>,
    read_timeout: Duration,
    pid: Option<u32>,
}

impl TranscoderProcess {
    pub fn spawn(config: &TranscoderConfig, locator: &str, params: &StartParams) -> Result<Self> {
        let args = config.build_args(locator, params);

        let mut child = Command::new(&config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Configuration(format!("Transcoder spawn failed ({}): {}", config.program, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Configuration("Transcoder stdout not captured".to_string()))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let session_id = params.session_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut last = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %session_id, line = %line, "transcoder stderr");
                    last = Some(line);
                }
                last
            })
        });

        let pid = child.id();
        tracing::info!(
            session_id = %params.session_id,
            pid = ?pid,
            program = %config.program,
            "Transcoder started"
        );

        Ok(Self {
            child,
            stdout: Some(stdout),
            stderr_task,
            read_timeout: config.read_timeout,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// One bounded read from the output stream
    ///
    /// `Err(Timeout)` when nothing arrives within the read timeout.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| Error::ChannelClosed("transcoder output released".to_string()))?;

        match timeout(self.read_timeout, stdout.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout(format!(
                "no transcoder output for {}ms",
                self.read_timeout.as_millis()
            ))),
        }
    }

    /// Wait for a natural exit (after end of output)
    pub async fn wait_exit(&mut self, bound: Duration) -> Option<ExitStatus> {
        timeout(bound, self.child.wait()).await.ok().and_then(|r| r.ok())
    }

    /// Terminate and reap: SIGTERM, bounded wait, SIGKILL
    ///
    /// Releases the output reader and the process handle on every path.
    pub async fn shutdown(mut self, grace: Duration) -> ExitSummary {
        drop(self.stdout.take());

        let status = match self.child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                self.signal_terminate();
                match timeout(grace, self.child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        tracing::warn!(pid = ?self.pid, "Transcoder ignored SIGTERM, killing");
                        let _ = self.child.start_kill();
                        timeout(grace, self.child.wait()).await.ok().and_then(|r| r.ok())
                    }
                }
            }
        };

        let last_error = match self.stderr_task.take() {
            Some(task) => timeout(Duration::from_millis(200), task)
                .await
                .ok()
                .and_then(|r| r.ok())
                .flatten(),
            None => None,
        };

        tracing::debug!(pid = ?self.pid, status = ?status, "Transcoder reaped");
        ExitSummary { status, last_error }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain kill(2) on our own child's PID, which is not yet reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Check the transcoder is installed; returns its version line
pub async fn check_transcoder(program: &str) -> Result<String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .await
        .map_err(|e| Error::Configuration(format!("{} not found: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::Configuration(format!("{} version check failed", program)));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    let first_line = version.lines().next().unwrap_or("unknown");
    Ok(first_line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_directory::CameraSource;
    use crate::frame_source::TimeWindow;

    fn params(speed: f32, resolution: Option<Resolution>) -> StartParams {
        StartParams {
            session_id: uuid::Uuid::new_v4(),
            camera: CameraSource::new("cam-001", "tapo"),
            window: TimeWindow::Live,
            resolution,
            speed,
        }
    }

    #[test]
    fn test_default_args_for_rtsp() {
        let config = TranscoderConfig::default();
        let args = config.build_args("rtsp://relay:8554/cam-001", &params(1.0, None));
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp -i rtsp://relay:8554/cam-001"));
        assert!(joined.contains("-vf fps=15"));
        assert!(joined.ends_with("-f image2pipe -vcodec mjpeg -q:v 5 pipe:1"));
    }

    #[test]
    fn test_filter_with_speed_and_scale() {
        let config = TranscoderConfig::default();
        let filter = config.filter(2.0, Some(Resolution { width: 640, height: 360 }));
        assert_eq!(filter, "setpts=PTS/2,fps=15,scale=640:360");
    }

    #[test]
    fn test_template_placeholders() {
        let config = TranscoderConfig {
            program: "sh".to_string(),
            args: Some(vec!["-c".into(), "echo {fps}".into(), "{input}".into()]),
            ..Default::default()
        };
        let args = config.build_args("file:///tmp/x.mp4", &params(1.0, None));
        assert_eq!(args, vec!["-c", "echo 15", "file:///tmp/x.mp4"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_configuration_error() {
        let result = check_transcoder("definitely-not-a-transcoder-binary").await;
        assert!(matches!(result, Err(Error::Configuration(_))));

        let config = TranscoderConfig {
            program: "definitely-not-a-transcoder-binary".to_string(),
            ..Default::default()
        };
        let spawned = TranscoderProcess::spawn(&config, "rtsp://x", &params(1.0, None));
        assert!(matches!(spawned, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_sleeping_process() {
        let config = TranscoderConfig {
            program: "sh".to_string(),
            args: Some(vec!["-c".into(), "sleep 30".into()]),
            ..Default::default()
        };
        let process = TranscoderProcess::spawn(&config, "unused", &params(1.0, None)).unwrap();
        let summary = process.shutdown(Duration::from_secs(2)).await;
        assert!(summary.status.is_some());
        assert!(!summary.success());
    }

    #[tokio::test]
    async fn test_read_times_out_on_silent_process() {
        let config = TranscoderConfig {
            program: "sh".to_string(),
            args: Some(vec!["-c".into(), "sleep 30".into()]),
            read_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut process = TranscoderProcess::spawn(&config, "unused", &params(1.0, None)).unwrap();
        let mut buf = [0u8; 16];
        let result = process.read(&mut buf).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        process.shutdown(Duration::from_secs(1)).await;
    }
}
