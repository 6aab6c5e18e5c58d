//! General-purpose extraction via an external `yt-dlp` process.
//!
//! The extractor is treated as an opaque collaborator: given a URL and an
//! output path it either produces a playable file or fails. Its stderr is
//! mapped onto the shared error taxonomy so the orchestrator can decide
//! whether to retry.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::direct::validate_http_url;
use super::{BoxFuture, MediaMetadata, SourceStrategy};
use crate::error::FetchError;
use crate::model::ProgressReporter;
use crate::proxy::{ProxyEndpoint, ProxyRotator};

/// Best MP4 at or below 1080p, merged with the best M4A audio when separate.
pub const DEFAULT_FORMAT_SELECTOR: &str =
    "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]/best[height<=1080]/best";

/// Default socket timeout passed to the extractor, in seconds.
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 30;

const PROGRESS_TEMPLATE: &str = "download:%(progress.downloaded_bytes)s/%(progress.total_bytes)s";

/// Extensions the extractor may append to the requested output path.
const OUTPUT_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov"];

/// Configuration for [`GenericExtractor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    /// Extractor executable (default: `yt-dlp` on `PATH`).
    pub binary: PathBuf,
    pub format: String,
    /// Route the extractor through the proxy pool.
    pub use_proxy: bool,
    pub socket_timeout_secs: u64,
    /// Extra arguments inserted before the URL.
    pub extra_args: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("yt-dlp"),
            format: DEFAULT_FORMAT_SELECTOR.to_string(),
            use_proxy: false,
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
            extra_args: Vec::new(),
        }
    }
}

/// Strategy delegating to `yt-dlp`.
#[derive(Debug)]
pub struct GenericExtractor {
    name: String,
    config: ExtractorConfig,
    proxies: Option<Arc<ProxyRotator>>,
}

#[derive(Debug, Deserialize)]
struct ExtractorInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    url: Option<String>,
}

impl GenericExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            name: "ytdlp".to_string(),
            config,
            proxies: None,
        }
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyRotator>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn select_proxy(&self) -> Option<Arc<ProxyEndpoint>> {
        if !self.config.use_proxy {
            return None;
        }
        self.proxies.as_ref().and_then(|p| p.select())
    }

    fn base_command(&self, proxy: Option<&ProxyEndpoint>) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--socket-timeout")
            .arg(self.config.socket_timeout_secs.to_string());
        if let Some(proxy) = proxy {
            cmd.arg("--proxy").arg(proxy.to_url());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_download(&self, url: &str, dest: &Path, progress: &ProgressReporter) -> Result<u64, FetchError> {
        validate_http_url(url)?;
        let proxy = self.select_proxy();

        let mut cmd = self.base_command(proxy.as_deref());
        cmd.arg("-f")
            .arg(&self.config.format)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--force-overwrites")
            .arg("--newline")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("-o")
            .arg(dest)
            .args(&self.config.extra_args)
            .arg("--")
            .arg(url);

        tracing::debug!(url, dest = %dest.display(), proxied = proxy.is_some(), "Running extractor");

        let result = self.run_to_completion(cmd, progress).await;
        let result = match result {
            Ok(()) => collect_output(dest).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            discard_partial(dest).await;
        }

        if let (Some(rotator), Some(proxy)) = (&self.proxies, &proxy) {
            rotator.report_result(proxy, &result);
        }
        result
    }

    async fn run_to_completion(&self, mut cmd: Command, progress: &ProgressReporter) -> Result<(), FetchError> {
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let progress_lines = async {
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some((downloaded, total)) = parse_progress_line(&line) {
                        progress.report(downloaded, total);
                    }
                }
            }
        };
        let error_text = async {
            let mut raw = Vec::new();
            if let Some(mut err) = stderr {
                if let Err(e) = err.read_to_end(&mut raw).await {
                    tracing::debug!(error = %e, "Extractor stderr read ended early");
                }
            }
            String::from_utf8_lossy(&raw).into_owned()
        };

        let (status, _, stderr_text) = tokio::join!(child.wait(), progress_lines, error_text);
        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(classify_failure(status.code(), &stderr_text))
        }
    }

    async fn run_metadata(&self, url: &str) -> Result<MediaMetadata, FetchError> {
        validate_http_url(url)?;
        let proxy = self.select_proxy();
        let mut cmd = self.base_command(proxy.as_deref());
        cmd.arg("--dump-json").arg("--no-download").arg("--").arg(url);

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(output.status.code(), &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().find(|l| l.trim_start().starts_with('{')).unwrap_or("");
        let info: ExtractorInfo = serde_json::from_str(line).map_err(|e| {
            FetchError::UnsupportedContent(format!("unreadable extractor metadata: {}", e))
        })?;

        Ok(MediaMetadata {
            title: info.title,
            duration_secs: info.duration,
            uploader: info.uploader,
            thumbnail: info.thumbnail,
            media_url: info.url,
        })
    }
}

impl SourceStrategy for GenericExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract_metadata<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MediaMetadata, FetchError>> {
        Box::pin(self.run_metadata(url))
    }

    fn fetch<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<u64, FetchError>> {
        Box::pin(self.run_download(url, dest, progress))
    }
}

/// Removes whatever a failed run left at `dest`, including the `.part` file
/// and extension-suffixed outputs.
async fn discard_partial(dest: &Path) {
    let mut paths = vec![dest.to_path_buf()];
    for ext in OUTPUT_EXTENSIONS.iter().chain(std::iter::once(&"part")) {
        let mut candidate = dest.as_os_str().to_owned();
        candidate.push(".");
        candidate.push(ext);
        paths.push(PathBuf::from(candidate));
    }

    for path in paths {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed partial extractor output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
        }
    }
}

/// Moves the extractor's output onto `dest` if it appended an extension,
/// and returns the file size.
async fn collect_output(dest: &Path) -> Result<u64, FetchError> {
    let mut found = tokio::fs::metadata(dest).await.ok().map(|m| m.len());

    if found.is_none() {
        for ext in OUTPUT_EXTENSIONS {
            let mut candidate = dest.as_os_str().to_owned();
            candidate.push(".");
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                tokio::fs::rename(&candidate, dest).await?;
                found = Some(meta.len());
                break;
            }
        }
    }

    match found {
        Some(0) | None => Err(FetchError::Extractor {
            code: Some(0),
            detail: "extractor reported success but produced no data".to_string(),
        }),
        Some(size) => Ok(size),
    }
}

fn parse_progress_line(line: &str) -> Option<(u64, Option<u64>)> {
    let rest = line.trim().strip_prefix("download:")?;
    let (done, total) = rest.split_once('/')?;
    let done = done.trim().parse::<f64>().ok()? as u64;
    let total = total.trim().parse::<f64>().ok().map(|t| t as u64);
    Some((done, total))
}

/// Maps extractor stderr onto the error taxonomy.
fn classify_failure(code: Option<i32>, stderr: &str) -> FetchError {
    let detail = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("no diagnostic output")
        .trim()
        .to_string();
    let lower = stderr.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["unsupported url"]) {
        FetchError::UnsupportedContent(detail)
    } else if has(&[
        "http error 404",
        "video unavailable",
        "has been removed",
        "does not exist",
    ]) {
        FetchError::NotFound(detail)
    } else if has(&[
        "http error 401",
        "http error 403",
        "private video",
        "sign in to confirm",
        "login required",
        "requested content is not available",
    ]) {
        FetchError::AuthOrAccessDenied(detail)
    } else if has(&[
        "http error 429",
        "http error 5",
        "timed out",
        "connection reset",
        "temporary failure",
    ]) {
        FetchError::NetworkTransient(detail)
    } else {
        FetchError::Extractor { code, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_classify_failure_table() {
        let cases = [
            ("ERROR: [generic] Unsupported URL: https://x", ErrorClass::Terminal),
            ("ERROR: unable to download webpage: HTTP Error 404: Not Found", ErrorClass::Terminal),
            ("ERROR: [youtube] abc: Private video", ErrorClass::Terminal),
            ("ERROR: HTTP Error 429: Too Many Requests", ErrorClass::Retryable),
            ("ERROR: HTTP Error 503: Service Unavailable", ErrorClass::Retryable),
            ("ERROR: The read operation timed out", ErrorClass::Retryable),
            ("Traceback (most recent call last): KeyError", ErrorClass::Retryable),
        ];
        for (stderr, expected) in cases {
            assert_eq!(classify_failure(Some(1), stderr).class(), expected, "{}", stderr);
        }
    }

    #[test]
    fn test_classify_failure_keeps_error_line() {
        let err = classify_failure(Some(1), "WARNING: x\nERROR: boom\n\n");
        assert!(err.to_string().contains("ERROR: boom"));
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(parse_progress_line("download:512/1024"), Some((512, Some(1024))));
        assert_eq!(parse_progress_line("download:512/NA"), Some((512, None)));
        assert_eq!(parse_progress_line("[download] 50%"), None);
    }

    #[tokio::test]
    async fn test_rejects_non_http_url_without_spawning() {
        let strategy = GenericExtractor::new(ExtractorConfig {
            binary: PathBuf::from("/nonexistent/yt-dlp"),
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let err = strategy
            .fetch("javascript:alert(1)", &dir.path().join("out"), &ProgressReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_terminal() {
        let strategy = GenericExtractor::new(ExtractorConfig {
            binary: PathBuf::from("/nonexistent/yt-dlp"),
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let err = strategy
            .fetch("https://video.example/clip", &dir.path().join("out"), &ProgressReporter::silent())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Terminal);
    }

    #[cfg(unix)]
    mod with_fake_binary {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_extractor(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-yt-dlp");
            let script = format!(
                "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    -o) out=\"$2\"; shift 2 ;;\n    *) shift ;;\n  esac\ndone\n{}\n",
                body
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn extractor(binary: PathBuf) -> GenericExtractor {
            GenericExtractor::new(ExtractorConfig {
                binary,
                ..Default::default()
            })
        }

        #[tokio::test]
        async fn test_successful_run_writes_dest() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_extractor(
                dir.path(),
                "echo 'download:3/6'\nprintf 'abcdef' > \"$out\"\necho 'download:6/6'",
            );
            let dest = dir.path().join("temp_generic_x");

            let size = extractor(bin)
                .fetch("https://video.example/clip", &dest, &ProgressReporter::silent())
                .await
                .unwrap();

            assert_eq!(size, 6);
            assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
        }

        #[tokio::test]
        async fn test_appended_extension_is_moved_onto_dest() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_extractor(dir.path(), "printf 'merged' > \"$out.mp4\"");
            let dest = dir.path().join("temp_generic_y");

            let size = extractor(bin)
                .fetch("https://video.example/clip", &dest, &ProgressReporter::silent())
                .await
                .unwrap();

            assert_eq!(size, 6);
            assert!(dest.exists());
            assert!(!dir.path().join("temp_generic_y.mp4").exists());
        }

        #[tokio::test]
        async fn test_failure_is_classified_from_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_extractor(
                dir.path(),
                "echo 'ERROR: [generic] Unsupported URL: https://video.example/clip' >&2\nexit 1",
            );

            let err = extractor(bin)
                .fetch(
                    "https://video.example/clip",
                    &dir.path().join("out"),
                    &ProgressReporter::silent(),
                )
                .await
                .unwrap_err();

            assert!(matches!(err, FetchError::UnsupportedContent(_)));
        }

        #[tokio::test]
        async fn test_failed_run_leaves_no_partial_output() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_extractor(
                dir.path(),
                "printf 'half' > \"$out\"\nprintf 'frag' > \"$out.part\"\necho 'ERROR: HTTP Error 503: Service Unavailable' >&2\nexit 1",
            );
            let dest = dir.path().join("temp_generic_z");

            let err = extractor(bin)
                .fetch("https://video.example/clip", &dest, &ProgressReporter::silent())
                .await
                .unwrap_err();

            assert_eq!(err.class(), ErrorClass::Retryable);
            assert!(!dest.exists());
            assert!(!dir.path().join("temp_generic_z.part").exists());
        }

        #[tokio::test]
        async fn test_non_utf8_stderr_is_still_classified() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_extractor(
                dir.path(),
                "printf '\\377\\376 garbage\\nERROR: [youtube] abc: Private video\\n' >&2\nexit 1",
            );

            let err = extractor(bin)
                .fetch(
                    "https://video.example/clip",
                    &dir.path().join("out"),
                    &ProgressReporter::silent(),
                )
                .await
                .unwrap_err();

            assert_eq!(err.class(), ErrorClass::Terminal);
            assert!(err.to_string().contains("Private video"));
        }

        #[tokio::test]
        async fn test_success_without_output_is_retryable() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_extractor(dir.path(), "exit 0");

            let err = extractor(bin)
                .fetch(
                    "https://video.example/clip",
                    &dir.path().join("out"),
                    &ProgressReporter::silent(),
                )
                .await
                .unwrap_err();

            assert_eq!(err.class(), ErrorClass::Retryable);
        }

        #[tokio::test]
        async fn test_metadata_parses_dump_json() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_extractor(
                dir.path(),
                r#"echo '{"title":"Clip","duration":12.5,"uploader":"someone","thumbnail":"https://i/x.jpg"}'"#,
            );

            let meta = extractor(bin)
                .extract_metadata("https://video.example/clip")
                .await
                .unwrap();

            assert_eq!(meta.title.as_deref(), Some("Clip"));
            assert_eq!(meta.duration_secs, Some(12.5));
            assert_eq!(meta.uploader.as_deref(), Some("someone"));
        }
    }
}
