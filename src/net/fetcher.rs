//! Ranged HTTP fetcher: `probe` plus `fetch_range`.
//!
//! Generalizes the whole-file download client this module is descended
//! from: the same `reqwest::Client` construction (with a panic-guarded
//! proxy fallback) and the same buffered-stream-to-file writer, but
//! reshaped around byte ranges, cooperative cancellation, and no cookie
//! jar, login-redirect detection, or browser-UA fallback — the catalog
//! host is anonymous HTTP, so those concerns have no counterpart here.

use std::panic::{AssertUnwindSafe, catch_unwind, set_hook, take_hook};
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, Proxy, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::constants::{CONNECT_TIMEOUT_SECS, MAX_REDIRECTS, READ_TIMEOUT_SECS};
use super::error::FetchError;
use crate::user_agent;

/// Outcome of a [`HttpFetcher::probe`] call.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    /// Total resource size in bytes, if the server reported it.
    pub total_bytes: Option<u64>,
    /// Whether the server advertised `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
}

/// Outcome of a single [`HttpFetcher::fetch_range`] call.
#[derive(Debug, Clone, Copy)]
pub struct FetchOutcome {
    /// Bytes appended to the destination file during this call.
    pub bytes_written: u64,
    /// Whether the server responded `206 Partial Content` (vs. `200`).
    pub partial: bool,
}

/// HTTP client for ranged, cancellable fetches.
///
/// Designed to be created once and reused across downloads and chunks,
/// taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    /// Creates a fetcher with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a fetcher with explicit connect/read timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = build_client(connect_timeout_secs, read_timeout_secs)
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Probes a URL for total size and range support via `HEAD`.
    ///
    /// Falls back to a `GET` with `Range: bytes=0-0` when the server
    /// rejects `HEAD` (some static hosts do).
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, FetchError> {
        let response = match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            _ => self
                .client
                .get(url)
                .header(RANGE, "bytes=0-0")
                .send()
                .await
                .map_err(|e| classify_send_error(url, e))?,
        };

        let status = response.status();
        if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::http_status(url, status.as_u16()));
        }

        let accept_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
            || status == StatusCode::PARTIAL_CONTENT;

        let total_bytes = if status == StatusCode::PARTIAL_CONTENT {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
        } else {
            response.content_length()
        };

        debug!(total_bytes = ?total_bytes, accept_ranges, "probed resource");
        Ok(ProbeResult {
            total_bytes,
            accept_ranges,
        })
    }

    /// Fetches `[byte_start, byte_end]` (inclusive; `byte_end = None` means
    /// "through end of body") and appends the streamed response body to
    /// `dest_path`, starting at the file's current length.
    ///
    /// Polling is raced against `cancel.cancelled()` so a cancelled fetch
    /// drops the connection promptly instead of draining the remaining
    /// body; bytes already flushed to `dest_path` are left in place for a
    /// later resume.
    #[instrument(skip(self, cancel), fields(url = %url, byte_start, byte_end = ?byte_end))]
    pub async fn fetch_range(
        &self,
        url: &str,
        byte_start: u64,
        byte_end: Option<u64>,
        dest_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let ranged = byte_start > 0 || byte_end.is_some();
        let mut request = self.client.get(url);
        if ranged {
            let range = match byte_end {
                Some(end) => format!("bytes={byte_start}-{end}"),
                None => format!("bytes={byte_start}-"),
            };
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::cancelled(url)),
            result = request.send() => result.map_err(|e| classify_send_error(url, e))?,
        };

        let status = response.status();
        if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(FetchError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        if ranged && status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::range_not_honored(url));
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dest_path)
            .await
            .map_err(|e| FetchError::io(dest_path, e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut bytes_written = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = writer.flush().await;
                    return Err(FetchError::cancelled(url));
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| FetchError::network(url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(dest_path, e))?;
            bytes_written += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| FetchError::io(dest_path, e))?;

        Ok(FetchOutcome {
            bytes_written,
            partial: status == StatusCode::PARTIAL_CONTENT,
        })
    }

    /// Returns a reference to the underlying reqwest client, for advanced
    /// operations not covered by this wrapper.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn classify_send_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else if error.is_redirect() {
        FetchError::redirection_not_supported(url, u8::try_from(MAX_REDIRECTS).unwrap_or(u8::MAX))
    } else {
        FetchError::network(url, error)
    }
}

/// Parses the total size out of a `Content-Range: bytes 0-0/12345` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.parse::<u64>().ok()
}

fn build_client(
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<Client, reqwest::Error> {
    match try_build_client(connect_timeout_secs, read_timeout_secs, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            warn!(
                "HTTP client builder panicked while loading system proxy settings; retrying with env-proxy fallback"
            );
            match try_build_client(connect_timeout_secs, read_timeout_secs, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Build(error)) => Err(error),
                Err(BuildClientFailure::Panic) => {
                    panic!("HTTP client builder panicked while applying env-proxy fallback")
                }
            }
        }
        Err(BuildClientFailure::Build(error)) => Err(error),
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

// `catch_unwind` does not suppress panic-hook stderr output. Guarded client
// builds intentionally catch system-proxy panics, so suppress hook output
// briefly to keep CLI stderr deterministic for expected recovery paths.
static CLIENT_BUILD_PANIC_HOOK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn try_build_client(
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    catch_unwind_silent(AssertUnwindSafe(move || {
        #[cfg(test)]
        maybe_inject_client_build_panic(disable_system_proxy_lookup);

        let mut builder = base_client_builder(connect_timeout_secs, read_timeout_secs);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn catch_unwind_silent<F, T>(operation: F) -> Result<T, Box<dyn std::any::Any + Send + 'static>>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    let _panic_hook_guard = CLIENT_BUILD_PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let previous_hook = take_hook();
    set_hook(Box::new(|_| {}));
    let outcome = catch_unwind(operation);
    set_hook(previous_hook);
    outcome
}

fn base_client_builder(connect_timeout_secs: u64, read_timeout_secs: u64) -> ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(read_timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .user_agent(user_agent::default_download_user_agent())
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    match scheme {
        "https" => find_first_proxy_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        "http" => find_first_proxy_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
        _ => None,
    }
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

#[cfg(test)]
static CLIENT_BUILD_PANIC_INJECTION_COUNT: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(0);

#[cfg(test)]
fn inject_client_build_panics(count: usize) {
    CLIENT_BUILD_PANIC_INJECTION_COUNT.store(count, std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
fn maybe_inject_client_build_panic(disable_system_proxy_lookup: bool) {
    use std::sync::atomic::Ordering;

    if disable_system_proxy_lookup {
        return;
    }

    if CLIENT_BUILD_PANIC_INJECTION_COUNT
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
            if count > 0 { Some(count - 1) } else { None }
        })
        .is_ok()
    {
        panic!("injected HTTP client builder panic");
    }
}
