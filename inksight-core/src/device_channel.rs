//! Channel A: a direct SSH/SFTP connection to the tablet.
//!
//! Built on the blocking `ssh2` crate. Every SFTP/shell call happens inside
//! `tokio::task::spawn_blocking`; the session itself lives behind a
//! `std::sync::Mutex` so overlapping calls from the File Monitor and the
//! Incremental Sync Engine serialize onto the same SFTP session rather than
//! racing it, since libssh2 sessions are not safe to drive concurrently.

use crate::error::{CoreError, Result};
use crate::model::{DocumentSummary, RemoteFileEntry};
use crate::selector::{extract_document_id, matches_document};
use crate::source::DocumentSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// The tablet's well-known document directory.
pub const DOCUMENTS_ROOT: &str = "/home/root/.local/share/remarkable/xochitl";

const DEFAULT_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Either a password or a private-key path. Mutually exclusive by
/// construction: `Credentials::new` picks the private key when both are
/// supplied.
#[derive(Debug, Clone)]
pub enum Credentials {
    Password(String),
    PrivateKey(PathBuf),
}

impl Credentials {
    pub fn new(password: Option<String>, private_key_path: Option<PathBuf>) -> Option<Self> {
        match (password, private_key_path) {
            (_, Some(key)) => Some(Credentials::PrivateKey(key)),
            (Some(pw), None) => Some(Credentials::Password(pw)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceChannelConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl DeviceChannelConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            credentials,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE,
        }
    }
}

struct SessionState {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
}

// `ssh2::Session`/`Sftp` hold a raw libssh2 pointer and are not `Sync`, but
// every access to them happens through the `StdMutex` below and never
// escapes a `spawn_blocking` closure, so sharing the handle across the
// worker pool is sound.
unsafe impl Send for SessionState {}

pub struct DeviceChannel {
    config: DeviceChannelConfig,
    inner: Arc<StdMutex<Option<SessionState>>>,
}

impl DeviceChannel {
    pub fn new(config: DeviceChannelConfig) -> Self {
        Self {
            config,
            inner: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().expect("device channel mutex poisoned").is_some()
    }

    pub fn disconnect(&self) {
        *self.inner.lock().expect("device channel mutex poisoned") = None;
        info!(host = %self.config.host, "disconnected from device");
    }

    /// Connects with up to 3 attempts, exponential backoff `500ms * 2^(n-1)`
    /// before the 2nd and 3rd attempts.
    pub async fn connect(&self) -> Result<()> {
        let config = self.config.clone();
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&config, &inner))
            .await
            .map_err(|_| CoreError::Cancelled)?
    }

    fn connect_blocking(
        config: &DeviceChannelConfig,
        inner: &Arc<StdMutex<Option<SessionState>>>,
    ) -> Result<()> {
        let mut last_err = String::new();
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            if attempt > 1 {
                let delay = Duration::from_millis(500u64 * 2u64.pow(attempt - 2));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying device connection");
                std::thread::sleep(delay);
            }
            match Self::try_connect_once(config) {
                Ok(state) => {
                    info!(host = %config.host, port = config.port, "connected to device");
                    *inner.lock().expect("device channel mutex poisoned") = Some(state);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "device connect attempt failed");
                    last_err = e;
                }
            }
        }
        Err(CoreError::ConnectionFailed(last_err))
    }

    fn try_connect_once(config: &DeviceChannelConfig) -> std::result::Result<SessionState, String> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| e.to_string())?
            .next()
            .ok_or_else(|| "could not resolve device address".to_string())?;

        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| e.to_string())?;

        let mut session = ssh2::Session::new().map_err(|e| e.to_string())?;
        session.set_tcp_stream(tcp);
        session.set_timeout(config.connect_timeout.as_millis() as u32);
        session.set_keepalive(true, config.keepalive_interval.as_secs() as u32);
        session.handshake().map_err(|e| e.to_string())?;

        match &config.credentials {
            Credentials::PrivateKey(path) => session
                .userauth_pubkey_file(&config.username, None, path, None)
                .map_err(|e| e.to_string())?,
            Credentials::Password(password) => session
                .userauth_password(&config.username, password)
                .map_err(|e| e.to_string())?,
        }

        if !session.authenticated() {
            return Err("device rejected authentication".to_string());
        }

        let sftp = session.sftp().map_err(|e| e.to_string())?;
        Ok(SessionState { session, sftp })
    }

    /// Runs `cmd` and streams its stdout line-by-line to `on_line` until the
    /// command's channel closes or `stop` flips true. Used by the File
    /// Monitor's inotify tail, which never terminates on its own. Blocks the
    /// calling thread; callers run it inside `spawn_blocking`.
    ///
    /// The session read timeout is lowered to 2s for the duration of the
    /// tail so the stop flag gets checked even when the device is quiet,
    /// then restored.
    pub(crate) fn exec_streaming_blocking(
        &self,
        cmd: &str,
        stop: &std::sync::atomic::AtomicBool,
        mut on_line: impl FnMut(String),
    ) -> Result<()> {
        use std::io::Read;
        use std::sync::atomic::Ordering;

        let original_timeout;
        let mut channel = {
            let guard = self.inner.lock().expect("device channel mutex poisoned");
            let state = guard
                .as_ref()
                .ok_or_else(|| CoreError::ConnectionFailed("not connected".to_string()))?;
            original_timeout = self.config.connect_timeout.as_millis() as u32;
            state.session.set_timeout(2_000);
            let mut channel = state
                .session
                .channel_session()
                .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;
            channel.exec(cmd).map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;
            channel
        };

        let mut buf = [0u8; 4096];
        let mut line_buf = String::new();
        let result = loop {
            if stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            match channel.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    line_buf.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(pos) = line_buf.find('\n') {
                        let line = line_buf[..pos].trim_end_matches('\r').to_string();
                        line_buf.drain(..=pos);
                        if !line.is_empty() {
                            on_line(line);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => break Err(CoreError::ConnectionFailed(e.to_string())),
            }
        };

        channel.close().ok();
        if let Ok(guard) = self.inner.lock() {
            if let Some(state) = guard.as_ref() {
                state.session.set_timeout(original_timeout);
            }
        }
        result
    }

    /// Lists entries directly from SFTP `readdir` of `path`, or of
    /// [`DOCUMENTS_ROOT`] when `path` is `None`.
    pub async fn list_files(&self, path: Option<String>) -> Result<Vec<RemoteFileEntry>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner.lock().expect("device channel mutex poisoned");
            let state = guard
                .as_ref()
                .ok_or_else(|| CoreError::ConnectionFailed("not connected".to_string()))?;
            let dir = path.unwrap_or_else(|| DOCUMENTS_ROOT.to_string());
            let raw = state
                .sftp
                .readdir(Path::new(&dir))
                .map_err(|e| CoreError::ListingFailed(e.to_string()))?;
            Ok(raw.iter().map(|(p, stat)| to_remote_file_entry(p, stat)).collect())
        })
        .await
        .map_err(|_| CoreError::Cancelled)?
    }

    /// Downloads a single remote file to `local`, creating missing parent
    /// directories.
    pub async fn download_file(&self, remote: String, local: PathBuf) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner.lock().expect("device channel mutex poisoned");
            let state = guard
                .as_ref()
                .ok_or_else(|| CoreError::ConnectionFailed("not connected".to_string()))?;
            download_one(&state.sftp, Path::new(&remote), &local)
                .map_err(CoreError::DownloadFailed)
        })
        .await
        .map_err(|_| CoreError::Cancelled)?
    }

    /// Enumerates the documents root once, downloads every artifact whose
    /// name equals `doc_id` (a directory, downloaded recursively into
    /// `local_dir/doc_id/`) or begins with `doc_id.` (a file, downloaded
    /// directly into `local_dir/`). Returns the written local paths.
    pub async fn download_document(&self, doc_id: String, local_dir: PathBuf) -> Result<Vec<String>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner.lock().expect("device channel mutex poisoned");
            let state = guard
                .as_ref()
                .ok_or_else(|| CoreError::ConnectionFailed("not connected".to_string()))?;

            let root_entries = state
                .sftp
                .readdir(Path::new(DOCUMENTS_ROOT))
                .map_err(|e| CoreError::ListingFailed(e.to_string()))?;

            let mut written = Vec::new();
            let mut matches: Vec<_> = root_entries
                .into_iter()
                .filter(|(p, _)| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|name| matches_document(name, &doc_id))
                        .unwrap_or(false)
                })
                .collect();
            matches.sort_by(|a, b| a.0.cmp(&b.0));

            for (path, stat) in matches {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if stat.is_dir() && name == doc_id {
                    let target_dir = local_dir.join(&doc_id);
                    download_dir_recursive(&state.sftp, &path, &target_dir, &mut written)
                        .map_err(CoreError::DownloadFailed)?;
                } else {
                    let target = local_dir.join(name);
                    download_one(&state.sftp, &path, &target).map_err(CoreError::DownloadFailed)?;
                    written.push(target.to_string_lossy().to_string());
                }
            }

            Ok(written)
        })
        .await
        .map_err(|_| CoreError::Cancelled)?
    }

    /// Lists the documents root and extracts a sorted, unique list of
    /// canonical document ids from entry names.
    pub async fn list_document_ids(&self) -> Result<Vec<String>> {
        let entries = self.list_files(None).await?;
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for entry in entries {
            if let Some(id) = extract_document_id(&entry.name) {
                ids.insert(id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Lists the documents root and derives one summary per document from
    /// its `.metadata` entry's id and SFTP mtime, skipping any document
    /// whose `.metadata` file is missing.
    pub async fn list_document_summaries(&self) -> Result<Vec<DocumentSummary>> {
        let entries = self.list_files(None).await?;
        let mut summaries: Vec<DocumentSummary> = entries
            .into_iter()
            .filter(|entry| !entry.is_directory && entry.name.ends_with(".metadata"))
            .filter_map(|entry| {
                extract_document_id(&entry.name).map(|id| DocumentSummary {
                    id,
                    modified_at: entry.modified_at,
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Executes a command via a fresh SSH shell channel, returning
    /// `(stdout, stderr, exit_code)`.
    pub async fn execute_command(&self, cmd: String) -> Result<(String, String, i32)> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Read;

            let guard = inner.lock().expect("device channel mutex poisoned");
            let state = guard
                .as_ref()
                .ok_or_else(|| CoreError::ConnectionFailed("not connected".to_string()))?;

            let mut channel = state
                .session
                .channel_session()
                .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;
            channel
                .exec(&cmd)
                .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;

            let mut stdout = String::new();
            channel.read_to_string(&mut stdout).ok();
            let mut stderr = String::new();
            channel.stderr().read_to_string(&mut stderr).ok();

            channel.wait_close().ok();
            let exit_code = channel.exit_status().unwrap_or(-1);

            Ok((stdout, stderr, exit_code))
        })
        .await
        .map_err(|_| CoreError::Cancelled)?
    }
}

#[async_trait]
impl DocumentSource for DeviceChannel {
    async fn list_document_ids(&self) -> Result<Vec<String>> {
        self.list_document_ids().await
    }

    async fn list_document_summaries(&self) -> Result<Vec<DocumentSummary>> {
        self.list_document_summaries().await
    }

    async fn download_document(&self, doc_id: String, local_dir: PathBuf) -> Result<Vec<String>> {
        self.download_document(doc_id, local_dir).await
    }
}

fn to_remote_file_entry(path: &Path, stat: &ssh2::FileStat) -> RemoteFileEntry {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let modified_at = stat
        .mtime
        .map(|secs| DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(secs)))
        .unwrap_or_else(Utc::now);

    RemoteFileEntry {
        path: path.to_string_lossy().to_string(),
        name,
        size: stat.size.unwrap_or(0),
        is_directory: stat.is_dir(),
        modified_at,
    }
}

fn download_one(sftp: &ssh2::Sftp, remote: &Path, local: &Path) -> std::result::Result<(), String> {
    use std::io::Read;

    if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let mut remote_file = sftp.open(remote).map_err(|e| e.to_string())?;
    let mut buf = Vec::new();
    remote_file.read_to_end(&mut buf).map_err(|e| e.to_string())?;
    std::fs::write(local, &buf).map_err(|e| e.to_string())
}

fn download_dir_recursive(
    sftp: &ssh2::Sftp,
    remote_dir: &Path,
    local_dir: &Path,
    written: &mut Vec<String>,
) -> std::result::Result<(), String> {
    std::fs::create_dir_all(local_dir).map_err(|e| e.to_string())?;
    let entries = sftp.readdir(remote_dir).map_err(|e| e.to_string())?;
    for (path, stat) in entries {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let local_target = local_dir.join(name);
        if stat.is_dir() {
            download_dir_recursive(sftp, &path, &local_target, written)?;
        } else {
            download_one(sftp, &path, &local_target)?;
            written.push(local_target.to_string_lossy().to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_wins_when_both_credentials_supplied() {
        let creds = Credentials::new(Some("pw".to_string()), Some(PathBuf::from("/key")));
        assert!(matches!(creds, Some(Credentials::PrivateKey(_))));
    }

    #[test]
    fn password_used_when_no_key_supplied() {
        let creds = Credentials::new(Some("pw".to_string()), None);
        assert!(matches!(creds, Some(Credentials::Password(_))));
    }

    #[test]
    fn no_credentials_supplied_yields_none() {
        assert!(Credentials::new(None, None).is_none());
    }

    #[test]
    fn backoff_delays_match_spec_formula() {
        let delays: Vec<u64> = (1..=MAX_CONNECT_ATTEMPTS)
            .filter(|a| *a > 1)
            .map(|a| 500u64 * 2u64.pow(a - 2))
            .collect();
        assert_eq!(delays, vec![500, 1000]);
    }
}
