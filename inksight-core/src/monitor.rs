//! Channel D: watches the device's document directory for changes.
//!
//! Primary strategy is an `inotifywait -m` tail run over the device
//! channel's streaming exec; a snapshot-diffing poll loop is the fallback
//! when `inotifywait` isn't installed on the device. Either way, raw
//! filesystem events are coalesced per document before the caller's handler
//! ever sees them, so a flurry of writes to the same document during a save
//! produces one `ChangeEvent`, not a dozen.

use crate::device_channel::{DeviceChannel, DOCUMENTS_ROOT};
use crate::model::{ChangeEvent, ChangeKind};
use crate::selector::extract_document_id;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            auto_reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

struct RawEvent {
    document_id: String,
    kind: ChangeKind,
    path: String,
}

struct Pending {
    kind: ChangeKind,
    affected_files: Vec<String>,
    deadline: tokio::time::Instant,
}

pub struct FileMonitor {
    device: Arc<DeviceChannel>,
    config: MonitorConfig,
    stop: Arc<AtomicBool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl FileMonitor {
    pub fn new(device: Arc<DeviceChannel>, config: MonitorConfig) -> Self {
        Self {
            device,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            task: StdMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().expect("monitor mutex poisoned").is_some()
    }

    /// Starts the monitor loop. A no-op if already running.
    pub fn start(&self, handler: ChangeHandler) {
        let mut guard = self.task.lock().expect("monitor mutex poisoned");
        if guard.is_some() {
            debug!("monitor already running, start is a no-op");
            return;
        }
        self.stop.store(false, Ordering::Relaxed);
        let device = self.device.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();
        *guard = Some(tokio::spawn(run(device, config, handler, stop)));
    }

    /// Stops the monitor loop. A no-op if not running.
    pub fn stop(&self) {
        let handle = self.task.lock().expect("monitor mutex poisoned").take();
        match handle {
            Some(handle) => {
                self.stop.store(true, Ordering::Relaxed);
                handle.abort();
                info!("file monitor stopped");
            }
            None => debug!("monitor not running, stop is a no-op"),
        }
    }
}

async fn run(device: Arc<DeviceChannel>, config: MonitorConfig, handler: ChangeHandler, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }

        let use_inotify = probe_inotifywait(&device).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_stop = stop.clone();
        let reader_device = device.clone();
        let poll_interval = config.poll_interval;

        let reader: JoinHandle<()> = if use_inotify {
            info!("file monitor using inotify-over-ssh tail");
            tokio::task::spawn_blocking(move || {
                run_inotify_reader(&reader_device, &reader_stop, tx);
            })
        } else {
            info!("inotifywait unavailable, falling back to polling");
            tokio::spawn(run_polling_reader(reader_device, poll_interval, tx, reader_stop))
        };

        debounce_loop(rx, &handler, config.debounce).await;
        reader.abort();

        if stop.load(Ordering::Relaxed) || !config.auto_reconnect {
            return;
        }
        warn!(delay_s = config.reconnect_delay.as_secs(), "monitor source ended, reconnecting");
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn probe_inotifywait(device: &DeviceChannel) -> bool {
    match device.execute_command("which inotifywait".to_string()).await {
        Ok((_, _, code)) => code == 0,
        Err(e) => {
            warn!(error = %e, "failed to probe for inotifywait, assuming unavailable");
            false
        }
    }
}

/// Maps an `inotifywait --format '%w%f %e'` event list to a [`ChangeKind`],
/// preferring Deleted over Created over Modified when a line reports more
/// than one flag (e.g. `MOVED_FROM,ISDIR`).
fn map_events_to_kind(events: &str) -> Option<ChangeKind> {
    let flags: Vec<&str> = events.split(',').collect();
    if flags.iter().any(|f| matches!(*f, "DELETE" | "MOVED_FROM" | "DELETE_SELF")) {
        Some(ChangeKind::Deleted)
    } else if flags.iter().any(|f| matches!(*f, "CREATE" | "MOVED_TO")) {
        Some(ChangeKind::Created)
    } else if flags.iter().any(|f| matches!(*f, "MODIFY" | "ATTRIB" | "CLOSE_WRITE")) {
        Some(ChangeKind::Modified)
    } else {
        None
    }
}

fn parse_inotify_line(line: &str) -> Option<RawEvent> {
    let (path, events) = line.rsplit_once(' ')?;
    let kind = map_events_to_kind(events)?;
    let name = path.rsplit('/').next().unwrap_or(path);
    let document_id = extract_document_id(name)?;
    Some(RawEvent {
        document_id,
        kind,
        path: path.to_string(),
    })
}

fn run_inotify_reader(device: &DeviceChannel, stop: &AtomicBool, tx: mpsc::UnboundedSender<RawEvent>) {
    let cmd = format!(
        "inotifywait -m -r -e create,modify,delete,moved_to,moved_from,attrib,close_write --format '%w%f %e' {DOCUMENTS_ROOT}"
    );
    let result = device.exec_streaming_blocking(&cmd, stop, |line| {
        if let Some(ev) = parse_inotify_line(&line) {
            let _ = tx.send(ev);
        }
    });
    if let Err(e) = result {
        warn!(error = %e, "inotify tail ended with an error");
    }
}

async fn run_polling_reader(
    device: Arc<DeviceChannel>,
    interval: Duration,
    tx: mpsc::UnboundedSender<RawEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut previous: HashMap<String, (u64, chrono::DateTime<chrono::Utc>)> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if stop.load(Ordering::Relaxed) {
            return;
        }

        let entries = match device.list_files(None).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "poll listing failed");
                return;
            }
        };

        let mut current = HashMap::new();
        for entry in &entries {
            if entry.is_directory {
                continue;
            }
            current.insert(entry.name.clone(), (entry.size, entry.modified_at));
        }

        for (name, stat) in &current {
            let Some(document_id) = extract_document_id(name) else { continue };
            match previous.get(name) {
                None => {
                    let _ = tx.send(RawEvent {
                        document_id,
                        kind: ChangeKind::Created,
                        path: name.clone(),
                    });
                }
                Some(prev) if prev != stat => {
                    let _ = tx.send(RawEvent {
                        document_id,
                        kind: ChangeKind::Modified,
                        path: name.clone(),
                    });
                }
                _ => {}
            }
        }
        for name in previous.keys() {
            if !current.contains_key(name) {
                if let Some(document_id) = extract_document_id(name) {
                    let _ = tx.send(RawEvent {
                        document_id,
                        kind: ChangeKind::Deleted,
                        path: name.clone(),
                    });
                }
            }
        }

        previous = current;
    }
}

async fn debounce_loop(mut rx: mpsc::UnboundedReceiver<RawEvent>, handler: &ChangeHandler, debounce: Duration) {
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let flush_tick = (debounce / 2).max(Duration::from_millis(25));
    let mut ticker = tokio::time::interval(flush_tick);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(ev) => {
                        let deadline = tokio::time::Instant::now() + debounce;
                        pending
                            .entry(ev.document_id)
                            .and_modify(|p| {
                                p.kind = merge_kind(p.kind, ev.kind);
                                p.affected_files.push(ev.path.clone());
                                p.deadline = deadline;
                            })
                            .or_insert(Pending {
                                kind: ev.kind,
                                affected_files: vec![ev.path],
                                deadline,
                            });
                    }
                    None => {
                        flush_ready(&mut pending, handler, true);
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush_ready(&mut pending, handler, false);
            }
        }
    }
}

/// Coalesces two raw events seen for the same document within one debounce
/// window into a single [`ChangeKind`]: Created if either saw the document
/// newly appear, else Modified if either saw a change in place, else
/// Deleted only when every event agrees the document is gone.
fn merge_kind(a: ChangeKind, b: ChangeKind) -> ChangeKind {
    use ChangeKind::*;
    match (a, b) {
        (Created, _) | (_, Created) => Created,
        (Modified, _) | (_, Modified) => Modified,
        (Deleted, Deleted) => Deleted,
    }
}

fn flush_ready(pending: &mut HashMap<String, Pending>, handler: &ChangeHandler, force: bool) {
    let now = tokio::time::Instant::now();
    let ready: Vec<String> = pending
        .iter()
        .filter(|(_, p)| force || p.deadline <= now)
        .map(|(id, _)| id.clone())
        .collect();

    for document_id in ready {
        if let Some(p) = pending.remove(&document_id) {
            handler(ChangeEvent {
                document_id,
                kind: p.kind,
                observed_at: chrono::Utc::now(),
                affected_files: p.affected_files,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_delete_over_create_when_both_flags_present() {
        assert_eq!(map_events_to_kind("MOVED_FROM,ISDIR"), Some(ChangeKind::Deleted));
        assert_eq!(map_events_to_kind("CREATE"), Some(ChangeKind::Created));
        assert_eq!(map_events_to_kind("MODIFY"), Some(ChangeKind::Modified));
        assert_eq!(map_events_to_kind("ISDIR"), None);
    }

    #[test]
    fn parses_well_formed_inotify_line() {
        let line = "/home/root/.local/share/remarkable/xochitl/aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee.metadata MODIFY";
        let ev = parse_inotify_line(line).unwrap();
        assert_eq!(ev.document_id, "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        assert_eq!(ev.kind, ChangeKind::Modified);
    }

    #[test]
    fn rejects_lines_without_a_document_id() {
        assert!(parse_inotify_line("/home/root/.local/share/remarkable/xochitl/.lock MODIFY").is_none());
    }

    #[test]
    fn merge_kind_prefers_created_over_modified_and_deleted() {
        assert_eq!(merge_kind(ChangeKind::Modified, ChangeKind::Created), ChangeKind::Created);
        assert_eq!(merge_kind(ChangeKind::Deleted, ChangeKind::Created), ChangeKind::Created);
    }

    #[test]
    fn merge_kind_prefers_modified_over_deleted() {
        assert_eq!(merge_kind(ChangeKind::Deleted, ChangeKind::Modified), ChangeKind::Modified);
        assert_eq!(merge_kind(ChangeKind::Modified, ChangeKind::Deleted), ChangeKind::Modified);
    }

    #[test]
    fn merge_kind_is_deleted_only_when_both_agree() {
        assert_eq!(merge_kind(ChangeKind::Deleted, ChangeKind::Deleted), ChangeKind::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_rapid_events_into_one() {
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: ChangeHandler = Arc::new(move |ev| seen_clone.lock().unwrap().push(ev));

        let doc_id = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string();
        tx.send(RawEvent {
            document_id: doc_id.clone(),
            kind: ChangeKind::Modified,
            path: format!("{doc_id}.metadata"),
        })
        .unwrap();
        tx.send(RawEvent {
            document_id: doc_id.clone(),
            kind: ChangeKind::Modified,
            path: format!("{doc_id}.content"),
        })
        .unwrap();
        drop(tx);

        debounce_loop(rx, &handler, Duration::from_millis(250)).await;

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].affected_files.len(), 2);
    }
}
