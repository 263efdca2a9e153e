//! mpv IPC driver with separated reader/writer tasks, and the `AudioOutput`
//! implementation built on it.
//!
//! Architecture:
//!
//! ```text
//!   MpvDriver::spawn_and_connect()
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event                      → event_tx channel
//!
//!   MpvOutput
//!         ├── event pump    ← event_tx → broadcast to attempt watchers,
//!         │                   end-file(error) of the live entry → failures
//!         └── attempt watcher per play(): start-file → playback-restart | end-file
//!                             (only events carrying its playlist_entry_id)
//! ```
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use radiomap_proto::protocol::Generation;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::playback::{AudioError, AudioOutput, PlayAttempt, StreamFailure};

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "playback-restart".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// For `end-file`: the reason ("eof", "stop", "quit", "error", "redirect").
    pub fn end_file_reason(&self) -> Option<&str> {
        if self.event_name()? != "end-file" {
            return None;
        }
        self.raw.get("reason")?.as_str()
    }

    /// The playlist entry an event refers to.  Set on `start-file` and
    /// `end-file`.
    pub fn playlist_entry_id(&self) -> Option<u64> {
        self.raw.get("playlist_entry_id")?.as_u64()
    }

    /// Human-readable failure text for an `end-file` with reason "error".
    pub fn file_error(&self) -> String {
        self.raw
            .get("file_error")
            .and_then(Value::as_str)
            .unwrap_or("stream ended with an error")
            .to_string()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace the current file.  Returns the new playlist entry id when the
    /// mpv build reports one (0.38+).
    pub async fn load_stream(&self, url: &str) -> anyhow::Result<Option<u64>> {
        self.send(json!(["set_property", "pause", false])).await?;
        let reply = self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(reply
            .get("data")
            .and_then(|d| d.get("playlist_entry_id"))
            .and_then(Value::as_u64))
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, vol: f32) -> anyhow::Result<()> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn set_mute(&self, muted: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "mute", muted])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.  `spawn_and_connect()` returns a fresh
/// `MpvHandle`; call it again if the process dies.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
    pub last_muted: bool,
}

impl MpvDriver {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self {
            socket_name: radiomap_proto::platform::mpv_socket_name(),
            binary,
            process: None,
            last_volume: 1.0,
            last_muted: false,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv: spawning new process");
        let mpv_binary = radiomap_proto::platform::find_mpv_binary(self.binary.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let mute_arg = format!("--mute={}", if self.last_muted { "yes" } else { "no" });

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(radiomap_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .arg(mute_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process().await?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── AudioOutput over mpv ──────────────────────────────────────────────────────

/// The generation that owns the player and the playlist entry it loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveEntry {
    generation: Generation,
    /// `None` when mpv did not report an id; every event is then attributed
    /// to this generation.
    entry: Option<u64>,
}

impl LiveEntry {
    fn matches(&self, evt: &MpvEvent) -> bool {
        entry_matches(self.entry, evt)
    }
}

fn entry_matches(entry: Option<u64>, evt: &MpvEvent) -> bool {
    match entry {
        Some(id) => evt.playlist_entry_id() == Some(id),
        None => true,
    }
}

type LiveSlot = Arc<std::sync::Mutex<Option<LiveEntry>>>;

struct MpvSlot {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
}

/// Single mpv process, started lazily on the first play.  At most one
/// generation owns it at a time; `loadfile replace` discards whatever the
/// previous owner had loaded.
pub struct MpvOutput {
    slot: Mutex<MpvSlot>,
    live: LiveSlot,
    events: broadcast::Sender<MpvEvent>,
    failures: broadcast::Sender<StreamFailure>,
}

impl MpvOutput {
    pub fn new(binary: Option<PathBuf>, volume: u8) -> Self {
        let mut driver = MpvDriver::new(binary);
        driver.last_volume = f32::from(volume.min(100)) / 100.0;
        let (events, _) = broadcast::channel(64);
        let (failures, _) = broadcast::channel(16);
        Self {
            slot: Mutex::new(MpvSlot {
                driver,
                handle: None,
            }),
            live: Arc::new(std::sync::Mutex::new(None)),
            events,
            failures,
        }
    }

    /// Kill the player process.
    pub async fn shutdown(&self) {
        set_live(&self.live, None);
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.handle.take() {
            let _ = handle.stop().await;
        }
        slot.driver.kill().await;
    }

    async fn ensure_handle(&self) -> Result<MpvHandle, AudioError> {
        let mut slot = self.slot.lock().await;
        if slot.handle.is_some() && !slot.driver.process_alive() {
            warn!("mpv: process died, dropping handle");
            slot.handle = None;
        }
        if let Some(handle) = slot.handle.as_ref() {
            return Ok(handle.clone());
        }

        // One forwarder per connection.  It ends when the reader task does.
        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
        tokio::spawn(event_pump(
            event_rx,
            self.events.clone(),
            self.failures.clone(),
            Arc::clone(&self.live),
        ));

        let handle = slot
            .driver
            .spawn_and_connect(event_tx)
            .await
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        slot.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn current_handle(&self) -> Option<MpvHandle> {
        self.slot.lock().await.handle.clone()
    }

    fn owns(&self, generation: Generation) -> bool {
        current_live(&self.live).map(|l| l.generation) == Some(generation)
    }
}

#[async_trait]
impl AudioOutput for MpvOutput {
    async fn play(&self, generation: Generation, url: &str) -> Result<PlayAttempt, AudioError> {
        let handle = self.ensure_handle().await?;

        // Subscribe before loadfile so start-file cannot be missed.  Until the
        // reply names our entry nothing is live; the replaced file's events
        // must not be charged to this generation.
        let events = self.events.subscribe();
        set_live(&self.live, None);
        let entry = handle
            .load_stream(url)
            .await
            .map_err(|e| AudioError::Rejected(e.to_string()))?;
        set_live(&self.live, Some(LiveEntry { generation, entry }));
        debug!("mpv: loadfile g={} entry={:?} {}", generation, entry, url);

        let (mut tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = watch_attempt(events, entry) => outcome,
                _ = tx.closed() => return,
            };
            let _ = tx.send(outcome);
        });
        Ok(rx)
    }

    async fn pause(&self, generation: Generation) -> Result<(), AudioError> {
        if !self.owns(generation) {
            return Ok(());
        }
        if let Some(handle) = self.current_handle().await {
            handle
                .set_pause(true)
                .await
                .map_err(|e| AudioError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        let mut slot = self.slot.lock().await;
        slot.driver.last_volume = volume.clamp(0.0, 1.0);
        if let Some(handle) = slot.handle.as_ref() {
            handle
                .set_volume(volume)
                .await
                .map_err(|e| AudioError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), AudioError> {
        let mut slot = self.slot.lock().await;
        slot.driver.last_muted = muted;
        if let Some(handle) = slot.handle.as_ref() {
            handle
                .set_mute(muted)
                .await
                .map_err(|e| AudioError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn release(&self, generation: Generation) -> Result<(), AudioError> {
        if !self.owns(generation) {
            return Ok(());
        }
        set_live(&self.live, None);
        if let Some(handle) = self.current_handle().await {
            debug!("mpv: stop g={}", generation);
            handle
                .stop()
                .await
                .map_err(|e| AudioError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    fn failures(&self) -> broadcast::Receiver<StreamFailure> {
        self.failures.subscribe()
    }
}

fn current_live(live: &std::sync::Mutex<Option<LiveEntry>>) -> Option<LiveEntry> {
    *live.lock().unwrap_or_else(|e| e.into_inner())
}

fn set_live(live: &std::sync::Mutex<Option<LiveEntry>>, value: Option<LiveEntry>) {
    *live.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Fan mpv events out to attempt watchers and report failures of the live
/// entry.  A vanished connection counts as a failure too.
async fn event_pump(
    mut rx: mpsc::Receiver<MpvEvent>,
    events: broadcast::Sender<MpvEvent>,
    failures: broadcast::Sender<StreamFailure>,
    live: LiveSlot,
) {
    while let Some(evt) = rx.recv().await {
        if evt.end_file_reason() == Some("error") {
            match current_live(&live) {
                Some(owner) if owner.matches(&evt) => {
                    let _ = failures.send(StreamFailure {
                        generation: owner.generation,
                        reason: evt.file_error(),
                    });
                }
                _ => debug!(
                    "mpv: dropping error for entry {:?}, not live",
                    evt.playlist_entry_id()
                ),
            }
        }
        let _ = events.send(evt);
    }
    if let Some(LiveEntry { generation, .. }) = current_live(&live) {
        warn!("mpv: connection lost while g={} was live", generation);
        let _ = failures.send(StreamFailure {
            generation,
            reason: "audio player exited".to_string(),
        });
    }
}

/// Outcome of one `loadfile`.  With an entry id only `start-file`/`end-file`
/// for that entry count; without one, events before the first `start-file`
/// belong to the file being replaced and are skipped.
async fn watch_attempt(
    mut events: broadcast::Receiver<MpvEvent>,
    entry: Option<u64>,
) -> Result<(), AudioError> {
    let mut started = false;
    loop {
        let evt = match events.recv().await {
            Ok(evt) => evt,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("mpv: attempt watcher lagged by {}", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(AudioError::Backend("mpv event stream closed".to_string()))
            }
        };
        match evt.event_name() {
            Some("start-file") if entry_matches(entry, &evt) => started = true,
            Some("playback-restart") if started => return Ok(()),
            Some("end-file") if started && entry_matches(entry, &evt) => {
                return match evt.end_file_reason() {
                    Some("error") => Err(AudioError::Stream(evt.file_error())),
                    _ => Err(AudioError::Interrupted),
                };
            }
            _ => {}
        }
    }
}
