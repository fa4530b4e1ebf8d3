//! POSIX message-queue transport for single-host process groups.
//!
//! There is no broker: every bus instance owns an event-loop queue, and a
//! shared registry directory maps channels to the queues of their current
//! subscribers. Publishing scans the channel's registry entries and sends a
//! framed copy of the message to each queue.
//!
//! On-disk layout:
//!
//! ```text
//! <base_dir>/<namespace>/subscribers/<channel>/<queue-name>   marker files
//! ```
//!
//! Kernel queue names: `/omnibus_<ns>_el_<pid>_<seq>` for event loops,
//! `/omnibus_<ns>_q_<name>` for named queues. Kernel queues are bounded;
//! a full subscriber queue drops the delivery with a warning, and named
//! queues surface `QueueFull`/`QueueEmpty` through the timed operations.
//! Pattern matching and length reporting are not available here.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Capabilities, Delivery, DeliverySink, Transport, TransportQueue};
use crate::config::IpcConfig;
use crate::error::{BusError, Result};

/// Interval between attempts while emulating blocking queue operations on
/// the kernel's non-blocking primitives.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Distinguishes event-loop queues of several buses in one process.
static INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Transport backed by POSIX message queues.
pub struct IpcTransport {
    config: IpcConfig,
    loop_queue: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    reader: Option<JoinHandle<()>>,
    stop: Option<watch::Sender<bool>>,
    markers: HashSet<String>,
}

impl IpcTransport {
    pub fn new(config: &IpcConfig) -> Self {
        let loop_queue = format!(
            "/omnibus_{}_el_{}_{}",
            sanitize(&config.namespace),
            std::process::id(),
            INSTANCE.fetch_add(1, Ordering::Relaxed),
        );
        Self {
            config: config.clone(),
            loop_queue,
            state: Mutex::new(State::default()),
        }
    }

    fn namespace_dir(&self) -> PathBuf {
        self.config.base_dir.join(sanitize(&self.config.namespace))
    }

    fn subscribers_dir(&self) -> PathBuf {
        self.namespace_dir().join("subscribers")
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        self.subscribers_dir().join(sanitize(channel))
    }

    fn marker_path(&self, channel: &str) -> PathBuf {
        self.channel_dir(channel)
            .join(self.loop_queue.trim_start_matches('/'))
    }

    fn queue_name(&self, name: &str) -> String {
        format!(
            "/omnibus_{}_q_{}",
            sanitize(&self.config.namespace),
            sanitize(name)
        )
    }
}

#[async_trait]
impl Transport for IpcTransport {
    fn name(&self) -> &'static str {
        "ipc"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            patterns: false,
            cross_process: true,
            queue_len: false,
        }
    }

    async fn start(&self, sink: DeliverySink) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.reader.is_some() {
            return Ok(());
        }

        let namespace_dir = self.namespace_dir();
        fs::create_dir_all(self.subscribers_dir())?;
        fs::set_permissions(&namespace_dir, fs::Permissions::from_mode(self.config.mode))?;

        let name = cstr(&self.loop_queue)?;
        let attr = MqAttr::new(0, self.config.max_messages, self.config.message_size, 0);
        let mq = mq_open(
            name.as_c_str(),
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDONLY | MQ_OFlag::O_NONBLOCK,
            Mode::from_bits_truncate(self.config.mode),
            Some(&attr),
        )
        .map_err(|e| BusError::Connection(format!("mq_open {} failed: {e}", self.loop_queue)))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let message_size = self.config.message_size as usize;
        let loop_queue = self.loop_queue.clone();

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; message_size];
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let mut priority = 0u32;
                match mq_receive(&mq, &mut buf, &mut priority) {
                    Ok(len) => match decode_frame(&buf[..len]) {
                        Some((channel, payload)) => {
                            let delivery = Delivery {
                                channel,
                                pattern: None,
                                payload,
                            };
                            if sink.send(delivery).is_err() {
                                break;
                            }
                        }
                        None => warn!(queue = %loop_queue, "dropping malformed frame"),
                    },
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                        tokio::select! {
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                            _ = stop_rx.changed() => {}
                        }
                    }
                    Err(e) => {
                        error!(queue = %loop_queue, error = %e, "event loop receive failed");
                        break;
                    }
                }
            }
            let _ = mq_close(mq);
            if let Err(e) = mq_unlink(name.as_c_str()) {
                if e != Errno::ENOENT {
                    warn!(queue = %loop_queue, error = %e, "failed to unlink event loop queue");
                }
            }
            debug!(queue = %loop_queue, "ipc event loop stopped");
        });

        state.reader = Some(reader);
        state.stop = Some(stop_tx);

        info!(
            queue = %self.loop_queue,
            registry = %self.subscribers_dir().display(),
            "ipc transport started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(stop) = state.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(reader) = state.reader.take() {
            let _ = reader.await;
        }
        for channel in state.markers.drain().collect::<Vec<_>>() {
            if let Err(e) = fs::remove_file(self.marker_path(&channel)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(channel = %channel, error = %e, "failed to remove registry marker");
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let frame = encode_frame(channel, &payload);
        if frame.len() > self.config.message_size as usize {
            return Err(BusError::Transport(format!(
                "message of {} bytes exceeds the ipc frame limit of {}",
                frame.len(),
                self.config.message_size
            )));
        }

        let dir = self.channel_dir(channel);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(channel, "no subscribers, dropping message");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let queue = format!("/{}", entry.file_name().to_string_lossy());
            let name = cstr(&queue)?;

            let mq = match mq_open(name.as_c_str(), MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK, Mode::empty(), None)
            {
                Ok(mq) => mq,
                Err(Errno::ENOENT) => {
                    // The subscriber is gone; its marker outlived it.
                    debug!(channel, queue = %queue, "pruning stale registry marker");
                    let _ = fs::remove_file(entry.path());
                    continue;
                }
                Err(e) => {
                    warn!(channel, queue = %queue, error = %e, "failed to open subscriber queue");
                    continue;
                }
            };

            match mq_send(&mq, &frame, 0) {
                Ok(()) => {}
                Err(Errno::EAGAIN) => {
                    warn!(channel, queue = %queue, "subscriber queue full, dropping message");
                }
                Err(e) => {
                    warn!(channel, queue = %queue, error = %e, "failed to deliver message");
                }
            }
            let _ = mq_close(mq);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        if pattern {
            return Err(BusError::Unsupported {
                operation: "pattern subscription",
                transport: self.name(),
            });
        }

        let mut state = self.state.lock().await;
        fs::create_dir_all(self.channel_dir(channel))?;
        fs::write(self.marker_path(channel), "")?;
        state.markers.insert(channel.to_string());
        debug!(channel, queue = %self.loop_queue, "registered subscriber");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        if pattern {
            return Err(BusError::Unsupported {
                operation: "pattern subscription",
                transport: self.name(),
            });
        }

        let mut state = self.state.lock().await;
        state.markers.remove(channel);
        match fs::remove_file(self.marker_path(channel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn TransportQueue>> {
        Ok(Arc::new(IpcQueue {
            name: name.to_string(),
            mq_name: self.queue_name(name),
            max_messages: self.config.max_messages,
            message_size: self.config.message_size,
            mode: self.config.mode,
            mq: Mutex::new(None),
        }))
    }
}

/// A named, bounded kernel queue. Blocking and timed semantics are built
/// from the non-blocking primitives, polled on a short interval.
struct IpcQueue {
    name: String,
    mq_name: String,
    max_messages: i64,
    message_size: i64,
    mode: u32,
    mq: Mutex<Option<MqdT>>,
}

impl IpcQueue {
    async fn open(&self) -> Result<MutexGuard<'_, Option<MqdT>>> {
        let mut guard = self.mq.lock().await;
        if guard.is_none() {
            let name = cstr(&self.mq_name)?;
            let attr = MqAttr::new(0, self.max_messages, self.message_size, 0);
            let mq = mq_open(
                name.as_c_str(),
                MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK,
                Mode::from_bits_truncate(self.mode),
                Some(&attr),
            )
            .map_err(|e| BusError::Connection(format!("mq_open {} failed: {e}", self.mq_name)))?;
            *guard = Some(mq);
        }
        Ok(guard)
    }

    async fn try_send(&self, payload: &[u8]) -> Result<bool> {
        let guard = self.open().await?;
        let mq = guard
            .as_ref()
            .ok_or_else(|| BusError::Transport("queue is not open".to_string()))?;
        match mq_send(mq, payload, 0) {
            Ok(()) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(BusError::Transport(format!(
                "mq_send {} failed: {e}",
                self.mq_name
            ))),
        }
    }

    async fn try_receive(&self) -> Result<Option<Vec<u8>>> {
        let guard = self.open().await?;
        let mq = guard
            .as_ref()
            .ok_or_else(|| BusError::Transport("queue is not open".to_string()))?;
        let mut buf = vec![0u8; self.message_size as usize];
        let mut priority = 0u32;
        match mq_receive(mq, &mut buf, &mut priority) {
            Ok(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(BusError::Transport(format!(
                "mq_receive {} failed: {e}",
                self.mq_name
            ))),
        }
    }
}

#[async_trait]
impl TransportQueue for IpcQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, payload: Vec<u8>, timeout: Option<Duration>) -> Result<()> {
        if payload.len() > self.message_size as usize {
            return Err(BusError::Transport(format!(
                "item of {} bytes exceeds the queue's message size of {}",
                payload.len(),
                self.message_size
            )));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_send(&payload).await? {
                return Ok(());
            }
            wait_for_retry(deadline, BusError::QueueFull).await?;
        }
    }

    async fn try_put(&self, payload: Vec<u8>) -> Result<()> {
        if self.try_send(&payload).await? {
            Ok(())
        } else {
            Err(BusError::QueueFull)
        }
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(item) = self.try_receive().await? {
                return Ok(item);
            }
            wait_for_retry(deadline, BusError::QueueEmpty).await?;
        }
    }

    async fn try_get(&self) -> Result<Vec<u8>> {
        self.try_receive().await?.ok_or(BusError::QueueEmpty)
    }

    async fn len(&self) -> Result<usize> {
        Err(BusError::Unsupported {
            operation: "queue length",
            transport: "ipc",
        })
    }
}

/// Sleep one poll interval, or fail with `past_deadline` once the deadline
/// has passed.
async fn wait_for_retry(deadline: Option<Instant>, past_deadline: BusError) -> Result<()> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(past_deadline);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
        None => tokio::time::sleep(POLL_INTERVAL).await,
    }
    Ok(())
}

/// Queue and registry names share one restricted alphabet; anything else
/// becomes a dash.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn cstr(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BusError::Transport(format!("invalid queue name: {name}")))
}

/// Frame layout: 4-byte big-endian channel length, channel bytes, payload.
fn encode_frame(channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + channel.len() + payload.len());
    frame.extend_from_slice(&(channel.len() as u32).to_be_bytes());
    frame.extend_from_slice(channel.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn decode_frame(frame: &[u8]) -> Option<(String, Vec<u8>)> {
    if frame.len() < 4 {
        return None;
    }
    let channel_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() < 4 + channel_len {
        return None;
    }
    let channel = std::str::from_utf8(&frame[4..4 + channel_len]).ok()?;
    Some((channel.to_string(), frame[4 + channel_len..].to_vec()))
}
