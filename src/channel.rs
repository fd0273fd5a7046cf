//! Detection dispatch channel.
//!
//! `DetectionChannel` turns one frame of detections into one UDP datagram and
//! hands it to the kernel with a single non-blocking `send_to`. It never waits:
//! if the datagram cannot be queued right away it is dropped, counted, and
//! superseded by the next frame.
//!
//! # Failure policy
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | datagram queued | `sent` += 1 |
//! | send buffer full, unreachable, any other transport error | `dropped` += 1, `on_drop` hook, rate-limited warning |
//! | object not encodable (NaN/inf score or bbox) | `Err` returned, nothing sent |
//!
//! Dropped frames are never retried or queued.

use anyhow::Result;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ChannelConfig;
use crate::detection::{DetectionBatch, DetectionObject};
use crate::socket::open_socket;

/// Anything that can fire a datagram at an address without blocking.
pub trait DatagramSink: Send + Sync {
    fn send_to(&self, payload: &[u8], destination: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_to(&self, payload: &[u8], destination: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, destination)
    }
}

/// Why a datagram was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Kernel send buffer full.
    WouldBlock,
    /// The kernel accepted fewer bytes than the payload.
    Truncated { written: usize, expected: usize },
    /// Any other transport error.
    Transport { kind: io::ErrorKind, message: String },
}

impl DropReason {
    fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => DropReason::WouldBlock,
            kind => DropReason::Transport {
                kind,
                message: err.to_string(),
            },
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::WouldBlock => write!(f, "send buffer full"),
            DropReason::Truncated { written, expected } => {
                write!(f, "short write ({} of {} bytes)", written, expected)
            }
            DropReason::Transport { kind, message } => {
                write!(f, "transport error ({}: {})", kind, message)
            }
        }
    }
}

/// Passed to the `on_drop` hook for every dropped datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DropEvent {
    pub frame_id: u64,
    /// Drops so far, including this one.
    pub total_drops: u64,
    pub reason: DropReason,
}

pub type DropHook = Box<dyn Fn(&DropEvent) + Send + Sync>;

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub dropped: u64,
    /// Drop warnings actually logged.
    pub diagnostics: u64,
}

enum SendOutcome {
    Sent(usize),
    Dropped(DropReason),
}

/// Fire-and-forget publisher of per-frame detections to one fixed destination.
pub struct DetectionChannel<S: DatagramSink = UdpSocket> {
    sink: S,
    destination: SocketAddr,
    drop_log_interval: u64,
    on_drop: Option<DropHook>,
    sent: AtomicU64,
    dropped: AtomicU64,
    diagnostics: AtomicU64,
}

impl DetectionChannel<UdpSocket> {
    /// Open a UDP channel to the configured destination.
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        let destination = config.resolve_destination()?;
        let socket = open_socket(destination, config.send_buffer_size)?;
        log::info!(
            "detection channel: {} -> {} (send buffer: {})",
            socket
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            destination,
            config
                .send_buffer_size
                .map(|size| format!("{} bytes", size))
                .unwrap_or_else(|| "system default".to_string())
        );
        Ok(Self::with_sink(socket, destination, config))
    }

    /// Channel to `127.0.0.1:5005` with the default buffer policy.
    pub fn open_default() -> Result<Self> {
        Self::new(&ChannelConfig::default())
    }

    /// Local address of the outbound socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sink.local_addr()
    }
}

impl<S: DatagramSink> DetectionChannel<S> {
    /// Build a channel over an arbitrary sink. Only `drop_log_interval` is read
    /// from `config`; the destination is taken as given.
    pub fn with_sink(sink: S, destination: SocketAddr, config: &ChannelConfig) -> Self {
        Self {
            sink,
            destination,
            drop_log_interval: config.drop_log_interval.max(1),
            on_drop: None,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            diagnostics: AtomicU64::new(0),
        }
    }

    /// Install a hook called once per dropped datagram.
    pub fn on_drop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DropEvent) + Send + Sync + 'static,
    {
        self.on_drop = Some(Box::new(hook));
        self
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Stamp, encode and fire one frame of detections.
    ///
    /// Transport failures are absorbed: the frame is dropped and counted and
    /// `Ok(())` is returned. Only an unencodable object produces an error.
    pub fn send(&self, objects: &[DetectionObject], frame_id: u64) -> Result<()> {
        self.send_batch(&DetectionBatch::now(frame_id, objects))
    }

    /// Like [`send`](Self::send) but with a caller-built batch.
    pub fn send_batch(&self, batch: &DetectionBatch<'_>) -> Result<()> {
        let payload = batch.encode()?;
        match self.transmit(&payload) {
            SendOutcome::Sent(written) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "sent frame {} ({} objects, {} bytes) to {}",
                    batch.frame_id,
                    batch.objects.len(),
                    written,
                    self.destination
                );
            }
            SendOutcome::Dropped(reason) => self.record_drop(batch.frame_id, reason),
        }
        Ok(())
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            diagnostics: self.diagnostics.load(Ordering::Relaxed),
        }
    }

    fn transmit(&self, payload: &[u8]) -> SendOutcome {
        match self.sink.send_to(payload, self.destination) {
            Ok(written) if written == payload.len() => SendOutcome::Sent(written),
            Ok(written) => SendOutcome::Dropped(DropReason::Truncated {
                written,
                expected: payload.len(),
            }),
            Err(err) => SendOutcome::Dropped(DropReason::from_io(&err)),
        }
    }

    fn record_drop(&self, frame_id: u64, reason: DropReason) {
        let total_drops = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;

        if should_report(total_drops, self.drop_log_interval) {
            self.diagnostics.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "dropped frame {} to {}: {}; {} dropped so far",
                frame_id,
                self.destination,
                reason,
                total_drops
            );
        } else {
            log::debug!("dropped frame {}: {}", frame_id, reason);
        }

        if let Some(hook) = &self.on_drop {
            hook(&DropEvent {
                frame_id,
                total_drops,
                reason,
            });
        }
    }
}

/// Report the 1st drop and every `interval`-th after it (1, 101, 201, ...).
fn should_report(drop_number: u64, interval: u64) -> bool {
    drop_number > 0 && (drop_number - 1) % interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    /// Fails the first `failures` sends with `kind`, then accepts everything.
    struct ScriptedSink {
        failures: AtomicUsize,
        kind: io::ErrorKind,
        accepted: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedSink {
        fn failing(failures: usize, kind: io::ErrorKind) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                kind,
                accepted: Mutex::new(Vec::new()),
            }
        }
    }

    impl DatagramSink for ScriptedSink {
        fn send_to(&self, payload: &[u8], _destination: SocketAddr) -> io::Result<usize> {
            let remaining = self.failures.load(Ordering::Relaxed);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::Relaxed);
                return Err(io::Error::new(self.kind, "scripted failure"));
            }
            self.accepted.lock().unwrap().push(payload.to_vec());
            Ok(payload.len())
        }
    }

    struct ShortWriteSink;

    impl DatagramSink for ShortWriteSink {
        fn send_to(&self, payload: &[u8], _destination: SocketAddr) -> io::Result<usize> {
            Ok(payload.len() / 2)
        }
    }

    fn dest() -> SocketAddr {
        "127.0.0.1:5005".parse().unwrap()
    }

    fn duck() -> Vec<DetectionObject> {
        vec![DetectionObject::new("duck", 0.87, [0.2, 0.3, 0.5, 0.6])]
    }

    #[test]
    fn report_schedule_is_first_then_every_interval() {
        let reported: Vec<u64> = (1..=250).filter(|n| should_report(*n, 100)).collect();
        assert_eq!(reported, vec![1, 101, 201]);
        assert!(!should_report(0, 100));
        assert!((1..=5).all(|n| should_report(n, 1)));
    }

    #[test]
    fn forced_failures_count_exactly_and_never_error() {
        let channel = DetectionChannel::with_sink(
            ScriptedSink::failing(37, io::ErrorKind::WouldBlock),
            dest(),
            &ChannelConfig::default(),
        );
        for frame_id in 0..37 {
            channel.send(&duck(), frame_id).unwrap();
        }
        assert_eq!(channel.drop_count(), 37);
        assert_eq!(channel.sent_count(), 0);

        channel.send(&duck(), 37).unwrap();
        assert_eq!(channel.stats().sent, 1);
        assert_eq!(channel.stats().dropped, 37);
    }

    #[test]
    fn diagnostics_are_rate_limited() {
        let channel = DetectionChannel::with_sink(
            ScriptedSink::failing(250, io::ErrorKind::WouldBlock),
            dest(),
            &ChannelConfig::default(),
        );
        for frame_id in 0..250 {
            channel.send(&duck(), frame_id).unwrap();
        }
        let stats = channel.stats();
        assert_eq!(stats.dropped, 250);
        assert!(stats.diagnostics <= 3, "{} diagnostics", stats.diagnostics);
        assert_eq!(stats.diagnostics, 3);
    }

    #[test]
    fn drop_hook_sees_every_drop_with_reason() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let channel = DetectionChannel::with_sink(
            ScriptedSink::failing(2, io::ErrorKind::PermissionDenied),
            dest(),
            &ChannelConfig::default(),
        )
        .on_drop(move |event| seen.lock().unwrap().push(event.clone()));

        for frame_id in 10..13 {
            channel.send(&duck(), frame_id).unwrap();
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].frame_id, 10);
        assert_eq!(events[0].total_drops, 1);
        assert_eq!(events[1].frame_id, 11);
        assert_eq!(events[1].total_drops, 2);
        assert_eq!(
            events[1].reason,
            DropReason::Transport {
                kind: io::ErrorKind::PermissionDenied,
                message: "scripted failure".to_string(),
            }
        );
        assert!(events[1].reason.to_string().contains("scripted failure"));
    }

    #[test]
    fn would_block_is_classified() {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&reasons);
        let channel = DetectionChannel::with_sink(
            ScriptedSink::failing(1, io::ErrorKind::WouldBlock),
            dest(),
            &ChannelConfig::default(),
        )
        .on_drop(move |event| seen.lock().unwrap().push(event.reason.clone()));
        channel.send(&[], 0).unwrap();
        assert_eq!(*reasons.lock().unwrap(), vec![DropReason::WouldBlock]);
    }

    #[test]
    fn short_write_counts_as_drop() {
        let channel =
            DetectionChannel::with_sink(ShortWriteSink, dest(), &ChannelConfig::default());
        channel.send(&duck(), 1).unwrap();
        assert_eq!(channel.drop_count(), 1);
        assert_eq!(channel.sent_count(), 0);
    }

    #[test]
    fn unencodable_objects_surface_and_are_not_drops() {
        let channel = DetectionChannel::with_sink(
            ScriptedSink::failing(0, io::ErrorKind::WouldBlock),
            dest(),
            &ChannelConfig::default(),
        );
        let bad = vec![DetectionObject::new("duck", f64::NAN, [0.0, 0.0, 1.0, 1.0])];
        assert!(channel.send(&bad, 1).is_err());
        assert_eq!(channel.stats(), ChannelStats::default());
        assert!(channel.sink.accepted.lock().unwrap().is_empty());
    }

    #[test]
    fn each_payload_stands_alone() {
        let channel = DetectionChannel::with_sink(
            ScriptedSink::failing(0, io::ErrorKind::WouldBlock),
            dest(),
            &ChannelConfig::default(),
        );
        channel.send(&duck(), 0).unwrap();
        channel.send(&[], 1).unwrap();

        let accepted = channel.sink.accepted.lock().unwrap();
        let first = DetectionBatch::decode(&accepted[0]).unwrap();
        let second = DetectionBatch::decode(&accepted[1]).unwrap();
        assert_eq!(first.frame_id, 0);
        assert_eq!(first.objects.as_ref(), duck().as_slice());
        assert_eq!(second.frame_id, 1);
        assert!(second.objects.is_empty());
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn concurrent_drops_are_counted_atomically() {
        let channel = Arc::new(DetectionChannel::with_sink(
            ScriptedSink::failing(usize::MAX, io::ErrorKind::WouldBlock),
            dest(),
            &ChannelConfig::default(),
        ));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let channel = Arc::clone(&channel);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        channel.send(&[], t * 100 + i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(channel.drop_count(), 400);
        assert_eq!(channel.stats().diagnostics, 4);
    }
}
