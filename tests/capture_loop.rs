//! Capture loop scenarios against a scripted video source and socket

use assert_matches::assert_matches;
use frame_relay::capture::{
    AllocationError, BufferState, CaptureError, FrameBuffer, PixelFormat, VideoFormat, VideoSource,
};
use frame_relay::capture_loop::{CaptureLoop, LoopConfig, LoopError, LoopState, ShutdownHandle};
use frame_relay::transmit::{
    Connect, DatagramSocket, SendError, SendFailurePolicy, Transmitter, TransmitterOptions,
};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

const FRAME: usize = 25_600;

/// One scripted `dequeue` outcome while streaming
enum Step {
    /// Fill the oldest queued buffer with this many bytes
    Frame(usize),
    Fail(CaptureError),
    /// Deliver a frame and request shutdown
    LastFrame(usize),
}

#[derive(Default)]
struct SourceJournal {
    enqueues: usize,
    starts: usize,
    stops: usize,
    frames_delivered: usize,
    /// Buffer indices currently owned by the device
    held: HashSet<usize>,
    max_held: usize,
    violations: Vec<String>,
}

struct ScriptedSource {
    /// Pitch the device imposes, 0 for tightly packed rows
    native_pitch: u32,
    reject_format: bool,
    fail_start: bool,
    /// Buffers silently discarded on the next stops
    lose_on_stop: usize,
    format: Option<VideoFormat>,
    script: VecDeque<Step>,
    queued: VecDeque<FrameBuffer>,
    streaming: bool,
    shutdown: ShutdownHandle,
    journal: Rc<RefCell<SourceJournal>>,
}

impl ScriptedSource {
    fn new(
        shutdown: &ShutdownHandle,
        script: impl IntoIterator<Item = Step>,
    ) -> (Self, Rc<RefCell<SourceJournal>>) {
        let journal = Rc::new(RefCell::new(SourceJournal::default()));
        let source = Self {
            native_pitch: 0,
            reject_format: false,
            fail_start: false,
            lose_on_stop: 0,
            format: None,
            script: script.into_iter().collect(),
            queued: VecDeque::new(),
            streaming: false,
            shutdown: shutdown.clone(),
            journal: Rc::clone(&journal),
        };
        (source, journal)
    }

    fn release(&mut self) -> Option<FrameBuffer> {
        let buffer = self.queued.pop_front()?;
        self.journal.borrow_mut().held.remove(&buffer.index());
        Some(buffer)
    }
}

impl VideoSource for ScriptedSource {
    fn set_format(&mut self, requested: &VideoFormat) -> Result<(), CaptureError> {
        if self.reject_format {
            return Err(CaptureError::UnsupportedFormat {
                format: *requested,
                reason: "not supported by this sensor".into(),
            });
        }

        let pitch = match self.native_pitch {
            0 => requested.width * requested.pixel_format.bytes_per_pixel().unwrap_or(2),
            pitch => pitch,
        };
        self.format = Some(VideoFormat::new(
            requested.pixel_format,
            requested.width,
            requested.height,
            pitch,
        ));
        Ok(())
    }

    fn get_format(&mut self) -> Result<VideoFormat, CaptureError> {
        self.format.ok_or(CaptureError::NotStreaming)
    }

    fn enqueue(&mut self, buffer: FrameBuffer) {
        let mut journal = self.journal.borrow_mut();
        journal.enqueues += 1;

        if buffer.state() != BufferState::Queued {
            let msg = format!("buffer {} enqueued as {:?}", buffer.index(), buffer.state());
            journal.violations.push(msg);
        }
        if !journal.held.insert(buffer.index()) {
            let msg = format!("buffer {} enqueued twice", buffer.index());
            journal.violations.push(msg);
        }
        journal.max_held = journal.max_held.max(journal.held.len());
        drop(journal);

        self.queued.push_back(buffer);
    }

    fn dequeue(&mut self, timeout: Option<Duration>) -> Result<FrameBuffer, CaptureError> {
        if !self.streaming {
            return match self.release() {
                Some(buffer) => Ok(buffer),
                None if timeout.is_some() => Err(CaptureError::Timeout),
                None => Err(CaptureError::NotStreaming),
            };
        }

        let len = match self.script.pop_front() {
            Some(Step::Frame(len)) => len,
            Some(Step::LastFrame(len)) => {
                self.shutdown.shutdown();
                len
            }
            Some(Step::Fail(e)) => return Err(e),
            None => return Err(CaptureError::Timeout),
        };

        let mut buffer = self.release().ok_or(CaptureError::NoBuffersQueued)?;
        buffer.fill_from(&vec![0xA5; len])?;
        self.journal.borrow_mut().frames_delivered += 1;
        Ok(buffer)
    }

    fn start_stream(&mut self) -> Result<(), CaptureError> {
        self.journal.borrow_mut().starts += 1;
        if self.fail_start {
            return Err(CaptureError::Io(io::Error::new(
                io::ErrorKind::Other,
                "VIDIOC_STREAMON",
            )));
        }
        if self.queued.is_empty() {
            return Err(CaptureError::NoBuffersQueued);
        }
        self.streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CaptureError> {
        self.journal.borrow_mut().stops += 1;
        self.streaming = false;

        if self.lose_on_stop > 0 {
            self.lose_on_stop -= 1;
            drop(self.release());
        }
        Ok(())
    }
}

#[derive(Default)]
struct SocketJournal {
    sends: usize,
    bytes: usize,
    /// Replies for the next sends, accepting everything once exhausted
    replies: VecDeque<io::Result<usize>>,
}

#[derive(Clone, Default)]
struct ScriptedSocket(Rc<RefCell<SocketJournal>>);

impl ScriptedSocket {
    fn reply_with(&self, reply: io::Result<usize>) {
        self.0.borrow_mut().replies.push_back(reply);
    }
}

impl DatagramSocket for ScriptedSocket {
    fn send_to(&mut self, buf: &[u8], _dest: SocketAddr) -> io::Result<usize> {
        let mut journal = self.0.borrow_mut();
        journal.sends += 1;

        let reply = journal.replies.pop_front().unwrap_or(Ok(buf.len()));
        if let Ok(n) = reply {
            journal.bytes += n.min(buf.len());
        }
        reply
    }
}

struct ScriptedConnector(ScriptedSocket);

impl Connect for ScriptedConnector {
    type Socket = ScriptedSocket;

    fn connect(&mut self) -> io::Result<ScriptedSocket> {
        Ok(self.0.clone())
    }
}

fn refused() -> io::Result<usize> {
    Err(io::ErrorKind::ConnectionRefused.into())
}

fn transmitter(policy: SendFailurePolicy) -> (Transmitter<ScriptedConnector>, ScriptedSocket) {
    let socket = ScriptedSocket::default();
    let tx = Transmitter::connect(
        ScriptedConnector(socket.clone()),
        "192.168.0.29:5000".parse().unwrap(),
        TransmitterOptions {
            policy,
            reconnect_backoff: Duration::ZERO,
            ..Default::default()
        },
    )
    .unwrap();
    (tx, socket)
}

fn rgb565_160x80() -> LoopConfig {
    LoopConfig {
        requested_format: VideoFormat::new(PixelFormat::RGB565, 160, 80, 320),
        dequeue_timeout: None,
        memory_limit: None,
    }
}

fn frames(n: usize) -> Vec<Step> {
    let mut steps: Vec<Step> = (1..n).map(|_| Step::Frame(FRAME)).collect();
    steps.push(Step::LastFrame(FRAME));
    steps
}

#[test]
fn test_five_frames_end_to_end() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(&shutdown, frames(5));
    let (tx, socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    relay.run().unwrap();

    let journal = journal.borrow();
    let socket = socket.0.borrow();

    assert_eq!(relay.format().unwrap().frame_size(), FRAME);
    assert_eq!(socket.sends, 5);
    assert_eq!(socket.bytes, 5 * FRAME);
    // Two initial enqueues plus one requeue per frame
    assert_eq!(journal.enqueues, 2 + 5);
    assert_eq!(journal.frames_delivered, 5);
    assert!(journal.max_held <= 2);
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    assert!(journal.held.is_empty());
    assert_eq!(journal.starts, 1);
    assert_eq!(journal.stops, 1);

    assert_eq!(relay.pool().peak(), 2);
    assert_eq!(relay.pool().live(), 0);
    assert_eq!(relay.state(), LoopState::Stopped);

    let stats = relay.stats();
    assert_eq!(stats.frames_captured, 5);
    assert_eq!(stats.frames_sent, 5);
    assert_eq!(stats.datagrams_sent, 5);
    assert_eq!(stats.bytes_sent, 5 * FRAME as u64);
    assert_eq!(stats.frames_dropped, 0);
}

#[test]
fn test_device_pitch_sizes_the_buffers() {
    let shutdown = ShutdownHandle::default();
    let (mut source, journal) = ScriptedSource::new(&shutdown, [Step::LastFrame(384 * 80)]);
    source.native_pitch = 384;
    let (tx, socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    relay.run().unwrap();

    let format = relay.format().unwrap();
    assert_eq!(format.pitch, 384);
    assert_eq!(format.frame_size(), 30_720);
    assert_eq!(socket.0.borrow().bytes, 30_720);
    assert_eq!(journal.borrow().frames_delivered, 1);
}

#[test]
fn test_dequeue_timeout_is_fatal() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(
        &shutdown,
        [
            Step::Frame(FRAME),
            Step::Frame(FRAME),
            Step::Fail(CaptureError::Timeout),
            Step::Frame(FRAME),
        ],
    );
    let (tx, socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    let err = relay.run().unwrap_err();

    assert_matches!(err, LoopError::Dequeue(CaptureError::Timeout));
    assert_eq!(err.exit_code(), 13);
    assert!(!err.is_setup());

    let journal = journal.borrow();
    assert_eq!(socket.0.borrow().sends, 2);
    assert_eq!(journal.enqueues, 2 + 2);
    assert_eq!(journal.frames_delivered, 2);
    // Both buffers were taken back from the stopped device
    assert_eq!(journal.stops, 1);
    assert!(journal.held.is_empty());
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    assert_eq!(relay.stats().frames_sent, 2);
}

#[test]
fn test_send_failure_drops_frames_and_keeps_capturing() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(&shutdown, frames(5));
    let (tx, socket) = transmitter(SendFailurePolicy::DropFrames);
    socket.reply_with(Ok(FRAME));
    socket.reply_with(refused());
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    relay.run().unwrap();

    let journal = journal.borrow();
    // The failed buffer went back to the device like any other
    assert_eq!(journal.enqueues, 2 + 5);
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    assert_eq!(socket.0.borrow().sends, 2);
    assert!(!relay.transmitter().is_open());

    let stats = relay.stats();
    assert_eq!(stats.frames_captured, 5);
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.send_errors, 1);
    assert_eq!(stats.frames_dropped, 3);
}

#[test]
fn test_abort_policy_stops_after_requeue() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(&shutdown, frames(5));
    let (tx, socket) = transmitter(SendFailurePolicy::Abort);
    socket.reply_with(refused());
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    let err = relay.run().unwrap_err();

    assert_matches!(err, LoopError::Transmit(SendError::Fatal { .. }));
    assert_eq!(err.exit_code(), 14);

    let journal = journal.borrow();
    assert_eq!(journal.frames_delivered, 1);
    assert_eq!(journal.enqueues, 2 + 1);
    assert!(journal.held.is_empty());
    assert_eq!(relay.stats().send_errors, 1);
}

#[test]
fn test_reconnect_policy_reopens_channel() {
    let shutdown = ShutdownHandle::default();
    let (source, _journal) = ScriptedSource::new(&shutdown, frames(3));
    let (tx, socket) = transmitter(SendFailurePolicy::Reconnect);
    socket.reply_with(refused());
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    relay.run().unwrap();

    assert!(relay.transmitter().is_open());
    let stats = relay.stats();
    assert_eq!(stats.send_errors, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.frames_sent, 2);
    assert_eq!(stats.frames_dropped, 0);
}

#[test]
fn test_transient_errors_are_retried() {
    let shutdown = ShutdownHandle::default();
    let (source, _journal) = ScriptedSource::new(&shutdown, frames(1));
    let (tx, socket) = transmitter(SendFailurePolicy::Abort);
    socket.reply_with(Err(io::ErrorKind::WouldBlock.into()));
    socket.reply_with(Ok(0));
    socket.reply_with(Ok(10_000));
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    relay.run().unwrap();

    assert_eq!(socket.0.borrow().bytes, FRAME);
    let stats = relay.stats();
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.transient_retries, 2);
    assert_eq!(stats.datagrams_sent, 2);
    assert_eq!(stats.bytes_sent, FRAME as u64);
}

#[test]
fn test_stream_stopped_restarts_stream() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(
        &shutdown,
        [
            Step::Frame(FRAME),
            Step::Fail(CaptureError::StreamStopped),
            Step::Frame(FRAME),
            Step::LastFrame(FRAME),
        ],
    );
    let (tx, _socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    relay.run().unwrap();

    let journal = journal.borrow();
    assert_eq!(journal.starts, 2);
    assert_eq!(journal.stops, 2);
    assert_eq!(journal.enqueues, 2 + 1 + 2 + 2);
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    assert_eq!(relay.pool().peak(), 2);

    let stats = relay.stats();
    assert_eq!(stats.stream_restarts, 1);
    assert_eq!(stats.frames_sent, 3);
}

#[test]
fn test_restart_replaces_lost_buffers() {
    let shutdown = ShutdownHandle::default();
    let (mut source, journal) = ScriptedSource::new(
        &shutdown,
        [
            Step::Frame(FRAME),
            Step::Fail(CaptureError::StreamStopped),
            Step::Frame(FRAME),
            Step::LastFrame(FRAME),
        ],
    );
    source.lose_on_stop = 1;
    let (tx, _socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    relay.run().unwrap();

    let journal = journal.borrow();
    assert_eq!(journal.starts, 2);
    assert_eq!(journal.max_held, 2);
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    assert_eq!(relay.pool().peak(), 2);
    assert_eq!(relay.stats().frames_sent, 3);
}

#[test]
fn test_idle_restarts_are_bounded() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(
        &shutdown,
        (0..10).map(|_| Step::Fail(CaptureError::StreamStopped)),
    );
    let (tx, _socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown);

    let err = relay.run().unwrap_err();

    assert_matches!(err, LoopError::Dequeue(CaptureError::StreamStopped));
    assert_eq!(journal.borrow().starts, 4);
    assert_eq!(relay.stats().stream_restarts, 3);
}

#[test]
fn test_shutdown_before_streaming() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(&shutdown, frames(3));
    let (tx, socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80()).with_shutdown(shutdown.clone());
    shutdown.shutdown();

    relay.run().unwrap();

    assert_eq!(relay.state(), LoopState::Stopped);
    assert_eq!(journal.borrow().starts, 0);
    assert_eq!(journal.borrow().enqueues, 0);
    assert_eq!(socket.0.borrow().sends, 0);
    assert_eq!(relay.pool().live(), 0);
}

#[test]
fn test_format_rejection_is_setup_failure() {
    let shutdown = ShutdownHandle::default();
    let (mut source, journal) = ScriptedSource::new(&shutdown, frames(1));
    source.reject_format = true;
    let (tx, _socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80());

    let err = relay.run().unwrap_err();

    assert_matches!(err, LoopError::FormatNegotiation(CaptureError::UnsupportedFormat { .. }));
    assert_eq!(err.exit_code(), 10);
    assert!(err.is_setup());
    assert_eq!(relay.state(), LoopState::Init);
    assert_eq!(relay.pool().peak(), 0);
    assert_eq!(journal.borrow().enqueues, 0);
}

#[test]
fn test_memory_limit_fails_allocation() {
    let shutdown = ShutdownHandle::default();
    let (source, journal) = ScriptedSource::new(&shutdown, frames(1));
    let (tx, _socket) = transmitter(SendFailurePolicy::DropFrames);
    let config = LoopConfig {
        memory_limit: Some(40_000),
        ..rgb565_160x80()
    };
    let mut relay = CaptureLoop::new(source, tx, config);

    let err = relay.run().unwrap_err();

    assert_matches!(err, LoopError::Allocation(AllocationError::LimitExceeded { index: 1, .. }));
    assert_eq!(err.exit_code(), 11);
    assert_eq!(relay.state(), LoopState::FormatNegotiated);
    assert_eq!(relay.pool().live(), 0);
    assert_eq!(journal.borrow().starts, 0);
}

#[test]
fn test_stream_start_failure() {
    let shutdown = ShutdownHandle::default();
    let (mut source, journal) = ScriptedSource::new(&shutdown, frames(1));
    source.fail_start = true;
    let (tx, socket) = transmitter(SendFailurePolicy::DropFrames);
    let mut relay = CaptureLoop::new(source, tx, rgb565_160x80());

    let err = relay.run().unwrap_err();

    assert_matches!(err, LoopError::StreamStart(CaptureError::Io(_)));
    assert_eq!(err.exit_code(), 12);
    assert_eq!(journal.borrow().starts, 1);
    assert_eq!(socket.0.borrow().sends, 0);
}
