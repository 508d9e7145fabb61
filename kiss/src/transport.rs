//! Serial-port KISS transport: opens a POSIX character device (or a Bluetooth RFCOMM
//! port behind one), frames/deframes KISS, and exposes a small `sync()`-driven state
//! machine in the same shape as a mio-polled network channel -- readiness is polled, and
//! accumulated [`TransportEvent`]s are drained by the caller once per tick.

use crate::codec::{self, Deframer, KissFrame, CMD_DATA, CMD_DUPLEX, CMD_PERSISTENCE, CMD_RESET, CMD_SLOT_TIME, CMD_TX_DELAY};
use crate::error::TransportError;
use crate::registry;
use flux::logging;
use mio::unix::EventedFd;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate as NixBaud, SetArg};
use nix::unistd;
use slice_deque::SliceDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const READ_TOKEN: Token = Token(0);
const BT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const STABILIZE_USB: Duration = Duration::from_millis(1_000);
const STABILIZE_BT: Duration = Duration::from_millis(500);
const WRITE_POLL_TIMEOUT: Duration = Duration::from_millis(500);
const INIT_FRAME_STAGGER: Duration = Duration::from_millis(100);
const INIT_RESET_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BaudRate {
    B1200,
    B2400,
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl Default for BaudRate {
    fn default() -> Self {
        BaudRate::B115200
    }
}

impl BaudRate {
    fn to_nix(self) -> NixBaud {
        match self {
            BaudRate::B1200 => NixBaud::B1200,
            BaudRate::B2400 => NixBaud::B2400,
            BaudRate::B4800 => NixBaud::B4800,
            BaudRate::B9600 => NixBaud::B9600,
            BaudRate::B19200 => NixBaud::B19200,
            BaudRate::B38400 => NixBaud::B38400,
            BaudRate::B57600 => NixBaud::B57600,
            BaudRate::B115200 => NixBaud::B115200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub gain: Option<u8>,
    pub modem_config: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct KissConfig {
    pub device_path: String,
    pub baud_rate: BaudRate,
    pub auto_reconnect: bool,
    pub vendor: Option<VendorConfig>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    FrameReceived(KissFrame),
    Error(String),
}

/// Determines whether a device path is a Bluetooth RFCOMM endpoint, by the conventional
/// naming schemes of the platforms this stack targets, rather than a USB-serial path.
pub fn is_bluetooth_path(path: &str) -> bool {
    path.contains("rfcomm") || path.contains("Bluetooth") || path.contains("bt-")
}

enum Phase {
    Disconnected,
    OpeningBlocking {
        rx: mpsc::Receiver<Result<RawFd, TransportError>>,
        started: Instant,
        attempt: u32,
    },
    Stabilizing {
        fd: RawFd,
        since: Instant,
        delay: Duration,
    },
    InitSequence {
        fd: RawFd,
        queued: Vec<(Duration, KissFrame)>,
        started: Instant,
        next_index: usize,
    },
    Open {
        fd: RawFd,
    },
    WaitingReconnect {
        retry_at: Instant,
        attempt: u32,
    },
}

pub struct KissTransport {
    config: KissConfig,
    port: u8,
    phase: Phase,
    poll: Poll,
    deframer: Deframer,
    egress: SliceDeque<u8>,
    events: Vec<TransportEvent>,
    state: TransportState,
    logger: logging::Logger,
}

struct RawFdSource(RawFd);

impl Evented for RawFdSource {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.0).register(poll, token, interest, opts)
    }
    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.0).reregister(poll, token, interest, opts)
    }
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        EventedFd(&self.0).deregister(poll)
    }
}

impl KissTransport {
    pub fn new(config: KissConfig, port: u8, logger: logging::Logger) -> Result<KissTransport, TransportError> {
        Ok(KissTransport {
            config,
            port,
            phase: Phase::Disconnected,
            poll: Poll::new().map_err(|e| TransportError::ConfigFailed(e.to_string()))?,
            deframer: Deframer::new(),
            egress: SliceDeque::new(),
            events: Vec::new(),
            state: TransportState::Disconnected,
            logger,
        })
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// The instant this transport next has something to do on its own (a Bluetooth open
    /// timeout, a stabilize/init-sequence step, a reconnect retry) -- `None` while open,
    /// since readability there is polled every `sync()` rather than deadline-driven.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match &self.phase {
            Phase::OpeningBlocking { started, .. } => Some(*started + BT_OPEN_TIMEOUT),
            Phase::Stabilizing { since, delay, .. } => Some(*since + *delay),
            Phase::InitSequence { started, queued, next_index, .. } => {
                queued.get(*next_index).map(|(delay, _)| *started + *delay)
            }
            Phase::WaitingReconnect { retry_at, .. } => Some(*retry_at),
            Phase::Open { .. } | Phase::Disconnected => None,
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if state != self.state {
            self.state = state;
            self.events.push(TransportEvent::StateChanged(state));
        }
    }

    /// Begins the open sequence (step 1-2 of the spec's open procedure): claims the
    /// process-wide path guard, then either hands off to a detached blocking-open worker
    /// (Bluetooth) or opens the device non-blocking directly (USB).
    pub fn open(&mut self) -> Result<(), TransportError> {
        self.open_attempt(1)
    }

    /// Same as [`open`](Self::open), but carries the retry-attempt count through so the
    /// reconnect backoff this failure schedules (if any) keeps escalating rather than
    /// resetting to the first-attempt delay on every loop iteration.
    fn open_attempt(&mut self, attempt: u32) -> Result<(), TransportError> {
        if !registry::claim(&self.config.device_path) {
            let err = TransportError::AlreadyClaimed(self.config.device_path.clone());
            self.set_state(TransportState::Failed);
            if self.config.auto_reconnect {
                self.schedule_reconnect(attempt, reconnect_base_delay(&err));
            }
            return Err(err);
        }
        self.set_state(TransportState::Connecting);

        if is_bluetooth_path(&self.config.device_path) {
            let (tx, rx) = mpsc::channel();
            let path = self.config.device_path.clone();
            thread::spawn(move || {
                let result = blocking_open(&path);
                let _ = tx.send(result);
            });
            self.phase = Phase::OpeningBlocking { rx, started: Instant::now(), attempt };
        } else {
            match nonblocking_open(&self.config.device_path, self.config.baud_rate) {
                Ok(fd) => self.begin_stabilize(fd, STABILIZE_USB),
                Err(err) => {
                    registry::release(&self.config.device_path);
                    self.set_state(TransportState::Failed);
                    if self.config.auto_reconnect {
                        self.schedule_reconnect(attempt, reconnect_base_delay(&err));
                    } else {
                        self.phase = Phase::Disconnected;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn begin_stabilize(&mut self, fd: RawFd, delay: Duration) {
        self.phase = Phase::Stabilizing { fd, since: Instant::now(), delay };
    }

    fn begin_init_sequence(&mut self, fd: RawFd) {
        let mut queued = vec![
            (Duration::from_secs(0), KissFrame::control(self.port, CMD_DUPLEX, vec![0])),
            (INIT_FRAME_STAGGER, KissFrame::control(self.port, CMD_PERSISTENCE, vec![64])),
            (INIT_FRAME_STAGGER * 2, KissFrame::control(self.port, CMD_SLOT_TIME, vec![0])),
            (INIT_FRAME_STAGGER * 3, KissFrame::control(self.port, CMD_TX_DELAY, vec![30])),
        ];
        if let Some(vendor) = &self.config.vendor {
            let mut at = INIT_FRAME_STAGGER * 4;
            if let Some(gain) = vendor.gain {
                queued.push((at, KissFrame::control(self.port, 0x06, vec![gain])));
                at += INIT_FRAME_STAGGER;
            }
            if let Some(modem) = &vendor.modem_config {
                queued.push((at, KissFrame::control(self.port, 0x06, modem.clone())));
            }
        }
        queued.push((INIT_RESET_DELAY, KissFrame::control(self.port, CMD_RESET, vec![])));
        self.phase = Phase::InitSequence { fd, queued, started: Instant::now(), next_index: 0 };
    }

    fn finish_open(&mut self, fd: RawFd) -> Result<(), TransportError> {
        let source = RawFdSource(fd);
        self.poll
            .register(&source, READ_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(|e| TransportError::ConfigFailed(e.to_string()))?;
        self.phase = Phase::Open { fd };
        self.set_state(TransportState::Connected);
        logging::info!(self.logger, "kiss transport open"; "device" => self.config.device_path.clone());
        Ok(())
    }

    /// Drives the state machine forward by one tick and drains queued outbound bytes
    /// where the phase allows it. Call on a fixed cadence (e.g. from an event loop).
    pub fn sync(&mut self, now: Instant) {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::OpeningBlocking { rx, started, attempt } => match rx.try_recv() {
                Ok(Ok(fd)) => self.begin_stabilize(fd, STABILIZE_BT),
                Ok(Err(err)) => {
                    registry::release(&self.config.device_path);
                    self.events.push(TransportEvent::Error(err.to_string()));
                    self.set_state(TransportState::Failed);
                    if self.config.auto_reconnect {
                        self.schedule_reconnect(attempt, reconnect_base_delay(&err));
                    }
                }
                Err(mpsc::TryRecvError::Empty) => {
                    if now.duration_since(started) >= BT_OPEN_TIMEOUT {
                        registry::release(&self.config.device_path);
                        self.events.push(TransportEvent::Error("bluetooth open timed out".into()));
                        self.set_state(TransportState::Failed);
                        if self.config.auto_reconnect {
                            self.schedule_reconnect(attempt, reconnect_base_delay(&TransportError::OpenTimeout(BT_OPEN_TIMEOUT)));
                        }
                    } else {
                        self.phase = Phase::OpeningBlocking { rx, started, attempt };
                    }
                }
                Err(mpsc::TryRecvError::Disconnected) => {
                    registry::release(&self.config.device_path);
                    self.set_state(TransportState::Failed);
                    if self.config.auto_reconnect {
                        self.schedule_reconnect(attempt, RECONNECT_BASE);
                    }
                }
            },
            Phase::Stabilizing { fd, since, delay } => {
                if now.duration_since(since) >= delay {
                    self.begin_init_sequence(fd);
                } else {
                    self.phase = Phase::Stabilizing { fd, since, delay };
                }
            }
            Phase::InitSequence { fd, queued, started, mut next_index } => {
                while next_index < queued.len() && now.duration_since(started) >= queued[next_index].0 {
                    let wire = codec::encode(&queued[next_index].1);
                    if write_all(fd, &wire).is_err() {
                        self.events.push(TransportEvent::Error("failed writing init frame".into()));
                    }
                    next_index += 1;
                }
                if next_index >= queued.len() {
                    if let Err(err) = self.finish_open(fd) {
                        self.events.push(TransportEvent::Error(err.to_string()));
                        self.set_state(TransportState::Failed);
                    }
                } else {
                    self.phase = Phase::InitSequence { fd, queued, started, next_index };
                }
            }
            Phase::Open { fd } => {
                self.poll_readable(fd);
                self.flush_egress(fd);
                self.phase = Phase::Open { fd };
            }
            Phase::WaitingReconnect { retry_at, attempt } => {
                if now >= retry_at && self.config.auto_reconnect {
                    if let Err(err) = self.open_attempt(attempt + 1) {
                        self.events.push(TransportEvent::Error(err.to_string()));
                    }
                } else {
                    self.phase = Phase::WaitingReconnect { retry_at, attempt };
                }
            }
            Phase::Disconnected => self.phase = Phase::Disconnected,
        }
    }

    fn poll_readable(&mut self, fd: RawFd) {
        let mut events = mio::Events::with_capacity(16);
        if self
            .poll
            .poll(&mut events, Some(Duration::from_millis(0)))
            .is_err()
        {
            return;
        }
        if events.iter().next().is_none() {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match unistd::read(fd, &mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    for result in self.deframer.feed(&buf[..count]) {
                        match result {
                            Ok(frame) => self.events.push(TransportEvent::FrameReceived(frame)),
                            Err(err) => logging::debug!(self.logger, "kiss decode error"; "error" => err.to_string()),
                        }
                    }
                }
                Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => break,
                Err(nix::Error::Sys(nix::errno::Errno::ENXIO))
                | Err(nix::Error::Sys(nix::errno::Errno::EIO)) => {
                    self.fail_lost_device();
                    break;
                }
                Err(err) => {
                    self.events.push(TransportEvent::Error(err.to_string()));
                    break;
                }
            }
        }
    }

    fn flush_egress(&mut self, fd: RawFd) {
        while !self.egress.is_empty() {
            match unistd::write(fd, &self.egress) {
                Ok(0) => break,
                Ok(count) => unsafe { self.egress.move_head(count as isize) },
                Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => {
                    wait_writable(fd, WRITE_POLL_TIMEOUT);
                    break;
                }
                Err(nix::Error::Sys(nix::errno::Errno::ENXIO))
                | Err(nix::Error::Sys(nix::errno::Errno::EIO)) => {
                    self.fail_lost_device();
                    break;
                }
                Err(err) => {
                    self.events.push(TransportEvent::Error(err.to_string()));
                    break;
                }
            }
        }
    }

    fn fail_lost_device(&mut self) {
        logging::warn!(self.logger, "kiss transport lost device"; "device" => self.config.device_path.clone());
        registry::release(&self.config.device_path);
        self.set_state(TransportState::Disconnected);
        if self.config.auto_reconnect {
            self.schedule_reconnect(1, RECONNECT_BASE);
        } else {
            self.phase = Phase::Disconnected;
        }
    }

    /// Schedules a reconnect attempt. `base` is the failure class's initial delay (see
    /// [`reconnect_base_delay`]); subsequent attempts double it, capped at 15 s, plus up
    /// to 0.5 s of jitter.
    fn schedule_reconnect(&mut self, attempt: u32, base: Duration) {
        let backoff = std::cmp::min(base * 2u32.saturating_pow(attempt.saturating_sub(1)), RECONNECT_CAP);
        let jitter = Duration::from_millis(rand_jitter_millis());
        self.phase = Phase::WaitingReconnect {
            retry_at: Instant::now() + backoff + jitter,
            attempt,
        };
    }

    /// Queues bytes for transmission as one data frame on this transport's port.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if !matches!(self.phase, Phase::Open { .. }) {
            return Err(TransportError::NotOpen);
        }
        let frame = KissFrame::data(self.port, payload.to_vec());
        let wire = codec::encode(&frame);
        self.egress.extend(wire.iter().copied());
        Ok(())
    }

    /// Drains accumulated events since the last call.
    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn close(&mut self) {
        if let Phase::Open { fd } | Phase::InitSequence { fd, .. } | Phase::Stabilizing { fd, .. } = self.phase {
            let _ = unistd::close(fd);
        }
        registry::release(&self.config.device_path);
        self.phase = Phase::Disconnected;
        self.set_state(TransportState::Disconnected);
    }
}

fn rand_jitter_millis() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..500)
}

fn nonblocking_open(path: &str, baud: BaudRate) -> Result<RawFd, TransportError> {
    let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK, Mode::empty())
        .map_err(|err| match err {
            nix::Error::Sys(nix::errno::Errno::ENOENT) => TransportError::DeviceNotFound(path.to_string()),
            other => TransportError::OpenFailed(other as i32),
        })?;
    configure_serial(fd, baud)?;
    Ok(fd)
}

/// Maps a failure class to its initial reconnect delay, before exponential backoff takes
/// over on subsequent attempts: a path already claimed (EBUSY-equivalent) retries soonest,
/// a missing device waits longer, and a timed-out Bluetooth open -- the slowest and least
/// likely to resolve itself quickly -- waits longest.
fn reconnect_base_delay(err: &TransportError) -> Duration {
    match err {
        TransportError::AlreadyClaimed(_) => Duration::from_secs(1),
        TransportError::DeviceNotFound(_) => Duration::from_secs(2),
        TransportError::OpenTimeout(_) => Duration::from_secs(5),
        _ => RECONNECT_BASE,
    }
}

/// Performs the (potentially very slow) blocking open of a Bluetooth RFCOMM device on a
/// detached thread; the caller races this against a timeout.
fn blocking_open(path: &str) -> Result<RawFd, TransportError> {
    fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())
        .map_err(|err| match err {
            nix::Error::Sys(nix::errno::Errno::ENOENT) => TransportError::DeviceNotFound(path.to_string()),
            other => TransportError::OpenFailed(other as i32),
        })
        .and_then(|fd| {
            fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .map_err(|err| TransportError::OpenFailed(err as i32))?;
            Ok(fd)
        })
}

/// Raw mode, 8-N-1, flow control disabled, CLOCAL+CREAD, VMIN=VTIME=0, DTR/RTS asserted.
/// Bluetooth RFCOMM sockets skip baud rate and modem-line configuration entirely (the
/// serial framing is meaningless over RFCOMM).
fn configure_serial(fd: RawFd, baud: BaudRate) -> Result<(), TransportError> {
    let mut attrs = termios::tcgetattr(fd).map_err(|e| TransportError::ConfigFailed(e.to_string()))?;
    termios::cfmakeraw(&mut attrs);
    attrs.control_flags.insert(termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD);
    attrs.input_flags.remove(termios::InputFlags::IXON | termios::InputFlags::IXOFF | termios::InputFlags::IXANY);
    attrs.control_chars[termios::SpecialCharacterIndices::VMIN as usize] = 0;
    attrs.control_chars[termios::SpecialCharacterIndices::VTIME as usize] = 0;
    termios::cfsetispeed(&mut attrs, baud.to_nix()).map_err(|e| TransportError::ConfigFailed(e.to_string()))?;
    termios::cfsetospeed(&mut attrs, baud.to_nix()).map_err(|e| TransportError::ConfigFailed(e.to_string()))?;
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(|e| TransportError::ConfigFailed(e.to_string()))?;
    termios::tcflush(fd, termios::FlushArg::TCIOFLUSH).map_err(|e| TransportError::ConfigFailed(e.to_string()))?;
    assert_dtr_rts(fd)?;
    Ok(())
}

fn assert_dtr_rts(fd: RawFd) -> Result<(), TransportError> {
    let bits: libc::c_int = libc::TIOCM_DTR | libc::TIOCM_RTS;
    let ret = unsafe { libc::ioctl(fd, libc::TIOCMBIS as libc::c_ulong, &bits as *const libc::c_int) };
    if ret < 0 {
        return Err(TransportError::ConfigFailed("ioctl TIOCMBIS failed".into()));
    }
    Ok(())
}

fn wait_writable(fd: RawFd, timeout: Duration) {
    let mut pollfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
    unsafe {
        libc::poll(&mut pollfd as *mut libc::pollfd, 1, timeout.as_millis() as libc::c_int);
    }
}

fn write_all(fd: RawFd, mut data: &[u8]) -> Result<(), TransportError> {
    while !data.is_empty() {
        match unistd::write(fd, data) {
            Ok(0) => return Err(TransportError::WriteFailed(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))),
            Ok(count) => data = &data[count..],
            Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => {
                wait_writable(fd, WRITE_POLL_TIMEOUT);
            }
            Err(err) => return Err(TransportError::WriteFailed(io::Error::from_raw_os_error(err as i32))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bluetooth_path_detection() {
        assert!(is_bluetooth_path("/dev/rfcomm0"));
        assert!(is_bluetooth_path("/dev/tty.Bluetooth-Incoming-Port"));
        assert!(!is_bluetooth_path("/dev/ttyUSB0"));
    }

    #[test]
    fn reconnect_backoff_doubles_and_caps() {
        let mut transport = make_test_transport();
        transport.schedule_reconnect(1, RECONNECT_BASE);
        let first = match transport.phase {
            Phase::WaitingReconnect { retry_at, .. } => retry_at,
            _ => panic!("expected WaitingReconnect"),
        };
        transport.schedule_reconnect(5, RECONNECT_BASE);
        let later = match transport.phase {
            Phase::WaitingReconnect { retry_at, .. } => retry_at,
            _ => panic!("expected WaitingReconnect"),
        };
        assert!(later >= first);
    }

    #[test]
    fn next_wakeup_tracks_the_waiting_reconnect_deadline() {
        let mut transport = make_test_transport();
        assert_eq!(transport.next_wakeup(), None);
        transport.schedule_reconnect(1, RECONNECT_BASE);
        let retry_at = match transport.phase {
            Phase::WaitingReconnect { retry_at, .. } => retry_at,
            _ => panic!("expected WaitingReconnect"),
        };
        assert_eq!(transport.next_wakeup(), Some(retry_at));
    }

    #[test]
    fn failure_class_selects_initial_reconnect_delay() {
        assert_eq!(reconnect_base_delay(&TransportError::AlreadyClaimed("x".into())), Duration::from_secs(1));
        assert_eq!(reconnect_base_delay(&TransportError::DeviceNotFound("x".into())), Duration::from_secs(2));
        assert_eq!(reconnect_base_delay(&TransportError::OpenTimeout(BT_OPEN_TIMEOUT)), Duration::from_secs(5));
    }

    fn make_test_transport() -> KissTransport {
        let config = KissConfig {
            device_path: "/dev/test-kiss-0".to_string(),
            baud_rate: BaudRate::B115200,
            auto_reconnect: true,
            vendor: None,
        };
        KissTransport::new(config, 0, logging::init("test", None)).unwrap()
    }
}
