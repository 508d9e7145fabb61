//! Daemon entry point: wires a [`kiss::KissTransport`] to a [`coordinator::Coordinator`]
//! and runs the single-threaded event loop the rest of the workspace is built to be
//! driven by. Everything interesting lives in the library crates; this binary is just
//! config loading, construction, and the poll-drain-tick loop.

mod config;
mod error;

use std::env;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use ax25::Frame;
use coordinator::{Coordinator, SessionEvent};
use error::DaemonError;
use flux::logging::{self, Logger};
use kiss::codec::CMD_DATA;
use kiss::{KissTransport, TransportEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long the loop should sleep before its next iteration: the nearer of the
/// transport's own pending deadline (reconnect backoff, stabilize delay, ...) and the
/// coordinator's timer wheel, capped at `POLL_INTERVAL` so an open, idle link still gets
/// polled for readability on a reasonable cadence.
fn next_sleep(transport: &KissTransport, coordinator: &Coordinator, now: Instant) -> Duration {
    let mut deadline = now + POLL_INTERVAL;
    if let Some(wakeup) = transport.next_wakeup() {
        deadline = deadline.min(wakeup);
    }
    if let Some(wakeup) = coordinator.next_wakeup() {
        deadline = deadline.min(wakeup);
    }
    deadline.saturating_duration_since(now)
}

fn load_config(path: &Path) -> Result<config::Config, DaemonError> {
    let cfg = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => flux::config::load_toml(path)?,
        _ => flux::config::load_json(path)?,
    };
    Ok(cfg)
}

fn run(cfg: config::Config, logger: Logger) -> Result<(), DaemonError> {
    let local = cfg.station.address()?;
    let session_config = cfg.session.to_session_config();
    let kiss_config = cfg.transport.to_kiss_config();

    let mut transport = KissTransport::new(kiss_config, 0, logger.new(logging::o!("component" => "kiss")))?;
    transport.open()?;

    // Auto-accepts every inbound transfer: this daemon has no UI collaborator to surface
    // the accept/decline prompt spec'd for the engine, so it takes the permissive default.
    let mut coordinator = Coordinator::new(
        local,
        cfg.station.channel,
        session_config,
        cfg.dgp.downloads_dir.clone(),
        cfg.dgp.auto_negotiate && cfg.dgp.extensions_enabled,
        logger.new(logging::o!("component" => "coordinator")),
    );

    logging::info!(logger, "dgpd started"; "device" => &cfg.transport.device_path);

    // TODO: no SIGINT/SIGTERM handling -- exits uncleanly on ctrl-c, no state persisted.
    loop {
        let now = Instant::now();
        transport.sync(now);

        for event in transport.drain_events() {
            match event {
                TransportEvent::FrameReceived(frame) => {
                    if frame.command != CMD_DATA {
                        continue;
                    }
                    match Frame::decode(&frame.payload) {
                        Ok(decoded) => coordinator.on_frame_received(decoded, now),
                        Err(err) => logging::debug!(logger, "dropping undecodable frame"; "error" => format!("{:?}", err)),
                    }
                }
                TransportEvent::StateChanged(state) => {
                    logging::info!(logger, "transport state changed"; "state" => format!("{:?}", state));
                }
                TransportEvent::Error(message) => {
                    logging::warn!(logger, "transport error"; "error" => message);
                }
            }
        }

        coordinator.tick(now);

        for event in coordinator.drain_events() {
            match event {
                SessionEvent::FrameToSend(frame) => {
                    if let Err(err) = transport.send(&frame.encode()) {
                        logging::error!(logger, "failed to send frame"; "error" => format!("{:?}", err));
                    }
                }
                SessionEvent::StateChanged { session, state } => {
                    logging::info!(logger, "session state changed"; "session" => format!("{:?}", session), "state" => format!("{:?}", state));
                }
                SessionEvent::DataDelivered { session, payload } => {
                    logging::debug!(logger, "data delivered"; "session" => format!("{:?}", session), "bytes" => payload.len());
                }
                SessionEvent::LinkFailure { session } => {
                    logging::warn!(logger, "link failure"; "session" => format!("{:?}", session));
                }
                SessionEvent::DgpMessageReceived { session, message } => {
                    logging::debug!(logger, "dgp message received"; "session" => format!("{:?}", session), "type" => format!("{:?}", message.message_type));
                }
                SessionEvent::CapabilityConfirmed { peer } => {
                    logging::info!(logger, "peer capability confirmed"; "peer" => peer);
                }
                SessionEvent::TransferAcceptRequest { session, dgp_session, filename, size } => {
                    logging::info!(logger, "incoming file transfer"; "session" => format!("{:?}", session), "dgp_session" => dgp_session, "filename" => filename, "size" => size);
                    let _ = coordinator.accept_transfer(session, now);
                }
                SessionEvent::TransferProgress { dgp_session, received_chunks, total_chunks, .. } => {
                    logging::debug!(logger, "transfer progress"; "dgp_session" => dgp_session, "received" => received_chunks, "total" => total_chunks);
                }
                SessionEvent::TransferCompleted { dgp_session, filename, bytes, .. } => {
                    logging::info!(logger, "transfer completed"; "dgp_session" => dgp_session, "filename" => filename, "bytes" => bytes.len());
                }
                SessionEvent::TransferFailed { dgp_session, reason, .. } => {
                    logging::warn!(logger, "transfer failed"; "dgp_session" => dgp_session, "reason" => reason);
                }
                SessionEvent::Error(message) => {
                    logging::error!(logger, "coordinator error"; "error" => message);
                }
            }
        }

        thread::sleep(next_sleep(&transport, &coordinator, now));
    }
}

fn main() {
    let config_path = env::args().nth(1).unwrap_or_else(|| "dgpd.json".to_string());
    let config_path = Path::new(&config_path);

    // The config file itself may carry a `logging` section, so a bootstrap logger (default
    // terminal-on-stderr) is all that exists until the file is parsed.
    let bootstrap_logger = logging::init("dgpd", None);

    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            logging::error!(bootstrap_logger, "failed to load config"; "path" => format!("{:?}", config_path), "error" => format!("{}", err));
            std::process::exit(1);
        }
    };

    let logger = logging::init("dgpd", cfg.logging.as_ref());

    if let Err(err) = run(cfg, logger.clone()) {
        logging::error!(logger, "fatal error"; "error" => format!("{}", err));
        std::process::exit(1);
    }
}
