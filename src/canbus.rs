/*! CAN bus frame sources.

One raw CAN socket per `can*` network interface, each read by its own
worker thread. Every data frame is decoded against the
[signal table](crate::signal::SignalTable) and the resulting metric
updates land in the shared [MetricSnapshot].

The decoder also keeps a shared last-frame timestamp; the supervisor
polls it and shuts the agent down after three minutes of bus silence
(a parked vehicle with controllers asleep).
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Socket};

use crate::Result;
use crate::metrics::MetricSnapshot;
use crate::signal::SignalTable;

/// Bus silence after which the supervisor requests shutdown.
pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(180);

const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// `can*` interfaces currently known to the kernel, sorted by name.
#[must_use]
pub fn scan_interfaces() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let names = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    filter_can_names(names)
}

fn filter_can_names(mut names: Vec<String>) -> Vec<String> {
    names.retain(|n| n.starts_with("can"));
    names.sort();
    names
}

/// 1-based source tag of an interface name: `can0` is source 1.
#[must_use]
pub fn source_of(name: &str) -> u8 {
    name.strip_prefix("can")
        .and_then(|n| n.parse::<u8>().ok())
        .map(|n| n.saturating_add(1))
        .unwrap_or(0)
}

/// Running CAN reader threads plus the shared silence clock.
pub struct CanDecoder {
    last_data: Arc<Mutex<Instant>>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl CanDecoder {
    /// Open every CAN interface and start one reader thread each.
    ///
    /// Interfaces that cannot be opened are skipped with a warning;
    /// an empty bus is not an error (the silence watchdog covers it).
    pub fn start(
        table: Arc<SignalTable>,
        snapshot: MetricSnapshot,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let last_data = Arc::new(Mutex::new(Instant::now()));
        let mut threads = Vec::new();
        let interfaces = scan_interfaces();
        if interfaces.is_empty() {
            warn!("no CAN interface detected");
        }
        for name in interfaces {
            let socket = match CanSocket::open(&name) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot open CAN interface {name}: {e}");
                    continue;
                }
            };
            info!("reading CAN frames from {name}");
            let source = source_of(&name);
            let table = table.clone();
            let snapshot = snapshot.clone();
            let stop = stop.clone();
            let last_data = last_data.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("tbox-{name}"))
                    .spawn(move || {
                        read_loop(&socket, source, &table, &snapshot, &stop, &last_data);
                    })?,
            );
        }
        Ok(Self { last_data, threads })
    }

    /// Time since the last frame on any interface.
    #[must_use]
    pub fn last_data_age(&self) -> Duration {
        self.last_data.lock().unwrap().elapsed()
    }

    /// True once the bus has been silent past [SILENCE_TIMEOUT].
    #[must_use]
    pub fn silent_too_long(&self) -> bool {
        self.last_data_age() >= SILENCE_TIMEOUT
    }

    /// Wait for the reader threads to observe the stop flag and exit.
    pub fn join(self) {
        for t in self.threads {
            let _ = t.join();
        }
    }
}

fn read_loop(
    socket: &CanSocket,
    source: u8,
    table: &SignalTable,
    snapshot: &MetricSnapshot,
    stop: &AtomicBool,
    last_data: &Mutex<Instant>,
) {
    while !stop.load(Ordering::Relaxed) {
        match socket.read_frame_timeout(READ_TIMEOUT) {
            Ok(CanFrame::Data(frame)) => {
                *last_data.lock().unwrap() = Instant::now();
                let id = match frame.id() {
                    socketcan::Id::Standard(id) => u32::from(id.as_raw()),
                    socketcan::Id::Extended(id) => id.as_raw(),
                };
                for (sig, value) in table.decode(source, id, frame.data()) {
                    debug!("{} (id {id:#x}) = {value}", sig.name);
                    snapshot.update(&sig.name, value as i64, sig.unit, sig.offset, source);
                }
            }
            Ok(_) => {} // remote and error frames carry no signals
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("CAN read error on source {source}: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}
