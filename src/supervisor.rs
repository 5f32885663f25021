/*! Component lifecycle wiring.

The supervisor builds every component, hands out the shared handles,
drives the periodic decoded-log tick, and owns the shutdown story:

* three minutes of CAN-bus silence, or a low-voltage notice from the
  MCU, request a graceful shutdown;
* graceful shutdown stops the uplink, the ticks and the worker
  threads, syncs the filesystem, asks the MCU to cut power and waits
  (bounded by a fallback timer) for the power-off confirmation;
* the process then exits, optionally handing over to `/sbin/poweroff`.
*/
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;

use crate::backlog::BacklogStore;
use crate::canbus::CanDecoder;
use crate::config::ConfigStore;
use crate::gps::Gps;
use crate::logger::DecodedLog;
use crate::metrics::MetricSnapshot;
use crate::net::{SharedConfig, Uplink};
use crate::serial::{McuCommand, McuEvent, McuSerial};
use crate::signal::SignalTable;
use crate::{Error, Result};

/// Wait this long for the MCU power-off confirmation before exiting
/// anyway.
pub const SHUTDOWN_FALLBACK: Duration = Duration::from_secs(180);

/// Signal table file name under the configuration directory.
pub const PARSE_FILE: &str = "tboxparse.xml";

/// Everything the agent needs to start.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Vehicle identification number, 17 characters.
    pub vin: String,
    /// SIM ICCID reported during login.
    pub iccid: String,
    /// Configuration directory.
    pub conf_dir: PathBuf,
    /// Log storage directory.
    pub log_dir: PathBuf,
    /// MCU serial port device.
    pub serial_port: String,
    /// Extra fleet server tried before the configured list.
    pub fallback_server: Option<String>,
}

/// Map an initialisation error to the documented process exit code.
#[must_use]
pub fn exit_code(e: &Error) -> i32 {
    match e {
        Error::SignalTable(_) => 3,
        Error::Can(_) => 4,
        _ => 2,
    }
}

/// The agent supervisor. Construct with options, then [Supervisor::run].
pub struct Supervisor {
    options: AgentOptions,
}

impl Supervisor {
    /// New supervisor for the given options.
    #[must_use]
    pub fn new(options: AgentOptions) -> Self {
        Self { options }
    }

    /// Build all components and run until shutdown.
    ///
    /// Returns true when the platform should be powered off after
    /// exit (the MCU shutdown handshake ran).
    pub fn run(self) -> Result<bool> {
        let opts = &self.options;

        // Decoded-metric log store first: nothing useful happens if
        // local persistence is broken.
        let log_store = DecodedLog::new(&opts.log_dir)?;

        let parse_path = opts.conf_dir.join(PARSE_FILE);
        let table = if parse_path.exists() {
            SignalTable::load(&parse_path).map_err(|e| Error::SignalTable(e.to_string()))?
        } else {
            warn!(
                "no signal table at {}, decoding nothing",
                parse_path.display()
            );
            SignalTable::default()
        };
        info!("signal table: {} CAN ids", table.len());
        let battery_codes = table.battery_codes().to_vec();

        let mut config = ConfigStore::load(&opts.conf_dir, &opts.vin);
        if let Some(fallback) = &opts.fallback_server {
            config.settings.servers.insert(0, fallback.clone());
        }
        let gravity_threshold = config.settings.gravity_threshold;
        let daily_alarm = config.settings.daily_alarm;

        let snapshot = MetricSnapshot::new();
        let stop = Arc::new(AtomicBool::new(false));
        let can = CanDecoder::start(Arc::new(table), snapshot.clone(), stop.clone())
            .map_err(|e| Error::Can(e.to_string()))?;

        let backlog = BacklogStore::new(&opts.log_dir);
        let backlog_worker = backlog.spawn_worker(stop.clone());

        let gps = Gps::new();
        let config: SharedConfig = Rc::new(RefCell::new(config));
        let uplink = Uplink::new(
            &opts.vin,
            &opts.iccid,
            config.clone(),
            &opts.conf_dir,
            snapshot.clone(),
            battery_codes,
            backlog.clone(),
            gps.clone(),
        );

        let (mcu_events, mcu_event_rx) = tokio::sync::mpsc::unbounded_channel();
        let mcu =
            match McuSerial::open(&opts.serial_port, mcu_events, gravity_threshold, daily_alarm) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("MCU serial unavailable: {e}");
                    None
                }
            };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = tokio::task::LocalSet::new();
        let poweroff = local.block_on(
            &runtime,
            main_loop(
                &uplink,
                &snapshot,
                &log_store,
                &config,
                &can,
                mcu.as_ref(),
                mcu_event_rx,
                &stop,
            ),
        );

        // Tear the worker threads down after the loop.
        stop.store(true, Ordering::Relaxed);
        can.join();
        let _ = backlog_worker.join();
        log_store.shutdown();
        if let Some(mcu) = mcu {
            mcu.shutdown();
        }
        info!("agent stopped");
        Ok(poweroff)
    }
}

struct ShutdownCtl {
    initiated: bool,
    deadline: Option<tokio::time::Instant>,
}

/// Begin the graceful shutdown sequence, once.
fn initiate_shutdown(
    ctl: &mut ShutdownCtl,
    low_voltage: bool,
    shutdown_tx: &watch::Sender<bool>,
    stop: &AtomicBool,
    mcu: Option<&McuSerial>,
) {
    if ctl.initiated {
        return;
    }
    ctl.initiated = true;
    info!("starting graceful shutdown");
    let _ = shutdown_tx.send(true);
    stop.store(true, Ordering::Relaxed);
    // SAFETY: sync(2) takes no arguments and cannot fail.
    unsafe { libc::sync() };
    if let Some(mcu) = mcu {
        mcu.send(McuCommand::RequestShutdown { low_voltage });
        ctl.deadline = Some(tokio::time::Instant::now() + SHUTDOWN_FALLBACK);
    } else {
        // Nobody to confirm power-off: leave right away.
        ctl.deadline = Some(tokio::time::Instant::now());
    }
}

#[allow(clippy::too_many_arguments)]
async fn main_loop(
    uplink: &Uplink,
    snapshot: &MetricSnapshot,
    log_store: &DecodedLog,
    config: &SharedConfig,
    can: &CanDecoder,
    mcu: Option<&McuSerial>,
    mut mcu_events: tokio::sync::mpsc::UnboundedReceiver<McuEvent>,
    stop: &AtomicBool,
) -> bool {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let uplink_task = uplink.run(snapshot.reader(), shutdown_rx.clone());

    // Decoded-log tick: deep-copy the snapshot every
    // LocalLogUpdateTimeout milliseconds when it changed.
    let log_tick = {
        let mut shutdown = shutdown_rx.clone();
        let mut reader = snapshot.reader();
        async move {
            loop {
                let ms = u64::from(config.borrow().settings.log_update_ms);
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        let (metrics, updated) = reader.take();
                        if updated {
                            log_store.submit(metrics);
                        }
                    }
                }
            }
        }
    };

    // Supervision proper: CAN silence, MCU events, shutdown
    // sequencing.
    let control = async {
        let mut silence_tick = tokio::time::interval(Duration::from_secs(5));
        silence_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ctl = ShutdownCtl {
            initiated: false,
            deadline: None,
        };
        loop {
            tokio::select! {
                _ = silence_tick.tick() => {
                    if !ctl.initiated && can.silent_too_long() {
                        info!("no CAN data for 3 minutes, shutting down");
                        initiate_shutdown(&mut ctl, false, &shutdown_tx, stop, mcu);
                    }
                }
                event = mcu_events.recv() => match event {
                    Some(McuEvent::LowVoltage) => {
                        initiate_shutdown(&mut ctl, true, &shutdown_tx, stop, mcu);
                    }
                    Some(McuEvent::PowerOffConfirmed) => {
                        info!("MCU confirmed power-off");
                        let _ = shutdown_tx.send(true);
                        stop.store(true, Ordering::Relaxed);
                        return true;
                    }
                    Some(McuEvent::AccelEvent { x, y, z }) => {
                        info!("acceleration event: x={x} y={y} z={z}");
                    }
                    None => {}
                },
                _ = tokio::time::sleep_until(ctl.deadline.unwrap_or_else(far_future)),
                    if ctl.deadline.is_some() =>
                {
                    warn!("MCU did not confirm power-off in time");
                    return true;
                }
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        info!("interrupted, exiting without poweroff");
                        let _ = shutdown_tx.send(true);
                        stop.store(true, Ordering::Relaxed);
                        return false;
                    }
                }
            }
        }
    };

    let (_, _, poweroff) = tokio::join!(uplink_task, log_tick, control);
    poweroff
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86400 * 365)
}
