#![warn(missing_docs)]
/*! This crate implements the core of an in-vehicle telematics agent
(a "T-Box") for electric vehicles, running on embedded Linux.

The agent continuously samples CAN-bus frames, decodes them into named
metrics through a declarative signal table, and keeps a live snapshot
of vehicle state. From that snapshot it:

* appends periodic decoded-metric records to framed local log files,
  with background zlib archival and free-space retention,
* builds binary telemetry payloads (total data, drive motors, position,
  extremums, alarms, cell voltages and temperatures) and uplinks them
  over plaintext TCP to a fleet server, with login/heartbeat handling,
  per-server failover, answer tracking and a disk-backed backlog that
  survives long disconnections,
* talks a small framed serial protocol to the companion power-management
  MCU (heartbeat, RTC sync, scheduled wake, shutdown handshake).

# Architecture overview

Data flows from sources to sinks through a handful of components wired
together by a [supervisor::Supervisor]:

```text
   [ CAN raw sockets ]          [ MCU serial ]   [ GPS fix ]
           ↓                          ↓               ↓
   [ canbus::CanDecoder ]      (worker thread)   (shared handle)
           ↓                          ↓               |
   [ metrics::MetricSnapshot ] → supervisor ←---------+
       ↓           ↓
  10 s tick     1 s tick
       ↓           ↓
[ logger::    [ telemetry encoders ]
  DecodedLog ]     ↓
              [ backlog::BacklogStore ] ⇄ tn-*.tn spill files
                   ↓
              [ net::UplinkClient ] → fleet server (TCP)
```

A single-threaded tokio runtime owns the uplink sockets, all timers and
the report tick. Blocking filesystem and device I/O (CAN reads, serial,
log writing, archive compression, backlog spill) runs on plain worker
threads that observe a cooperative stop flag, bridged into the loop by
channels.
 */

pub mod backlog;
pub mod canbus;
pub mod config;
pub mod crc;
pub mod gps;
pub mod logger;
pub mod metrics;
pub mod net;
pub mod packet;
pub mod serial;
pub mod signal;
pub mod supervisor;
pub mod telemetry;

/// Crate error type.
///
/// Per-field decode problems inside telemetry encoders are not errors
/// (they become wire sentinels); this enum covers the failures a caller
/// can meaningfully react to.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Signal table file could not be parsed.
    #[error("signal table error: {0}")]
    SignalTable(String),

    /// Settings file could not be read or written.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed wire or on-disk frame.
    #[error("frame error: {0}")]
    Frame(String),

    /// Decoded-log JSON body could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CAN socket failure.
    #[error("CAN error: {0}")]
    Can(String),

    /// MCU serial port failure.
    #[error("serial error: {0}")]
    Serial(String),
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Serial(e.to_string())
    }
}

/// Result type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
