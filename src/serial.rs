/*! Companion MCU serial link.

The power-management MCU speaks a small framed protocol over a 9600
8N1 UART:

```text
0xA5 | length | command | payload | ack_flag | checksum | 0x5A
```

`length` covers command, payload and ack flag; the checksum is the XOR
of everything from 0xA5 through the ack flag. Responses to command N
arrive as command N+1, paired by `(cmd + 1) / 2` equivalence, with a
result byte of 0 for success.

The link runs on its own worker thread owning the blocking port. The
supervisor sends [McuCommand]s in and receives [McuEvent]s out over
channels; heartbeat cadence, RTC-sync retries and the ack/retry
bookkeeping all live inside the thread.
*/
use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, TimeZone, Timelike};
use log::{debug, info, warn};

use crate::Result;
use crate::crc::xor_checksum;

/// Frame start marker.
pub const FRAME_HEAD: u8 = 0xA5;
/// Frame end marker.
pub const FRAME_TAIL: u8 = 0x5A;

/// Ack-expected commands are retried this many times.
pub const WRITE_RETRY_MAX: u32 = 3;
/// Seconds between retries of an unacknowledged command.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(5);
/// Heartbeat cadence.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
/// RTC sync is re-requested at this cadence until acknowledged.
pub const TIME_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// System time earlier than this year is considered unset; RTC sync
/// waits for NTP or GPS to move the clock first.
const TIME_VALID_YEAR: i32 = 2017;

/// MCU command bytes.
pub mod cmd {
    /// Keep-alive, no ack.
    pub const HEARTBEAT: u8 = 0x01;
    /// Normal shutdown request.
    pub const SHUTDOWN: u8 = 0x03;
    /// Power-off confirmation for a normal shutdown.
    pub const POWER_OFF_A: u8 = 0x04;
    /// Supply voltage dropped, MCU wants the host down.
    pub const LOW_VOLTAGE: u8 = 0x05;
    /// Shutdown request acknowledging a low-voltage notice.
    pub const LOW_VOLTAGE_SHUTDOWN: u8 = 0x07;
    /// Power-off confirmation for a low-voltage shutdown.
    pub const POWER_OFF_B: u8 = 0x08;
    /// RTC synchronisation with the host clock.
    pub const RTC_SYNC: u8 = 0x09;
    /// RTC synchronisation acknowledgement.
    pub const RTC_SYNC_ACK: u8 = 0x0A;
    /// Arm the wake timer.
    pub const SET_WAKE_TIME: u8 = 0x0B;
    /// Set the accelerometer gravity-event threshold.
    pub const SET_GRAVITY_THRESHOLD: u8 = 0x0F;
    /// Acceleration event with three signed 16-bit axes.
    pub const ACCEL_EVENT: u8 = 0x13;
}

/// Build one serial frame.
#[must_use]
pub fn build_frame(command: u8, payload: &[u8], need_ack: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(FRAME_HEAD);
    out.push(payload.len() as u8 + 2);
    out.push(command);
    out.extend_from_slice(payload);
    out.push(u8::from(need_ack));
    out.push(xor_checksum(&out));
    out.push(FRAME_TAIL);
    out
}

/// Local civil time as the seven wire bytes
/// (year-2000, month, day, weekday, hour, minute, second).
#[must_use]
pub fn time_bytes(t: chrono::DateTime<Local>) -> [u8; 7] {
    [
        (t.year() - 2000) as u8,
        t.month() as u8,
        t.day() as u8,
        t.weekday().number_from_monday() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    ]
}

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuFrame {
    /// Command byte.
    pub command: u8,
    /// Payload without the ack flag.
    pub body: Vec<u8>,
    /// Ack flag byte.
    pub ack: u8,
}

impl McuFrame {
    /// Result byte convention: first payload byte, 0 when absent.
    #[must_use]
    pub fn result(&self) -> u8 {
        self.body.first().copied().unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
enum ReadState {
    #[default]
    Hunt,
    Length,
    Body {
        expect: usize,
    },
}

/// Byte-oriented inbound frame parser.
#[derive(Debug, Default)]
pub struct FrameReader {
    state: ReadState,
    buf: Vec<u8>,
}

impl FrameReader {
    /// New parser in the hunting state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning completed valid frames.
    pub fn feed(&mut self, data: &[u8]) -> Vec<McuFrame> {
        let mut out = Vec::new();
        for &byte in data {
            match self.state {
                ReadState::Hunt => {
                    if byte == FRAME_HEAD {
                        self.buf.clear();
                        self.buf.push(byte);
                        self.state = ReadState::Length;
                    }
                }
                ReadState::Length => {
                    self.buf.push(byte);
                    if byte < 2 {
                        self.state = ReadState::Hunt;
                    } else {
                        self.state = ReadState::Body {
                            expect: byte as usize,
                        };
                    }
                }
                ReadState::Body { expect } => {
                    self.buf.push(byte);
                    if self.buf.len() == expect + 4 {
                        if self.buf[expect + 3] != FRAME_TAIL {
                            warn!("MCU frame with bad tail byte");
                        } else {
                            let want = self.buf[expect + 2];
                            let got = xor_checksum(&self.buf[..expect + 2]);
                            if want != got {
                                warn!(
                                    "MCU frame with bad checksum: want {want:#04x}, got {got:#04x}"
                                );
                            } else {
                                out.push(McuFrame {
                                    command: self.buf[2],
                                    body: self.buf[3..expect + 1].to_vec(),
                                    ack: self.buf[expect + 1],
                                });
                            }
                        }
                        self.state = ReadState::Hunt;
                    }
                }
            }
        }
        out
    }
}

/// Next local occurrence of `hour:minute`, tomorrow when today's has
/// already passed.
#[must_use]
pub fn next_daily(
    now: chrono::DateTime<Local>,
    hour: u8,
    minute: u8,
) -> Option<chrono::DateTime<Local>> {
    let mut date = now.date_naive();
    if now.hour() * 60 + now.minute() >= u32::from(hour) * 60 + u32::from(minute) {
        date = date.succ_opt()?;
    }
    let naive = date.and_hms_opt(u32::from(hour), u32::from(minute), 0)?;
    Local.from_local_datetime(&naive).single()
}

/// Commands the supervisor can send to the MCU thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McuCommand {
    /// Ask the MCU to cut power once the host is down.
    RequestShutdown {
        /// Use the low-voltage variant of the handshake.
        low_voltage: bool,
    },
    /// Push a new gravity-event threshold.
    SetGravityThreshold(u8),
    /// Arm the wake timer for an absolute Unix timestamp.
    SetWakeTime(i64),
    /// Arm a daily recurring wake time.
    SetDailyWake {
        /// Hour 0..=23.
        hour: u8,
        /// Minute 0..=59.
        minute: u8,
    },
}

/// Events surfaced by the MCU thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuEvent {
    /// MCU confirmed power-off; the main loop should exit now.
    PowerOffConfirmed,
    /// Supply voltage low; the agent should shut down gracefully.
    LowVoltage,
    /// Acceleration event (gravity threshold exceeded).
    AccelEvent {
        /// X axis.
        x: i16,
        /// Y axis.
        y: i16,
        /// Z axis.
        z: i16,
    },
}

struct PendingWrite {
    frame: Vec<u8>,
    command: u8,
    retries_left: u32,
    sent_at: Instant,
}

struct Worker {
    port: Box<dyn serialport::SerialPort>,
    reader: FrameReader,
    queue: VecDeque<(Vec<u8>, u8, bool)>,
    pending: Option<PendingWrite>,
    heartbeat_at: Instant,
    rtc_synced: bool,
    rtc_attempt: Option<Instant>,
    daily: Option<(u8, u8)>,
    armed_wake: Option<i64>,
    daily_check_at: Instant,
    events: tokio::sync::mpsc::UnboundedSender<McuEvent>,
}

impl Worker {
    fn enqueue(&mut self, command: u8, payload: &[u8], need_ack: bool) {
        self.queue
            .push_back((build_frame(command, payload, need_ack), command, need_ack));
    }

    fn enqueue_wake_time(&mut self, ts: i64) {
        if let Some(t) = Local.timestamp_opt(ts, 0).single() {
            let bytes = time_bytes(t);
            self.enqueue(cmd::SET_WAKE_TIME, &bytes, true);
            self.armed_wake = Some(ts);
        }
    }

    fn handle_command(&mut self, command: McuCommand) {
        match command {
            McuCommand::RequestShutdown { low_voltage } => {
                let c = if low_voltage {
                    cmd::LOW_VOLTAGE_SHUTDOWN
                } else {
                    cmd::SHUTDOWN
                };
                self.enqueue(c, &[], true);
            }
            McuCommand::SetGravityThreshold(v) => {
                self.enqueue(cmd::SET_GRAVITY_THRESHOLD, &[v], true);
            }
            McuCommand::SetWakeTime(ts) => self.enqueue_wake_time(ts),
            McuCommand::SetDailyWake { hour, minute } => {
                self.daily = Some((hour, minute));
                self.arm_daily(Local::now());
            }
        }
    }

    /// Arm the wake timer for the next occurrence of the daily time.
    fn arm_daily(&mut self, now: chrono::DateTime<Local>) {
        let Some((hour, minute)) = self.daily else {
            return;
        };
        if let Some(t) = next_daily(now, hour, minute) {
            info!("MCU: arming daily wake for {t}");
            self.enqueue_wake_time(t.timestamp());
        }
    }

    fn handle_frame(&mut self, frame: &McuFrame) {
        if let Some(p) = self
            .pending
            .take_if(|p| (p.command + 1) / 2 == (frame.command + 1) / 2)
            && frame.result() != 0
        {
            warn!(
                "MCU rejected command {:#04x} with result {:#04x}",
                p.command,
                frame.result()
            );
        }

        debug!("MCU frame {:#04x}, result {}", frame.command, frame.result());
        match frame.command {
            cmd::POWER_OFF_A | cmd::POWER_OFF_B => {
                let _ = self.events.send(McuEvent::PowerOffConfirmed);
            }
            cmd::LOW_VOLTAGE => {
                info!("MCU reports low supply voltage");
                let _ = self.events.send(McuEvent::LowVoltage);
            }
            cmd::RTC_SYNC_ACK => {
                if frame.result() == 0 {
                    info!("MCU RTC sync finished");
                    self.rtc_synced = true;
                }
            }
            cmd::ACCEL_EVENT => {
                if frame.body.len() >= 6 {
                    let axis = |i: usize| i16::from_be_bytes([frame.body[i], frame.body[i + 1]]);
                    let _ = self.events.send(McuEvent::AccelEvent {
                        x: axis(0),
                        y: axis(2),
                        z: axis(4),
                    });
                }
            }
            _ => {}
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> bool {
        match std::io::Write::write_all(&mut self.port, frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("MCU write failed: {e}");
                false
            }
        }
    }

    fn pump_writes(&mut self) {
        if let Some(pending) = &mut self.pending {
            if pending.sent_at.elapsed() >= RETRY_TIMEOUT {
                if pending.retries_left == 0 {
                    warn!("MCU command {:#04x} out of retries", pending.command);
                    self.pending = None;
                } else {
                    pending.retries_left -= 1;
                    pending.sent_at = Instant::now();
                    let frame = pending.frame.clone();
                    self.write_frame(&frame);
                }
            }
            return;
        }
        if let Some((frame, command, need_ack)) = self.queue.pop_front() {
            self.write_frame(&frame);
            if need_ack {
                self.pending = Some(PendingWrite {
                    frame,
                    command,
                    retries_left: WRITE_RETRY_MAX,
                    sent_at: Instant::now(),
                });
            }
        }
    }

    fn tick(&mut self) {
        if self.queue.is_empty() && self.pending.is_none() {
            if self.heartbeat_at.elapsed() >= HEARTBEAT_TIMEOUT {
                self.enqueue(cmd::HEARTBEAT, &[], false);
                self.heartbeat_at = Instant::now();
            }
            if !self.rtc_synced
                && self
                    .rtc_attempt
                    .is_none_or(|at| at.elapsed() >= TIME_SYNC_TIMEOUT)
            {
                let now = Local::now();
                if now.year() >= TIME_VALID_YEAR {
                    let bytes = time_bytes(now);
                    self.enqueue(cmd::RTC_SYNC, &bytes, true);
                    self.rtc_attempt = Some(Instant::now());
                }
            }
        }
        if self.daily.is_some() && self.daily_check_at.elapsed() >= Duration::from_secs(60) {
            self.daily_check_at = Instant::now();
            let now = Local::now();
            if self.armed_wake.is_none_or(|t| now.timestamp() > t) {
                self.arm_daily(now);
            }
        }
        self.pump_writes();
    }

    fn run(mut self, commands: Receiver<McuCommand>, stop: Arc<AtomicBool>) {
        let mut buf = [0u8; 512];
        while !stop.load(Ordering::Relaxed) {
            loop {
                match commands.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for frame in self.reader.feed(&buf[..n]) {
                        self.handle_frame(&frame);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("MCU read failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
            self.tick();
        }
    }
}

/// Handle to the MCU serial worker thread.
pub struct McuSerial {
    commands: Sender<McuCommand>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl McuSerial {
    /// Open the serial port and start the worker.
    ///
    /// `gravity_threshold` is pushed immediately when non-zero, and
    /// `daily_alarm` arms the recurring wake timer.
    pub fn open(
        path: &str,
        events: tokio::sync::mpsc::UnboundedSender<McuEvent>,
        gravity_threshold: u8,
        daily_alarm: Option<(u8, u8)>,
    ) -> Result<Self> {
        let port = serialport::new(path, 9600)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;
        info!("MCU serial open on {path}");

        let mut worker = Worker {
            port,
            reader: FrameReader::new(),
            queue: VecDeque::new(),
            pending: None,
            heartbeat_at: Instant::now(),
            rtc_synced: false,
            rtc_attempt: None,
            daily: None,
            armed_wake: None,
            daily_check_at: Instant::now(),
            events,
        };
        worker.enqueue(cmd::HEARTBEAT, &[], false);
        if gravity_threshold > 0 {
            worker.handle_command(McuCommand::SetGravityThreshold(gravity_threshold));
        }
        if let Some((hour, minute)) = daily_alarm {
            worker.handle_command(McuCommand::SetDailyWake { hour, minute });
        }

        let (commands, command_rx) = channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("tbox-mcu".into())
            .spawn(move || worker.run(command_rx, thread_stop))?;
        Ok(Self {
            commands,
            stop,
            thread: Some(thread),
        })
    }

    /// Send a command to the worker.
    pub fn send(&self, command: McuCommand) {
        if self.commands.send(command).is_err() {
            warn!("MCU worker gone, command dropped");
        }
    }

    /// Stop the worker thread.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
