/*! Fleet-server uplink client.

A TCP client working through a failover list of servers. After a
connection is established the client logs the vehicle in (session
counter, ICCID, battery pack identity), then keeps draining pending
report payloads from the priority tree, classifying each as realtime
or repeat depending on how stale its event timestamp is. Entries leave
the tree only when the server acknowledges them by echoing the report's
six timestamp bytes. Idle connections carry heartbeats; a server that
goes quiet past the answer timeout is abandoned and the connect loop
starts over.

The server can also talk back: parameter query, parameter setup
(persisted write-through, with a debounced reconnect when the server
list changes) and terminal control (firmware update launch, power off,
reboot, parameter reset, PPP teardown).

Everything here runs on the supervisor's single-threaded runtime; the
only lock shared with other threads is the priority-tree mutex.
*/
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, TimeZone, Timelike};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::backlog::{BacklogStore, PriorityTree};
use crate::config::{ConfigStore, SERVER_LIST_MAX};
use crate::gps::Gps;
use crate::metrics::{MetricSnapshot, SnapshotReader, names};
use crate::packet::{self, Answer, Command, Packet, PacketReader};
use crate::telemetry;

/// Attempts per server before failing over to the next one.
pub const RETRY_MAXIMUM: u32 = 3;
/// Login retry cycle while connected but not logged in.
pub const RETRY_CYCLE: Duration = Duration::from_secs(10);
/// Socket connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const IDLE_RETRY_DELAY: Duration = Duration::from_secs(2);
const SETUP_RECONNECT_DEBOUNCE: Duration = Duration::from_secs(5);
const DEFAULT_SERVER_PORT: u16 = 8700;
/// Emergency threshold of the vehicle fault level.
const FAULT_EMERGENCY: i64 = 3;

/// Configuration store shared across the event-loop components.
pub type SharedConfig = Rc<RefCell<ConfigStore>>;

/// Local civil time as the six wire bytes (year-2000, month, day,
/// hour, minute, second).
#[must_use]
pub fn time6(t: chrono::DateTime<Local>) -> [u8; 6] {
    [
        (t.year() - 2000) as u8,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    ]
}

/// Decode six wire bytes back to a Unix timestamp, local civil time.
#[must_use]
pub fn decode_time6(b: &[u8]) -> Option<i64> {
    if b.len() < 6 {
        return None;
    }
    Local
        .with_ymd_and_hms(
            2000 + i32::from(b[0]),
            u32::from(b[1]),
            u32::from(b[2]),
            u32::from(b[3]),
            u32::from(b[4]),
            u32::from(b[5]),
        )
        .single()
        .map(|t| t.timestamp())
}

/// Split `host[:port]`, defaulting the port.
#[must_use]
pub fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(DEFAULT_SERVER_PORT),
        ),
        None => (addr.to_string(), DEFAULT_SERVER_PORT),
    }
}

/// Build one realtime/repeat report packet for an event timestamp.
#[must_use]
pub fn build_report(vin: &str, ts: i64, payload: &[u8], is_repeat: bool) -> Vec<u8> {
    let when = Local
        .timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(Local::now);
    let mut body = Vec::with_capacity(6 + payload.len());
    body.extend_from_slice(&time6(when));
    body.extend_from_slice(payload);
    let command = if is_repeat {
        Command::RepeatData
    } else {
        Command::RealtimeData
    };
    packet::build(command, Answer::Command, vin, &body)
}

fn read_version(path: &str) -> [u8; 5] {
    let mut out = [0u8; 5];
    if let Ok(data) = std::fs::read(path) {
        let n = data.len().min(5);
        out[..n].copy_from_slice(&data[..n]);
    }
    out
}

struct Shared {
    vin: String,
    iccid: String,
    config: SharedConfig,
    conf_dir: PathBuf,
    snapshot: MetricSnapshot,
    battery_codes: Vec<String>,
    hw_version: [u8; 5],
    fw_version: [u8; 5],
    backlog: BacklogStore,
    tree: PriorityTree,
    gps: Gps,
    first_connected: bool,
    emergency: bool,
    last_fault_level: i64,
    last_report_at: Option<Instant>,
    server_index: usize,
    retry_count: u32,
    /// Report timestamps sent and awaiting the echoed acknowledgement.
    pending: HashMap<i64, Instant>,
    /// Debounced reconnect requested by a Setup command.
    reconnect_at: Option<Instant>,
}

struct OutPacket {
    bytes: Vec<u8>,
    expect_answer: bool,
}

struct AnswerWait {
    bytes: Vec<u8>,
    retries: u32,
    sent_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    LoggingIn,
    LoggedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Continue,
    Disconnect,
}

/// The uplink client. Drive it with [Uplink::run].
pub struct Uplink {
    shared: Rc<RefCell<Shared>>,
}

impl Uplink {
    /// Wire up a new client. `battery_codes` comes from the signal
    /// table, everything else from the supervisor.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vin: &str,
        iccid: &str,
        config: SharedConfig,
        conf_dir: &Path,
        snapshot: MetricSnapshot,
        battery_codes: Vec<String>,
        backlog: BacklogStore,
        gps: Gps,
    ) -> Self {
        let tree = backlog.tree();
        Self {
            shared: Rc::new(RefCell::new(Shared {
                vin: vin.to_string(),
                iccid: iccid.to_string(),
                config,
                conf_dir: conf_dir.to_path_buf(),
                snapshot,
                battery_codes,
                hw_version: read_version("/etc/tboxhwver"),
                fw_version: read_version("/etc/tboxfwver"),
                backlog,
                tree,
                gps,
                first_connected: false,
                emergency: false,
                last_fault_level: 0,
                last_report_at: None,
                server_index: 0,
                retry_count: 0,
                pending: HashMap::new(),
                reconnect_at: None,
            })),
        }
    }

    /// Run the connection state machine and the report tick until
    /// shutdown is signalled.
    pub async fn run(&self, reader: SnapshotReader, shutdown: watch::Receiver<bool>) {
        tokio::join!(
            self.connection_loop(shutdown.clone()),
            self.report_loop(reader, shutdown),
        );
    }

    fn answer_timeout(&self) -> Duration {
        let s = self.shared.borrow();
        let secs = s.config.borrow().settings.answer_timeout;
        Duration::from_secs(secs.into())
    }

    /// The 1-second report tick: build a payload from the snapshot,
    /// remember it in the history ring, track the fault level, and on
    /// the report cadence queue it for uplink.
    async fn report_loop(&self, mut reader: SnapshotReader, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {}
            }
            let (metrics, updated) = reader.take();
            if !updated {
                continue;
            }
            self.process_report_tick(&metrics, Local::now().timestamp());
        }
    }

    /// One report tick over a metric copy: remember the payload in the
    /// history ring, track the fault level (promoting history on an
    /// emergency crossing), and on the report cadence queue the
    /// payload for uplink.
    fn process_report_tick(&self, metrics: &telemetry::Metrics, now_ts: i64) {
        let fix = self.shared.borrow().gps.latest();
        let payload = telemetry::build_payload(metrics, fix);

        let mut s = self.shared.borrow_mut();
        s.backlog.push_history(now_ts, payload.clone());
        if let Some(fault) = metrics.get(names::FAULT_LEVEL).map(|m| m.value) {
            s.emergency = fault >= FAULT_EMERGENCY;
            if s.last_fault_level < FAULT_EMERGENCY && fault >= FAULT_EMERGENCY {
                s.backlog.promote_history(now_ts);
            }
            s.last_fault_level = fault;
        }
        if !s.first_connected {
            return;
        }
        let period = {
            let c = s.config.borrow();
            if s.emergency {
                c.settings.report_emergency_timeout
            } else {
                c.settings.report_normal_timeout
            }
        };
        let period = Duration::from_secs(period.into());
        if s.last_report_at.is_none_or(|at| at.elapsed() >= period) {
            s.backlog.insert(now_ts, payload);
            s.last_report_at = Some(Instant::now());
        }
    }

    /// Index into the server list currently being tried.
    #[must_use]
    pub fn server_index(&self) -> usize {
        self.shared.borrow().server_index
    }

    async fn connection_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let server = {
                let s = self.shared.borrow();
                let c = s.config.borrow();
                let servers = &c.settings.servers;
                if servers.is_empty() {
                    None
                } else {
                    let index = s.server_index.min(servers.len() - 1);
                    Some(servers[index].clone())
                }
            };
            let Some(server) = server else {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(IDLE_RETRY_DELAY) => {}
                }
                continue;
            };
            let (host, port) = split_host_port(&server);
            let addr = format!("{host}:{port}");
            debug!("connecting to {addr}");
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    info!("connected to {addr}");
                    self.shared.borrow_mut().retry_count = 0;
                    self.session(stream, &mut shutdown).await;
                    info!("disconnected from {addr}");
                }
                Ok(Err(e)) => {
                    warn!("cannot connect to {addr}: {e}");
                    self.connect_failed();
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(IDLE_RETRY_DELAY) => {}
                    }
                }
                Err(_) => {
                    warn!("connect to {addr} timed out");
                    self.connect_failed();
                }
            }
        }
    }

    fn connect_failed(&self) {
        let mut s = self.shared.borrow_mut();
        s.retry_count += 1;
        if s.retry_count > RETRY_MAXIMUM {
            s.retry_count = 0;
            advance_server(&mut s);
        }
    }

    /// One established connection, from Connected through login and
    /// report draining until something forces a disconnect.
    async fn session(&self, stream: TcpStream, shutdown: &mut watch::Receiver<bool>) {
        let (mut rd, mut wr) = stream.into_split();
        let mut parser = PacketReader::new();
        let mut state = SessionState::Connected;
        let mut last_login_at: Option<Instant> = None;
        let mut last_activity = Instant::now();
        let mut heartbeat_at = Instant::now();
        let mut queue: VecDeque<OutPacket> = VecDeque::new();
        let mut wait: Option<AnswerWait> = None;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut buf = vec![0u8; 4096];

        'session: loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        info!("server closed the connection");
                        break;
                    }
                    Ok(n) => {
                        last_activity = Instant::now();
                        for pkt in parser.feed(&buf[..n]) {
                            self.handle_packet(&pkt, &mut state, &mut queue, &mut wait, &mut last_login_at);
                        }
                    }
                    Err(e) => {
                        warn!("uplink read error: {e}");
                        break;
                    }
                },
                _ = tick.tick() => {
                    let action = self.tick(
                        &mut state,
                        &mut queue,
                        wait.is_some(),
                        &mut last_login_at,
                        last_activity,
                        &mut heartbeat_at,
                    );
                    if action == Tick::Disconnect {
                        break;
                    }
                }
            }

            // Retry or expire an answer-expected packet.
            let answer_timeout = self.answer_timeout();
            if matches!(&wait, Some(w) if w.sent_at.elapsed() >= answer_timeout) {
                let mut w = wait.take().unwrap();
                w.retries += 1;
                if w.retries > RETRY_MAXIMUM {
                    warn!("no answer from server, dropping request");
                    if state == SessionState::LoggingIn {
                        state = SessionState::Connected;
                        last_login_at = Some(Instant::now());
                    }
                } else {
                    w.sent_at = Instant::now();
                    let bytes = w.bytes.clone();
                    wait = Some(w);
                    if wr.write_all(&bytes).await.is_err() {
                        break 'session;
                    }
                }
            }

            // Drain the write queue; an answer-expected packet parks
            // the queue until answered or expired.
            while wait.is_none() {
                let Some(out) = queue.pop_front() else {
                    break;
                };
                if wr.write_all(&out.bytes).await.is_err() {
                    warn!("uplink write error");
                    break 'session;
                }
                if out.expect_answer {
                    wait = Some(AnswerWait {
                        bytes: out.bytes,
                        retries: 0,
                        sent_at: Instant::now(),
                    });
                }
            }
        }
        // In-flight bookkeeping dies with the session; unacknowledged
        // entries are still in the tree and will be re-sent.
        self.shared.borrow_mut().pending.clear();
    }

    fn tick(
        &self,
        state: &mut SessionState,
        queue: &mut VecDeque<OutPacket>,
        answer_pending: bool,
        last_login_at: &mut Option<Instant>,
        last_activity: Instant,
        heartbeat_at: &mut Instant,
    ) -> Tick {
        let answer_timeout = self.answer_timeout();
        {
            let mut s = self.shared.borrow_mut();
            if let Some(at) = s.reconnect_at
                && Instant::now() >= at
            {
                s.reconnect_at = None;
                s.server_index = 0;
                s.retry_count = 0;
                info!("applying new server configuration");
                return Tick::Disconnect;
            }
        }
        match state {
            SessionState::Connected => {
                if self.shared.borrow().retry_count > RETRY_MAXIMUM {
                    let mut s = self.shared.borrow_mut();
                    s.retry_count = 0;
                    advance_server(&mut s);
                    return Tick::Disconnect;
                }
                if last_login_at.is_none_or(|at| at.elapsed() >= RETRY_CYCLE) {
                    queue.push_back(OutPacket {
                        bytes: self.build_login(),
                        expect_answer: true,
                    });
                    *state = SessionState::LoggingIn;
                    *last_login_at = Some(Instant::now());
                    self.shared.borrow_mut().retry_count += 1;
                }
            }
            SessionState::LoggingIn => {
                if last_login_at.is_none_or(|at| at.elapsed() >= answer_timeout) {
                    *state = SessionState::Connected;
                }
            }
            SessionState::LoggedIn => {
                if last_activity.elapsed() >= answer_timeout {
                    warn!("uplink liveness timeout");
                    return Tick::Disconnect;
                }
                if queue.is_empty() && !answer_pending {
                    self.drain_reports(queue, answer_timeout);
                    let heartbeat_timeout = {
                        let s = self.shared.borrow();
                        let secs = s.config.borrow().settings.heartbeat_timeout;
                        Duration::from_secs(secs.into())
                    };
                    if queue.is_empty() && heartbeat_at.elapsed() >= heartbeat_timeout {
                        let vin = self.shared.borrow().vin.clone();
                        queue.push_back(OutPacket {
                            bytes: packet::build(
                                Command::ClientHeartbeat,
                                Answer::Command,
                                &vin,
                                &[],
                            ),
                            expect_answer: false,
                        });
                        *heartbeat_at = Instant::now();
                    }
                }
            }
        }
        Tick::Continue
    }

    /// Queue every due tree entry as a realtime or repeat report.
    fn drain_reports(&self, queue: &mut VecDeque<OutPacket>, answer_timeout: Duration) {
        let now_ts = Local::now().timestamp();
        let stale_after = answer_timeout.as_secs() as i64;
        let mut s = self.shared.borrow_mut();
        let entries: Vec<(i64, Vec<u8>)> = {
            let tree = s.tree.lock().unwrap();
            tree.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        for (ts, payload) in entries {
            let due = s
                .pending
                .get(&ts)
                .is_none_or(|at| at.elapsed() >= answer_timeout);
            if !due {
                continue;
            }
            let is_repeat = ts < now_ts - stale_after;
            debug!("queueing {} report for {ts}", if is_repeat { "repeat" } else { "realtime" });
            queue.push_back(OutPacket {
                bytes: build_report(&s.vin, ts, &payload, is_repeat),
                expect_answer: false,
            });
            s.pending.insert(ts, Instant::now());
        }
    }

    /// Build the vehicle login packet, bumping and persisting the
    /// session counter.
    fn build_login(&self) -> Vec<u8> {
        let s = self.shared.borrow();
        let mut body = Vec::new();
        body.extend_from_slice(&time6(Local::now()));
        {
            let mut c = s.config.borrow_mut();
            c.settings.session = c.settings.session.wrapping_add(1);
            if let Err(e) = c.sync() {
                warn!("cannot persist session counter: {e}");
            }
            body.extend_from_slice(&c.settings.session.to_be_bytes());
        }
        let mut iccid = [0u8; 20];
        let n = s.iccid.len().min(20);
        iccid[..n].copy_from_slice(&s.iccid.as_bytes()[..n]);
        body.extend_from_slice(&iccid);

        let battery_count = s
            .snapshot
            .get(names::BATTERY_COUNT)
            .map(|m| m.value)
            .unwrap_or(0)
            .clamp(0, 250) as u8;
        body.push(battery_count);
        let code_len = if battery_count > 0 {
            s.battery_codes
                .first()
                .map(|c| c.len().min(255) as u8)
                .unwrap_or(0)
        } else {
            0
        };
        body.push(code_len);
        if code_len > 0 {
            let want = usize::from(battery_count) * usize::from(code_len);
            let mut area = Vec::with_capacity(want);
            for code in &s.battery_codes {
                area.extend_from_slice(code.as_bytes());
                if area.len() >= want {
                    break;
                }
            }
            area.resize(want, 0);
            body.extend_from_slice(&area);
        }
        packet::build(Command::VehicleLogin, Answer::Command, &s.vin, &body)
    }

    fn handle_packet(
        &self,
        pkt: &Packet,
        state: &mut SessionState,
        queue: &mut VecDeque<OutPacket>,
        wait: &mut Option<AnswerWait>,
        last_login_at: &mut Option<Instant>,
    ) {
        if pkt.vin != self.shared.borrow().vin {
            debug!("ignoring packet for foreign VIN {}", pkt.vin);
            return;
        }
        match Command::from_u8(pkt.command) {
            Some(Command::VehicleLogin) => {
                *wait = None;
                match Answer::from_u8(pkt.answer) {
                    Some(Answer::Succeed) => {
                        info!("vehicle login accepted");
                        *state = SessionState::LoggedIn;
                        let mut s = self.shared.borrow_mut();
                        s.first_connected = true;
                        s.retry_count = 0;
                        s.pending.clear();
                    }
                    Some(Answer::Command) | None => {}
                    Some(other) => {
                        warn!("vehicle login rejected: {other:?}");
                        *state = SessionState::Connected;
                        *last_login_at = Some(Instant::now());
                    }
                }
            }
            Some(Command::RealtimeData | Command::RepeatData) => {
                if pkt.answer == Answer::Succeed as u8 {
                    self.handle_report_ack(&pkt.payload);
                }
            }
            Some(Command::ClientHeartbeat) => {}
            Some(Command::Query) if pkt.answer == Answer::Command as u8 => {
                if let Some(bytes) = self.query_response(&pkt.payload) {
                    queue.push_back(OutPacket {
                        bytes,
                        expect_answer: false,
                    });
                }
            }
            Some(Command::Setup) if pkt.answer == Answer::Command as u8 => {
                self.apply_setup(&pkt.payload);
            }
            Some(Command::TerminalControl) if pkt.answer == Answer::Command as u8 => {
                self.terminal_control(&pkt.payload);
            }
            _ => debug!("unhandled command {:#04x}", pkt.command),
        }
    }

    /// Remove an acknowledged report from the tree.
    ///
    /// The ACK body echoes the report's six timestamp bytes. An empty
    /// body is accepted only when exactly one report is in flight.
    fn handle_report_ack(&self, payload: &[u8]) {
        let mut s = self.shared.borrow_mut();
        let ts = if payload.len() >= 6 {
            decode_time6(&payload[..6])
        } else if s.pending.len() == 1 {
            s.pending.keys().next().copied()
        } else {
            None
        };
        let Some(ts) = ts else {
            debug!("unattributable report acknowledgement");
            return;
        };
        s.tree.lock().unwrap().remove(&ts);
        s.pending.remove(&ts);
        debug!("report {ts} acknowledged");
    }

    /// Answer a parameter query (command 0x80).
    fn query_response(&self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() < 7 {
            return None;
        }
        let argc = payload[6] as usize;
        if argc > 252 || payload.len() < argc + 7 {
            return None;
        }
        let s = self.shared.borrow();
        let c = s.config.borrow();
        let (host, port) = c
            .settings
            .servers
            .first()
            .map(|h| split_host_port(h))
            .unwrap_or_default();
        let host_len = host.len().min(255) as u8;

        let mut body = Vec::new();
        body.extend_from_slice(&payload[..6]);
        body.push(0);
        let mut count = 0u8;
        let push_u16 = |body: &mut Vec<u8>, v: u16| body.extend_from_slice(&v.to_be_bytes());
        for &arg in &payload[7..7 + argc] {
            match arg {
                0x01 => {
                    body.push(arg);
                    push_u16(&mut body, c.settings.log_update_ms.min(0xFFFF) as u16);
                    count += 1;
                }
                0x02 => {
                    body.push(arg);
                    let v = c.settings.report_normal_timeout;
                    push_u16(
                        &mut body,
                        if v == 0 || v > 600 { 0xFFFE } else { v as u16 },
                    );
                    count += 1;
                }
                0x03 => {
                    body.push(arg);
                    let v = c.settings.report_emergency_timeout * 1000;
                    push_u16(
                        &mut body,
                        if v == 0 || v > 60000 { 0xFFFE } else { v as u16 },
                    );
                    count += 1;
                }
                0x04 => {
                    body.push(arg);
                    body.push(host_len);
                    count += 1;
                }
                0x05 => {
                    body.push(arg);
                    body.extend_from_slice(&host.as_bytes()[..host_len as usize]);
                }
                0x06 => {
                    body.push(arg);
                    push_u16(
                        &mut body,
                        if port == 0 || port > 65531 { 0xFFFE } else { port },
                    );
                    count += 1;
                }
                0x07 => {
                    body.push(arg);
                    body.extend_from_slice(&s.hw_version);
                    count += 1;
                }
                0x08 => {
                    body.push(arg);
                    body.extend_from_slice(&s.fw_version);
                    count += 1;
                }
                0x09 => {
                    body.push(arg);
                    let v = c.settings.heartbeat_timeout;
                    body.push(if v == 0 || v > 240 { 0xFE } else { v as u8 });
                    count += 1;
                }
                0x0A | 0x0B => {
                    body.push(arg);
                    let v = c.settings.answer_timeout;
                    push_u16(
                        &mut body,
                        if v == 0 || v > 600 { 0xFFFE } else { v as u16 },
                    );
                    count += 1;
                }
                0x0C => {
                    body.push(arg);
                    body.push(0xFF);
                    count += 1;
                }
                0x0D => {
                    // Public domain is not configured on this platform.
                    body.push(arg);
                    body.push(0);
                    count += 1;
                }
                0x0E => {
                    body.push(arg);
                    count += 1;
                }
                0x0F => {
                    body.push(arg);
                    push_u16(&mut body, 0);
                    count += 1;
                }
                0x10 => {
                    body.push(arg);
                    body.push(0x02);
                    count += 1;
                }
                other => warn!("unknown query argument {other:#04x}"),
            }
        }
        body[6] = count;
        Some(packet::build(Command::Query, Answer::Succeed, &s.vin, &body))
    }

    /// Apply a parameter setup (command 0x81), clamping each value to
    /// its documented range. A 0xFFFE/0xFE argument aborts the whole
    /// setup without touching anything.
    fn apply_setup(&self, payload: &[u8]) {
        if payload.len() < 7 {
            return;
        }
        let argc = payload[6] as usize;
        if argc > 252 || payload.len() < argc + 7 {
            return;
        }

        let mut log_update_ms: Option<u32> = None;
        let mut report_normal: Option<u32> = None;
        let mut report_emergency: Option<u32> = None;
        let mut heartbeat: Option<u32> = None;
        let mut answer: Option<u32> = None;
        let mut host: Option<String> = None;
        let mut host_len = 0usize;
        let mut port: Option<u16> = None;
        let mut public_len = 0usize;

        let mut i = 7usize;
        let take_u16 = |payload: &[u8], i: &mut usize| -> Option<u16> {
            if *i + 2 > payload.len() {
                return None;
            }
            let v = u16::from_be_bytes([payload[*i], payload[*i + 1]]);
            *i += 2;
            Some(v)
        };
        while i < payload.len() {
            let arg = payload[i];
            i += 1;
            match arg {
                0x01 => {
                    let Some(v) = take_u16(payload, &mut i) else {
                        return;
                    };
                    match v {
                        0xFFFE => return,
                        0xFFFF => {}
                        v if v < 1000 => log_update_ms = Some(1000),
                        v if v <= 60000 => log_update_ms = Some(u32::from(v)),
                        _ => log_update_ms = Some(60000),
                    }
                }
                0x02 => {
                    let Some(v) = take_u16(payload, &mut i) else {
                        return;
                    };
                    match v {
                        0xFFFE => return,
                        0xFFFF => {}
                        0 => report_normal = Some(1),
                        v if v <= 600 => report_normal = Some(u32::from(v)),
                        _ => report_normal = Some(600),
                    }
                }
                0x03 => {
                    let Some(v) = take_u16(payload, &mut i) else {
                        return;
                    };
                    match v {
                        0xFFFE => return,
                        0xFFFF => {}
                        v if v < 1000 => report_emergency = Some(1),
                        v if v <= 60000 => report_emergency = Some(u32::from(v) / 1000),
                        _ => report_emergency = Some(60),
                    }
                }
                0x04 => {
                    if i >= payload.len() {
                        return;
                    }
                    host_len = payload[i] as usize;
                    i += 1;
                }
                0x05 => {
                    if i + host_len > payload.len() {
                        return;
                    }
                    host = Some(String::from_utf8_lossy(&payload[i..i + host_len]).into_owned());
                    i += host_len;
                }
                0x06 => {
                    let Some(v) = take_u16(payload, &mut i) else {
                        return;
                    };
                    match v {
                        0xFFFE => return,
                        0 => port = Some(DEFAULT_SERVER_PORT),
                        v if v < 0xFFFE => port = Some(v),
                        _ => {}
                    }
                }
                0x09 => {
                    if i >= payload.len() {
                        return;
                    }
                    let v = payload[i];
                    i += 1;
                    match v {
                        0xFE => return,
                        0 => heartbeat = Some(1),
                        v if v < 0xFE => heartbeat = Some(u32::from(v)),
                        _ => {}
                    }
                }
                0x0A => {
                    let Some(v) = take_u16(payload, &mut i) else {
                        return;
                    };
                    // The command-timeout parameter never overrides a
                    // value already set earlier in this request; the
                    // dedicated answer-timeout parameter (0x0B) wins.
                    if answer.is_none() {
                        match v {
                            0xFFFE => return,
                            0xFFFF => {}
                            v if v < 15 => answer = Some(15),
                            v if v <= 600 => answer = Some(u32::from(v)),
                            _ => answer = Some(600),
                        }
                    }
                }
                0x0B => {
                    let Some(v) = take_u16(payload, &mut i) else {
                        return;
                    };
                    match v {
                        0xFFFE => return,
                        0xFFFF => {}
                        v if v < 15 => answer = Some(15),
                        v if v <= 600 => answer = Some(u32::from(v)),
                        _ => answer = Some(600),
                    }
                }
                0x0C | 0x10 => {
                    if i >= payload.len() {
                        return;
                    }
                    i += 1;
                }
                0x0D => {
                    if i >= payload.len() {
                        return;
                    }
                    public_len = payload[i] as usize;
                    i += 1;
                }
                0x0E => {
                    if i + public_len > payload.len() {
                        return;
                    }
                    i += public_len;
                }
                0x0F => {
                    if i + 2 > payload.len() {
                        return;
                    }
                    i += 2;
                }
                other => {
                    warn!("unknown setup argument {other:#04x}");
                    return;
                }
            }
        }

        let mut s = self.shared.borrow_mut();
        let mut changed = false;
        {
            let mut c = s.config.borrow_mut();
            if let Some(v) = log_update_ms {
                c.settings.log_update_ms = v;
                changed = true;
            }
            if let Some(v) = report_normal {
                c.settings.report_normal_timeout = v;
                changed = true;
            }
            if let Some(v) = report_emergency {
                c.settings.report_emergency_timeout = v;
                changed = true;
            }
            if let Some(v) = heartbeat {
                c.settings.heartbeat_timeout = v;
                changed = true;
            }
            if let Some(v) = answer {
                c.settings.answer_timeout = v;
                changed = true;
            }
            if let Some(host) = &host {
                let address = format!("{host}:{}", port.unwrap_or(DEFAULT_SERVER_PORT));
                info!("server list head replaced with {address}");
                c.settings.servers.insert(0, address);
                c.settings.servers.truncate(SERVER_LIST_MAX);
                changed = true;
            }
            if changed && let Err(e) = c.sync() {
                warn!("cannot persist setup: {e}");
            }
        }
        if host.is_some() {
            s.reconnect_at = Some(Instant::now() + SETUP_RECONNECT_DEBOUNCE);
        }
    }

    /// Terminal control (command 0x82).
    fn terminal_control(&self, payload: &[u8]) {
        if payload.len() < 7 {
            return;
        }
        match payload[6] {
            0x01 => self.launch_update(&payload[7..]),
            0x02 => spawn_command("/sbin/poweroff", &[]),
            0x03 => spawn_command("/sbin/reboot", &[]),
            0x04 => {
                info!("resetting parameters to defaults");
                let s = self.shared.borrow();
                let mut c = s.config.borrow_mut();
                c.settings.reset_tunables();
                if let Err(e) = c.sync() {
                    warn!("cannot persist parameter reset: {e}");
                }
            }
            0x05 => {
                spawn_command("/usr/bin/poff", &["gprs"]);
                if let Err(e) = std::fs::write("/tmp/gprs-off", b"DISCONNECT") {
                    warn!("cannot write PPP marker: {e}");
                }
            }
            other => warn!("unknown terminal control {other:#04x}"),
        }
    }

    /// Write the update descriptor and launch the updater.
    ///
    /// The descriptor is `URL;APN;USER;PASSWORD;` followed by
    /// fixed-width address, port, factory code, hardware and firmware
    /// versions and a timeout.
    fn launch_update(&self, data: &[u8]) {
        fn take_field<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
            let rest = &data[*pos..];
            let end = rest.iter().position(|&b| b == b';')?;
            *pos += end + 1;
            Some(&rest[..end])
        }
        fn take_fixed<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
            if *pos + n > data.len() {
                return None;
            }
            let out = &data[*pos..*pos + n];
            *pos += n + 1; // fields are NUL-separated
            Some(out)
        }

        let mut pos = 0usize;
        let url = take_field(data, &mut pos).map(|b| String::from_utf8_lossy(b).into_owned());
        let apn = take_field(data, &mut pos).map(|b| String::from_utf8_lossy(b).into_owned());
        let user = take_field(data, &mut pos).map(|b| String::from_utf8_lossy(b).into_owned());
        let password = take_field(data, &mut pos).map(|b| String::from_utf8_lossy(b).into_owned());
        let address = take_fixed(data, &mut pos, 6).map(<[u8]>::to_vec);
        let port = take_fixed(data, &mut pos, 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or(0);
        let factory = take_fixed(data, &mut pos, 4).map(<[u8]>::to_vec);
        let hw = take_fixed(data, &mut pos, 5).map(<[u8]>::to_vec);
        let fw = take_fixed(data, &mut pos, 5).map(<[u8]>::to_vec);
        let timeout = if pos + 2 <= data.len() {
            u16::from_be_bytes([data[pos], data[pos + 1]])
        } else {
            0
        };

        // Only plain download schemes are allowed.
        let url = url.filter(|u| {
            let u = u.to_ascii_lowercase();
            u.starts_with("http://") || u.starts_with("https://") || u.starts_with("ftp://")
        });

        let s = self.shared.borrow();
        let path = s.conf_dir.join("tl-update.conf");
        let write = || -> std::io::Result<()> {
            let mut f = std::fs::File::create(&path)?;
            writeln!(f, "TIMESTAMP={}", Local::now().timestamp())?;
            if let Some(url) = &url
                && !url.is_empty()
            {
                writeln!(f, "URL={url}")?;
            }
            for (key, value) in [("APN", &apn), ("USER", &user), ("PASSWORD", &password)] {
                if let Some(v) = value
                    && !v.is_empty()
                {
                    writeln!(f, "{key}={v}")?;
                }
            }
            if let Some(a) = &address {
                if a[0] == 0 && a[1] == 0 {
                    writeln!(f, "HOST={}.{}.{}.{}", a[2], a[3], a[4], a[5])?;
                } else {
                    writeln!(f, "HOST={}", String::from_utf8_lossy(a))?;
                }
            }
            writeln!(f, "PORT={port}")?;
            if let Some(v) = &factory {
                writeln!(f, "FACTORYCODE={}", String::from_utf8_lossy(v))?;
            }
            if let Some(v) = &hw {
                writeln!(f, "HWVERSION={}", String::from_utf8_lossy(v))?;
            }
            if let Some(v) = &fw {
                writeln!(f, "FWVERSION={}", String::from_utf8_lossy(v))?;
            }
            writeln!(f, "TIMEOUT={timeout}")?;
            Ok(())
        };
        match write() {
            Ok(()) => {
                info!("update descriptor written to {}", path.display());
                spawn_command("/usr/bin/tl-update", &[]);
            }
            Err(e) => warn!("cannot write update descriptor: {e}"),
        }
    }
}

fn advance_server(s: &mut Shared) {
    let len = s.config.borrow().settings.servers.len();
    if s.server_index + 1 < len {
        s.server_index += 1;
        info!("failing over to server {}", s.server_index + 1);
    }
}

fn spawn_command(program: &str, args: &[&str]) {
    match std::process::Command::new(program).args(args).spawn() {
        Ok(_) => info!("launched {program}"),
        Err(e) => warn!("cannot launch {program}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSnapshot;

    const VIN: &str = "ABCDEFGHJKLMNPRST";
    const ICCID: &str = "89000000000000000001";

    fn test_uplink(dir: &Path) -> (Uplink, SharedConfig, BacklogStore) {
        let mut store = ConfigStore::load(dir, VIN);
        store.settings.servers = vec!["127.0.0.1:1".into()];
        store.sync().unwrap();
        let config: SharedConfig = Rc::new(RefCell::new(store));
        let snapshot = MetricSnapshot::new();
        snapshot.update(names::BATTERY_COUNT, 2, 1.0, 0, 1);
        let backlog = BacklogStore::new(dir);
        let uplink = Uplink::new(
            VIN,
            ICCID,
            config.clone(),
            dir,
            snapshot,
            vec!["PACK0001A".into()],
            backlog.clone(),
            Gps::new(),
        );
        (uplink, config, backlog)
    }

    #[test]
    fn time6_roundtrip() {
        let t = Local.with_ymd_and_hms(2024, 5, 17, 10, 30, 45).unwrap();
        let b = time6(t);
        assert_eq!(b, [24, 5, 17, 10, 30, 45]);
        assert_eq!(decode_time6(&b), Some(t.timestamp()));
        assert_eq!(decode_time6(&b[..5]), None);
    }

    #[test]
    fn host_port_split() {
        assert_eq!(split_host_port("10.0.0.1:8700"), ("10.0.0.1".into(), 8700));
        assert_eq!(split_host_port("example.com"), ("example.com".into(), 8700));
        assert_eq!(split_host_port("host:notaport"), ("host".into(), 8700));
    }

    #[test]
    fn report_classification() {
        let now = Local::now().timestamp();
        let fresh = build_report(VIN, now - 10, &[0xAA], false);
        assert_eq!(fresh[2], Command::RealtimeData as u8);
        let stale = build_report(VIN, now - 120, &[0xAA], true);
        assert_eq!(stale[2], Command::RepeatData as u8);
        // The event timestamp rides in the body.
        let mut reader = PacketReader::new();
        let pkt = &reader.feed(&fresh)[0];
        assert_eq!(decode_time6(&pkt.payload[..6]), Some(now - 10));
        assert_eq!(&pkt.payload[6..], &[0xAA]);
    }

    #[test]
    fn login_packet_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, _) = test_uplink(dir.path());
        let bytes = uplink.build_login();
        let mut reader = PacketReader::new();
        let pkt = &reader.feed(&bytes)[0];
        assert_eq!(pkt.command, Command::VehicleLogin as u8);
        assert_eq!(pkt.answer, Answer::Command as u8);
        assert_eq!(pkt.vin, VIN);
        let body = &pkt.payload;
        // time6 + session + iccid + counts + codes
        assert_eq!(u16::from_be_bytes([body[6], body[7]]), 1);
        assert_eq!(&body[8..28], ICCID.as_bytes());
        assert_eq!(body[28], 2); // battery count
        assert_eq!(body[29], 9); // code length
        assert_eq!(&body[30..39], b"PACK0001A");
        // Second pack code missing: NUL padding.
        assert_eq!(&body[39..48], &[0u8; 9]);
        assert_eq!(body.len(), 48);
        // The bumped session was persisted.
        assert_eq!(config.borrow().settings.session, 1);
        let reloaded = ConfigStore::load(dir.path(), VIN);
        assert_eq!(reloaded.settings.session, 1);
    }

    #[test]
    fn report_ack_removes_tree_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, _, backlog) = test_uplink(dir.path());
        let ts = Local.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap().timestamp();
        backlog.insert(ts, vec![1, 2, 3]);
        uplink.shared.borrow_mut().pending.insert(ts, Instant::now());

        uplink.handle_report_ack(&[24, 5, 17, 10, 0, 0]);
        assert!(backlog.tree().lock().unwrap().is_empty());
        assert!(uplink.shared.borrow().pending.is_empty());
    }

    #[test]
    fn empty_ack_only_matches_single_inflight() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, _, backlog) = test_uplink(dir.path());
        backlog.insert(100, vec![1]);
        backlog.insert(200, vec![2]);
        {
            let mut s = uplink.shared.borrow_mut();
            s.pending.insert(100, Instant::now());
            s.pending.insert(200, Instant::now());
        }
        // Ambiguous: nothing must be removed.
        uplink.handle_report_ack(&[]);
        assert_eq!(backlog.tree().lock().unwrap().len(), 2);

        uplink.shared.borrow_mut().pending.remove(&200);
        uplink.handle_report_ack(&[]);
        assert_eq!(backlog.tree().lock().unwrap().len(), 1);
        assert!(backlog.tree().lock().unwrap().contains_key(&200));
    }

    #[test]
    fn setup_applies_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, _) = test_uplink(dir.path());
        let mut payload = vec![24, 1, 1, 0, 0, 0, 2];
        payload.push(0x0A);
        payload.extend_from_slice(&90u16.to_be_bytes());
        payload.push(0x09);
        payload.push(20);
        uplink.apply_setup(&payload);
        assert_eq!(config.borrow().settings.answer_timeout, 90);
        assert_eq!(config.borrow().settings.heartbeat_timeout, 20);
        let reloaded = ConfigStore::load(dir.path(), VIN);
        assert_eq!(reloaded.settings.answer_timeout, 90);
        assert_eq!(reloaded.settings.heartbeat_timeout, 20);
        // No server change: no reconnect scheduled.
        assert!(uplink.shared.borrow().reconnect_at.is_none());
    }

    #[test]
    fn setup_clamps_and_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, _) = test_uplink(dir.path());
        // Below-range answer timeout clamps up to 15.
        let mut payload = vec![0, 0, 0, 0, 0, 0, 1, 0x0A];
        payload.extend_from_slice(&5u16.to_be_bytes());
        uplink.apply_setup(&payload);
        assert_eq!(config.borrow().settings.answer_timeout, 15);

        // An abnormal argument aborts the whole setup.
        let mut payload = vec![0, 0, 0, 0, 0, 0, 2, 0x09, 30, 0x0A];
        payload.extend_from_slice(&0xFFFEu16.to_be_bytes());
        uplink.apply_setup(&payload);
        assert_eq!(config.borrow().settings.heartbeat_timeout, 10);
    }

    #[test]
    fn setup_dedicated_answer_timeout_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, _) = test_uplink(dir.path());
        // 0x0B after 0x0A overrides it.
        let mut payload = vec![0, 0, 0, 0, 0, 0, 2, 0x0A];
        payload.extend_from_slice(&90u16.to_be_bytes());
        payload.push(0x0B);
        payload.extend_from_slice(&50u16.to_be_bytes());
        uplink.apply_setup(&payload);
        assert_eq!(config.borrow().settings.answer_timeout, 50);

        // 0x0A after 0x0B is ignored: the command timeout never
        // overrides a value already set in the same request.
        let mut payload = vec![0, 0, 0, 0, 0, 0, 2, 0x0B];
        payload.extend_from_slice(&120u16.to_be_bytes());
        payload.push(0x0A);
        payload.extend_from_slice(&90u16.to_be_bytes());
        uplink.apply_setup(&payload);
        assert_eq!(config.borrow().settings.answer_timeout, 120);

        // A repeated 0x0A is sticky-first.
        let mut payload = vec![0, 0, 0, 0, 0, 0, 2, 0x0A];
        payload.extend_from_slice(&30u16.to_be_bytes());
        payload.push(0x0A);
        payload.extend_from_slice(&200u16.to_be_bytes());
        uplink.apply_setup(&payload);
        assert_eq!(config.borrow().settings.answer_timeout, 30);
    }

    #[test]
    fn setup_server_change_schedules_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, _) = test_uplink(dir.path());
        let host = b"10.1.2.3";
        let mut payload = vec![0, 0, 0, 0, 0, 0, 3];
        payload.push(0x04);
        payload.push(host.len() as u8);
        payload.push(0x05);
        payload.extend_from_slice(host);
        payload.push(0x06);
        payload.extend_from_slice(&9000u16.to_be_bytes());
        uplink.apply_setup(&payload);
        assert_eq!(
            config.borrow().settings.servers[0],
            "10.1.2.3:9000".to_string()
        );
        assert_eq!(config.borrow().settings.servers.len(), 2);
        assert!(uplink.shared.borrow().reconnect_at.is_some());
    }

    #[test]
    fn query_reports_current_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, _) = test_uplink(dir.path());
        config.borrow_mut().settings.answer_timeout = 77;
        let payload = vec![24, 1, 1, 0, 0, 0, 3, 0x01, 0x09, 0x0A];
        let bytes = uplink.query_response(&payload).unwrap();
        let mut reader = PacketReader::new();
        let pkt = &reader.feed(&bytes)[0];
        assert_eq!(pkt.command, Command::Query as u8);
        assert_eq!(pkt.answer, Answer::Succeed as u8);
        let body = &pkt.payload;
        assert_eq!(&body[..6], &payload[..6]);
        assert_eq!(body[6], 3);
        assert_eq!(body[7], 0x01);
        assert_eq!(u16::from_be_bytes([body[8], body[9]]), 10000);
        assert_eq!(body[10], 0x09);
        assert_eq!(body[11], 10);
        assert_eq!(body[12], 0x0A);
        assert_eq!(u16::from_be_bytes([body[13], body[14]]), 77);
    }

    #[test]
    fn terminal_reset_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, _) = test_uplink(dir.path());
        config.borrow_mut().settings.answer_timeout = 300;
        uplink.terminal_control(&[0, 0, 0, 0, 0, 0, 0x04]);
        assert_eq!(config.borrow().settings.answer_timeout, 60);
        let reloaded = ConfigStore::load(dir.path(), VIN);
        assert_eq!(reloaded.settings.answer_timeout, 60);
    }

    #[test]
    fn reports_queue_only_after_first_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, _, backlog) = test_uplink(dir.path());
        let snap = MetricSnapshot::new();
        snap.update(names::SOC, 50, 1.0, 0, 1);
        let mut reader = snap.reader();
        let now = Local::now().timestamp();

        let (metrics, _) = reader.take();
        uplink.process_report_tick(&metrics, now);
        assert!(backlog.tree().lock().unwrap().is_empty());

        uplink.shared.borrow_mut().first_connected = true;
        uplink.process_report_tick(&metrics, now + 1);
        assert_eq!(backlog.tree().lock().unwrap().len(), 1);

        // The next tick falls inside the normal report period and is
        // kept in history only.
        uplink.process_report_tick(&metrics, now + 2);
        assert_eq!(backlog.tree().lock().unwrap().len(), 1);
    }

    #[test]
    fn emergency_crossing_promotes_recent_history() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, _, backlog) = test_uplink(dir.path());
        let snap = MetricSnapshot::new();
        snap.update(names::FAULT_LEVEL, 1, 1.0, 0, 1);
        let mut reader = snap.reader();
        let t0 = Local::now().timestamp();

        // 40 seconds of uneventful driving before the fault.
        for i in 0..40 {
            snap.update(names::SOC, 50, 1.0, 0, 1);
            let (metrics, _) = reader.take();
            uplink.process_report_tick(&metrics, t0 - 40 + i);
        }
        assert!(backlog.tree().lock().unwrap().is_empty());

        snap.update(names::FAULT_LEVEL, 3, 1.0, 0, 1);
        let (metrics, _) = reader.take();
        uplink.process_report_tick(&metrics, t0);

        // The last 30 seconds of history (plus the current frame) are
        // promoted, older frames are discarded.
        let tree = backlog.tree();
        let tree = tree.lock().unwrap();
        assert_eq!(tree.len(), 31);
        assert_eq!(tree.keys().next().copied(), Some(t0 - 30));
        assert_eq!(tree.keys().next_back().copied(), Some(t0));
        assert!(uplink.shared.borrow().emergency);
    }

    /// Scenario: no server reachable; the client fails over after
    /// repeated refusals and never loses queued reports.
    #[tokio::test(flavor = "current_thread")]
    async fn failover_after_repeated_refusals() {
        let dir = tempfile::tempdir().unwrap();
        let (uplink, config, backlog) = test_uplink(dir.path());
        // Reserved ports with nothing listening: connection refused.
        config.borrow_mut().settings.servers =
            vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()];
        backlog.insert(Local::now().timestamp(), vec![0x42]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let snapshot = MetricSnapshot::new();
        let reader = snapshot.reader();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let run = uplink.run(reader, shutdown_rx);
                let watchdog = async {
                    for _ in 0..300 {
                        if uplink.server_index() == 1 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    shutdown_tx.send(true).unwrap();
                };
                tokio::join!(run, watchdog);
            })
            .await;

        assert_eq!(uplink.server_index(), 1);
        // Nothing was lost while unreachable.
        assert_eq!(backlog.tree().lock().unwrap().len(), 1);
        assert!(!uplink.shared.borrow().first_connected);
    }

    /// Full login-then-report exchange against a scripted server.
    #[tokio::test(flavor = "current_thread")]
    async fn login_then_report_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (uplink, config, backlog) = test_uplink(dir.path());
        config.borrow_mut().settings.servers = vec![format!("127.0.0.1:{port}")];

        // One stale and one fresh report wait in the tree.
        let now = Local::now().timestamp();
        let stale_ts = now - 120;
        let fresh_ts = now - 10;
        backlog.insert(stale_ts, vec![0x01, 0x02]);
        backlog.insert(fresh_ts, vec![0x03, 0x04]);

        let server = std::thread::spawn(move || -> (u8, Vec<(u8, i64)>) {
            use std::io::{Read, Write};
            let (mut sock, _) = listener.accept().unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut parser = PacketReader::new();
            let mut buf = [0u8; 4096];
            let mut login_cmd = 0;
            let mut reports: Vec<(u8, i64)> = Vec::new();
            'outer: loop {
                let n = sock.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                for pkt in parser.feed(&buf[..n]) {
                    if pkt.command == Command::VehicleLogin as u8 {
                        login_cmd = pkt.command;
                        let ack = packet::build(
                            Command::VehicleLogin,
                            Answer::Succeed,
                            &pkt.vin,
                            &[],
                        );
                        sock.write_all(&ack).unwrap();
                    } else if pkt.command == Command::RealtimeData as u8
                        || pkt.command == Command::RepeatData as u8
                    {
                        let ts = decode_time6(&pkt.payload[..6]).unwrap();
                        reports.push((pkt.command, ts));
                        let ack = packet::build(
                            Command::from_u8(pkt.command).unwrap(),
                            Answer::Succeed,
                            &pkt.vin,
                            &pkt.payload[..6],
                        );
                        sock.write_all(&ack).unwrap();
                        if reports.len() == 2 {
                            break 'outer;
                        }
                    }
                }
            }
            (login_cmd, reports)
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let snapshot = MetricSnapshot::new();
        let reader = snapshot.reader();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let run = uplink.run(reader, shutdown_rx);
                let wait_acks = async {
                    for _ in 0..200 {
                        if backlog.tree().lock().unwrap().is_empty() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    shutdown_tx.send(true).unwrap();
                };
                tokio::join!(run, wait_acks);
            })
            .await;

        let (login_cmd, reports) = server.join().unwrap();
        assert_eq!(login_cmd, Command::VehicleLogin as u8);
        assert_eq!(reports.len(), 2);
        // Ascending timestamp order: the stale one first, as Repeat.
        assert_eq!(reports[0], (Command::RepeatData as u8, stale_ts));
        assert_eq!(reports[1], (Command::RealtimeData as u8, fresh_ts));
        // Echoed ACKs emptied the tree.
        assert!(backlog.tree().lock().unwrap().is_empty());
    }
}
