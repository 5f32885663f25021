/*! Decoded-metric log store.

Every few seconds (configurable, default 10 s) the supervisor submits a
deep copy of the metric snapshot. A writer thread frames each snapshot
as a record

```text
"TLIH" | total_len:4 BE | crc16:2 BE | json | "TLIT"
```

where `total_len` counts everything from the head magic through the
last JSON byte, and appends it (with an fsync per record) to a
`tbl-YYYYMMDDhhmmss.tlw` file. On rotation (8 MiB, time running
backwards, or a write error) the file is renamed to `.tl`; leftover
`.tlw` files are renamed on startup for crash recovery.

An archive thread compresses `.tl` files to zlib `.tlz` streams once a
minute and enforces the free-space/free-inode retention policy. A
query thread serves time-range queries over the archived files plus
the in-memory tail of recent records.
*/
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::crc::crc16;
use crate::metrics::{MetricShape, MetricValue};
use crate::telemetry::Metrics;

/// Record head magic.
pub const HEAD_MAGIC: &[u8; 4] = b"TLIH";
/// Record tail magic.
pub const TAIL_MAGIC: &[u8; 4] = b"TLIT";
/// Rotation threshold for the write-in-progress file.
pub const LOG_SIZE_MAX: u64 = 8 * 1024 * 1024;

/// Synthetic metric carrying the record's Unix timestamp.
pub const TIME_METRIC: &str = "time";

const FREE_SPACE_MIN: u64 = 200 * 1024 * 1024;
const FREE_INODES_MIN: u64 = 2048;
const ARCHIVE_INTERVAL: Duration = Duration::from_secs(60);
const CACHE_MAX: usize = 1024;

/// One metric as stored in the JSON body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct LogEntry {
    name: String,
    value: i64,
    offset: i64,
    unit: f64,
    source: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    listindex: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    index: Option<BTreeMap<String, i64>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    listparent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    valuetable: Option<BTreeMap<String, i64>>,
}

impl From<&MetricValue> for LogEntry {
    fn from(m: &MetricValue) -> Self {
        let mut entry = LogEntry {
            name: m.name.clone(),
            value: m.value,
            offset: m.offset,
            unit: m.unit,
            source: m.source,
            listindex: None,
            index: None,
            listparent: None,
            valuetable: None,
        };
        match &m.shape {
            MetricShape::Plain => {}
            MetricShape::ListIndex { indices, .. } => {
                entry.listindex = Some(true);
                entry.index = Some(indices.clone());
            }
            MetricShape::ListMember { parent, values } => {
                entry.listparent = Some(parent.clone());
                entry.valuetable = Some(values.clone());
            }
        }
        entry
    }
}

impl From<LogEntry> for MetricValue {
    fn from(e: LogEntry) -> Self {
        let shape = if e.listindex.unwrap_or(false) {
            MetricShape::ListIndex {
                current_key: String::new(),
                indices: e.index.unwrap_or_default(),
            }
        } else if let Some(parent) = e.listparent {
            MetricShape::ListMember {
                parent,
                values: e.valuetable.unwrap_or_default(),
            }
        } else {
            MetricShape::Plain
        };
        MetricValue {
            name: e.name,
            value: e.value,
            unit: e.unit,
            offset: e.offset,
            source: e.source,
            shape,
        }
    }
}

/// Encode one snapshot as a framed record.
pub fn encode_record(snapshot: &Metrics) -> Result<Vec<u8>> {
    let mut entries: Vec<LogEntry> = snapshot.values().map(LogEntry::from).collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let json = serde_json::to_vec(&entries)?;
    let mut out = Vec::with_capacity(json.len() + 14);
    out.extend_from_slice(HEAD_MAGIC);
    out.extend_from_slice(&(10 + json.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc16(&json).to_be_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(TAIL_MAGIC);
    Ok(out)
}

/// Decode every valid record in a byte stream.
///
/// Damaged records (bad magic, bad CRC, bad JSON) are skipped; the
/// scan resynchronises on the next head magic.
#[must_use]
pub fn decode_records(data: &[u8]) -> Vec<(i64, Metrics)> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 14 <= data.len() {
        if &data[pos..pos + 4] != HEAD_MAGIC {
            pos += 1;
            continue;
        }
        let total_len = u32::from_be_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]) as usize;
        if total_len < 10 || pos + total_len + 4 > data.len() {
            pos += 1;
            continue;
        }
        let want_crc = u16::from_be_bytes([data[pos + 8], data[pos + 9]]);
        let json = &data[pos + 10..pos + total_len];
        let tail = &data[pos + total_len..pos + total_len + 4];
        if tail != TAIL_MAGIC || crc16(json) != want_crc {
            warn!("skipping damaged decoded-log record at offset {pos}");
            pos += 1;
            continue;
        }
        match serde_json::from_slice::<Vec<LogEntry>>(json) {
            Ok(entries) => {
                let mut map = Metrics::new();
                for e in entries {
                    let m = MetricValue::from(e);
                    map.insert(m.name.clone(), m);
                }
                let time = map.get(TIME_METRIC).map(|m| m.value).unwrap_or(0);
                out.push((time, map));
            }
            Err(e) => warn!("skipping decoded-log record with bad JSON: {e}"),
        }
        pos += total_len + 4;
    }
    out
}

/// Free space and free inodes of the filesystem holding `path`.
fn fs_free(path: &Path) -> Option<(u64, u64)> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and st is a
    // properly sized out-parameter.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return None;
    }
    Some((
        st.f_bavail as u64 * st.f_frsize as u64,
        st.f_favail as u64,
    ))
}

/// Delete oldest archives until the measured free space and inodes are
/// above the retention thresholds.
fn retention_sweep(dir: &Path, mut free: (u64, u64)) {
    if free.0 >= FREE_SPACE_MIN && free.1 >= FREE_INODES_MIN {
        return;
    }
    let mut archives: Vec<PathBuf> = list_with_extension(dir, "tlz");
    archives.sort();
    for path in archives {
        if free.0 >= FREE_SPACE_MIN && free.1 >= FREE_INODES_MIN {
            break;
        }
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("retention: removed {}", path.display());
                free.0 += size;
                free.1 += 1;
            }
            Err(e) => warn!("retention: cannot remove {}: {e}", path.display()),
        }
    }
}

fn list_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == ext))
        .collect()
}

/// Compress one `.tl` file to `.tlz`, removing the original.
fn archive_file(path: &Path) -> Result<()> {
    let dest = path.with_extension("tlz");
    let tmp = path.with_extension("tlz.tmp");
    let data = fs::read(path)?;
    let file = File::create(&tmp)?;
    let mut enc = flate2::write::ZlibEncoder::new(file, flate2::Compression::default());
    enc.write_all(&data)?;
    enc.finish()?;
    fs::rename(&tmp, &dest)?;
    fs::remove_file(path)?;
    debug!("archived {} -> {}", path.display(), dest.display());
    Ok(())
}

fn archive_sweep(dir: &Path) {
    for path in list_with_extension(dir, "tl") {
        if let Err(e) = archive_file(&path) {
            // Left in place for the next sweep.
            warn!("archive of {} failed: {e}", path.display());
        }
    }
    if let Some(free) = fs_free(dir) {
        retention_sweep(dir, free);
    }
}

/// Range query request.
struct QueryRequest {
    begin: Option<i64>,
    end: Option<i64>,
    tx: Sender<(i64, Metrics)>,
}

enum WriterMsg {
    Record(Metrics),
    Flush,
}

struct Writer {
    base: PathBuf,
    file: Option<(File, PathBuf, u64)>,
    last_time: i64,
    last_file_stamp: i64,
    cache: Arc<Mutex<VecDeque<(i64, Metrics)>>>,
}

impl Writer {
    fn open_new(&mut self) -> Result<()> {
        use chrono::TimeZone;
        // File names must stay strictly chronological even when two
        // rotations land in the same wall-clock second.
        let mut stamp = chrono::Local::now().timestamp();
        if stamp <= self.last_file_stamp {
            stamp = self.last_file_stamp + 1;
        }
        self.last_file_stamp = stamp;
        let when = chrono::Local
            .timestamp_opt(stamp, 0)
            .single()
            .unwrap_or_else(chrono::Local::now);
        let name = format!("tbl-{}.tlw", when.format("%Y%m%d%H%M%S"));
        let path = self.base.join(name);
        let file = File::options().create(true).append(true).open(&path)?;
        debug!("decoded log: opened {}", path.display());
        self.file = Some((file, path, 0));
        Ok(())
    }

    fn rotate(&mut self) {
        // The cached tail belongs to the file being rotated out; from
        // here on queries find those records through the archive path.
        self.cache.lock().unwrap().clear();
        if let Some((file, path, _)) = self.file.take() {
            drop(file);
            let done = path.with_extension("tl");
            if let Err(e) = fs::rename(&path, &done) {
                warn!("decoded log: rotate rename failed: {e}");
            } else {
                info!("decoded log: rotated {}", done.display());
            }
        }
    }

    fn write_snapshot(&mut self, snapshot: Metrics) {
        let time = snapshot.get(TIME_METRIC).map(|m| m.value).unwrap_or(0);
        if time < self.last_time {
            // Wall clock went backwards; start a fresh file so names
            // stay chronological.
            self.rotate();
        }
        self.last_time = time;

        let record = match encode_record(&snapshot) {
            Ok(r) => r,
            Err(e) => {
                warn!("decoded log: cannot encode record: {e}");
                return;
            }
        };

        if self.file.is_none()
            && let Err(e) = self.open_new()
        {
            warn!("decoded log: cannot open file: {e}");
            return;
        }
        let (file, _, written) = self.file.as_mut().unwrap();
        let res = file.write_all(&record).and_then(|()| file.sync_data());
        match res {
            Ok(()) => {
                *written += record.len() as u64;
                let full = *written >= LOG_SIZE_MAX;
                let mut cache = self.cache.lock().unwrap();
                cache.push_back((time, snapshot));
                while cache.len() > CACHE_MAX {
                    cache.pop_front();
                }
                drop(cache);
                if full {
                    self.rotate();
                }
            }
            Err(e) => {
                // Close the file and drop cached state so a stuck
                // filesystem cannot wedge the writer.
                warn!("decoded log: write failed: {e}");
                self.rotate();
            }
        }
    }
}

fn query_serve(base: &Path, cache: &Mutex<VecDeque<(i64, Metrics)>>, req: &QueryRequest) {
    let begin = req.begin.unwrap_or(i64::MIN);
    let end = req.end.unwrap_or(i64::MAX);
    let mut archives = list_with_extension(base, "tlz");
    archives.sort();
    'scan: for path in archives {
        let records = match File::open(&path) {
            Ok(file) => {
                let mut data = Vec::new();
                match flate2::read::ZlibDecoder::new(file).read_to_end(&mut data) {
                    Ok(_) => decode_records(&data),
                    Err(e) => {
                        warn!("query: cannot decompress {}: {e}", path.display());
                        continue;
                    }
                }
            }
            Err(e) => {
                warn!("query: cannot open {}: {e}", path.display());
                continue;
            }
        };
        for (time, map) in records {
            if time < begin {
                continue;
            }
            if time > end {
                break 'scan;
            }
            if req.tx.send((time, map)).is_err() {
                return;
            }
        }
    }
    let tail: Vec<(i64, Metrics)> = cache.lock().unwrap().iter().cloned().collect();
    for (time, map) in tail {
        if time >= begin && time <= end && req.tx.send((time, map)).is_err() {
            return;
        }
    }
}

/// Handle to the decoded-log store and its worker threads.
pub struct DecodedLog {
    tx: Sender<WriterMsg>,
    query_tx: Sender<QueryRequest>,
    stop: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl DecodedLog {
    /// Open the store under `base`, recovering any crashed `.tlw`
    /// files, and start the writer/archive/query threads.
    pub fn new(base: &Path) -> Result<Self> {
        fs::create_dir_all(base)?;
        for path in list_with_extension(base, "tlw") {
            let done = path.with_extension("tl");
            warn!("decoded log: recovering {}", path.display());
            let _ = fs::rename(&path, &done);
        }

        let cache = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::<WriterMsg>();
        let (query_tx, query_rx) = channel::<QueryRequest>();
        let mut threads = Vec::new();

        let mut writer = Writer {
            base: base.to_path_buf(),
            file: None,
            last_time: 0,
            last_file_stamp: 0,
            cache: cache.clone(),
        };
        threads.push(
            std::thread::Builder::new()
                .name("tbox-log-writer".into())
                .spawn(move || {
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            WriterMsg::Record(snapshot) => writer.write_snapshot(snapshot),
                            WriterMsg::Flush => writer.rotate(),
                        }
                    }
                    writer.rotate();
                })?,
        );

        let archive_base = base.to_path_buf();
        let archive_stop = stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("tbox-log-archive".into())
                .spawn(move || {
                    let mut slept = Duration::ZERO;
                    while !archive_stop.load(Ordering::Relaxed) {
                        if slept >= ARCHIVE_INTERVAL {
                            slept = Duration::ZERO;
                            archive_sweep(&archive_base);
                        }
                        std::thread::sleep(Duration::from_secs(1));
                        slept += Duration::from_secs(1);
                    }
                })?,
        );

        let query_base = base.to_path_buf();
        let query_cache = cache;
        threads.push(
            std::thread::Builder::new()
                .name("tbox-log-query".into())
                .spawn(move || {
                    while let Ok(req) = query_rx.recv() {
                        query_serve(&query_base, &query_cache, &req);
                    }
                })?,
        );

        Ok(Self {
            tx,
            query_tx,
            stop,
            threads,
        })
    }

    /// Submit a snapshot for persistence, stamping it with the current
    /// wall clock.
    pub fn submit(&self, snapshot: Metrics) {
        self.submit_at(snapshot, chrono::Local::now().timestamp());
    }

    fn submit_at(&self, mut snapshot: Metrics, time: i64) {
        snapshot.insert(
            TIME_METRIC.to_string(),
            MetricValue::plain(TIME_METRIC, time, 1.0, 0, 0),
        );
        if self.tx.send(WriterMsg::Record(snapshot)).is_err() {
            warn!("decoded log: writer gone, dropping snapshot");
        }
    }

    /// Rotate the current write-in-progress file out, if any.
    pub fn flush(&self) {
        let _ = self.tx.send(WriterMsg::Flush);
    }

    /// Query records whose timestamp falls within `[begin, end]`
    /// (either bound optional). Results stream through the returned
    /// channel in file order, the cached tail last.
    #[must_use]
    pub fn query(&self, begin: Option<i64>, end: Option<i64>) -> Receiver<(i64, Metrics)> {
        let (tx, rx) = channel();
        if self.query_tx.send(QueryRequest { begin, end, tx }).is_err() {
            warn!("decoded log: query thread gone");
        }
        rx
    }

    /// Stop all worker threads, rotating the open file out.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        drop(self.tx);
        drop(self.query_tx);
        for t in self.threads {
            let _ = t.join();
        }
    }
}
