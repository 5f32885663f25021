/*! Pending-report backlog.

Unsent report payloads wait in a priority tree ordered by event
timestamp. The tree is bounded: past 2048 entries a worker thread
drains roughly half of them to per-date spill files, and refills from
the oldest non-stale file once the tree runs dry, so week-long
disconnections do not eat the device's memory.

Spill file record, numeric fields big-endian:

```text
"TLNP" | ts_high:4 | ts_low:4 | pkt_len:4 | crc16:2 | pkt
```

The store also keeps a short history ring of the most recent report
payloads. When the vehicle fault level crosses into the emergency
range, the last 30 seconds of history are promoted wholesale into the
tree so the platform sees the run-up to the fault.
*/
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeZone;
use log::{debug, info, warn};

use crate::crc::crc16;

/// Tree size that triggers a spill to disk.
pub const SPILL_TRIGGER: usize = 2048;
/// Entries loaded back per refill.
pub const RELOAD_BATCH: usize = 1024;
/// History ring capacity.
pub const HISTORY_MAX: usize = 45;
/// Seconds of history promoted on an emergency crossing.
pub const HISTORY_PROMOTE_WINDOW: i64 = 30;
/// Spill record magic.
pub const FILE_MAGIC: &[u8; 4] = b"TLNP";

const DAY: i64 = 86400;
/// Entries older than this are not worth spilling.
const SPILL_MAX_AGE: i64 = 7 * DAY;
/// Files older than this are deleted on sight.
const FILE_MAX_AGE: i64 = 8 * DAY;

/// Priority tree shared between the report tick, the uplink drain and
/// the spill worker. Keys are event timestamps in Unix seconds.
pub type PriorityTree = Arc<Mutex<BTreeMap<i64, Vec<u8>>>>;

/// Encode one spill record.
#[must_use]
pub fn encode_spill_record(ts: i64, pkt: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(18 + pkt.len());
    out.extend_from_slice(FILE_MAGIC);
    out.extend_from_slice(&((ts as u64 >> 32) as u32).to_be_bytes());
    out.extend_from_slice(&(ts as u64 as u32).to_be_bytes());
    out.extend_from_slice(&(pkt.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc16(pkt).to_be_bytes());
    out.extend_from_slice(pkt);
    out
}

/// Decode up to `limit` records from a spill file image.
///
/// Returns the records plus the byte offset of the first unconsumed
/// record, which callers use to rewrite a partially drained file.
/// CRC-mismatched records are skipped.
#[must_use]
pub fn decode_spill_records(data: &[u8], limit: usize) -> (Vec<(i64, Vec<u8>)>, usize) {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while out.len() < limit {
        let Some(found) = data[pos..]
            .windows(4)
            .position(|w| w == FILE_MAGIC)
            .map(|p| pos + p)
        else {
            return (out, data.len());
        };
        if found + 18 > data.len() {
            return (out, data.len());
        }
        let ts_high = u32::from_be_bytes(data[found + 4..found + 8].try_into().unwrap());
        let ts_low = u32::from_be_bytes(data[found + 8..found + 12].try_into().unwrap());
        let len = u32::from_be_bytes(data[found + 12..found + 16].try_into().unwrap()) as usize;
        let want_crc = u16::from_be_bytes(data[found + 16..found + 18].try_into().unwrap());
        if len == 0 || found + 18 + len > data.len() {
            // Truncated or nonsense header: nothing more to salvage.
            return (out, data.len());
        }
        let pkt = &data[found + 18..found + 18 + len];
        if crc16(pkt) == want_crc {
            let ts = ((u64::from(ts_high) << 32) | u64::from(ts_low)) as i64;
            out.push((ts, pkt.to_vec()));
        } else {
            warn!("backlog: skipping spill record with bad CRC at {found}");
        }
        pos = found + 18 + len;
    }
    (out, pos)
}

fn date_of(ts: i64) -> String {
    chrono::Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "19700101".to_string())
}

/// Midnight timestamp of a `tn-YYYYMMDD.tn` file, if the name parses.
fn file_timestamp(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let date = name.strip_prefix("tn-")?.strip_suffix(".tn")?;
    let date = chrono::NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    chrono::Local
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .single()
        .map(|d| d.timestamp())
}

fn spill_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| file_timestamp(p).is_some())
        .collect();
    files.sort();
    files
}

/// Pending-report store: history ring + priority tree + spill worker.
#[derive(Clone)]
pub struct BacklogStore {
    tree: PriorityTree,
    history: Arc<Mutex<VecDeque<(i64, Vec<u8>)>>>,
    log_dir: PathBuf,
}

impl BacklogStore {
    /// New store spilling under `log_dir`.
    #[must_use]
    pub fn new(log_dir: &Path) -> Self {
        Self {
            tree: Arc::new(Mutex::new(BTreeMap::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// Shared handle to the priority tree.
    #[must_use]
    pub fn tree(&self) -> PriorityTree {
        self.tree.clone()
    }

    /// Record a freshly built report payload in the history ring.
    pub fn push_history(&self, ts: i64, payload: Vec<u8>) {
        let mut history = self.history.lock().unwrap();
        while history.len() >= HISTORY_MAX {
            history.pop_front();
        }
        history.push_back((ts, payload));
    }

    /// Queue a payload for uplink.
    pub fn insert(&self, ts: i64, payload: Vec<u8>) {
        self.tree.lock().unwrap().insert(ts, payload);
    }

    /// Move the last 30 seconds of history into the tree, discarding
    /// anything older. Called on an upward fault-level crossing into
    /// the emergency range.
    pub fn promote_history(&self, now: i64) {
        let mut history = self.history.lock().unwrap();
        let mut tree = self.tree.lock().unwrap();
        let mut promoted = 0usize;
        for (ts, payload) in history.drain(..) {
            if now - ts <= HISTORY_PROMOTE_WINDOW {
                tree.insert(ts, payload);
                promoted += 1;
            }
        }
        info!("backlog: promoted {promoted} history frames on emergency");
    }

    /// Start the spill/reload worker. It runs until `stop` is set.
    pub fn spawn_worker(&self, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let store = self.clone();
        std::thread::Builder::new()
            .name("tbox-backlog".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    store.work_once(chrono::Local::now().timestamp());
                    std::thread::sleep(Duration::from_secs(1));
                }
            })
            .expect("spawning backlog worker")
    }

    fn work_once(&self, now: i64) {
        let len = self.tree.lock().unwrap().len();
        if len > SPILL_TRIGGER {
            self.spill(now);
        } else if len == 0 {
            self.reload(now);
        }
    }

    /// Drain roughly half the tree (oldest first) into per-date spill
    /// files, then drop stale files.
    fn spill(&self, now: i64) {
        let drained: Vec<(i64, Vec<u8>)> = {
            let mut tree = self.tree.lock().unwrap();
            let mut keys: Vec<i64> = tree.keys().copied().take(SPILL_TRIGGER / 2).collect();
            keys.sort_unstable();
            keys.into_iter()
                .filter_map(|k| tree.remove(&k).map(|v| (k, v)))
                .collect()
        };
        let mut buffers: HashMap<String, Vec<u8>> = HashMap::new();
        let mut written = 0usize;
        for (ts, payload) in &drained {
            if now - ts > SPILL_MAX_AGE {
                continue;
            }
            buffers
                .entry(date_of(*ts))
                .or_default()
                .extend_from_slice(&encode_spill_record(*ts, payload));
            written += 1;
        }
        let _ = fs::create_dir_all(&self.log_dir);
        for (date, buffer) in buffers {
            let path = self.log_dir.join(format!("tn-{date}.tn"));
            let res = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| std::io::Write::write_all(&mut f, &buffer));
            if let Err(e) = res {
                warn!("backlog: cannot append {}: {e}", path.display());
            }
        }
        info!(
            "backlog: spilled {written} of {} entries to disk",
            drained.len()
        );
        for path in spill_files(&self.log_dir) {
            if let Some(ts) = file_timestamp(&path)
                && now - ts >= FILE_MAX_AGE
            {
                debug!("backlog: deleting stale {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Refill the tree from the oldest non-stale spill file.
    fn reload(&self, now: i64) {
        let mut loaded = 0usize;
        for path in spill_files(&self.log_dir) {
            if loaded >= RELOAD_BATCH {
                break;
            }
            let Some(file_ts) = file_timestamp(&path) else {
                continue;
            };
            if now - file_ts >= FILE_MAX_AGE {
                debug!("backlog: deleting stale {}", path.display());
                let _ = fs::remove_file(&path);
                continue;
            }
            let data = match fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!("backlog: cannot read {}: {e}", path.display());
                    continue;
                }
            };
            let (records, consumed) = decode_spill_records(&data, RELOAD_BATCH - loaded);
            if records.is_empty() && consumed >= data.len() {
                let _ = fs::remove_file(&path);
                continue;
            }
            loaded += records.len();
            {
                let mut tree = self.tree.lock().unwrap();
                for (ts, payload) in records {
                    tree.insert(ts, payload);
                }
            }
            if consumed >= data.len() {
                let _ = fs::remove_file(&path);
            } else {
                // Keep the unconsumed suffix for the next refill.
                let tmp = path.with_extension("tn.new");
                let rest = &data[consumed..];
                let ok = fs::write(&tmp, rest).and_then(|()| fs::rename(&tmp, &path));
                if let Err(e) = ok {
                    warn!("backlog: cannot rewrite {}: {e}", path.display());
                }
                break;
            }
        }
        if loaded > 0 {
            info!("backlog: reloaded {loaded} entries from disk");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> i64 {
        chrono::Local::now().timestamp()
    }

    #[test]
    fn spill_record_roundtrip() {
        let pkt = vec![1u8, 2, 3, 4, 5];
        let ts = 0x1_2345_6789i64;
        let record = encode_spill_record(ts, &pkt);
        assert_eq!(&record[..4], FILE_MAGIC);
        let (records, consumed) = decode_spill_records(&record, 10);
        assert_eq!(consumed, record.len());
        assert_eq!(records, vec![(ts, pkt)]);
    }

    #[test]
    fn decode_skips_bad_crc() {
        let mut stream = encode_spill_record(10, &[1, 2, 3]);
        let len = stream.len();
        stream[len - 1] ^= 0xFF;
        stream.extend_from_slice(&encode_spill_record(20, &[4, 5]));
        let (records, consumed) = decode_spill_records(&stream, 10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 20);
        assert_eq!(consumed, stream.len());
    }

    #[test]
    fn decode_respects_limit_and_reports_offset() {
        let a = encode_spill_record(1, &[1]);
        let b = encode_spill_record(2, &[2]);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);
        let (records, consumed) = decode_spill_records(&stream, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(consumed, a.len());
        let (rest, _) = decode_spill_records(&stream[consumed..], 10);
        assert_eq!(rest[0].0, 2);
    }

    #[test]
    fn history_ring_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        for i in 0..100 {
            store.push_history(i, vec![i as u8]);
        }
        assert_eq!(store.history.lock().unwrap().len(), HISTORY_MAX);
        assert_eq!(store.history.lock().unwrap().front().unwrap().0, 55);
    }

    #[test]
    fn promote_history_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let t0 = 1_700_000_000;
        store.push_history(t0 - 100, vec![1]);
        store.push_history(t0 - 30, vec![2]);
        store.push_history(t0 - 1, vec![3]);
        store.promote_history(t0);
        let tree = store.tree.lock().unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.contains_key(&(t0 - 30)));
        assert!(tree.contains_key(&(t0 - 1)));
        drop(tree);
        assert!(store.history.lock().unwrap().is_empty());
    }

    #[test]
    fn spill_then_reload_preserves_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let t = now();
        let total = SPILL_TRIGGER + 10;
        for i in 0..total {
            store.insert(t - i as i64, vec![(i % 251) as u8; 4]);
        }
        let original: BTreeMap<i64, Vec<u8>> = store.tree.lock().unwrap().clone();

        store.work_once(t);
        let after_spill = store.tree.lock().unwrap().len();
        assert_eq!(after_spill, total - SPILL_TRIGGER / 2);
        assert!(!spill_files(dir.path()).is_empty());

        // Drain the tree as if everything was acknowledged, then let
        // the worker refill from disk.
        store.tree.lock().unwrap().clear();
        store.work_once(t);
        let reloaded = store.tree.lock().unwrap().clone();
        assert_eq!(reloaded.len(), SPILL_TRIGGER / 2);
        for (ts, payload) in &reloaded {
            assert_eq!(original.get(ts), Some(payload));
        }
        // The reloaded set is exactly the spilled (oldest) half.
        let oldest: Vec<i64> = original.keys().copied().take(SPILL_TRIGGER / 2).collect();
        let got: Vec<i64> = reloaded.keys().copied().collect();
        assert_eq!(got, oldest);
    }

    #[test]
    fn stale_files_removed_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let stale = dir.path().join("tn-20200101.tn");
        fs::write(&stale, encode_spill_record(1577836800, &[1, 2, 3])).unwrap();
        store.work_once(now());
        assert!(!stale.exists());
        assert!(store.tree.lock().unwrap().is_empty());
    }

    #[test]
    fn partially_drained_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let t = now();
        let date = date_of(t);
        let path = dir.path().join(format!("tn-{date}.tn"));
        let mut image = Vec::new();
        for i in 0..(RELOAD_BATCH + 50) {
            image.extend_from_slice(&encode_spill_record(t - i as i64, &[i as u8]));
        }
        fs::write(&path, &image).unwrap();

        store.reload(t);
        assert_eq!(store.tree.lock().unwrap().len(), RELOAD_BATCH);
        assert!(path.exists());

        store.tree.lock().unwrap().clear();
        store.reload(t);
        assert_eq!(store.tree.lock().unwrap().len(), 50);
        assert!(!path.exists());
    }
}
