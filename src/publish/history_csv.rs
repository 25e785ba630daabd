//! CSV mirror of the history log.
//!
//! - Producer side (`record`) is a non-blocking push into a bounded `ArrayQueue`;
//!   a full queue drops the row and counts it, the sink worker never waits on disk.
//! - A background thread drains the queue in batches and flushes every few batches
//!   to keep syscall jitter down.
//! - `stop` (also run on drop) drains what is left and flushes before joining.

use std::{
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_queue::ArrayQueue;
use csv::Writer;
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::ingest::reading::Reading;

const QUEUE_CAPACITY: usize = 8192;
const CONSUMER_POLL_MS: u64 = 5;
const DRAIN_BATCH: usize = 256;
const FLUSH_BATCHES: usize = 8;

pub struct CsvHistoryMirror {
    path: PathBuf,
    queue: Arc<ArrayQueue<Reading>>,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CsvHistoryMirror {
    /// Creates (truncates) the file up front so a bad path fails at startup, then
    /// spawns the writer thread.
    pub fn start(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        let queue = Arc::new(ArrayQueue::new(QUEUE_CAPACITY));
        let dropped = Arc::new(AtomicU64::new(0));
        let written = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let queue = queue.clone();
            let written = written.clone();
            let running = running.clone();
            let path = path.clone();
            thread::Builder::new()
                .name("history-csv".into())
                .spawn(move || run_writer(file, &path, queue, written, running))?
        };

        info!("history CSV mirror writing to {:?}", path);
        Ok(Self {
            path,
            queue,
            dropped,
            written,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Non-blocking; drops the row when the queue is full.
    pub fn record(&self, reading: &Reading) {
        if self.queue.push(reading.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_rows(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn written_rows(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
    }
}

impl Drop for CsvHistoryMirror {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_writer(
    file: File,
    path: &Path,
    queue: Arc<ArrayQueue<Reading>>,
    written: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
) {
    let mut wtr = Writer::from_writer(BufWriter::new(file));
    let mut flush_counter = 0usize;

    while running.load(Ordering::SeqCst) {
        let mut any = false;
        for _ in 0..DRAIN_BATCH {
            match queue.pop() {
                Some(reading) => {
                    any = true;
                    write_row(&mut wtr, &reading, &written);
                }
                None => break,
            }
        }
        if any {
            flush_counter += 1;
            if flush_counter >= FLUSH_BATCHES {
                if let Err(e) = wtr.flush() {
                    error!("history CSV flush failed for {:?}: {}", path, e);
                }
                flush_counter = 0;
            }
        } else {
            thread::sleep(Duration::from_millis(CONSUMER_POLL_MS));
        }
    }

    // Final drain
    while let Some(reading) = queue.pop() {
        write_row(&mut wtr, &reading, &written);
    }
    if let Err(e) = wtr.flush() {
        error!("history CSV final flush failed for {:?}: {}", path, e);
    }
    debug!(
        "history CSV writer exiting, rows written={}",
        written.load(Ordering::Relaxed)
    );
}

fn write_row<W: io::Write>(wtr: &mut Writer<W>, reading: &Reading, written: &AtomicU64) {
    match wtr.serialize(reading) {
        Ok(()) => {
            written.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => error!("history CSV row dropped: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn writes_header_and_rows_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let mirror = CsvHistoryMirror::start(&path).unwrap();
        for i in 0..3 {
            mirror.record(&Reading {
                timestamp: Utc.with_ymd_and_hms(2025, 3, 18, 10, i * 10, 0).unwrap(),
                temperature: 20.0 + i as f64,
                humidity: 60.0,
                air_pressure: 1012.0,
                wind_speed: 3.0,
            });
        }
        mirror.stop();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "timestamp,temperature,humidity,air_pressure,wind_speed");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("2025-03-18T10:00:00Z,20.0,"));
        assert_eq!(mirror.written_rows(), 3);
        assert_eq!(mirror.dropped_rows(), 0);
    }

    #[test]
    fn bad_path_fails_at_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CsvHistoryMirror::start(dir.path().join("missing/dir/h.csv")).is_err());
    }
}
