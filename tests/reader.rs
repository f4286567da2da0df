use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use eb90_telemetry::{
    ByteSource, Event, FrameError, FrameReader, FrameSink, LoopTracker, ReaderConfig, Record,
    ScriptedSource, SourceError,
};

fn record(loop_count: u8) -> Record {
    Record::new(
        loop_count as f64 * 0.01,
        (1..=60).map(|i| i as f32).collect(),
        1,
        2,
        loop_count,
    )
}

/// Never has data; each read waits a little like a serial port timeout.
struct Silent {
    closed: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl ByteSource for Silent {
    type Error = std::io::Error;

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, SourceError<Self::Error>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(1));
        Ok(0)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

fn silent() -> (Silent, Arc<AtomicBool>, Arc<AtomicUsize>) {
    let closed = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let s = Silent {
        closed: Arc::clone(&closed),
        reads: Arc::clone(&reads),
    };
    (s, closed, reads)
}

#[test]
fn channel_delivers_records_and_errors_in_order() {
    let mut bad = record(2).to_frame().unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;

    let mut src = ScriptedSource::from_bytes([0x00u8, 0x13, 0x37]);
    src.push_bytes(record(1).to_frame().unwrap())
        .push_bytes([0xEBu8, 0x00])
        .push_bytes(&bad)
        .push_timeout()
        .push_bytes(record(3).to_frame().unwrap());

    let (reader, rx) = FrameReader::channel(src, ReaderConfig::default()).unwrap();
    let events: Vec<Event> = rx.iter().collect();

    assert_eq!(events.len(), 4);
    assert_eq!(events[0], Event::Record(record(1)));
    assert_eq!(
        events[1],
        Event::Rejected(FrameError::HeaderMismatch { found: 0x00 })
    );
    assert!(matches!(
        events[2],
        Event::Rejected(FrameError::ChecksumMismatch { length: 252, .. })
    ));
    assert_eq!(events[3], Event::Record(record(3)));

    let exit = reader.join().unwrap();
    assert!(matches!(exit.result, Err(SourceError::Closed)));
    assert!(exit.source.is_closed());
    assert_eq!(exit.stats.records, 2);
    assert_eq!(exit.stats.rejected(), 2);
    assert_eq!(exit.stats.noise_bytes, 3);
}

#[test]
fn stop_ends_an_idle_reader() {
    let (src, closed, reads) = silent();
    let (reader, rx) = FrameReader::channel(src, ReaderConfig::default()).unwrap();

    while reads.load(Ordering::Relaxed) < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(reader.is_running());

    let exit = reader.stop().unwrap();
    assert!(exit.result.is_ok());
    assert!(closed.load(Ordering::Relaxed));
    assert_eq!(exit.stats.records, 0);
    assert!(rx.recv().is_err());
}

#[test]
fn stop_handle_works_from_another_thread() {
    let (src, closed, _) = silent();
    let (reader, _rx) = FrameReader::channel(src, ReaderConfig::default()).unwrap();
    let handle = reader.stop_handle();

    thread::spawn(move || handle.stop()).join().unwrap();

    let exit = reader.join().unwrap();
    assert!(exit.result.is_ok());
    assert!(closed.load(Ordering::Relaxed));
}

#[test]
fn dropping_the_reader_stops_it() {
    let (src, closed, _) = silent();
    let reader = FrameReader::channel(src, ReaderConfig::default()).unwrap().0;
    drop(reader);
    assert!(closed.load(Ordering::Relaxed));
}

#[derive(Default)]
struct Status {
    records: Vec<Record>,
    messages: Vec<&'static str>,
}

struct SharedStatus(Arc<Mutex<Status>>);

impl FrameSink for SharedStatus {
    fn on_record(&mut self, record: Record) {
        self.0.lock().unwrap().records.push(record);
    }

    fn on_checksum_error(&mut self, _length: u16, _expected: u8, _computed: u8) {
        self.0.lock().unwrap().messages.push("checksum error");
    }

    fn on_header_error(&mut self) {
        self.0.lock().unwrap().messages.push("header not found");
    }
}

#[test]
fn sink_callbacks_run_on_reader_thread() {
    let mut bad = record(5).to_frame().unwrap();
    bad[6] ^= 0x40;

    let mut src = ScriptedSource::from_bytes(record(4).to_frame().unwrap());
    src.push_bytes([0xEBu8, 0xEB])
        .push_bytes(&bad)
        .push_bytes(record(7).to_frame().unwrap());

    let status = Arc::new(Mutex::new(Status::default()));
    let config = ReaderConfig {
        thread_name: "sink-test".to_string(),
        ..ReaderConfig::default()
    };
    let reader = FrameReader::spawn(src, SharedStatus(Arc::clone(&status)), config).unwrap();
    let exit = reader.join().unwrap();
    assert!(matches!(exit.result, Err(SourceError::Closed)));

    let status = status.lock().unwrap();
    assert_eq!(status.messages, ["header not found", "checksum error"]);
    assert_eq!(status.records, [record(4), record(7)]);

    let mut tracker = LoopTracker::new();
    let gaps: Vec<_> = status
        .records
        .iter()
        .filter_map(|r| tracker.observe(r.loop_count))
        .collect();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].missed, 2);
}
