pub mod queue;

use chrono::{Datelike, Local, Timelike};
use queue::BlockDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

/// Lines per log file before rollover within the same day.
const MAX_LINES: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "[debug]",
            Level::Info => "[info] ",
            Level::Warn => "[warn] ",
            Level::Error => "[error]",
        }
    }
}

struct Sink {
    dir: PathBuf,
    suffix: String,
    file: File,
    today: u32,
    line_count: usize,
    rollover_index: usize,
}

impl Sink {
    fn open(dir: &PathBuf, suffix: &str, today: u32) -> Sink {
        fs::create_dir_all(dir).ok();
        let name = dir.join(format!(
            "{}{}",
            Local::now().format("%Y_%m_%d"),
            suffix
        ));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&name)
            .unwrap_or_else(|_| panic!("failed to open log file {:?}", name));
        Sink {
            dir: dir.clone(),
            suffix: suffix.to_string(),
            file,
            today,
            line_count: 0,
            rollover_index: 0,
        }
    }

    fn roll_if_needed(&mut self) {
        let now = Local::now();
        let day = now.day();
        let needs_roll = self.today != day || (self.line_count > 0 && self.line_count % MAX_LINES == 0);
        if !needs_roll {
            return;
        }
        let stamp = now.format("%Y_%m_%d").to_string();
        let name = if self.today != day {
            self.today = day;
            self.line_count = 0;
            self.rollover_index = 0;
            self.dir.join(format!("{}{}", stamp, self.suffix))
        } else {
            self.rollover_index += 1;
            self.dir
                .join(format!("{}-{}{}", stamp, self.rollover_index, self.suffix))
        };
        if let Ok(f) = OpenOptions::new().create(true).append(true).open(&name) {
            self.file = f;
        }
    }

    fn write_line(&mut self, line: &str) {
        self.roll_if_needed();
        self.line_count += 1;
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.write_all(b"\n");
    }
}

struct Logger {
    level: AtomicU8,
    sink: Mutex<Sink>,
    deque: Option<BlockDeque<String>>,
    dropped: AtomicUsize,
}

static INSTANCE: OnceLock<Logger> = OnceLock::new();
static WRITER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

/// Initialize the process-wide logger. Safe to call once; later calls are
/// ignored (matching the teacher's lazily-initialized singleton).
///
/// `queue_size == 0` selects synchronous logging: `log()` writes the file
/// directly under the sink's mutex. Otherwise a bounded queue and a single
/// writer thread are started.
pub fn init(level: Level, dir: impl Into<PathBuf>, suffix: &str, queue_size: usize) {
    let dir = dir.into();
    let today = Local::now().day();
    let logger = Logger {
        level: AtomicU8::new(level as u8),
        sink: Mutex::new(Sink::open(&dir, suffix, today)),
        deque: if queue_size > 0 {
            Some(BlockDeque::new(queue_size))
        } else {
            None
        },
        dropped: AtomicUsize::new(0),
    };
    if INSTANCE.set(logger).is_err() {
        return;
    }
    if let Some(logger) = INSTANCE.get() {
        if logger.deque.is_some() {
            let handle = std::thread::spawn(writer_loop);
            *WRITER.lock().unwrap() = Some(handle);
        }
    }
}

fn writer_loop() {
    let logger = match INSTANCE.get() {
        Some(l) => l,
        None => return,
    };
    let deque = match &logger.deque {
        Some(d) => d,
        None => return,
    };
    while let Some(line) = deque.pop() {
        logger.sink.lock().unwrap().write_line(&line);
    }
}

pub fn set_level(level: Level) {
    if let Some(logger) = INSTANCE.get() {
        logger.level.store(level as u8, Ordering::Relaxed);
    }
}

pub fn level() -> Level {
    match INSTANCE.get().map(|l| l.level.load(Ordering::Relaxed)) {
        Some(0) => Level::Debug,
        Some(2) => Level::Warn,
        Some(3) => Level::Error,
        _ => Level::Info,
    }
}

/// Flush any queued lines. Called from shutdown before the writer thread joins.
pub fn flush() {
    if let Some(logger) = INSTANCE.get() {
        if let Some(deque) = &logger.deque {
            deque.flush();
        }
        logger.sink.lock().unwrap().file.flush().ok();
    }
}

/// Closes the queue (if any) and joins the writer thread. Call during
/// shutdown, before the process exits.
pub fn shutdown() {
    if let Some(logger) = INSTANCE.get() {
        if let Some(deque) = &logger.deque {
            while !deque.is_empty() {
                deque.flush();
                std::thread::yield_now();
            }
            deque.close();
        }
    }
    if let Some(handle) = WRITER.lock().unwrap().take() {
        handle.join().ok();
    }
    if let Some(logger) = INSTANCE.get() {
        logger.sink.lock().unwrap().file.flush().ok();
    }
}

/// Format and enqueue (or synchronously write) one log line. Not usually
/// called directly; prefer the `debug!`/`info!`/`warn!`/`error!` macros.
pub fn log(level: Level, args: std::fmt::Arguments) {
    let Some(logger) = INSTANCE.get() else {
        return;
    };
    if (level as u8) < logger.level.load(Ordering::Relaxed) {
        return;
    }
    let now = Local::now();
    let line = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06} {} {}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_micros(),
        level.tag(),
        args
    );
    match &logger.deque {
        Some(deque) if !deque.is_full() => deque.push_back(line),
        Some(_) => {
            logger.dropped.fetch_add(1, Ordering::Relaxed);
        }
        None => logger.sink.lock().unwrap().write_line(&line),
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug { ($($arg:tt)*) => { $crate::log!($crate::Level::Debug, $($arg)*) }; }
#[macro_export]
macro_rules! info { ($($arg:tt)*) => { $crate::log!($crate::Level::Info, $($arg)*) }; }
#[macro_export]
macro_rules! warn { ($($arg:tt)*) => { $crate::log!($crate::Level::Warn, $($arg)*) }; }
#[macro_export]
macro_rules! error { ($($arg:tt)*) => { $crate::log!($crate::Level::Error, $($arg)*) }; }
