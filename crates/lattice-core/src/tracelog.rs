//! Leveled diagnostic logging
//!
//! Thread-aware stderr logging for the runtime. Workers tag their thread
//! (`w3`), the lifeguard tags `lg`; every line carries the tag so
//! interleaved output stays readable.
//!
//! # Environment Variables
//!
//! - `LATTICE_LOG_LEVEL=<0..5>` - 0=off, 1=error, 2=warn, 3=info, 4=debug,
//!   5=trace (default 1)
//! - `LATTICE_LOG_FLUSH=1` - flush stderr after each line
//! - `LATTICE_LOG_TIME=1` - prefix lines with monotonic nanoseconds
//!
//! # Usage
//!
//! ```ignore
//! use lattice_core::{tlog_info, tlog_debug};
//!
//! tlog_info!("pool started with {} workers", n);
//! tlog_debug!("stole closure from {:p}", queue);
//! ```

use crate::clock;
use crate::env;
use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log severities, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "E",
            LogLevel::Warn => "W",
            LogLevel::Info => "I",
            LogLevel::Debug => "D",
            LogLevel::Trace => "T",
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Error as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static TIME: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static THREAD_TAG: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Read the environment once; later calls are no-ops
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    LEVEL.store(
        env::get::<u8>("LATTICE_LOG_LEVEL", LogLevel::Error as u8),
        Ordering::Relaxed,
    );
    FLUSH.store(env::get_bool("LATTICE_LOG_FLUSH", false), Ordering::Relaxed);
    TIME.store(env::get_bool("LATTICE_LOG_TIME", false), Ordering::Relaxed);
}

/// Override the level at runtime (tests, embedders)
pub fn set_level(level: LogLevel) {
    init();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Install a short tag identifying the current thread in log lines
pub fn set_thread_tag(tag: &str) {
    THREAD_TAG.with(|t| {
        let mut t = t.borrow_mut();
        t.clear();
        t.push_str(tag);
    });
}

/// Whether a message at `level` would be emitted
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    (level as u8) <= LEVEL.load(Ordering::Relaxed)
}

/// Emit a line; callers go through the `tlog_*` macros
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let tag = THREAD_TAG.with(|t| {
        let t = t.borrow();
        if t.is_empty() {
            "--".to_string()
        } else {
            t.clone()
        }
    });
    let result = if TIME.load(Ordering::Relaxed) {
        writeln!(
            out,
            "[{}] [{}] [{}] {}",
            level.label(),
            clock::monotonic_nanos(),
            tag,
            args
        )
    } else {
        writeln!(out, "[{}] [{}] {}", level.label(), tag, args)
    };
    let _ = result;
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! tlog_error {
    ($($arg:tt)*) => {
        if $crate::tracelog::enabled($crate::tracelog::LogLevel::Error) {
            $crate::tracelog::log($crate::tracelog::LogLevel::Error, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! tlog_warn {
    ($($arg:tt)*) => {
        if $crate::tracelog::enabled($crate::tracelog::LogLevel::Warn) {
            $crate::tracelog::log($crate::tracelog::LogLevel::Warn, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! tlog_info {
    ($($arg:tt)*) => {
        if $crate::tracelog::enabled($crate::tracelog::LogLevel::Info) {
            $crate::tracelog::log($crate::tracelog::LogLevel::Info, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! tlog_debug {
    ($($arg:tt)*) => {
        if $crate::tracelog::enabled($crate::tracelog::LogLevel::Debug) {
            $crate::tracelog::log($crate::tracelog::LogLevel::Debug, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! tlog_trace {
    ($($arg:tt)*) => {
        if $crate::tracelog::enabled($crate::tracelog::LogLevel::Trace) {
            $crate::tracelog::log($crate::tracelog::LogLevel::Trace, format_args!($($arg)*));
        }
    };
}
