//! 虚存子系统的日志输出
//!
//! 只负责把 `log` 的记录格式化后交给宿主内核提供的 [`Console`]，
//! 形如 `[ INFO] message`，级别带颜色。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use core::fmt::{self, Write};

use anstyle::{AnsiColor, Reset};
use klocks::Once;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// 日志的输出端，由宿主内核实现
pub trait Console: Send + Sync {
    fn write_str(&self, s: &str);
}

struct SimpleLogger {
    console: &'static dyn Console,
    level: LevelFilter,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = String::new();
        // 写入 String 不会失败
        let _ = write_log(&mut line, record.level(), record.args());
        self.console.write_str(&line);
    }

    fn flush(&self) {}
}

static LOGGER: Once<SimpleLogger> = Once::new();

/// 编译期通过 `KERNEL_CLOG` 决定的日志级别，未设置时关闭
pub fn level_from_env() -> LevelFilter {
    parse_level(option_env!("KERNEL_CLOG"))
}

fn parse_level(s: Option<&str>) -> LevelFilter {
    match s {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// 初始化日志。可以重复调用，只有第一次生效
pub fn init(console: &'static dyn Console) {
    init_with_level(console, level_from_env());
}

pub fn init_with_level(console: &'static dyn Console, level: LevelFilter) {
    let mut first = false;
    let logger = LOGGER.call_once(|| {
        first = true;
        SimpleLogger { console, level }
    });
    if first && log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

fn write_log(writer: &mut impl Write, level: Level, args: &fmt::Arguments<'_>) -> fmt::Result {
    let color = match level {
        Level::Error => AnsiColor::Red,
        Level::Warn => AnsiColor::BrightYellow,
        Level::Info => AnsiColor::Blue,
        Level::Debug => AnsiColor::Green,
        Level::Trace => AnsiColor::BrightBlack,
    };
    writeln!(
        writer,
        "{}[{:>5}]{} {}",
        color.render_fg(),
        level,
        Reset.render(),
        args
    )
}

#[cfg(test)]
mod tests {
    use klocks::SpinMutex;

    use super::*;

    struct Captured(SpinMutex<String>);

    impl Console for Captured {
        fn write_str(&self, s: &str) {
            self.0.lock().push_str(s);
        }
    }

    static CAPTURED: Captured = Captured(SpinMutex::new(String::new()));

    #[test]
    fn level_names() {
        assert_eq!(parse_level(Some("DEBUG")), LevelFilter::Debug);
        assert_eq!(parse_level(Some("debug")), LevelFilter::Off);
        assert_eq!(parse_level(None), LevelFilter::Off);
    }

    #[test]
    fn line_format() {
        let mut line = String::new();
        write_log(&mut line, Level::Info, &format_args!("frame {}", 3)).unwrap();
        assert!(line.contains("[ INFO]"));
        assert!(line.ends_with(" frame 3\n"));
    }

    #[test]
    fn init_is_idempotent() {
        init_with_level(&CAPTURED, LevelFilter::Debug);
        init_with_level(&CAPTURED, LevelFilter::Error);
        log::debug!("evict frame 7");
        log::trace!("not shown");
        let out = CAPTURED.0.lock().clone();
        assert!(out.contains("[DEBUG]"));
        assert!(out.contains("evict frame 7"));
        assert!(!out.contains("not shown"));
    }
}
