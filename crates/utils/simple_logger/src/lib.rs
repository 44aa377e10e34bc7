//! 输出到 stderr 的简单日志实现
//!
//! 日志级别由 `KERNEL_CLOG` 决定，运行时的环境变量优先于编译时的

use std::io::Write;

use anstyle::{AnsiColor, Reset};
use log::{self, Level, LevelFilter, Log, Metadata, Record};
use spin::Lazy;

/// a simple logger
struct SimpleLogger {
    clog: LevelFilter,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.clog >= metadata.level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        // 写 stderr 失败时也没有别的地方可以报告了
        let _ = write_log(&mut stderr, record);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn write_log(writer: &mut impl Write, record: &Record<'_>) -> std::io::Result<()> {
    let color = match record.level() {
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
        record.level(),
        Reset.render(),
        record.args()
    )
}

fn parse_level(level: Option<&str>) -> LevelFilter {
    match level {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// initiate logger
///
/// 重复调用是无害的，只有第一次生效
pub fn init() {
    static LOGGER: Lazy<SimpleLogger> = Lazy::new(|| {
        let runtime = std::env::var("KERNEL_CLOG").ok();
        let clog = parse_level(runtime.as_deref().or(option_env!("KERNEL_CLOG")));
        SimpleLogger { clog }
    });

    if log::set_logger(&*LOGGER).is_ok() {
        log::set_max_level(LOGGER.clog);
    }
}
