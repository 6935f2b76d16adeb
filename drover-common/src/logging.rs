//! Tracing setup and the relay's log spans
//!
//! Two spans partition the log stream: `internal` for component lifecycle
//! and `dispatch` for per-message outcomes (sent, deferred, failed), so an
//! operator can follow a message's fate with a single span filter.

use chrono::Utc;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, fmt::time::FormatTime, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

struct Time;

impl FormatTime for Time {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let time = Utc::now();
        w.write_fmt(format_args!("{:?}", time.timestamp_micros()))
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!(target: "drover", $level, $span);
        let _enter = span.enter();

        $crate::tracing::event!(target: "drover", $level, $($msg),*)
    }};
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! dispatch_log {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "dispatch", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::dispatch_log!(level = TRACE, $($msg),*)
    };
}

pub fn init() {
    let level = if let Ok(level) = std::env::var("LOG_LEVEL") {
        match level.to_ascii_lowercase().as_str() {
            "warn" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => LevelFilter::ERROR,
        }
    } else if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::Registry::default()
        .with(
            (if cfg!(debug_assertions) {
                tracing_subscriber::fmt::layer()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_file(false)
                    .with_line_number(false)
            })
            .compact()
            .with_ansi(true)
            .with_timer(Time)
            .with_target(false)
            .with_level(false)
            .with_filter(level)
            .with_filter(FilterFn::new(|metadata| {
                metadata.target().starts_with("drover")
            })),
        )
        .init();
}
