//! Simple re-export of logging-related macros, plus subscriber setup.
pub use color_eyre::eyre::eyre;
pub use tracing::{debug, error, info, span, trace, warn};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Output shape of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Install color_eyre as the global error handler.
#[tracing::instrument]
pub fn install_color_eyre() -> color_eyre::eyre::Result<()> {
    color_eyre::config::HookBuilder::default()
        .add_default_filters()
        .add_frame_filter(Box::new(|frames| {
            let filters = &["tokio::", "tracing::", "color_eyre::", "<core::"];

            frames.retain(|frame| {
                !filters.iter().any(|f| {
                    let name = if let Some(name) = frame.name.as_ref() {
                        name.as_str()
                    } else {
                        return true;
                    };

                    name.starts_with(f)
                })
            });
        }))
        .install()?;

    Ok(())
}

/// Map the `-q` / `-v` flags onto a level. `-v` always wins over `-q`.
pub fn level_for(quiet: bool, verbose: usize) -> LevelFilter {
    if quiet && verbose == 0 {
        LevelFilter::ERROR
    } else if verbose > 0 {
        match verbose {
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    } else {
        LevelFilter::ERROR
    }
}

/// Install the global tracing subscriber. Logs go to stderr so that stdout
/// stays free for the `* ...` progress lines.
pub fn install_logger(level: LevelFilter, format: LogFormat) -> color_eyre::eyre::Result<()> {
    let builder = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .with_max_level(level);

    match format {
        LogFormat::Compact => builder.compact().finish().try_init()?,
        LogFormat::Json => builder.json().finish().try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_overrides_quiet() {
        assert_eq!(LevelFilter::ERROR, level_for(true, 0));
        assert_eq!(LevelFilter::ERROR, level_for(false, 0));
        assert_eq!(LevelFilter::WARN, level_for(true, 1));
        assert_eq!(LevelFilter::INFO, level_for(false, 2));
        assert_eq!(LevelFilter::TRACE, level_for(false, 7));
    }
}
