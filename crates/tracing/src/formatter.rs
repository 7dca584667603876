use crate::layers::BoxedLayer;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Format of log lines.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// `key=value` pairs.
    LogFmt,
    /// Human-readable, terminal-friendly output.
    #[default]
    Terminal,
}

impl LogFormat {
    /// Builds a layer writing in this format.
    ///
    /// Color is enabled unless `color` is `None` or `"never"`; `RUST_LOG_STYLE` overrides it.
    /// Targets are shown when `RUST_LOG_TARGET` is set to anything but `0`, or, by default, when
    /// the filter enables levels below INFO.
    pub fn apply(
        &self,
        filter: EnvFilter,
        color: Option<&str>,
        file_writer: Option<NonBlocking>,
    ) -> BoxedLayer<Registry> {
        let ansi = color.is_some_and(|color| {
            std::env::var("RUST_LOG_STYLE").map(|val| val != "never").unwrap_or(color != "never")
        });
        let target = std::env::var("RUST_LOG_TARGET").map(|val| val != "0").unwrap_or_else(|_| {
            filter.max_level_hint().is_none_or(|max_level| max_level > tracing::Level::INFO)
        });

        match self {
            Self::Json => {
                let layer =
                    tracing_subscriber::fmt::layer().json().with_ansi(ansi).with_target(target);
                match file_writer {
                    Some(writer) => layer.with_writer(writer).with_filter(filter).boxed(),
                    None => layer.with_filter(filter).boxed(),
                }
            }
            Self::LogFmt => tracing_logfmt::layer().with_filter(filter).boxed(),
            Self::Terminal => {
                let layer = tracing_subscriber::fmt::layer().with_ansi(ansi).with_target(target);
                match file_writer {
                    Some(writer) => {
                        layer.with_ansi(false).with_writer(writer).with_filter(filter).boxed()
                    }
                    None => layer.with_filter(filter).boxed(),
                }
            }
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::LogFmt => write!(f, "logfmt"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "logfmt" => Ok(Self::LogFmt),
            "terminal" => Ok(Self::Terminal),
            other => Err(eyre::eyre!("unknown log format {other:?}")),
        }
    }
}
