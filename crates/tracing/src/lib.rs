//!  Logging setup of the backfill engine.
//!
//!  The engine itself only emits `tracing` events and spans. Binaries embedding it install a
//!  subscriber with a [`Tracer`]: [`BackfillTracer`] logs to stdout and optionally to a rolling
//!  file, [`TestTracer`] logs through the test writer.
//!
//!  # Examples
//!
//!  ```
//!  use backfill_tracing::{
//!      tracing::level_filters::LevelFilter, BackfillTracer, LayerInfo, LogFormat, Tracer,
//!  };
//!
//!  fn main() -> eyre::Result<()> {
//!      let tracer = BackfillTracer::new().with_stdout(LayerInfo::new(
//!          LogFormat::Json,
//!          LevelFilter::INFO.to_string(),
//!          "backfill::scheduler=debug".to_string(),
//!          None,
//!      ));
//!
//!      let _guard = tracer.init()?;
//!      Ok(())
//!  }
//!  ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

// Re-export tracing crates
pub use tracing;
pub use tracing_appender;
pub use tracing_subscriber;

pub use formatter::LogFormat;
pub use layers::{FileInfo, FileWorkerGuard};
pub use test_tracer::TestTracer;

mod formatter;
mod layers;
mod test_tracer;

use crate::layers::Layers;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

///  Tracer logging to stdout and, optionally, to a rolling file.
#[derive(Debug, Clone, Default)]
pub struct BackfillTracer {
    stdout: LayerInfo,
    file: Option<(LayerInfo, FileInfo)>,
}

impl BackfillTracer {
    ///  Constructs a tracer with the default stdout layer and no file layer.
    pub fn new() -> Self {
        Self::default()
    }

    ///  Sets the stdout layer.
    pub fn with_stdout(mut self, config: LayerInfo) -> Self {
        self.stdout = config;
        self
    }

    ///  Adds a file layer.
    pub fn with_file(mut self, config: LayerInfo, file_info: FileInfo) -> Self {
        self.file = Some((config, file_info));
        self
    }
}

///  Configuration of a logging layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    format: LogFormat,
    default_directive: String,
    filters: String,
    color: Option<String>,
}

impl LayerInfo {
    ///  Constructs a new `LayerInfo`.
    ///
    ///  * `format` - format of the log lines.
    ///  * `default_directive` - directive used when `RUST_LOG` is unset, e.g. `info`.
    ///  * `filters` - extra comma-separated directives.
    ///  * `color` - `None` or `"never"` disables ANSI colors.
    pub const fn new(
        format: LogFormat,
        default_directive: String,
        filters: String,
        color: Option<String>,
    ) -> Self {
        Self { format, default_directive, filters, color }
    }
}

impl Default for LayerInfo {
    ///  Terminal format at INFO, with colors.
    fn default() -> Self {
        Self {
            format: LogFormat::Terminal,
            default_directive: LevelFilter::INFO.to_string(),
            filters: String::new(),
            color: Some("always".to_string()),
        }
    }
}

/// Installs a global tracing subscriber.
pub trait Tracer {
    /// Initialize the logging configuration.
    ///
    /// Returns the guard of the file writer if a file layer is configured. Logs written to the
    /// file are lost once the guard is dropped.
    fn init(self) -> eyre::Result<Option<WorkerGuard>>;
}

impl Tracer for BackfillTracer {
    fn init(self) -> eyre::Result<Option<WorkerGuard>> {
        let mut layers = Layers::new();

        layers.stdout(
            self.stdout.format,
            self.stdout.default_directive.parse()?,
            &self.stdout.filters,
            self.stdout.color.as_deref(),
        )?;

        let file_guard = match self.file {
            Some((config, file_info)) => Some(layers.file(config.format, &config.filters, file_info)?),
            None => None,
        };

        // fails only if a global subscriber is already installed
        let _ = tracing_subscriber::registry().with(layers.into_inner()).try_init().inspect_err(
            |e| tracing::warn!(%e, "Tracing subscriber could not be initialized"),
        );
        Ok(file_guard)
    }
}

///  Initializes a tracing subscriber for tests.
///
///  The filter is configurable via `RUST_LOG`. Installing silently fails if a subscriber is
///  already set.
pub fn init_test_tracing() {
    let _ = TestTracer::default().init();
}
