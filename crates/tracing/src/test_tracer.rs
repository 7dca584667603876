use crate::Tracer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

///  Tracer for tests.
///
///  Logs through the test writer, so output is captured per test. The filter is configurable via
///  `RUST_LOG`.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct TestTracer;

impl Tracer for TestTracer {
    fn init(self) -> eyre::Result<Option<WorkerGuard>> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Ok(None)
    }
}
