//! Logging during tests.

use tokio::runtime::RuntimeFlavor;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set: everything from the engine, warnings from the rest.
const DEFAULT_FILTER: &str = "warn,bitswap_engine=trace";

/// Configures logging for the current test, **single-threaded runtime only**.
///
/// Logs are captured by the test framework and only printed when the test fails.
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn test_something() {
///     let _guard = bitswap_test::logging::setup();
///     assert!(true);
/// }
/// ```
#[must_use = "The tracing guard must only be dropped at the end of the test"]
pub fn setup() -> tracing::subscriber::DefaultGuard {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        match handle.runtime_flavor() {
            RuntimeFlavor::CurrentThread => (),
            RuntimeFlavor::MultiThread => {
                panic!("setup() does not work in a multi-threaded tokio runtime, use setup_global()");
            }
            _ => panic!("unknown runtime flavour"),
        }
    }
    testing_subscriber().set_default()
}

/// Installs the testing subscriber as the global default.
///
/// Works on any runtime flavour. Only the first call in a test binary has an effect, later
/// calls are ignored.
pub fn setup_global() {
    testing_subscriber().try_init().ok();
}

/// Returns the [`tracing::Subscriber`] configured for our tests.
///
/// Output goes through the test harness' output capturing. `RUST_LOG` overrides the default
/// filter.
pub fn testing_subscriber() -> impl tracing::Subscriber {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .event_format(tracing_subscriber::fmt::format().with_line_number(true))
            .with_writer(|| TestWriter)
            .with_filter(filter),
    )
}

/// A tracing writer that interacts well with test output capture.
#[derive(Debug)]
struct TestWriter;

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        print!("{}", String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}
