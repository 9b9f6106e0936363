pub mod builders;
pub mod recorder;

use std::sync::Once;
use std::time::Duration;

use taskdag::engine::EventStream;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Read events until one equals `wanted`, returning everything read so far
/// (including the match). Panics after 5 seconds or if the stream ends.
pub async fn events_until(stream: &mut EventStream, wanted: &str) -> Vec<String> {
    with_timeout(async {
        let mut seen = Vec::new();
        loop {
            match stream.recv().await {
                Some(event) => {
                    let done = event == wanted;
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                None => panic!("event stream closed before {wanted:?}; saw {seen:?}"),
            }
        }
    })
    .await
}

/// Drain whatever is buffered right now, waiting briefly for stragglers.
pub async fn drain_events(stream: &mut EventStream) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await
    {
        seen.push(event);
    }
    seen
}
