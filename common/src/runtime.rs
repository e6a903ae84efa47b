use std::io;
use tokio::runtime::Runtime;
use tracing::info;

/// Build the multi-threaded runtime the binaries run on.
/// `threads` overrides the worker count, otherwise tokio picks one per core.
pub fn build(name: &str, threads: Option<usize>) -> io::Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name(name);
    if let Some(threads) = threads.filter(|t| *t > 0) {
        info!("{}: custom runtime threads: {}", name, threads);
        builder.worker_threads(threads);
    }

    builder.build()
}
