use std::{io, time::Duration};
use tokio::runtime::Runtime;

pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Builds the single-threaded runtime that drives one stub server. Connection tasks share the
/// runtime thread; dynamic responders are moved to its blocking pool.
pub(crate) fn new_current_thread() -> io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}
