use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag;

/// Set once the process was asked to terminate. The consumer loop checks it between
/// periods and goes through the normal drain/teardown path.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag on SIGHUP, SIGINT, SIGQUIT and SIGTERM.
    pub fn on_signals() -> io::Result<Self> {
        let shutdown = Shutdown::new();
        for sig in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
            flag::register(sig, Arc::clone(&shutdown.flag))?;
        }
        Ok(shutdown)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
