pub(crate) mod metrics;
pub mod queue;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};

pub trait Builder<T>: Sync + Send {
    fn build(&self) -> T;
}

pub fn init_globals() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stdout)
        .init();
}

/// Cooperative shutdown signal shared by the evaluator, its runner threads
/// and the self-play actors.
///
/// Monotonic: starts not-stopped, `stop` flips it exactly once, it never
/// goes back.
#[derive(Default)]
pub struct StopToken {
    stopped: AtomicBool,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
