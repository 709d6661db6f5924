//! Worker thread spawning.
//!
//! Pipeline consumers and query workers are long-lived threads; giving each
//! a name keeps thread listings and panic messages attributable to a stage
//! (`stat-consumer`, `qe-worker-0`, ...).

use std::thread::{Builder, JoinHandle};

/// Spawns a named worker thread. Failing to spawn means the thread name is
/// invalid or the process is out of resources; neither is recoverable at a
/// pipeline stage, so this panics with the stage name.
pub fn spawn_named_thread<F, T>(name: impl Into<String>, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    Builder::new()
        .name(name.clone())
        .spawn(f)
        .unwrap_or_else(|err| panic!("failed to spawn worker thread `{name}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_carries_its_stage_name() {
        let handle = spawn_named_thread("stat-consumer", || {
            std::thread::current().name().map(str::to_string)
        });
        assert_eq!(handle.join().unwrap().as_deref(), Some("stat-consumer"));
    }
}
