//! Engine trait and thread launch
//!
//! Each engine owns its loop and runs on a dedicated, named OS thread.

use anyhow::{Context, Result};
use log::{error, info};
use std::thread::JoinHandle;

/// A loop that moves frames until its stop signal fires
pub trait Engine: Send + 'static {
    /// Run until stopped. Transient transfer errors are counted, not returned.
    fn run(&mut self) -> Result<()>;

    /// Get the name of this engine for logging
    fn name(&self) -> &'static str;
}

/// Start `engine` on its own thread named after it.
pub fn spawn_engine<E: Engine>(mut engine: E) -> Result<JoinHandle<Result<()>>> {
    let name = engine.name();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = engine.run();
            match &result {
                Ok(()) => info!("{}: exited", name),
                Err(e) => error!("{}: failed: {:#}", name, e),
            }
            result
        })
        .with_context(|| format!("Failed to spawn {} thread", name))
}

/// Join an engine thread, turning a panic into an error.
pub fn join_engine(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("{} thread panicked", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        fail: bool,
    }

    impl Engine for Counting {
        fn run(&mut self) -> Result<()> {
            if self.fail {
                anyhow::bail!("stream refused to start");
            }
            assert_eq!(std::thread::current().name(), Some("Counting"));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting"
        }
    }

    #[test]
    fn test_engine_runs_on_named_thread() {
        let handle = spawn_engine(Counting { fail: false }).unwrap();
        assert!(join_engine("Counting", handle).is_ok());
    }

    #[test]
    fn test_engine_error_is_returned() {
        let handle = spawn_engine(Counting { fail: true }).unwrap();
        let err = join_engine("Counting", handle).unwrap_err();
        assert!(err.to_string().contains("refused"));
    }
}
