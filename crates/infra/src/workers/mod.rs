//! Background task plumbing shared by the daemons.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to stop and join a background daemon.
#[derive(Debug)]
pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Spawn `run` with a fresh shutdown signal.
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, receiver) = watch::channel(false);
        let join = tokio::spawn(run(receiver));
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Signal shutdown and wait for the daemon to finish its current cycle.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                tracing::warn!(error = %err, "daemon task ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `true` if the caller should stop.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    if duration.is_zero() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_interrupts_pause() {
        let handle = DaemonHandle::spawn(|mut shutdown| async move {
            while !pause(&mut shutdown, Duration::from_secs(60)).await {}
        });
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pause_without_signal_runs_out() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!pause(&mut rx, Duration::from_millis(5)).await);
    }
}
