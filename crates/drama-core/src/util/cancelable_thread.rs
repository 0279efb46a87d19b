use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

/// A thread handle that can be signaled to stop.
///
/// Wraps a join handle with a cancellation flag that the thread
/// can check to determine when to exit.
pub struct CancelableJoinHandle<T> {
    handle: thread::JoinHandle<T>,
    running: Arc<AtomicBool>,
}

/// Spawns a cancelable thread that can be joined later.
/// The thread is passed an `Arc<AtomicBool>` that can be used to check if the thread should stop running.
/// The thread is requested to stop running when the `AtomicBool` is set to `false`.
pub fn spawn_cancelable<T: Send + Sync + 'static>(
    func: impl FnOnce(Arc<AtomicBool>) -> T + Send + 'static,
) -> CancelableJoinHandle<T> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    let handle = thread::spawn(move || func(r));
    CancelableJoinHandle { handle, running }
}

impl<T> CancelableJoinHandle<T> {
    /// Checks if the thread should continue running.
    ///
    /// # Returns
    ///
    /// `true` if thread has not been signaled to stop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Checks if the thread body has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the thread to stop without waiting for it.
    ///
    /// A discovery run observes the flag between sampling batches, never in
    /// the middle of a measurement.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Signals the thread to stop and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns error if thread panicked
    pub fn join(self) -> thread::Result<T> {
        self.running.store(false, Ordering::Relaxed);
        self.handle.join()
    }

    /// Waits for the thread to finish without signaling it.
    ///
    /// # Errors
    ///
    /// Returns error if thread panicked
    pub fn wait(self) -> thread::Result<T> {
        self.handle.join()
    }
}

#[cfg(test)]
mod tests {
    use super::spawn_cancelable;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn test_cancel_stops_loop() {
        let handle = spawn_cancelable(|running| {
            let mut spins = 0u64;
            while running.load(Ordering::Relaxed) {
                spins += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            spins
        });
        assert!(handle.is_running());
        std::thread::sleep(Duration::from_millis(5));
        handle.cancel();
        assert!(!handle.is_running());
        assert!(handle.wait().is_ok());
    }
}
