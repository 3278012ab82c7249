use std::sync::{Condvar, Mutex};

/// Counting semaphore over a mutex + condvar.
///
/// `post` never blocks. `wait` blocks until a permit is available and
/// consumes it. Used to signal FIFO queues where the producer must never
/// sleep.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self { permits: Mutex::new(initial), available: Condvar::new() }
    }

    pub fn post(&self) {
        self.post_n(1);
    }

    /// Releases `n` permits at once. Used at shutdown to unblock every
    /// waiter in one call.
    pub fn post_n(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }
}
