//! A counting semaphore, since neither POSIX `sem_t` nor a native Windows
//! semaphore has a portable stdlib equivalent — built directly on
//! `parking_lot::{Mutex, Condvar}` as spec.md's design notes direct
//! ("model these directly; a mutex+condition-variable pair suffices where
//! semaphores are not native").

use parking_lot::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Release `n` permits, waking as many waiters as permits allow.
    pub fn post(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock();
        *count += n;
        drop(count);
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> u64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_consumes_a_permit() {
        let sem = Semaphore::new(2);
        sem.wait();
        assert_eq!(sem.available(), 1);
        sem.wait();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn post_wakes_a_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || {
                sem.wait();
            })
        };
        thread::sleep(Duration::from_millis(20));
        sem.post(1);
        waiter.join().unwrap();
    }

    #[test]
    fn post_n_releases_n_permits() {
        let sem = Semaphore::new(0);
        sem.post(3);
        assert_eq!(sem.available(), 3);
        sem.wait();
        sem.wait();
        sem.wait();
        assert_eq!(sem.available(), 0);
    }
}
