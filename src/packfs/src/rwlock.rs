//! Writer-preferring reader/writer lock.
//!
//! Built from two binary semaphores gated by two counted "lightswitches"
//! (Little Book of Semaphores, §4.2.6): any number of readers share the lock,
//! writers are exclusive, and once a writer is waiting no new reader gets in
//! ahead of it. The lock is not reentrant and unlocks must pair with locks.

use tokio::sync::{Mutex, Semaphore};

/// First task in raises the gate semaphore, last task out lowers it.
#[derive(Debug)]
struct LightSwitch {
    count: Mutex<usize>,
}

impl LightSwitch {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
        }
    }

    async fn enter(&self, gate: &Semaphore) {
        let mut count = self.count.lock().await;
        if *count == 0 {
            gate.acquire().await.unwrap().forget();
        }
        *count += 1;
    }

    async fn exit(&self, gate: &Semaphore) {
        let mut count = self.count.lock().await;
        *count -= 1;
        if *count == 0 {
            gate.add_permits(1);
        }
    }
}

#[derive(Debug)]
pub struct WritePriorityLock {
    no_readers: Semaphore,
    no_writers: Semaphore,
    read_switch: LightSwitch,
    write_switch: LightSwitch,
}

impl Default for WritePriorityLock {
    fn default() -> Self {
        Self::new()
    }
}

impl WritePriorityLock {
    pub fn new() -> Self {
        Self {
            no_readers: Semaphore::new(1),
            no_writers: Semaphore::new(1),
            read_switch: LightSwitch::new(),
            write_switch: LightSwitch::new(),
        }
    }

    /// Blocks while a writer holds or awaits the lock.
    pub async fn lock_read(&self) {
        let turnstile = self.no_readers.acquire().await.unwrap();
        self.read_switch.enter(&self.no_writers).await;
        drop(turnstile);
    }

    pub async fn unlock_read(&self) {
        self.read_switch.exit(&self.no_writers).await;
    }

    /// The first waiting writer closes the turnstile to new readers, then
    /// waits for in-flight readers to drain.
    ///
    /// Not cancellation-safe between the two phases: a caller that drops this
    /// future after `write_switch.enter` would leave readers shut out. Engine
    /// sections await it to completion.
    pub async fn lock_write(&self) {
        self.write_switch.enter(&self.no_readers).await;
        self.no_writers.acquire().await.unwrap().forget();
    }

    pub async fn unlock_write(&self) {
        self.no_writers.add_permits(1);
        self.write_switch.exit(&self.no_readers).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_share() {
        let lock = Arc::new(WritePriorityLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                lock.lock_read().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                lock.unlock_read().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "readers never overlapped");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writer_is_exclusive() {
        let lock = Arc::new(WritePriorityLock::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                lock.lock_write().await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.unlock_write().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writer_blocks_new_readers() {
        let lock = Arc::new(WritePriorityLock::new());

        lock.lock_read().await;

        let writer = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock_write().await;
                sleep(Duration::from_millis(30)).await;
                lock.unlock_write().await;
            })
        };
        // let the writer reach its turnstile
        sleep(Duration::from_millis(50)).await;

        let late_reader = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock_read().await;
                lock.unlock_read().await;
            })
        };
        sleep(Duration::from_millis(50)).await;
        // the late reader must be parked behind the waiting writer
        assert!(!late_reader.is_finished());
        assert!(!writer.is_finished());

        lock.unlock_read().await;
        writer.await.unwrap();
        late_reader.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writer_waits_for_readers() {
        let lock = Arc::new(WritePriorityLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        lock.lock_read().await;
        let writer = {
            let lock = lock.clone();
            let order = order.clone();
            tokio::spawn(async move {
                lock.lock_write().await;
                order.lock().await.push("writer");
                lock.unlock_write().await;
            })
        };
        sleep(Duration::from_millis(50)).await;
        order.lock().await.push("reader-release");
        lock.unlock_read().await;
        writer.await.unwrap();

        assert_eq!(*order.lock().await, vec!["reader-release", "writer"]);
    }
}
