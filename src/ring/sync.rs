use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::ByteRing;


/// A [`ByteRing`] shared between threads.
///
/// Writers and readers can block until the other side made progress. The
/// driver itself never uses this type; it is meant for embeddings that hand
/// request bodies or responses to worker threads.
#[derive(Debug)]
pub struct SyncByteRing {
    ring: Mutex<ByteRing>,
    changed: Condvar,
}

impl SyncByteRing {
    /// Creates an empty shared ring holding at most `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { ring: Mutex::new(ByteRing::new(size)), changed: Condvar::new() }
    }

    /// Returns the number of readable bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.ring.lock().size()
    }

    /// Appends as much of `data` as currently fits.
    pub fn write(&self, data: &[u8]) -> usize {
        let n = self.ring.lock().write(data);
        if n > 0 {
            self.changed.notify_all();
        }
        n
    }

    /// Moves up to `out.len()` readable bytes into `out` without waiting.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let n = self.ring.lock().read(out);
        if n > 0 {
            self.changed.notify_all();
        }
        n
    }

    /// Waits up to `timeout` for data and then reads like [`read`](Self::read).
    ///
    /// Returns 0 if nothing arrived in time.
    pub fn read_timeout(&self, out: &mut [u8], timeout: Duration) -> usize {
        let mut ring = self.ring.lock();
        if ring.is_empty() {
            let _res = self.changed.wait_while_for(&mut ring, |r| r.is_empty(), timeout);
        }
        let n = ring.read(out);
        drop(ring);
        if n > 0 {
            self.changed.notify_all();
        }
        n
    }

    /// Writes all of `data`, waiting for readers to make room as needed.
    ///
    /// Gives up once a wait of `timeout` passes without progress and returns
    /// the number of bytes written so far.
    pub fn write_all_timeout(&self, mut data: &[u8], timeout: Duration) -> usize {
        let total = data.len();
        let mut ring = self.ring.lock();
        while !data.is_empty() {
            if ring.is_full()
                && self.changed.wait_while_for(&mut ring, |r| r.is_full(), timeout).timed_out()
            {
                break;
            }
            let n = ring.write(data);
            data = &data[n..];
            self.changed.notify_all();
        }
        total - data.len()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use super::*;

    #[test]
    fn cross_thread_transfer() {
        let shared = Arc::new(SyncByteRing::new(16));
        let payload: Vec<u8> = (0..=255).collect();

        let writer = {
            let shared = Arc::clone(&shared);
            let payload = payload.clone();
            thread::spawn(move || shared.write_all_timeout(&payload, Duration::from_secs(5)))
        };

        let mut got = Vec::new();
        let mut buf = [0; 7];
        while got.len() < payload.len() {
            let n = shared.read_timeout(&mut buf, Duration::from_secs(5));
            assert!(n > 0, "reader starved");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(writer.join().ok(), Some(payload.len()));
        assert_eq!(got, payload);
    }

    #[test]
    fn read_times_out_empty() {
        let shared = SyncByteRing::new(4);
        let mut buf = [0; 4];
        assert_eq!(shared.read_timeout(&mut buf, Duration::from_millis(10)), 0);
        assert_eq!(shared.size(), 0);
    }
}
