//! Directory polling contract: files appear atomically (producer does
//! create-elsewhere-then-rename); the poller only yields files that have
//! been visible and unchanged across two consecutive polls. Shaped after
//! the teacher's background-thread-plus-channel watch loop, swapped from
//! an mpsc channel to a blocking queue since `next_file()` here must
//! block the calling worker thread and wake on `stop()`.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    File(PathBuf),
    Stopped,
}

struct Shared {
    queue: Mutex<VecDeque<PathBuf>>,
    cv: Condvar,
    stopped: AtomicBool,
}

/// A background poller over one directory.
pub struct DirPoller {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl DirPoller {
    pub fn start(dir: PathBuf, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let thread = std::thread::spawn(move || poll_loop(dir, interval, worker_shared));
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Block until a stable file is available or the poller is stopped.
    pub fn next_file(&self) -> PollOutcome {
        let mut queue = self.shared.queue.lock().unwrap();
        loop {
            if let Some(path) = queue.pop_front() {
                return PollOutcome::File(path);
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                return PollOutcome::Stopped;
            }
            queue = self.shared.cv.wait(queue).unwrap();
        }
    }

    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Signal shutdown without requiring exclusive access, for a poller
    /// shared across worker threads via `Arc`. Wakes every blocked
    /// `next_file()` immediately; the background poll thread itself
    /// exits on its next tick. Idempotent.
    pub fn request_stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
    }
}

impl Drop for DirPoller {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
    }
}

fn poll_loop(dir: PathBuf, interval: Duration, shared: Arc<Shared>) {
    let mut candidates: HashMap<PathBuf, (SystemTime, u64)> = HashMap::new();
    while !shared.stopped.load(Ordering::SeqCst) {
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                // The dot prefix marks a file still being written by the
                // packer; only the non-dot placeholder name is ready for
                // a consumer to pick up.
                let is_dotfile = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                if is_dotfile {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let Ok(mtime) = meta.modified() else {
                    continue;
                };
                let size = meta.len();
                match candidates.remove(&path) {
                    Some((prev_mtime, prev_size)) if prev_mtime == mtime && prev_size == size => {
                        let mut queue = shared.queue.lock().unwrap();
                        queue.push_back(path);
                        shared.cv.notify_one();
                    }
                    _ => {
                        candidates.insert(path, (mtime, size));
                    }
                }
            }
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn yields_file_once_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dat");
        {
            let mut f = fs::File::create(&path).unwrap();
            f.write_all(b"hello").unwrap();
        }

        let mut poller = DirPoller::start(dir.path().to_path_buf(), Duration::from_millis(20));
        match poller.next_file() {
            PollOutcome::File(p) => assert_eq!(p, path),
            PollOutcome::Stopped => panic!("expected a file"),
        }
        poller.stop();
    }

    #[test]
    fn never_yields_dot_prefixed_working_files() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join(".a.dat");
        {
            let mut f = fs::File::create(&working).unwrap();
            f.write_all(b"hello").unwrap();
        }

        let mut poller = DirPoller::start(dir.path().to_path_buf(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(80));
        poller.stop();
        // No stable candidate other than the dot-prefixed file ever
        // existed, so the queue must still be empty.
        assert_eq!(poller.next_file(), PollOutcome::Stopped);
    }

    #[test]
    fn stop_wakes_blocked_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = DirPoller::start(dir.path().to_path_buf(), Duration::from_millis(20));
        poller.stop();
        assert_eq!(poller.next_file(), PollOutcome::Stopped);
    }
}
