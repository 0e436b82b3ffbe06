//! Captured output of a supervised command.
//!
//! One `OutputStore` per stream, backed by a spool file. The capture pump is
//! the only writer; any number of readers replay from the first byte and
//! tail the file live until the store is closed and drained.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

/// Upper bound on the bytes a reader pulls per chunk, which also bounds the
/// frames the streaming RPC sends.
const CHUNK_SIZE: usize = 32 * 1024;

pub struct OutputStore {
    path: PathBuf,
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    writer: Option<File>,
    len: u64,
    closed: bool,
}

impl OutputStore {
    /// Create the spool file, truncating any stale file at the same path.
    pub fn create(path: &Path) -> io::Result<Arc<Self>> {
        let writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            state: Mutex::new(State {
                writer: Some(writer),
                len: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }))
    }

    /// Append bytes and wake tailing readers. Readers never observe a length
    /// beyond fully written data.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let writer = state.writer.as_mut().ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "output store is closed")
            })?;
            writer.write_all(bytes)?;
            state.len += bytes.len() as u64;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark end-of-stream. Current and future readers drain whatever was
    /// appended and then observe completion.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.writer = None;
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Open an independent reader positioned at the first byte.
    pub fn open_reader(self: &Arc<Self>) -> io::Result<OutputReader> {
        let file = File::open(&self.path)?;
        Ok(OutputReader {
            store: Arc::clone(self),
            file,
            offset: 0,
        })
    }

    fn snapshot(&self) -> (u64, bool) {
        let state = self.state.lock().unwrap();
        (state.len, state.closed)
    }
}

impl Drop for OutputStore {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), %err, "spool file already gone");
        }
    }
}

/// A live view over one store. Yields chunks in producer order; dropping a
/// reader never affects the store or other readers.
pub struct OutputReader {
    store: Arc<OutputStore>,
    file: File,
    offset: u64,
}

impl OutputReader {
    /// The next chunk of output, or `None` at end-of-stream. Suspends while
    /// the store is open with no bytes past the current offset.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // register with the notifier before checking state so an append
            // between the check and the await cannot be missed
            let mut notified = pin!(self.store.notify.notified());
            notified.as_mut().enable();
            let (len, closed) = self.store.snapshot();

            if self.offset < len {
                let want = usize::min(CHUNK_SIZE, (len - self.offset) as usize);
                let mut buf = vec![0u8; want];
                let n = self.file.read_at(&mut buf, self.offset)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "spool file shorter than its recorded length",
                    ));
                }
                buf.truncate(n);
                self.offset += n as u64;
                return Ok(Some(Bytes::from(buf)));
            }

            if closed {
                return Ok(None);
            }

            notified.await;
        }
    }
}
