//! Shared read buffer between a client's background reader and `ask`.
//!
//! The reader appends under a short-held lock; consumers address bytes by
//! logical position (`bytes_dropped + offset`) so the sliding cap never
//! invalidates a recorded start position.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

use super::scan;
use super::{ClientError, MAX_READ_BUFFER, POLL_SLICE};

#[derive(Default)]
struct ReadBuffer {
    data: Vec<u8>,
    /// Total bytes evicted from the head of `data` by the cap.
    dropped: u64,
    /// Set once when the reader exits; the reason travels to callers as a
    /// connection error.
    closed: Option<String>,
}

impl ReadBuffer {
    fn logical_end(&self) -> u64 {
        self.dropped + self.data.len() as u64
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > MAX_READ_BUFFER {
            let excess = self.data.len() - MAX_READ_BUFFER;
            self.data.drain(..excess);
            self.dropped += excess as u64;
        }
    }

    /// The window `[start..end)` in logical coordinates, clamped to what is
    /// still resident.
    fn window_from(&self, start: u64) -> &[u8] {
        let from = start.saturating_sub(self.dropped) as usize;
        if from >= self.data.len() {
            &[]
        } else {
            &self.data[from..]
        }
    }
}

/// Buffer plus wakeup primitive, shared by reference between the reader task
/// and the client.
#[derive(Default)]
pub struct Shared {
    buf: Mutex<ReadBuffer>,
    notify: Notify,
}

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from the channel and wake any waiter.
    pub fn push(&self, bytes: &[u8]) {
        {
            let mut buf = self.buf.lock().expect("read buffer poisoned");
            buf.append(bytes);
        }
        self.notify.notify_waiters();
    }

    /// Record that the channel is gone. Waiters observe this as a
    /// connection error on their next poll.
    pub fn mark_closed(&self, reason: impl Into<String>) {
        {
            let mut buf = self.buf.lock().expect("read buffer poisoned");
            if buf.closed.is_none() {
                buf.closed = Some(reason.into());
            }
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.buf.lock().expect("read buffer poisoned").closed.is_some()
    }

    /// Current logical end position; recorded before a write so the
    /// transcript starts at the first byte the REPL produces in response.
    pub fn logical_end(&self) -> u64 {
        self.buf.lock().expect("read buffer poisoned").logical_end()
    }

    /// Total bytes evicted so far.
    pub fn bytes_dropped(&self) -> u64 {
        self.buf.lock().expect("read buffer poisoned").dropped
    }

    /// Wait until the window `[start..)` ends in a prompt, contains a
    /// complete JSON object, or `idle` runs out.
    ///
    /// Polls in slices bounded by [`POLL_SLICE`], woken early by the reader.
    pub async fn wait_transcript(&self, start: u64, idle: Duration) -> Result<String, ClientError> {
        let deadline = Instant::now() + idle;
        loop {
            // Arm the wakeup before inspecting the buffer so an append
            // between the check and the await is not lost.
            let notified = self.notify.notified();

            {
                let buf = self.buf.lock().expect("read buffer poisoned");
                let window = buf.window_from(start);
                if !window.is_empty() {
                    if scan::has_prompt(window) {
                        return Ok(String::from_utf8_lossy(window).into_owned());
                    }
                    let tail = if window.len() > scan::PROMPT_SCAN_WINDOW {
                        &window[window.len() - scan::PROMPT_SCAN_WINDOW..]
                    } else {
                        window
                    };
                    let tail_str = String::from_utf8_lossy(tail);
                    if let Some(js) = scan::extract_first_json(&tail_str) {
                        return Ok(js.to_string());
                    }
                }
                if let Some(reason) = &buf.closed {
                    return Err(ClientError::Connection(reason.clone()));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::DeadlineExceeded);
            }
            let slice = remaining.min(POLL_SLICE);
            tokio::select! {
                _ = notified => {}
                _ = sleep(slice) => {}
            }
        }
    }
}
