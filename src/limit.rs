//! Output byte budgets.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A writer that passes through at most `budget` bytes.
///
/// The write that crosses the budget is truncated to fit; every write after
/// the budget is spent fails with an "output limit reached" error. The first
/// time either happens the shared reached flag is set and a warning is logged.
pub struct LimitingWriter<W> {
    inner: W,
    remaining: u64,
    reached: Arc<AtomicBool>,
}

impl<W: Write> LimitingWriter<W> {
    pub fn new(inner: W, budget: u64) -> Self {
        Self {
            inner,
            remaining: budget,
            reached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle on the reached flag that stays readable after the writer is moved.
    pub fn reached_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reached)
    }

    pub fn limit_reached(&self) -> bool {
        self.reached.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn mark_reached(&self) {
        if !self.reached.swap(true, Ordering::SeqCst) {
            tracing::warn!("output limit reached");
        }
    }
}

impl<W: Write> Write for LimitingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            self.mark_reached();
            return Err(io::Error::other("output limit reached"));
        }

        let allowed = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let payload = if buf.len() > allowed {
            self.mark_reached();
            &buf[..allowed]
        } else {
            buf
        };

        let written = self.inner.write(payload)?;
        self.remaining -= written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
