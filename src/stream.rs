use crate::connection::{wait_for, Link};
use crate::protocol::{AdbError, Command};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-stream state shared between the receive loop and the stream's owner.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub(crate) remote_id: u32,
    pub(crate) queue: VecDeque<Vec<u8>>,
    pub(crate) write_ready: bool,
    pub(crate) opened: bool,
    pub(crate) closed: bool,
}

/// Table entry for one local id
pub(crate) struct StreamSlot {
    pub(crate) local_id: u32,
    pub(crate) state: Mutex<StreamState>,
    pub(crate) cond: Condvar,
}

impl StreamSlot {
    pub(crate) fn new(local_id: u32) -> Self {
        Self {
            local_id,
            state: Mutex::new(StreamState::default()),
            cond: Condvar::new(),
        }
    }

    /// OKAY: learn the peer's id and grant one write credit
    pub(crate) fn on_okay(&self, remote_id: u32) {
        let mut state = self.state.lock();
        state.remote_id = remote_id;
        state.opened = true;
        state.write_ready = true;
        self.cond.notify_all();
    }

    /// WRTE: queue the payload
    pub(crate) fn on_write(&self, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.queue.push_back(payload);
        self.cond.notify_all();
    }

    /// CLSE from the peer, or connection teardown
    pub(crate) fn on_close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// One logical channel multiplexed over an [`AdbConnection`](crate::AdbConnection).
///
/// Dropping the stream closes it.
pub struct AdbStream {
    slot: Arc<StreamSlot>,
    link: Arc<Link>,
}

impl AdbStream {
    pub(crate) fn new(slot: Arc<StreamSlot>, link: Arc<Link>) -> Self {
        Self { slot, link }
    }

    pub fn local_id(&self) -> u32 {
        self.slot.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.slot.state.lock().remote_id
    }

    pub fn is_closed(&self) -> bool {
        self.slot.state.lock().closed
    }

    /// Send bytes to the peer. Each WRTE frame waits for one write credit;
    /// payloads larger than the negotiated max are split. An empty `data`
    /// sends nothing.
    pub fn write(&self, data: &[u8]) -> Result<(), AdbError> {
        let max_data = self.link.max_data().max(1) as usize;
        for chunk in data.chunks(max_data) {
            self.write_frame(chunk)?;
        }
        Ok(())
    }

    /// Write a string followed by a separate NUL frame
    pub fn write_str(&self, text: &str) -> Result<(), AdbError> {
        self.write(text.as_bytes())?;
        self.write_frame(&[0])
    }

    fn write_frame(&self, chunk: &[u8]) -> Result<(), AdbError> {
        let remote_id = {
            let mut state = self.slot.state.lock();
            wait_for(&self.slot.cond, &mut state, None, |s| !s.write_ready && !s.closed);
            if state.closed {
                return Err(AdbError::StreamClosed);
            }
            state.write_ready = false;
            state.remote_id
        };

        self.link
            .transport
            .send(Command::Wrte, self.slot.local_id, remote_id, chunk)
    }

    /// Next payload from the peer, oldest first. Queued payloads are still
    /// returned after the stream closes; once the queue is empty every call
    /// fails with [`AdbError::StreamClosed`].
    pub fn read(&self) -> Result<Vec<u8>, AdbError> {
        self.read_until(None)
    }

    /// Like [`read`](Self::read) but gives up with [`AdbError::Timeout`]
    pub fn read_timeout(&self, timeout: Duration) -> Result<Vec<u8>, AdbError> {
        self.read_until(Some(Instant::now() + timeout))
    }

    fn read_until(&self, deadline: Option<Instant>) -> Result<Vec<u8>, AdbError> {
        let mut state = self.slot.state.lock();
        wait_for(&self.slot.cond, &mut state, deadline, |s| {
            s.queue.is_empty() && !s.closed
        });

        match state.queue.pop_front() {
            Some(payload) => Ok(payload),
            None if state.closed => Err(AdbError::StreamClosed),
            None => Err(AdbError::Timeout),
        }
    }

    /// Close the stream and remove it from the connection's table.
    /// Idempotent; no CLSE is sent when the peer closed first.
    pub fn close(&self) -> Result<(), AdbError> {
        let remote_id = {
            let mut state = self.slot.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            self.slot.cond.notify_all();
            state.remote_id
        };

        self.link.forget_stream(self.slot.local_id);
        self.link
            .transport
            .send(Command::Clse, self.slot.local_id, remote_id, &[])
    }
}

impl Drop for AdbStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("Closing stream {} on drop: {}", self.slot.local_id, e);
        }
    }
}

impl std::fmt::Debug for AdbStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.slot.state.lock();
        f.debug_struct("AdbStream")
            .field("local_id", &self.slot.local_id)
            .field("remote_id", &state.remote_id)
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}
