//! Response packet buffers.
//!
//! A dispatch worker holds at most one response packet between building it
//! and writing it to the tunnel, so the pool keeps one buffer per worker.
//! Buffers come back when the written packet is dropped.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use super::packet::{IPV4_HEADER_SIZE, UDP_HEADER_SIZE};
use crate::config::DispatchSettings;
use crate::dns::resolver::MAX_UPSTREAM_REPLY_SIZE;

/// Largest response packet built from an upstream reply.
pub const PACKET_BUFFER_SIZE: usize = IPV4_HEADER_SIZE + UDP_HEADER_SIZE + MAX_UPSTREAM_REPLY_SIZE;

type FreeList = Arc<Mutex<Vec<Vec<u8>>>>;

/// A response packet backed by a pooled buffer.
pub struct ResponsePacket {
    data: Vec<u8>,
    free: FreeList,
    retain: usize,
}

impl ResponsePacket {
    pub(super) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for ResponsePacket {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for ResponsePacket {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        if data.capacity() > PACKET_BUFFER_SIZE {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.retain {
            data.clear();
            free.push(data);
        }
    }
}

/// Buffers shared by the workers of one session.
///
/// Clones share the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    free: FreeList,
    retain: usize,
}

impl BufferPool {
    /// Pool with one pre-allocated buffer per worker.
    pub fn new(workers: usize) -> Self {
        let free = (0..workers)
            .map(|_| Vec::with_capacity(PACKET_BUFFER_SIZE))
            .collect();
        Self {
            free: Arc::new(Mutex::new(free)),
            retain: workers,
        }
    }

    /// A zeroed packet of `len` bytes.
    ///
    /// Allocates when every buffer is in use. Packets larger than
    /// [`PACKET_BUFFER_SIZE`] are never kept.
    pub(super) fn packet(&self, len: usize) -> ResponsePacket {
        let mut data = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(PACKET_BUFFER_SIZE.max(len)));
        data.resize(len, 0);
        ResponsePacket {
            data,
            free: Arc::clone(&self.free),
            retain: self.retain,
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DispatchSettings::default().workers)
    }
}
