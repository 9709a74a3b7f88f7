use bytes::BytesMut;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// A pool of equally-sized buffers for received packets. The dispatcher takes a buffer for every
///  read from the transport, and the buffer finds its way back here when the packet was consumed.
///
/// The pool is not a hard limit: if it is empty, a fresh buffer is allocated.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl Debug for BufferPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferPool{{buf_size: {}, max_pool_size: {}}}", self.buf_size, self.max_pool_size)
    }
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    /// number of idle buffers currently held by the pool
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// Returns an empty buffer with a capacity of (at least) `buf_size` bytes. The buffer goes
    ///  back to the pool when the returned handle is dropped.
    pub fn get_from_pool(self: &Arc<Self>) -> PooledBuf {
        PooledBuf {
            buf: self.take_buffer(),
            pool: self.clone(),
        }
    }

    fn take_buffer(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            debug!("returned buffer has a capacity of {} instead of {} bytes: discarding it", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// A buffer on loan from a [BufferPool]. Dropping it is the (only) way of returning it.
pub struct PooledBuf {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Makes the full capacity of the buffer available for writing, e.g. as a receive buffer
    pub fn maximize_len(&mut self) {
        self.buf.resize(self.pool.buf_size, 0);
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuf{{len: {}}}", self.buf.len())
    }
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.return_to_pool(buf);
    }
}
