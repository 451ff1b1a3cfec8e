use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tracing::{debug, trace};


/// Pool of reusable receive/send buffers, all of one size class. A buffer is checked out for
///  the duration of one read-dispatch cycle and returned when the [PooledBuf] goes out of
///  scope, so a buffer can never be reissued while a dispatch callback still reads from it.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn check_out(self: &Arc<Self>) -> PooledBuf {
        {
            let mut buffers = self.buffers.lock().expect("buffer pool lock poisoned");
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return PooledBuf {
                    pool: self.clone(),
                    buf: Some(buffer),
                };
            }
        }

        debug!("no buffer in pool: creating new buffer");
        PooledBuf {
            pool: self.clone(),
            buf: Some(BytesMut::with_capacity(self.buf_size)),
        }
    }

    fn return_buf(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            // the buffer was grown past the pool's size class, reusing it would defeat pooling
            debug!("discarding returned buffer with capacity {}", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().expect("buffer pool lock poisoned");
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}


/// A buffer checked out of a [BufferPool], returned automatically when dropped.
pub struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Option<BytesMut>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}
impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_buf(buf);
        }
    }
}
