//! Size-classed scratch buffers and recycled messages.
//!
//! Pools are plain values handed to whoever needs them, so tests can build a
//! fresh one per case. With [`PoolConfig::enabled`] off every acquire is a
//! fresh allocation and every release a drop; results are identical either
//! way.

use crate::message::Message;

use parking_lot::Mutex;
use std::sync::Arc;

/// Configuration for buffer and message pooling.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Recycle buffers and messages. When off, pools only allocate.
    pub enabled: bool,
    /// Smallest size class in bytes.
    pub min_size: usize,
    /// Largest size class in bytes; bigger requests bypass the pool.
    pub max_size: usize,
    /// Buffers (or messages) kept per size class.
    pub max_retained: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 64,
            max_size: 1024 * 1024, // 1MB
            max_retained: 64,
        }
    }
}

impl PoolConfig {
    /// A configuration that never recycles.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

struct SizeClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

struct BufferPoolInner {
    enabled: bool,
    max_retained: usize,
    classes: Vec<SizeClass>,
}

/// Pool of byte buffers keyed by power-of-two size class.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    /// Create a pool with classes `min_size, 2*min_size, ...` capped at `max_size`.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let mut classes = Vec::new();
        let min_size = config.min_size.max(1);

        if config.max_size >= min_size {
            let mut size = min_size;
            while size < config.max_size {
                classes.push(SizeClass {
                    size,
                    free: Mutex::new(Vec::new()),
                });
                size = size.saturating_mul(2);
            }
            classes.push(SizeClass {
                size: config.max_size,
                free: Mutex::new(Vec::new()),
            });
        }

        Self {
            inner: Arc::new(BufferPoolInner {
                enabled: config.enabled,
                max_retained: config.max_retained,
                classes,
            }),
        }
    }

    /// Whether buffers are recycled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Get a zeroed buffer of exactly `size` bytes.
    ///
    /// Capacity is the size of the smallest class that fits, so the buffer
    /// can be cleared and refilled up to that capacity without reallocating.
    #[must_use]
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        if !self.inner.enabled {
            return vec![0; size];
        }

        let Some(class) = self.inner.classes.iter().find(|class| class.size >= size) else {
            return vec![0; size];
        };

        let mut buf = class
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; class.size]);
        buf.truncate(size);
        buf
    }

    /// Return a buffer to the class matching its capacity.
    ///
    /// The whole capacity is zeroed. Buffers smaller than the smallest class,
    /// larger than the largest, or arriving at a full class are dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        if !self.inner.enabled {
            return;
        }

        let capacity = buf.capacity();
        let Some(class) = self
            .inner
            .classes
            .iter()
            .rev()
            .find(|class| class.size <= capacity)
        else {
            return;
        };
        if capacity > self.inner.classes.last().map_or(0, |class| class.size) {
            return;
        }

        buf.clear();
        buf.resize(capacity, 0);

        let mut free = class.free.lock();
        if free.len() < self.inner.max_retained {
            free.push(buf);
        }
    }

    /// Number of idle buffers held across all classes.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.inner
            .classes
            .iter()
            .map(|class| class.free.lock().len())
            .sum()
    }

    /// Sizes of the configured classes, smallest first.
    #[must_use]
    pub fn class_sizes(&self) -> Vec<usize> {
        self.inner.classes.iter().map(|class| class.size).collect()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("enabled", &self.inner.enabled)
            .field("classes", &self.class_sizes())
            .finish_non_exhaustive()
    }
}

/// Pool of [`Message`] values whose string and metadata storage is reused.
#[derive(Clone)]
pub struct MessagePool {
    enabled: bool,
    max_retained: usize,
    free: Arc<Mutex<Vec<Message>>>,
}

impl MessagePool {
    /// Create a message pool.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_retained: config.max_retained,
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Take a blank message.
    #[must_use]
    pub fn get(&self) -> Message {
        if !self.enabled {
            return Message::new();
        }
        self.free.lock().pop().unwrap_or_default()
    }

    /// Reset a message and keep it for reuse.
    pub fn put(&self, mut message: Message) {
        if !self.enabled {
            return;
        }
        message.reset();

        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            free.push(message);
        }
    }

    /// Number of idle messages held.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("enabled", &self.enabled)
            .field("retained", &self.retained())
            .finish()
    }
}
