//! Subscriber side of a topic
//!
//! A subscriber claims one slot of the segment's subscriber table, sleeps on the
//! slot's private semaphore and pops descriptor indices from the slot's used
//! ring. Every frame of a received message shares one lease; dropping the last
//! frame hands the descriptor reference back to the publisher.

use crate::config::SubscriberConfig;
use crate::guard::{payload_range, FrameGuard, Lease, Message};
use crate::layout::{MemoryStatus, SlotStatus, SubscriberSlot, NUM_DESC};
use crate::mapper::{ImportedBuffer, MemoryMapper};
use crate::meta::BufferRef;
use crate::segment::{free_sem_name, release_desc, used_sem_name, Release, RingSegment};
use crate::semaphore::NamedSemaphore;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Uninitialized,
    Initialized,
    Started,
    Running,
    Stopped,
    Deinitialized,
}

/// Segment mapping and free-list signal shared by the subscriber and every
/// outstanding frame
pub(crate) struct Channel {
    segment: RingSegment,
    free_sem: NamedSemaphore,
    underflows: Arc<AtomicU64>,
}

impl Channel {
    /// Drop this subscriber's reference on `idx`
    pub(crate) fn release(&self, idx: u16) {
        match release_desc(self.segment.memory(), &self.free_sem, idx) {
            Ok(Release::Underflow(_)) => {
                self.underflows.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(topic = %self.segment.topic(), idx, error = %e, "release failed");
            }
        }
    }

    fn slot(&self, slot: usize) -> Result<&SubscriberSlot> {
        self.segment
            .memory()
            .slot(slot)
            .ok_or_else(|| Error::OutOfBound(format!("subscriber slot {slot}")))
    }
}

/// Resources held between `start` and `deinit`
struct Connection {
    channel: Arc<Channel>,
    slot: usize,
    used_sem: NamedSemaphore,
    running: Arc<AtomicBool>,
    liveness: Option<JoinHandle<()>>,
}

/// Subscriber of one topic
pub struct Subscriber<M: MemoryMapper> {
    mapper: Arc<M>,
    config: SubscriberConfig,
    name: String,
    topic: String,
    state: SubscriberState,
    conn: Option<Connection>,
    /// Imported buffers by handle
    cache: HashMap<u64, Arc<ImportedBuffer>>,
    underflows: Arc<AtomicU64>,
}

impl<M: MemoryMapper> Subscriber<M> {
    pub fn new(mapper: M) -> Self {
        Self::with_config(mapper, SubscriberConfig::default())
    }

    pub fn with_config(mapper: M, config: SubscriberConfig) -> Self {
        Self {
            mapper: Arc::new(mapper),
            config,
            name: String::new(),
            topic: String::new(),
            state: SubscriberState::Uninitialized,
            conn: None,
            cache: HashMap::new(),
            underflows: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record identity; no OS resource is touched
    pub fn init(&mut self, name: &str, topic: &str, queue_depth: u32) -> Result<()> {
        match self.state {
            SubscriberState::Uninitialized | SubscriberState::Deinitialized => {}
            _ => return Err(Error::BadState("subscriber already initialized")),
        }
        if topic.is_empty() {
            return Err(Error::BadArguments("empty topic".to_string()));
        }
        if queue_depth == 0 || queue_depth as usize > NUM_DESC {
            return Err(Error::BadArguments(format!(
                "queue depth {queue_depth} not in 1..={NUM_DESC}"
            )));
        }

        self.name = name.to_string();
        self.topic = topic.to_string();
        self.config.queue_depth = queue_depth;
        self.state = SubscriberState::Initialized;
        Ok(())
    }

    /// Attach to the topic's segment and claim a subscriber slot.
    ///
    /// Waits up to `start_timeout` for the publisher to bring the segment online.
    /// On any failure everything acquired so far is released and the subscriber
    /// stays `Initialized`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SubscriberState::Initialized {
            return Err(Error::BadState("subscriber not initialized"));
        }

        let segment = self.wait_segment()?;
        segment
            .memory()
            .validate()
            .map_err(|msg| Error::SharedMemory(format!("{}: {msg}", segment.name())))?;
        let free_sem = NamedSemaphore::open(&free_sem_name(&self.topic))?;
        let channel = Arc::new(Channel {
            segment,
            free_sem,
            underflows: self.underflows.clone(),
        });

        let mem = channel.segment.memory();
        let (slot, slot_ref) = mem.claim_slot().ok_or_else(|| {
            tracing::error!(topic = %self.topic, "no free subscriber slot");
            Error::NoFreeSlot
        })?;

        let connected = NamedSemaphore::open(&used_sem_name(&self.topic, slot)).and_then(|used_sem| {
            let running = Arc::new(AtomicBool::new(true));
            let liveness = spawn_liveness(
                channel.clone(),
                running.clone(),
                self.config.liveness_interval,
            )?;
            Ok((used_sem, running, liveness))
        });
        let (used_sem, running, liveness) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                slot_ref.unclaim();
                return Err(e);
            }
        };

        slot_ref.announce(&self.name, self.config.queue_depth);
        tracing::info!(
            topic = %self.topic,
            name = %self.name,
            slot,
            publisher = %mem.name(),
            "publisher online"
        );

        self.conn = Some(Connection {
            channel,
            slot,
            used_sem,
            running,
            liveness: Some(liveness),
        });
        self.state = SubscriberState::Started;
        Ok(())
    }

    /// Open the segment once it exists and its publisher marked it initialized
    fn wait_segment(&self) -> Result<RingSegment> {
        // `None` waits forever
        let deadline = Instant::now().checked_add(self.config.start_timeout);
        loop {
            match RingSegment::open(&self.topic) {
                Ok(segment) if segment.memory().status() == MemoryStatus::Initialized => {
                    return Ok(segment);
                }
                Ok(_) => {}
                Err(e) => tracing::trace!(topic = %self.topic, error = %e, "segment not ready"),
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                tracing::warn!(topic = %self.topic, "timed out waiting for publisher");
                return Err(Error::Timeout);
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Messages arrive in publish order. The returned frames keep the message
    /// alive; drop them to give the descriptor back.
    pub fn receive(&mut self, timeout: Duration) -> Result<Message> {
        match self.state {
            SubscriberState::Started | SubscriberState::Running => {}
            _ => return Err(Error::BadState("subscriber not started")),
        }
        let conn = self.conn.as_ref().ok_or(Error::BadState("subscriber not started"))?;

        conn.used_sem.wait(timeout)?;
        let idx = conn
            .channel
            .slot(conn.slot)?
            .ring()
            .pop()?
            .ok_or_else(|| Error::OutOfBound(format!("used ring {} empty after signal", conn.slot)))?;
        let desc = conn.channel.segment.memory().desc(idx).ok_or_else(|| {
            tracing::error!(topic = %self.topic, idx, "descriptor index out of range");
            Error::OutOfBound(format!("descriptor index {idx} >= {NUM_DESC}"))
        })?;
        tracing::debug!(topic = %self.topic, idx, "received desc");

        let lease = Arc::new(Lease::new(conn.channel.clone(), idx));
        let mut frames = Vec::with_capacity(desc.num_frames());
        for i in 0..desc.num_frames() {
            let entry = desc.frame(i).ok_or(Error::NullPtr)?;
            // on failure `frames` and `lease` drop here, releasing the message
            let buffer = import(&self.mapper, &mut self.cache, &entry.buf)?;
            if payload_range(&entry.buf, buffer.len()).is_none() {
                tracing::error!(
                    topic = %self.topic,
                    idx,
                    handle = entry.buf.dma_handle,
                    offset = entry.buf.offset,
                    len = entry.buf.len,
                    mapped = buffer.len(),
                    "frame range outside buffer"
                );
                return Err(Error::OutOfBound(format!(
                    "frame {i} range {}+{} exceeds buffer {} of {} bytes",
                    entry.buf.offset,
                    entry.buf.len,
                    entry.buf.dma_handle,
                    buffer.len()
                )));
            }
            frames.push(FrameGuard::new(buffer, entry.buf, entry.info(), lease.clone()));
        }
        let message = Message::new(idx, desc.timestamp(), frames);

        self.state = SubscriberState::Running;
        Ok(message)
    }

    /// Import `buf`, reusing the mapping of an already imported handle
    pub fn import(&mut self, buf: &BufferRef) -> Result<Arc<ImportedBuffer>> {
        import(&self.mapper, &mut self.cache, buf)
    }

    /// Stop the liveness task and release every index still queued for us
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            SubscriberState::Started | SubscriberState::Running => {}
            SubscriberState::Stopped => return Ok(()),
            _ => return Err(Error::BadState("subscriber not started")),
        }
        let conn = self.conn.as_mut().ok_or(Error::BadState("subscriber not started"))?;

        conn.running.store(false, Ordering::Release);
        if let Some(handle) = conn.liveness.take() {
            handle
                .join()
                .map_err(|_| Error::Fail("liveness thread panicked".to_string()))?;
        }

        let ring = conn.channel.slot(conn.slot)?.ring();
        let mut drained = 0usize;
        while let Some(idx) = ring.pop()? {
            conn.channel.release(idx);
            drained += 1;
        }
        conn.used_sem.reset();
        if drained > 0 {
            tracing::debug!(topic = %self.topic, drained, "released pending descs");
        }

        self.state = SubscriberState::Stopped;
        Ok(())
    }

    /// Give the slot back and unmap cached buffers. Only valid after `stop`.
    ///
    /// A buffer still held by received frames is unmapped through the mapper
    /// when the last of those frames is dropped.
    pub fn deinit(&mut self) -> Result<()> {
        if self.state != SubscriberState::Stopped {
            return Err(Error::BadState("subscriber not stopped"));
        }

        let mut first_err = None;
        if let Some(conn) = self.conn.take() {
            match conn.channel.slot(conn.slot) {
                Ok(slot) => slot.set_status(SlotStatus::Destroyed),
                Err(e) => first_err = Some(e),
            }
            tracing::info!(topic = %self.topic, slot = conn.slot, "subscriber offline");
        }

        for (handle, imported) in self.cache.drain() {
            match Arc::try_unwrap(imported) {
                Ok(imported) => {
                    if let Err(e) = imported.unmap() {
                        tracing::error!(handle, error = %e, "failed to unmap buffer");
                        first_err.get_or_insert(e);
                    }
                }
                Err(_) => tracing::debug!(handle, "buffer still referenced at deinit"),
            }
        }

        self.state = SubscriberState::Deinitialized;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Claimed slot while started
    pub fn slot_id(&self) -> Option<usize> {
        self.conn.as_ref().map(|c| c.slot)
    }

    /// Number of buffers currently imported
    pub fn cached_buffers(&self) -> usize {
        self.cache.len()
    }

    /// Reference underflows seen by this subscriber's releases
    pub fn underflow_count(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }
}

impl<M: MemoryMapper> Drop for Subscriber<M> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            SubscriberState::Started | SubscriberState::Running
        ) {
            if let Err(e) = self.stop() {
                tracing::error!(topic = %self.topic, error = %e, "stop on drop failed");
            }
        }
        if self.state == SubscriberState::Stopped {
            if let Err(e) = self.deinit() {
                tracing::error!(topic = %self.topic, error = %e, "deinit on drop failed");
            }
        }
    }
}

fn import<M: MemoryMapper>(
    mapper: &Arc<M>,
    cache: &mut HashMap<u64, Arc<ImportedBuffer>>,
    buf: &BufferRef,
) -> Result<Arc<ImportedBuffer>> {
    if let Some(mapped) = cache.get(&buf.dma_handle) {
        return Ok(mapped.clone());
    }
    let mapped = mapper.map(buf).map_err(|e| {
        tracing::error!(handle = buf.dma_handle, error = %e, "failed to import buffer");
        Error::Fail(format!("import of buffer {}: {e}", buf.dma_handle))
    })?;
    let mapped = Arc::new(ImportedBuffer::new(mapped, mapper.clone()));
    cache.insert(buf.dma_handle, mapped.clone());
    Ok(mapped)
}

fn spawn_liveness(
    channel: Arc<Channel>,
    running: Arc<AtomicBool>,
    interval: Duration,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("shmbus-liveness".to_string())
        .spawn(move || {
            let mut offline = false;
            while running.load(Ordering::Acquire) {
                let destroyed = channel.segment.memory().status() == MemoryStatus::Destroyed;
                if destroyed && !offline {
                    tracing::warn!(topic = %channel.segment.topic(), "publisher offline");
                }
                offline = destroyed;
                thread::sleep(interval);
            }
        })
        .map_err(|e| Error::Fail(format!("spawn liveness thread: {e}")))
}
