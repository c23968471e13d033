//! Publisher side of a topic
//!
//! The publisher creates the segment, owns every semaphore of the topic and
//! runs a service thread that registers subscribers, reclaims the slots of
//! departed ones and recycles descriptor indices from the free ring back to
//! the avail ring.

use crate::config::PublisherConfig;
use crate::layout::{MemoryStatus, RingMemory, SlotStatus, MAX_DATA_FRAMES, NUM_DESC, NUM_SUBSCRIBERS};
use crate::meta::{BufferRef, FrameEntry, FrameInfo};
use crate::segment::{free_sem_name, release_desc, used_sem_name, RingSegment};
use crate::semaphore::NamedSemaphore;
use crate::{Error, Result};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Anything the publisher must keep alive while subscribers read a frame
pub type KeepAlive = Arc<dyn Any + Send + Sync>;

/// One frame handed to `Publisher::publish`
pub struct PublishFrame {
    pub buf: BufferRef,
    pub info: FrameInfo,
    /// Dropped once every subscriber released the message
    pub keep_alive: Option<KeepAlive>,
}

impl PublishFrame {
    pub fn new(buf: BufferRef, info: FrameInfo) -> Self {
        Self {
            buf,
            info,
            keep_alive: None,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }
}

/// Lifecycle of a publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
    Deinitialized,
}

struct Shared {
    segment: RingSegment,
    free_sem: NamedSemaphore,
    used_sems: Vec<NamedSemaphore>,
    /// Registered subscriber slots
    subscribers: Mutex<[bool; NUM_SUBSCRIBERS]>,
    /// Keep-alive handles of each in-flight descriptor
    in_flight: Mutex<Vec<Vec<KeepAlive>>>,
    running: AtomicBool,
    last_timestamp: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn memory(&self) -> &RingMemory {
        self.segment.memory()
    }

    fn release(&self, idx: u16) {
        if let Err(e) = release_desc(self.memory(), &self.free_sem, idx) {
            tracing::error!(topic = %self.segment.topic(), idx, error = %e, "release failed");
        }
    }

    /// Strictly increasing nanosecond timestamp
    fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let prev = self
            .last_timestamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// Register new subscribers, reclaim destroyed slots
    fn scan_slots(&self) {
        let mem = self.memory();
        let mut subs = lock(&self.subscribers);
        for (i, slot) in mem.slots().iter().enumerate() {
            if !slot.is_claimed() {
                continue;
            }
            match slot.status() {
                SlotStatus::Initialized if !subs[i] => {
                    subs[i] = true;
                    tracing::info!(
                        topic = %self.segment.topic(),
                        slot = i,
                        name = %slot.ring().name(),
                        queue_depth = slot.ring().queue_depth(),
                        "subscriber online"
                    );
                }
                SlotStatus::Destroyed => {
                    if subs[i] {
                        subs[i] = false;
                        tracing::info!(topic = %self.segment.topic(), slot = i, "subscriber offline");
                    }
                    loop {
                        match slot.ring().pop() {
                            Ok(Some(idx)) => self.release(idx),
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(slot = i, error = %e, "reclaim pop failed");
                                break;
                            }
                        }
                    }
                    self.used_sems[i].reset();
                    slot.set_status(SlotStatus::Uninitialized);
                    slot.unclaim();
                }
                _ => {}
            }
        }
    }

    /// Move released indices from the free ring back to avail
    fn recycle(&self) {
        let mem = self.memory();
        loop {
            let idx = match mem.free.pop() {
                Ok(Some(idx)) => idx,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "free ring pop failed");
                    break;
                }
            };
            if let Some(held) = lock(&self.in_flight).get_mut(idx as usize) {
                held.clear();
            }
            tracing::debug!(idx, "recycle desc");
            if let Err(e) = mem.avail.push(idx) {
                tracing::error!(idx, error = %e, "avail ring push failed");
            }
        }
    }

    fn service(&self, free_wait: Duration) {
        while self.running.load(Ordering::Acquire) {
            self.scan_slots();
            match self.free_sem.wait(free_wait) {
                Ok(()) | Err(Error::Timeout) => {}
                Err(e) => tracing::error!(error = %e, "free semaphore wait failed"),
            }
            self.recycle();
        }
    }
}

/// The single writer of a topic
pub struct Publisher {
    config: PublisherConfig,
    name: String,
    topic: String,
    state: PublisherState,
    shared: Option<Arc<Shared>>,
    service: Option<JoinHandle<()>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::with_config(PublisherConfig::default())
    }

    pub fn with_config(config: PublisherConfig) -> Self {
        Self {
            config,
            name: String::new(),
            topic: String::new(),
            state: PublisherState::Uninitialized,
            shared: None,
            service: None,
        }
    }

    /// Create and initialize the topic's segment and semaphores.
    ///
    /// Fails if the topic already exists; use `cleanup` to remove what a crashed
    /// publisher left behind.
    pub fn init(&mut self, name: &str, topic: &str) -> Result<()> {
        match self.state {
            PublisherState::Uninitialized | PublisherState::Deinitialized => {}
            _ => return Err(Error::BadState("publisher already initialized")),
        }
        if topic.is_empty() {
            return Err(Error::BadArguments("empty topic".to_string()));
        }

        // dropping any of these on an error path unlinks it again
        let segment = RingSegment::create(topic)?;
        let free_sem = NamedSemaphore::create(&free_sem_name(topic), 0)?;
        let used_sems = (0..NUM_SUBSCRIBERS)
            .map(|i| NamedSemaphore::create(&used_sem_name(topic, i), 0))
            .collect::<Result<Vec<_>>>()?;

        let mem = segment.memory();
        mem.avail.init(&format!("{name}.avail"));
        mem.free.init(&format!("{name}.free"));
        for (i, slot) in mem.slots().iter().enumerate() {
            slot.ring().init(&format!("{name}.used{i}"));
        }
        for idx in 0..NUM_DESC as u16 {
            mem.avail.push(idx)?;
        }
        mem.stamp();
        mem.set_name(name);
        mem.set_status(MemoryStatus::Initialized);

        self.shared = Some(Arc::new(Shared {
            segment,
            free_sem,
            used_sems,
            subscribers: Mutex::new([false; NUM_SUBSCRIBERS]),
            in_flight: Mutex::new((0..NUM_DESC).map(|_| Vec::new()).collect()),
            running: AtomicBool::new(false),
            last_timestamp: AtomicU64::new(0),
        }));
        self.name = name.to_string();
        self.topic = topic.to_string();
        self.state = PublisherState::Initialized;
        tracing::info!(topic, name, "publisher initialized");
        Ok(())
    }

    /// Spawn the service thread
    pub fn start(&mut self) -> Result<()> {
        if self.state != PublisherState::Initialized {
            return Err(Error::BadState("publisher not initialized"));
        }
        let shared = self
            .shared
            .clone()
            .ok_or(Error::BadState("publisher not initialized"))?;

        shared.running.store(true, Ordering::Release);
        let free_wait = self.config.free_wait;
        let service = thread::Builder::new()
            .name("shmbus-publisher".to_string())
            .spawn({
                let shared = shared.clone();
                move || shared.service(free_wait)
            })
            .map_err(|e| {
                shared.running.store(false, Ordering::Release);
                Error::Fail(format!("spawn service thread: {e}"))
            })?;

        self.service = Some(service);
        self.state = PublisherState::Started;
        Ok(())
    }

    /// Publish one message to every registered subscriber.
    ///
    /// Returns the number of subscribers it was delivered to. A subscriber whose
    /// queue is full loses its oldest pending message instead of blocking the
    /// publisher.
    pub fn publish(&self, frames: Vec<PublishFrame>) -> Result<usize> {
        if frames.len() > MAX_DATA_FRAMES {
            return Err(Error::BadArguments(format!(
                "{} frames, at most {MAX_DATA_FRAMES} per message",
                frames.len()
            )));
        }
        let shared = self.started()?;
        let mem = shared.memory();

        let idx = mem
            .avail
            .pop()?
            .ok_or_else(|| Error::OutOfBound("no free descriptor, all in flight".to_string()))?;
        let desc = mem.desc(idx).ok_or_else(|| {
            tracing::error!(topic = %self.topic, idx, "avail ring holds invalid index");
            Error::OutOfBound(format!("descriptor index {idx} >= {NUM_DESC}"))
        })?;

        // held for the whole fan-out so no slot is reclaimed halfway
        let subs = lock(&shared.subscribers);
        let targets: Vec<usize> = (0..NUM_SUBSCRIBERS).filter(|&i| subs[i]).collect();
        if targets.is_empty() {
            mem.avail.push(idx)?;
            return Ok(0);
        }

        let entries: Vec<FrameEntry> = frames
            .iter()
            .map(|f| FrameEntry::new(f.buf, &f.info))
            .collect();
        if let Some(held) = lock(&shared.in_flight).get_mut(idx as usize) {
            *held = frames.into_iter().filter_map(|f| f.keep_alive).collect();
        }
        // Safety: `idx` came off avail, no subscriber holds it.
        unsafe { desc.fill(&entries, shared.next_timestamp()) };
        desc.set_ref_count(targets.len() as i32);

        for (n, &slot) in targets.iter().enumerate() {
            let ring = match mem.slot(slot) {
                Some(s) => s.ring(),
                None => continue,
            };
            match ring.push_bounded(idx, ring.queue_depth()) {
                Ok(Some(old)) => {
                    tracing::debug!(slot, idx = old, "queue full, dropping oldest");
                    shared.release(old);
                }
                Ok(None) => {
                    if let Err(e) = shared.used_sems[slot].post() {
                        tracing::warn!(slot, error = %e, "failed to signal subscriber");
                    }
                }
                Err(e) => {
                    tracing::error!(topic = %self.topic, slot, idx, error = %e, "fan-out failed");
                    for _ in n..targets.len() {
                        shared.release(idx);
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!(topic = %self.topic, idx, subscribers = targets.len(), "published desc");
        Ok(targets.len())
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .as_ref()
            .map_or(0, |s| lock(&s.subscribers).iter().filter(|&&b| b).count())
    }

    /// Block until at least `n` subscribers are registered
    pub fn wait_for_subscribers(&self, n: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        while self.subscriber_count() < n {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Error::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Stop the service thread
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            PublisherState::Started => {}
            PublisherState::Stopped => return Ok(()),
            _ => return Err(Error::BadState("publisher not started")),
        }
        if let Some(shared) = &self.shared {
            shared.running.store(false, Ordering::Release);
        }
        if let Some(handle) = self.service.take() {
            handle
                .join()
                .map_err(|_| Error::Fail("service thread panicked".to_string()))?;
        }
        self.state = PublisherState::Stopped;
        Ok(())
    }

    /// Mark the segment destroyed and remove every OS object of the topic
    pub fn deinit(&mut self) -> Result<()> {
        match self.state {
            PublisherState::Initialized | PublisherState::Stopped => {}
            _ => return Err(Error::BadState("publisher not stopped")),
        }
        if let Some(shared) = self.shared.take() {
            shared.memory().set_status(MemoryStatus::Destroyed);
            tracing::info!(topic = %self.topic, "publisher offline");
        }
        self.state = PublisherState::Deinitialized;
        Ok(())
    }

    /// Remove the segment and semaphores of `topic` left by a dead publisher
    pub fn cleanup(topic: &str) -> Result<()> {
        RingSegment::unlink(topic)?;
        NamedSemaphore::unlink(&free_sem_name(topic))?;
        for i in 0..NUM_SUBSCRIBERS {
            NamedSemaphore::unlink(&used_sem_name(topic, i))?;
        }
        Ok(())
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The topic's shared segment while initialized
    pub fn memory(&self) -> Option<&RingMemory> {
        self.shared.as_ref().map(|s| s.memory())
    }

    fn started(&self) -> Result<&Shared> {
        match (&self.state, &self.shared) {
            (PublisherState::Started, Some(shared)) => Ok(shared.as_ref()),
            _ => Err(Error::BadState("publisher not started")),
        }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.state == PublisherState::Started {
            if let Err(e) = self.stop() {
                tracing::error!(topic = %self.topic, error = %e, "stop on drop failed");
            }
        }
        if matches!(
            self.state,
            PublisherState::Initialized | PublisherState::Stopped
        ) {
            if let Err(e) = self.deinit() {
                tracing::error!(topic = %self.topic, error = %e, "deinit on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Allocator;

    fn topic(tag: &str) -> String {
        format!("/shmbus/unit/{tag}/{}", std::process::id())
    }

    #[test]
    fn test_init_builds_segment() {
        let topic = topic("init");
        let mut publisher = Publisher::new();
        publisher.init("pub", &topic).unwrap();

        let mem = publisher.memory().unwrap();
        assert_eq!(mem.status(), MemoryStatus::Initialized);
        assert!(mem.validate().is_ok());
        assert_eq!(mem.name(), "pub");
        assert_eq!(mem.avail.size(), NUM_DESC as u32);
        assert_eq!(mem.avail.name(), "pub.avail");
        assert_eq!(mem.slot(3).unwrap().ring().name(), "pub.used3");
        assert!(mem.free.is_empty());

        // the topic is taken until this publisher goes away
        assert!(Publisher::new().init("other", &topic).is_err());
        publisher.deinit().unwrap();
        drop(publisher);
        let mut again = Publisher::new();
        again.init("again", &topic).unwrap();
    }

    #[test]
    fn test_publish_without_subscribers_keeps_desc() {
        let mut publisher = Publisher::new();
        publisher.init("pub", &topic("nosub")).unwrap();
        let frame = || {
            PublishFrame::new(
                BufferRef::raw(Allocator::Shm, 1, 16),
                FrameInfo::default(),
            )
        };
        assert!(matches!(
            publisher.publish(vec![frame()]),
            Err(Error::BadState(_))
        ));

        publisher.start().unwrap();
        assert_eq!(publisher.publish(vec![frame()]).unwrap(), 0);
        assert_eq!(publisher.memory().unwrap().avail.size(), NUM_DESC as u32);

        let too_many = (0..MAX_DATA_FRAMES + 1).map(|_| frame()).collect();
        assert!(matches!(
            publisher.publish(too_many),
            Err(Error::BadArguments(_))
        ));
        publisher.stop().unwrap();
        publisher.deinit().unwrap();
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut publisher = Publisher::new();
        publisher.init("pub", &topic("ts")).unwrap();
        let shared = publisher.shared.clone().unwrap();
        let a = shared.next_timestamp();
        let b = shared.next_timestamp();
        let c = shared.next_timestamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_cleanup_missing_topic_is_ok() {
        Publisher::cleanup(&topic("never")).unwrap();
    }
}
