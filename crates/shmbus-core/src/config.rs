//! Runtime tunables for publishers and subscribers

use std::time::Duration;

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Messages the publisher may queue for this subscriber before dropping the oldest
    pub queue_depth: u32,
    /// How long `start` waits for the publisher to bring the segment online
    pub start_timeout: Duration,
    /// Retry interval while waiting for the segment
    pub poll_interval: Duration,
    /// Tick of the background liveness task
    pub liveness_interval: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            queue_depth: 2,
            start_timeout: Duration::from_secs(100),
            poll_interval: Duration::from_millis(1),
            liveness_interval: Duration::from_millis(10),
        }
    }
}

impl SubscriberConfig {
    pub fn with_queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }
}

/// Publisher settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Longest sleep of the service thread on the free semaphore; also bounds how
    /// fast subscribers joining or leaving are noticed
    pub free_wait: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            free_wait: Duration::from_millis(10),
        }
    }
}

impl PublisherConfig {
    pub fn with_free_wait(mut self, wait: Duration) -> Self {
        self.free_wait = wait;
        self
    }
}
