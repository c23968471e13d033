//! shmbus - Zero-copy publish/subscribe of buffer handles over shared memory

pub mod buffer;
pub mod config;
pub mod dtype;
pub mod error;
pub mod guard;
pub mod layout;
pub mod mapper;
pub mod meta;
pub mod publisher;
pub mod ring;
pub mod segment;
pub mod semaphore;
pub mod shm;
pub mod spinlock;
pub mod storage;
pub mod subscriber;

pub use buffer::{MappedBuffer, ShmBuffer};
pub use config::{PublisherConfig, SubscriberConfig};
pub use dtype::TensorType;
pub use error::{Error, Result};
pub use guard::{FrameGuard, Message};
pub use layout::{MemoryStatus, RingMemory, SlotStatus, MAX_DATA_FRAMES, NUM_DESC, NUM_SUBSCRIBERS};
pub use mapper::{ImportedBuffer, MemoryMapper, ShmMapper};
pub use meta::{BufferRef, Descriptor, FrameEntry, FrameInfo, ImageProps, TensorProps};
pub use publisher::{PublishFrame, Publisher, PublisherState};
pub use ring::Ring;
pub use segment::{release_desc, Release, RingSegment};
pub use semaphore::NamedSemaphore;
pub use spinlock::SpinLock;
pub use storage::{Allocator, BufferType, BufferUsage};
pub use subscriber::{Subscriber, SubscriberState};
