//! 数据发布者 - 创建 topic 并周期性发布共享内存帧
//!
//! 先运行此程序，再运行一个或多个 subscriber。
//!
//! 使用方法:
//! ```bash
//! cargo run --example publisher
//! ```

use shmbus_core::buffer::shm_buffer_name;
use shmbus_core::shm::SharedMemory;
use shmbus_core::{FrameInfo, PublishFrame, Publisher, ShmBuffer};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TOPIC: &str = "/shmbus/demo/camera";
const POOL: &str = "shmbus_demo_pool";
const BUFFERS: u64 = 8;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // 清理上次异常退出留下的对象
    Publisher::cleanup(TOPIC)?;

    let mut publisher = Publisher::new();
    publisher.init("demo", TOPIC)?;
    publisher.start()?;
    println!("Publishing on {}. Press Ctrl+C to exit...", TOPIC);

    // 固定的 buffer 池，订阅者按 handle 缓存映射
    let mut buffers = Vec::new();
    for handle in 0..BUFFERS {
        SharedMemory::unlink(&shm_buffer_name(POOL, handle))?;
        buffers.push(Arc::new(ShmBuffer::alloc(POOL, handle, 4096)?));
    }

    let mut frame_id = 0u64;
    loop {
        let slot = &mut buffers[(frame_id % BUFFERS) as usize];
        // 仍被订阅者持有的 buffer 不能改写
        let Some(buf) = Arc::get_mut(slot) else {
            println!("frame {} skipped: buffer busy", frame_id);
            frame_id += 1;
            thread::sleep(Duration::from_millis(100));
            continue;
        };
        let text = format!("frame {}\0", frame_id);
        buf.as_mut_slice()[..text.len()].copy_from_slice(text.as_bytes());

        let info = FrameInfo {
            frame_id,
            name: "camera".to_string(),
            ..Default::default()
        };
        let frame = PublishFrame::new(slot.buffer_ref(), info).with_keep_alive(slot.clone());
        match publisher.publish(vec![frame]) {
            Ok(n) => println!("frame {} -> {} subscribers", frame_id, n),
            Err(e) => println!("frame {} dropped: {}", frame_id, e),
        }

        frame_id += 1;
        thread::sleep(Duration::from_millis(100));
    }
}
