//! 数据订阅者 - 订阅 topic 并读取共享内存帧
//!
//! 需要 publisher 正在运行（也可以先启动，会等待 publisher 上线）。
//!
//! 使用方法:
//! ```bash
//! cargo run --example subscriber
//! ```

use shmbus_core::{Error, ShmMapper, Subscriber};
use std::time::Duration;

const TOPIC: &str = "/shmbus/demo/camera";
const POOL: &str = "shmbus_demo_pool";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut sub = Subscriber::new(ShmMapper::new(POOL));
    sub.init("demo-subscriber", TOPIC, 2)?;
    sub.start()?;
    println!("Subscribed to {} on slot {:?}", TOPIC, sub.slot_id());

    for _ in 0..50 {
        let msg = match sub.receive(Duration::from_secs(1)) {
            Ok(msg) => msg,
            // 超时可重试
            Err(e) if e.is_recoverable() => continue,
            Err(Error::Fail(e)) => {
                println!("skipped message: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        for frame in msg.frames() {
            let data = frame.as_slice();
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            println!(
                "desc {} frame {} ({}): {}",
                msg.index(),
                frame.frame_id(),
                frame.name(),
                String::from_utf8_lossy(&data[..end])
            );
        }
        // msg 在这里 drop，描述符归还给 publisher
    }

    sub.stop()?;
    sub.deinit()?;
    Ok(())
}
