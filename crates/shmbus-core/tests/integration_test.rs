//! 跨进程集成测试
//!
//! 使用 fork() 创建真正独立的进程，验证订阅槽位抢占和零拷贝数据传递。

#[cfg(all(test, feature = "integration"))]
mod integration {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use std::thread;
    use std::time::Duration;

    use shmbus_core::{
        FrameInfo, PublishFrame, Publisher, ShmBuffer, ShmMapper, Subscriber, SubscriberConfig,
    };

    type ChildResult = Result<i32, Box<dyn std::error::Error>>;

    fn unique_topic(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/shmbus_it/{}/{}", tag, ts)
    }

    fn config() -> SubscriberConfig {
        SubscriberConfig::default().with_start_timeout(Duration::from_secs(5))
    }

    /// 子进程入口：不让 panic 逃逸到测试框架
    fn run_child(f: impl FnOnce() -> ChildResult) -> ! {
        let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(Ok(code)) => code,
            _ => 255,
        };
        std::process::exit(code);
    }

    fn exit_code(status: WaitStatus) -> Option<i32> {
        match status {
            WaitStatus::Exited(_, code) => Some(code),
            _ => None,
        }
    }

    /// 两个订阅进程同时启动，各自抢到不同的槽位
    #[test]
    fn test_two_processes_claim_distinct_slots() {
        let topic = unique_topic("claim");

        let mut children = Vec::new();
        for i in 0..2 {
            match unsafe { fork() }.unwrap() {
                ForkResult::Child => run_child(|| {
                    let mut sub = Subscriber::with_config(ShmMapper::new("unused"), config());
                    sub.init(&format!("sub{}", i), &topic, 2)?;
                    sub.start()?;
                    let slot = sub.slot_id().ok_or("no slot")?;
                    // 保持槽位，直到两个进程都完成抢占
                    thread::sleep(Duration::from_millis(500));
                    Ok(slot as i32)
                }),
                ForkResult::Parent { child } => children.push(child),
            }
        }

        // 父进程：子进程已在等待，再创建 topic
        let mut publisher = Publisher::new();
        publisher.init("pub", &topic).unwrap();

        let mut slots: Vec<i32> = children
            .into_iter()
            .map(|child| exit_code(waitpid(child, None).unwrap()).unwrap())
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1]);

        publisher.deinit().unwrap();
    }

    /// 发布进程写入共享内存 buffer，订阅进程零拷贝读取
    #[test]
    fn test_cross_process_frame_delivery() {
        let topic = unique_topic("data");
        let pool = unique_topic("pool").replace('/', "_");

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => run_child(|| {
                let mut sub = Subscriber::with_config(ShmMapper::new(&pool), config());
                sub.init("reader", &topic, 2)?;
                sub.start()?;
                let msg = sub.receive(Duration::from_secs(5))?;
                let frame = &msg.frames()[0];
                if &frame.as_slice()[..17] != b"Hello from parent" || frame.frame_id() != 42 {
                    return Ok(1);
                }
                drop(msg);
                sub.stop()?;
                sub.deinit()?;
                Ok(0)
            }),
            ForkResult::Parent { child } => {
                let mut publisher = Publisher::new();
                publisher.init("writer", &topic).unwrap();
                publisher.start().unwrap();
                publisher
                    .wait_for_subscribers(1, Duration::from_secs(5))
                    .unwrap();

                let mut buf = ShmBuffer::alloc(&pool, 0, 1024).unwrap();
                buf.as_mut_slice()[..17].copy_from_slice(b"Hello from parent");
                let info = FrameInfo {
                    frame_id: 42,
                    name: "greeting".to_string(),
                    ..Default::default()
                };
                let r = buf.buffer_ref();
                let delivered = publisher
                    .publish(vec![PublishFrame::new(r, info).with_keep_alive(std::sync::Arc::new(buf))])
                    .unwrap();
                assert_eq!(delivered, 1);

                let status = waitpid(child, None).unwrap();
                assert_eq!(exit_code(status), Some(0));

                // 子进程释放后描述符回到 avail
                let mem = publisher.memory().unwrap();
                let mut attempts = 0;
                while mem.avail.size() != shmbus_core::NUM_DESC as u32 {
                    attempts += 1;
                    assert!(attempts < 500, "descriptor was not recycled");
                    thread::sleep(Duration::from_millis(2));
                }

                publisher.stop().unwrap();
                publisher.deinit().unwrap();
            }
        }
    }
}
