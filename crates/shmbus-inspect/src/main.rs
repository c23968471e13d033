//! Print the shared ring state of a topic without touching it

use clap::Parser;
use shmbus_core::{BufferRef, BufferType, Descriptor, Ring, RingSegment, NUM_DESC};
use std::fmt::Write;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "shmbus-inspect")]
#[command(about = "dump the rings and descriptors of a shmbus topic")]
struct Args {
    #[arg(short, long, help = "topic name, e.g. /sensor/camera/CAM0/raw")]
    topic: String,

    #[arg(short, long, help = "also dump every non-empty descriptor")]
    all: bool,
}

fn ring_text(label: &str, ring: &Ring) -> Option<String> {
    if ring.is_pristine() {
        return None;
    }
    let (r, w) = (ring.read_idx(), ring.write_idx());
    let slot = |i: u16| ring.slot(i as usize % NUM_DESC);
    let contents: Vec<String> = (0..NUM_DESC).map(|i| ring.slot(i).to_string()).collect();

    let mut out = String::new();
    let _ = writeln!(out, "{label} name: '{}'", ring.name());
    let _ = writeln!(out, "  lock: {:#x}", ring.lock_word());
    let _ = writeln!(
        out,
        "  queue depth: {}  size: {}",
        ring.queue_depth(),
        ring.size()
    );
    let _ = writeln!(
        out,
        "  read: {r:#06x} {} -> {}  write: {w:#06x} {} -> {}",
        r as usize % NUM_DESC,
        slot(r),
        w as usize % NUM_DESC,
        slot(w)
    );
    let _ = writeln!(out, "  ring: [{}]", contents.join(", "));
    Some(out)
}

fn buffer_text(buf: &BufferRef) -> String {
    match buf.buffer_type() {
        Some(BufferType::Raw) => "Raw".to_string(),
        Some(BufferType::Image) => {
            let img = &buf.image;
            let planes = (img.num_planes as usize).min(img.stride.len());
            format!(
                "Image format={} batch={} resolution={}x{} stride={:?} actual height={:?} plane size={:?}",
                img.format,
                img.batch_size,
                img.width,
                img.height,
                &img.stride[..planes],
                &img.actual_height[..planes],
                &img.plane_buf_size[..planes]
            )
        }
        Some(BufferType::Tensor) => format!(
            "Tensor type={} dims={:?}",
            buf.tensor.tensor_type,
            buf.tensor.dims()
        ),
        None => format!("unknown type {}", buf.buffer_type),
    }
}

fn desc_text(idx: usize, desc: &Descriptor) -> Option<String> {
    if desc.num_frames() == 0 && desc.timestamp() == 0 && desc.ref_count() == 0 {
        return None;
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "desc{idx}: frames {}  timestamp {}  ref {}",
        desc.num_frames(),
        desc.timestamp(),
        desc.ref_count()
    );
    for i in 0..desc.num_frames() {
        let Some(frame) = desc.frame(i) else { break };
        let buf = &frame.buf;
        let _ = writeln!(
            out,
            "   [{i}] name='{}' frame_id={} timestamp={} quant_scale={:.3} quant_offset={}",
            frame.name(),
            frame.frame_id,
            frame.timestamp,
            frame.quant_scale,
            frame.quant_offset
        );
        let _ = writeln!(
            out,
            "    handle={} size={} offset={} len={} pid={} usage={} flags={:#x} allocator={}",
            buf.dma_handle, buf.size, buf.offset, buf.len, buf.pid, buf.usage, buf.flags, buf.allocator
        );
        let _ = writeln!(out, "    {}", buffer_text(buf));
    }
    Some(out)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let segment = match RingSegment::open(&args.topic) {
        Ok(segment) => segment,
        Err(e) => {
            error!(topic = %args.topic, error = %e, "failed to open topic");
            return ExitCode::FAILURE;
        }
    };
    let mem = segment.memory();

    println!("topic: '{}' ({})", mem.name(), segment.name());
    println!("status: {:?}", mem.status());
    if let Err(e) = mem.validate() {
        println!("header: {e}");
    }

    let rings = [("avail".to_string(), &mem.avail), ("free".to_string(), &mem.free)];
    let used = mem
        .slots()
        .iter()
        .enumerate()
        .map(|(i, slot)| (format!("used{i}"), slot.ring()));
    for (label, ring) in rings.into_iter().chain(used) {
        if let Some(text) = ring_text(&label, ring) {
            print!("{text}");
        }
    }
    for (i, slot) in mem.slots().iter().enumerate() {
        if slot.is_claimed() {
            println!("slot{i}: claimed, status {:?}", slot.status());
        }
    }

    if args.all {
        for (i, desc) in mem.descs().iter().enumerate() {
            if let Some(text) = desc_text(i, desc) {
                print!("{text}");
            }
        }
    }
    ExitCode::SUCCESS
}
