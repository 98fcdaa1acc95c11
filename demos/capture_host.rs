// Minimal console host for the capture broker.
//
// Runs the broker on the well-known rendezvous socket and drives a
// CaptureSource at ~60 Hz with an importer that only logs what it would
// import. Useful for checking that a layered application connects, exports
// its texture and survives reconnects, without bringing up a GPU host.
//
// Run it, then start any Vulkan application with the capture layer enabled.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use vkcapture::{Broker, CaptureSource, TextureImporter, TextureInfo};

struct LoggingImporter {
    frames: u64,
}

impl TextureImporter for LoggingImporter {
    type Texture = ();

    fn import(&mut self, info: &TextureInfo, fds: &[BorrowedFd<'_>]) -> vkcapture::Result<()> {
        self.frames += 1;
        println!(
            "import #{}: {}x{} format {:#010x} modifier {:#x} ({} plane fd(s), first fd {})",
            self.frames,
            info.width,
            info.height,
            info.format,
            info.modifier,
            fds.len(),
            fds[0].as_raw_fd(),
        );
        Ok(())
    }

    fn release(&mut self, _texture: ()) {
        println!("released shared texture");
    }
}

fn main() -> vkcapture::Result<()> {
    env_logger::init();

    let broker = Broker::start()?;
    println!("broker listening on {}", vkcapture::SOCKET_PATH);

    let mut source = CaptureSource::new(&broker, LoggingImporter { frames: 0 });
    let mut last_report = Instant::now();
    loop {
        source.tick();

        if last_report.elapsed() >= Duration::from_secs(2) {
            last_report = Instant::now();
            broker.with_clients(|clients| {
                println!("{} client(s) connected", clients.len());
                for client in clients {
                    println!("  {} (buf {})", client.describe(), client.buf_id);
                }
            });
        }
        std::thread::sleep(Duration::from_millis(16));
    }
}
