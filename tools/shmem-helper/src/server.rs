//! Control connection and event loop

use std::io::Read;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{never, select, tick, unbounded, Receiver};
use nix::sys::eventfd::{EfdFlags, EventFd};
use sendfd::SendWithFd;
use vbattery::R_STATE;

use crate::region::SharedRegion;

#[derive(Debug, Clone, Copy, Default)]
pub struct ServeOptions {
    /// Interval of the simulated discharge, if any.
    pub tick: Option<Duration>,
    /// Charge drained per tick, in mAh.
    pub step: u32,
}

/// What happened during one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub rings: u64,
    pub ticks: u64,
}

enum Event {
    Ring(u64),
    Tick,
    Hangup,
}

/// Hand the descriptors over `stream`: memory, interrupt, doorbell.
fn send_descriptors(stream: &UnixStream, region: &SharedRegion, irq: &EventFd, doorbell: &EventFd) -> Result<()> {
    let fds = [
        ("memory", region.as_fd().as_raw_fd()),
        ("interrupt", irq.as_fd().as_raw_fd()),
        ("doorbell", doorbell.as_fd().as_raw_fd()),
    ];
    for (what, fd) in fds {
        stream
            .send_with_fd(&[0], &[fd])
            .with_context(|| format!("Failed to send {} descriptor", what))?;
        log::debug!("sent {} descriptor (fd {})", what, fd);
    }
    Ok(())
}

/// Blocks on the doorbell and forwards each read counter.
fn spawn_doorbell_reader(doorbell: Arc<EventFd>, stop: Arc<AtomicBool>) -> Receiver<u64> {
    let (tx, rx) = unbounded();
    thread::spawn(move || loop {
        let count = match doorbell.read() {
            Ok(count) => count,
            Err(e) => {
                log::warn!("doorbell read failed: {}", e);
                break;
            }
        };
        if stop.load(Ordering::Acquire) || tx.send(count).is_err() {
            break;
        }
    });
    rx
}

/// Signals once the VMM closes its end.
fn spawn_hangup_watch(mut stream: UnixStream) -> Receiver<()> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => log::debug!("ignoring {} bytes from the VMM", n),
            }
        }
        let _ = tx.send(());
    });
    rx
}

/// Accept one VMM connection and service it until it goes away.
pub fn serve(listener: &UnixListener, region: &mut SharedRegion, opts: ServeOptions) -> Result<Stats> {
    let (stream, _) = listener.accept().context("Failed to accept VMM connection")?;
    log::info!("VMM connected");

    let irq = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC).context("Failed to create interrupt eventfd")?;
    let doorbell = Arc::new(
        EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC).context("Failed to create doorbell eventfd")?,
    );
    send_descriptors(&stream, region, &irq, &doorbell)?;

    let stop = Arc::new(AtomicBool::new(false));
    let rings = spawn_doorbell_reader(doorbell.clone(), stop.clone());
    let hangup = spawn_hangup_watch(stream.try_clone().context("Failed to clone control socket")?);
    let ticker = opts.tick.map(tick).unwrap_or_else(never);

    let mut stats = Stats::default();
    loop {
        let event = select! {
            recv(rings) -> count => count.map(Event::Ring).unwrap_or(Event::Hangup),
            recv(ticker) -> _ => Event::Tick,
            recv(hangup) -> _ => Event::Hangup,
        };
        match event {
            Event::Ring(count) => {
                stats.rings += count;
                log::info!("doorbell rung ({}x), state register {:#x}", count, region.register(R_STATE));
            }
            Event::Tick => {
                let charge = region.discharge(opts.step);
                irq.write(1).context("Failed to raise interrupt")?;
                stats.ticks += 1;
                log::debug!("tick {}: charge_now {} mAh", stats.ticks, charge);
            }
            Event::Hangup => {
                log::info!("VMM disconnected");
                break;
            }
        }
    }

    // wake the reader so it sees the stop flag
    stop.store(true, Ordering::Release);
    let _ = doorbell.write(1);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use acpi_shmem::{Handshake, UnixHelperChannel};
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::fs::FileExt;
    use vbattery::{BatteryConfig, R_CHARGE_NOW};

    fn socket_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("shmem-helper-{}-{}.sock", name, std::process::id()))
    }

    #[test]
    fn test_handshake_and_tick() {
        let path = socket_path("tick");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let mut region = SharedRegion::create(0x1000).unwrap();
            region.seed(&BatteryConfig::default());
            let opts = ServeOptions {
                tick: Some(Duration::from_millis(5)),
                step: 100,
            };
            serve(&listener, &mut region, opts).unwrap()
        });

        let mut channel = UnixHelperChannel::connect(&path).unwrap();
        let handle = Handshake::new(&mut channel).run().unwrap();
        assert_eq!(handle.size, 0x1000);

        // blocks until the first tick raised the interrupt
        let mut counter = [0u8; 8];
        File::from(handle.irq).read_exact(&mut counter).unwrap();
        assert!(u64::from_ne_bytes(counter) >= 1);

        let mem = File::from(handle.mem);
        let mut charge = [0u8; 4];
        mem.read_exact_at(&mut charge, (R_CHARGE_NOW * 4) as u64).unwrap();
        assert!(u32::from_le_bytes(charge) < 1500);

        File::from(handle.doorbell).write_all(&1u64.to_ne_bytes()).unwrap();
        drop(channel);

        let stats = server.join().unwrap();
        assert!(stats.ticks >= 1);
        std::fs::remove_file(&path).unwrap();
    }
}
