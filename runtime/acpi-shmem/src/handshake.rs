//! Helper Handshake - acquire memory, interrupt and doorbell descriptors
//!
//! The helper sends three one-byte messages, each carrying exactly one
//! descriptor, in a fixed order. Any failure closes every descriptor
//! received so far, in the order they arrived, before the error is returned.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::stat::fstat;

use crate::channel::HelperChannel;
use crate::{Result, ShmemError, MAX_SIZE, MIN_SIZE};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitMemFd,
    AwaitIrqFd,
    AwaitDoorbellFd,
    Validate,
    Ready,
    Failed,
}

const RECEIVE_ORDER: [HandshakeState; 3] = [
    HandshakeState::AwaitMemFd,
    HandshakeState::AwaitIrqFd,
    HandshakeState::AwaitDoorbellFd,
];

/// Descriptor set produced by a successful handshake.
#[derive(Debug)]
pub struct SharedMemoryHandle {
    pub mem: OwnedFd,
    pub irq: OwnedFd,
    pub doorbell: OwnedFd,
    pub size: u64,
}

/// One run of the handshake over `channel`.
pub struct Handshake<'a, C: HelperChannel> {
    channel: &'a mut C,
    state: HandshakeState,
    fds: Vec<OwnedFd>,
}

impl<'a, C: HelperChannel> Handshake<'a, C> {
    pub fn new(channel: &'a mut C) -> Self {
        Self {
            channel,
            state: HandshakeState::Idle,
            fds: Vec::with_capacity(RECEIVE_ORDER.len()),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drive the handshake to `Ready` or `Failed`.
    ///
    /// Blocks on the channel. May only be run once.
    pub fn run(&mut self) -> Result<SharedMemoryHandle> {
        assert_eq!(self.state, HandshakeState::Idle, "handshake already ran");
        match self.receive_all() {
            Ok(handle) => {
                self.state = HandshakeState::Ready;
                log::debug!("helper handshake complete: {} bytes of shared memory", handle.size);
                Ok(handle)
            }
            Err(e) => {
                log::debug!("helper handshake failed in {:?}: {}", self.state, e);
                self.state = HandshakeState::Failed;
                self.close_all();
                Err(e)
            }
        }
    }

    fn receive_all(&mut self) -> Result<SharedMemoryHandle> {
        for state in RECEIVE_ORDER {
            self.state = state;
            let fd = self.recvmsg()?;
            log::debug!("{:?}: received fd {}", state, fd.as_raw_fd());
            self.fds.push(fd);
        }

        self.state = HandshakeState::Validate;
        let size = shared_memory_size(&self.fds[0])?;

        let mut fds = self.fds.drain(..);
        match (fds.next(), fds.next(), fds.next()) {
            (Some(mem), Some(irq), Some(doorbell)) => Ok(SharedMemoryHandle {
                mem,
                irq,
                doorbell,
                size,
            }),
            _ => unreachable!("three descriptors were collected"),
        }
    }

    fn recvmsg(&mut self) -> Result<OwnedFd> {
        let mut byte = 0u8;
        loop {
            match self.channel.recv_byte(&mut byte) {
                Ok(0) => return Err(ShmemError::HelperClosed),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ShmemError::Read(e)),
            }
        }
        self.channel.take_msgfd().ok_or(ShmemError::MissingDescriptor)
    }

    fn close_all(&mut self) {
        for fd in self.fds.drain(..) {
            log::debug!("closing fd {}", fd.as_raw_fd());
            drop(fd);
        }
    }
}

fn shared_memory_size(mem: &OwnedFd) -> Result<u64> {
    let stat = fstat(mem.as_raw_fd()).map_err(|e| ShmemError::Stat(io::Error::from(e)))?;
    let size = stat.st_size.max(0) as u64;
    if !(MIN_SIZE..=MAX_SIZE).contains(&size) {
        return Err(ShmemError::BadSize(size));
    }
    Ok(size)
}
