//! Control channel to the helper process

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use sendfd::RecvWithFd;

use crate::{Result, ShmemError};

/// Byte stream that can carry one descriptor per message.
pub trait HelperChannel {
    /// Read one data byte. `Ok(0)` means the peer closed the channel.
    fn recv_byte(&mut self, byte: &mut u8) -> io::Result<usize>;

    /// Take the descriptor that arrived with the last byte read, if any.
    fn take_msgfd(&mut self) -> Option<OwnedFd>;
}

/// [`HelperChannel`] over a connected Unix stream socket.
pub struct UnixHelperChannel {
    stream: UnixStream,
    msgfd: Option<OwnedFd>,
}

impl UnixHelperChannel {
    /// Connect to the helper listening at `path`.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|source| ShmemError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("connected to helper at {}", path.display());
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            msgfd: None,
        }
    }
}

impl HelperChannel for UnixHelperChannel {
    fn recv_byte(&mut self, byte: &mut u8) -> io::Result<usize> {
        let mut buf = [0u8; 1];
        let mut fds: [RawFd; 1] = [-1];
        let (n, nfds) = self.stream.recv_with_fd(&mut buf, &mut fds)?;

        // A descriptor not claimed after the previous read is closed here.
        self.msgfd = if nfds > 0 {
            // SAFETY: the kernel just installed this descriptor for us and
            // nothing else refers to it.
            Some(unsafe { OwnedFd::from_raw_fd(fds[0]) })
        } else {
            None
        };

        if n > 0 {
            *byte = buf[0];
        }
        Ok(n)
    }

    fn take_msgfd(&mut self) -> Option<OwnedFd> {
        self.msgfd.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendfd::SendWithFd;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_byte_with_descriptor() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (payload, _keep) = UnixStream::pair().unwrap();
        theirs.send_with_fd(&[7], &[payload.as_raw_fd()]).unwrap();

        let mut chan = UnixHelperChannel::from_stream(ours);
        let mut byte = 0;
        assert_eq!(chan.recv_byte(&mut byte).unwrap(), 1);
        assert_eq!(byte, 7);
        assert!(chan.take_msgfd().is_some());
        assert!(chan.take_msgfd().is_none());
    }

    #[test]
    fn test_byte_without_descriptor() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(&[1]).unwrap();

        let mut chan = UnixHelperChannel::from_stream(ours);
        let mut byte = 0;
        assert_eq!(chan.recv_byte(&mut byte).unwrap(), 1);
        assert!(chan.take_msgfd().is_none());
    }

    #[test]
    fn test_closed_peer_reads_zero() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);

        let mut chan = UnixHelperChannel::from_stream(ours);
        let mut byte = 0;
        assert_eq!(chan.recv_byte(&mut byte).unwrap(), 0);
    }

    #[test]
    fn test_connect_failure_names_path() {
        let err = UnixHelperChannel::connect(Path::new("/nonexistent/helper.sock"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/helper.sock"));
    }
}
