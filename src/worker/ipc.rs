//! Framed IPC primitives for worker communication.
//!
//! Every message is a 4-byte little-endian length followed by that many
//! payload bytes. Reads are unbuffered so that a readiness poll on the
//! descriptor always reflects unread frames; writes are buffered and flushed
//! once per frame.

use std::io::{self, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Default buffer size for the write side (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Size of the length prefix.
const HEADER_LEN: usize = 4;

/// Largest payload accepted from a peer (256 MiB).
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create a unidirectional pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec. Forked workers still inherit them; programs
/// the caller executes do not.
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_fd, write_fd) = raw_pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok((PipeFd::new(read_fd), PipeFd::new(write_fd)))
}

#[cfg(target_os = "linux")]
fn raw_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(not(target_os = "linux"))]
fn raw_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    let (read_fd, write_fd) = nix::unistd::pipe()?;
    for fd in [&read_fd, &write_fd] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read_fd, write_fd))
}

/// Reads length-prefixed frames.
#[derive(Debug)]
pub struct FrameReader {
    fd: PipeFd,
}

impl FrameReader {
    pub fn new(fd: PipeFd) -> Self {
        Self { fd }
    }

    /// Read one frame.
    ///
    /// Returns `None` on end-of-stream at a frame boundary. End-of-stream in
    /// the middle of a frame is an `UnexpectedEof` error.
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.fd.read(&mut header[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a frame header",
                    ));
                }
                n => filled += n,
            }
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
            ));
        }

        let mut payload = vec![0u8; len];
        self.fd.read_exact(&mut payload)?;
        Ok(Some(payload))
    }
}

impl AsFd for FrameReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Writes length-prefixed frames.
#[derive(Debug)]
pub struct FrameWriter {
    writer: BufWriter<PipeFd>,
}

impl FrameWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write one frame and flush it.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds limit of {}",
                    payload.len(),
                    MAX_FRAME_LEN
                ),
            ));
        }
        self.writer
            .write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.flush()
    }
}

impl AsFd for FrameWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.writer.get_ref().as_fd()
    }
}
