//! Buffered IPC primitives for worker communication.
//!
//! Provides line-based I/O over pipes with EINTR handling and optional
//! bounded waits for a response line.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<std::process::ChildStdin> for PipeFd {
    fn from(stdin: std::process::ChildStdin) -> Self {
        Self::new(OwnedFd::from(stdin))
    }
}

impl From<std::process::ChildStdout> for PipeFd {
    fn from(stdout: std::process::ChildStdout) -> Self {
        Self::new(OwnedFd::from(stdout))
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
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

/// Block until `fd` is readable or hung up, or `deadline` passes.
fn wait_readable(fd: &PipeFd, deadline: Instant) -> io::Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for worker output",
            ));
        }
        // PollTimeout tops out at u16 millis here; longer waits loop.
        let millis = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => continue,
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

/// Buffered line reader for IPC.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    bytes: Vec<u8>,
    line_buffer: String,
}

impl LineReader {
    /// Create a new line reader from a file descriptor.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            bytes: Vec::with_capacity(4096),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.read_line_timeout(None)
    }

    /// Read a line, giving up with `ErrorKind::TimedOut` once `timeout` elapses.
    ///
    /// A partial line at EOF is returned as a line. Returns `None` on EOF.
    pub fn read_line_timeout(&mut self, timeout: Option<Duration>) -> io::Result<Option<&str>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.bytes.clear();
        self.line_buffer.clear();

        loop {
            if let Some(deadline) = deadline
                && self.reader.buffer().is_empty()
            {
                wait_readable(self.reader.get_ref(), deadline)?;
            }

            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                break; // EOF
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.bytes.extend_from_slice(&available[..=pos]);
                    self.reader.consume(pos + 1);
                    break;
                }
                None => {
                    let len = available.len();
                    self.bytes.extend_from_slice(available);
                    self.reader.consume(len);
                }
            }
        }

        if self.bytes.is_empty() {
            return Ok(None);
        }

        let text = std::str::from_utf8(&self.bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.line_buffer.push_str(text);

        // Strip trailing newline
        if self.line_buffer.ends_with('\n') {
            self.line_buffer.pop();
        }
        if self.line_buffer.ends_with('\r') {
            self.line_buffer.pop();
        }
        Ok(Some(&self.line_buffer))
    }

    /// Read a line and return an owned string.
    /// Returns `None` on EOF.
    pub fn read_line_owned(&mut self) -> io::Result<Option<String>> {
        Ok(self.read_line()?.map(String::from))
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    /// Create a new line writer from a file descriptor.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    /// Write raw bytes and flush.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}
