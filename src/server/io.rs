//! Resumable non-blocking socket operations.
//!
//! Every operation makes one attempt (an interrupted call is retried on the
//! spot) and reports how far it got. `WouldBlock` is a status, not an error;
//! a peer that closed the connection is reported as `UnexpectedEof`.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use crate::http::buffer::Buffer;

/// Bytes appended to the input buffer per read.
pub const READ_CHUNK: usize = 1024;

const SENDFILE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    WouldBlock,
    Progress(usize),
}

/// A non-blocking stream with its last-activity timestamp.
#[derive(Debug)]
pub struct Socket<S> {
    stream: S,
    last_activity: Instant,
    max_per_call: Option<usize>,
}

impl<S: Read + Write + AsRawFd> Socket<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            last_activity: Instant::now(),
            max_per_call: None,
        }
    }

    /// Caps the bytes moved by a single call.
    pub fn set_max_per_call(&mut self, limit: Option<usize>) {
        self.max_per_call = limit.filter(|&n| n > 0);
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn limit(&self, n: usize) -> usize {
        self.max_per_call.map_or(n, |max| n.min(max))
    }

    /// Appends up to [`READ_CHUNK`] bytes to `buf`.
    pub fn read(&mut self, buf: &mut Buffer) -> io::Result<IoStatus> {
        let chunk = self.limit(READ_CHUNK);
        let start = buf.len();
        loop {
            let result = self.stream.read(buf.extend_zeroed(chunk));
            match result {
                Ok(0) => {
                    buf.truncate(start);
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(n) => {
                    buf.truncate(start + n);
                    self.touch();
                    return Ok(IoStatus::Progress(n));
                }
                Err(e) => {
                    buf.truncate(start);
                    match e.kind() {
                        io::ErrorKind::Interrupted => continue,
                        io::ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    /// Sends `data[*cursor..]`, advancing `cursor` by what was written.
    pub fn write(&mut self, data: &[u8], cursor: &mut usize) -> io::Result<IoStatus> {
        if *cursor >= data.len() {
            return Ok(IoStatus::Progress(0));
        }
        let end = *cursor + self.limit(data.len() - *cursor);
        loop {
            match self.stream.write(&data[*cursor..end]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    *cursor += n;
                    self.touch();
                    return Ok(IoStatus::Progress(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
                Err(e) => return Err(e),
            }
        }
    }

    /// Like [`Socket::write`] over the concatenation of `parts`.
    pub fn writev(&mut self, parts: &[&[u8]], cursor: &mut usize) -> io::Result<IoStatus> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if *cursor >= total {
            return Ok(IoStatus::Progress(0));
        }
        let mut budget = self.limit(total - *cursor);

        let mut skip = *cursor;
        let mut slices = Vec::with_capacity(parts.len());
        for part in parts {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            let take = (part.len() - skip).min(budget);
            slices.push(IoSlice::new(&part[skip..skip + take]));
            budget -= take;
            skip = 0;
            if budget == 0 {
                break;
            }
        }

        loop {
            match self.stream.write_vectored(&slices) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    *cursor += n;
                    self.touch();
                    return Ok(IoStatus::Progress(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends `file[*offset..end]` without copying through user space where
    /// the platform allows it.
    pub fn sendfile(&mut self, file: &File, offset: &mut u64, end: u64) -> io::Result<IoStatus> {
        if *offset >= end {
            return Ok(IoStatus::Progress(0));
        }
        let count = self.limit(((end - *offset) as usize).min(SENDFILE_CHUNK));
        loop {
            match self.send_file_once(file, *offset, count) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    *offset += n as u64;
                    self.touch();
                    return Ok(IoStatus::Progress(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn send_file_once(&mut self, file: &File, offset: u64, count: usize) -> io::Result<usize> {
        let mut off = offset as libc::off_t;
        // SAFETY: both descriptors stay open for the duration of the call and
        // `off` is a valid, exclusively borrowed offset.
        let sent = unsafe {
            libc::sendfile(self.stream.as_raw_fd(), file.as_raw_fd(), &mut off, count)
        };
        if sent < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(sent as usize)
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn send_file_once(&mut self, file: &File, offset: u64, count: usize) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut chunk = vec![0u8; count];
        let n = file.read_at(&mut chunk, offset)?;
        if n == 0 {
            return Ok(0);
        }
        self.stream.write(&chunk[..n])
    }

    /// Holds back partial segments until [`Socket::uncork`].
    pub fn cork(&self) -> io::Result<()> {
        self.set_cork(true)
    }

    pub fn uncork(&self) -> io::Result<()> {
        self.set_cork(false)
    }

    fn set_cork(&self, on: bool) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        let option = libc::TCP_CORK;
        #[cfg(not(target_os = "linux"))]
        let option = libc::TCP_NOPUSH;

        let value: libc::c_int = on.into();
        // SAFETY: `value` outlives the call and its size is passed alongside.
        let rc = unsafe {
            libc::setsockopt(
                self.stream.as_raw_fd(),
                libc::IPPROTO_TCP,
                option,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom};
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (Socket<UnixStream>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (Socket::new(a), b)
    }

    #[test]
    fn read_reports_would_block_then_eof() {
        let (mut sock, mut peer) = pair();
        let mut buf = Buffer::new();
        assert_eq!(sock.read(&mut buf).unwrap(), IoStatus::WouldBlock);

        peer.write_all(b"hello").unwrap();
        assert_eq!(sock.read(&mut buf).unwrap(), IoStatus::Progress(5));
        assert_eq!(buf.as_slice(), b"hello");

        drop(peer);
        let err = sock.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn writev_resumes_across_parts() {
        let (mut sock, mut peer) = pair();
        sock.set_max_per_call(Some(3));
        let parts: [&[u8]; 2] = [b"head", b"body"];
        let mut cursor = 0;
        while cursor < 8 {
            sock.writev(&parts, &mut cursor).unwrap();
        }
        let mut got = [0u8; 8];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"headbody");
    }

    #[test]
    fn sendfile_honours_range_end() {
        let (mut sock, mut peer) = pair();
        let path = std::env::temp_dir().join(format!("sentinel-io-{}", std::process::id()));
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(b"0123456789").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut offset = 2;
        while offset < 6 {
            sock.sendfile(&file, &mut offset, 6).unwrap();
        }
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"2345");
    }
}
