use std::{
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, UdpSocket},
    time::{Duration, Instant},
};

use log::warn;

use super::error::PingError;

/// A connection owned by exactly one ping call.
pub trait Transport: Sized {
    fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self>;

    /// Sets both the read and the write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// A single read. May return fewer bytes than `buf` holds; `Ok(0)` means the peer is gone.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn read_exact(&mut self, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_some(buf)? {
                0 => return Err(ErrorKind::UnexpectedEof.into()),
                n => buf = &mut buf[n..],
            }
        }
        Ok(())
    }

    fn close(self) -> io::Result<()>;
}

/// Runs `drive` against `transport`, then closes it no matter how `drive` ended.
pub(crate) fn with_transport<T, R>(
    mut transport: T,
    drive: impl FnOnce(&mut T) -> Result<R, PingError>,
) -> Result<R, PingError>
where
    T: Transport,
{
    let outcome = drive(&mut transport);
    if let Err(e) = transport.close() {
        warn!("failed to close transport: {}", e);
    }
    outcome
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn close(self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl Transport for UdpTransport {
    /// Datagram sockets have no handshake, so `_timeout` is unused.
    fn connect(addr: SocketAddr, _timeout: Duration) -> io::Result<Self> {
        let local = match addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(addr)?;
        Ok(Self { socket })
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.socket.set_read_timeout(Some(timeout))?;
        self.socket.set_write_timeout(Some(timeout))
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(data)?;
        if sent != data.len() {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, data.len()),
            ));
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.socket.recv(buf) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn close(self) -> io::Result<()> {
        Ok(())
    }
}

/// Validates a timeout given in seconds.
pub fn timeout_from_secs(secs: f64) -> Result<Duration, PingError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(PingError::InvalidArgument(format!(
            "timeout must be a non-negative number of seconds, got {}",
            secs
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// The total time a single call may take, measured from its start.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in the budget, or `Timeout` once it is used up.
    pub fn remaining(&self, stage: &'static str) -> Result<Duration, PingError> {
        self.budget
            .checked_sub(self.elapsed())
            .filter(|left| !left.is_zero())
            .ok_or(PingError::Timeout(stage))
    }
}

/// [`Read`] adapter that re-checks the deadline before every read and narrows
/// the socket timeout to whatever budget is left.
pub(crate) struct TimedReader<'a, T: Transport> {
    transport: &'a mut T,
    deadline: Deadline,
}

impl<'a, T: Transport> TimedReader<'a, T> {
    pub(crate) fn new(transport: &'a mut T, deadline: Deadline) -> Self {
        Self {
            transport,
            deadline,
        }
    }
}

impl<'a, T: Transport> Read for TimedReader<'a, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self
            .deadline
            .remaining("read")
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "time budget exhausted"))?;
        self.transport.set_timeout(left)?;
        self.transport.read_some(buf)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use super::*;

    /// What a [`FakeTransport`] observed.
    #[derive(Debug, Default)]
    pub(crate) struct FakeLog {
        pub written: Vec<Vec<u8>>,
        pub reads: usize,
        pub closed: bool,
    }

    /// Replays scripted chunks, one chunk (or part of one) per read.
    pub(crate) struct FakeTransport {
        chunks: VecDeque<Vec<u8>>,
        delay: Option<Duration>,
        log: Rc<RefCell<FakeLog>>,
    }

    impl FakeTransport {
        pub(crate) fn new(chunks: Vec<Vec<u8>>) -> (Self, Rc<RefCell<FakeLog>>) {
            let log = Rc::new(RefCell::new(FakeLog::default()));
            let transport = Self {
                chunks: chunks.into(),
                delay: None,
                log: Rc::clone(&log),
            };
            (transport, log)
        }

        /// Makes every read take `delay`, like a slow peer.
        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    impl Transport for FakeTransport {
        fn connect(_addr: SocketAddr, _timeout: Duration) -> io::Result<Self> {
            Err(ErrorKind::ConnectionRefused.into())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.log.borrow_mut().written.push(data.to_vec());
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.log.borrow_mut().reads += 1;
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let mut chunk = match self.chunks.pop_front() {
                Some(chunk) => chunk,
                None => return Ok(0),
            };
            if chunk.len() > buf.len() {
                let rest = chunk.split_off(buf.len());
                self.chunks.push_front(rest);
            }
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }

        fn close(self) -> io::Result<()> {
            self.log.borrow_mut().closed = true;
            Ok(())
        }
    }
}
