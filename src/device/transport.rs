//! Line-oriented transports carrying the drive's wire protocol.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, trace};

/// Serial line rate of the AXA Remote.
pub const BAUD_RATE: u32 = 19_200;

/// Default TCP port of serial-to-network bridges (ser2net and friends).
pub const DEFAULT_TELNET_PORT: u16 = 23;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_REPLY_READS: usize = 4;

/// Byte-level access to the drive. A transport carries single-line commands
/// and single-line replies; protocol interpretation lives in the driver.
pub trait Transport: Send {
    /// Open the underlying connection.
    fn open(&mut self) -> io::Result<()>;

    /// Close the underlying connection, dropping any buffered data.
    fn close(&mut self);

    /// True when the connection is currently open.
    fn is_open(&self) -> bool;

    /// Send one command line and read one reply line.
    fn exchange(&mut self, command: &str) -> io::Result<String>;

    /// Human-readable endpoint, also used as the stable unique id.
    fn describe(&self) -> String;
}

impl Transport for Box<dyn Transport> {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn exchange(&mut self, command: &str) -> io::Result<String> {
        (**self).exchange(command)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not open")
}

/// Read one non-empty reply line, skipping blank lines and command echo
/// artifacts. EOF means the peer went away.
fn read_reply<R: BufRead>(reader: &mut R) -> io::Result<String> {
    for _ in 0..MAX_REPLY_READS {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed by peer",
            ));
        }
        let line = line.trim();
        if !line.is_empty() {
            trace!("<- {line}");
            return Ok(line.to_string());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no reply line received",
    ))
}

fn write_command<W: Write>(writer: &mut W, command: &str) -> io::Result<()> {
    trace!("-> {command}");
    // A leading newline flushes any stale input the drive may still hold.
    writer.write_all(format!("\r\n{command}\r\n").as_bytes())?;
    writer.flush()
}

/// Direct serial connection to the drive.
pub struct SerialTransport {
    path: String,
    reader: Option<BufReader<Box<dyn serialport::SerialPort>>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reader: None,
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> io::Result<()> {
        let port = serialport::new(&self.path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::Two)
            .timeout(REPLY_TIMEOUT)
            .open()
            .map_err(io::Error::other)?;
        debug!("serial port {} opened", self.path);
        self.reader = Some(BufReader::new(port));
        Ok(())
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!("serial port {} closed", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    fn exchange(&mut self, command: &str) -> io::Result<String> {
        let reader = self.reader.as_mut().ok_or_else(not_open)?;
        write_command(reader.get_mut(), command)?;
        read_reply(reader)
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Serial-to-network bridge connection (raw TCP, telnet style).
pub struct TelnetTransport {
    host: String,
    port: u16,
    stream: Option<BufReader<TcpStream>>,
}

impl TelnetTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }
}

impl Transport for TelnetTransport {
    fn open(&mut self) -> io::Result<()> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} did not resolve", self.host),
                )
            })?;
        let stream = TcpStream::connect_timeout(&addr, REPLY_TIMEOUT)?;
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        stream.set_write_timeout(Some(REPLY_TIMEOUT))?;
        stream.set_nodelay(true)?;
        debug!("telnet connection to {} established", self.describe());
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("telnet connection to {} closed", self.describe());
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn exchange(&mut self, command: &str) -> io::Result<String> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        write_command(stream.get_mut(), command)?;
        read_reply(stream)
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// One-shot echo peer: answers every received line with a canned reply.
    fn spawn_peer(replies: Vec<&'static str>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut received = Vec::new();
            for reply in replies {
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 {
                        return received;
                    }
                    let line = line.trim();
                    if !line.is_empty() {
                        received.push(line.to_string());
                        break;
                    }
                }
                writer.write_all(format!("{reply}\r\n").as_bytes()).unwrap();
            }
            received
        });
        (port, handle)
    }

    #[test]
    fn test_telnet_exchange_round_trip() {
        let (port, peer) = spawn_peer(vec!["260 RV2900", "211 OK"]);
        let mut transport = TelnetTransport::new("127.0.0.1", port);
        transport.open().unwrap();
        assert!(transport.is_open());

        assert_eq!(transport.exchange("DEVICE").unwrap(), "260 RV2900");
        assert_eq!(transport.exchange("OPEN").unwrap(), "211 OK");

        transport.close();
        assert!(!transport.is_open());
        assert_eq!(peer.join().unwrap(), vec!["DEVICE", "OPEN"]);
    }

    #[test]
    fn test_exchange_before_open_fails() {
        let mut transport = TelnetTransport::new("127.0.0.1", 1);
        let err = transport.exchange("STATUS").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_exchange_after_peer_closes_fails() {
        let (port, peer) = spawn_peer(vec!["260 RV2900"]);
        let mut transport = TelnetTransport::new("127.0.0.1", port);
        transport.open().unwrap();
        transport.exchange("DEVICE").unwrap();
        peer.join().unwrap();

        assert!(transport.exchange("STATUS").is_err());
    }

    #[test]
    fn test_describe_endpoints() {
        assert_eq!(
            TelnetTransport::new("10.0.0.30", 23).describe(),
            "10.0.0.30:23"
        );
        assert_eq!(
            SerialTransport::new("/dev/ttyUSB0").describe(),
            "/dev/ttyUSB0"
        );
    }

    #[test]
    fn test_boxed_transport_delegates() {
        let (port, _peer) = spawn_peer(vec!["210 Unlocked"]);
        let mut transport: Box<dyn Transport> =
            Box::new(TelnetTransport::new("127.0.0.1", port));
        transport.open().unwrap();
        assert_eq!(transport.exchange("STATUS").unwrap(), "210 Unlocked");
        assert_eq!(transport.describe(), format!("127.0.0.1:{port}"));
    }
}
