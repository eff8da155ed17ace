use std::path::PathBuf;
use std::{
    fmt,
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
    time::Duration,
};

use serialport::SerialPort;

/// An open link to an OTA target.
#[derive(Debug)]
pub enum Connection {
    Serial(Box<dyn SerialPort>),
    Tcp(TcpStream),
}

/// Describes an OTA target to connect to.
#[derive(Debug, clap::Subcommand)]
pub enum Connect {
    /// connect to a simulator at IP:PORT
    Tcp {
        /// IP address to connect to. This defaults to localhost.
        #[clap(long, default_value_t = Self::DEFAULT_IP)]
        ip: IpAddr,
        /// TCP port to connect to (usually 9999 for otasim)
        #[arg(default_value_t = Self::DEFAULT_TCP_PORT)]
        port: u16,
    },
    /// open the serial port at PATH
    Serial {
        /// path to the serial port device (usually /dev/ttyUSBx for hw)
        path: PathBuf,

        /// baud rate (usually 115200 for hw)
        #[arg(default_value_t = Self::DEFAULT_BAUD_RATE)]
        baud: u32,
    },
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Serial(s) => s.write(buf),
            Self::Tcp(t) => t.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Serial(s) => s.flush(),
            Self::Tcp(t) => t.flush(),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Serial(s) => s.read(buf),
            Self::Tcp(t) => t.read(buf),
        }
    }
}

impl Connect {
    pub const DEFAULT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    pub const DEFAULT_TCP_PORT: u16 = 9999;
    pub const DEFAULT_BAUD_RATE: u32 = 115200;
    /// Reads poll at this interval so the ack deadline can be checked.
    pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

    pub fn connect(&self) -> io::Result<Connection> {
        match *self {
            Self::Tcp { ip, port } => {
                let addr = SocketAddr::from((ip, port));
                let sock = TcpStream::connect(addr)?;
                sock.set_read_timeout(Some(Self::READ_TIMEOUT))?;
                sock.set_nodelay(true)?;
                Ok(Connection::Tcp(sock))
            }
            Self::Serial { ref path, baud } => {
                let path = path.to_str().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "path is not UTF-8")
                })?;
                let port = serialport::new(path, baud)
                    .timeout(Self::READ_TIMEOUT)
                    .open()?;
                Ok(Connection::Serial(port))
            }
        }
    }
}

impl fmt::Display for Connect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { ip, port } => write!(f, "{ip}:{port}"),
            Self::Serial { path, baud } => write!(f, "{} (@ {baud})", path.display()),
        }
    }
}
