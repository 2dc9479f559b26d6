//! Dialing: destination resolution, TCP socket setup, and the hello
//! handshake that yields a ready [`TcpConnection`].
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::connection::{Connection, Reader, ServerInfo, TcpConnection};
use crate::constants::*;
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::native::protocol::{
    ClientPacketId, CompressionMethod, DBMS_TCP_PROTOCOL_VERSION, Feature, ServerPacketId,
};
use crate::settings::Settings;
use crate::{Error, Result};

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    inner: DestinationInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DestinationInner {
    SocketAddr(SocketAddr),
    HostPort(String, u16),
    Endpoint(String),
}

impl Destination {
    /// Resolve to socket addresses using [`tokio::net::lookup_host`].
    pub(crate) async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = match &self.inner {
            DestinationInner::SocketAddr(addr) => return Ok(vec![*addr]),
            DestinationInner::HostPort(host, port) => {
                tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map(|it| it.collect::<Vec<_>>())
            }
            DestinationInner::Endpoint(endpoint) => tokio::net::lookup_host(endpoint.as_str())
                .await
                .map(|it| it.collect::<Vec<_>>()),
        }
        .map_err(|e| Error::Protocol(format!("could not resolve {self}: {e}")))?;
        if addrs.is_empty() {
            return Err(Error::Protocol(format!("{self} resolved to no addresses")));
        }
        Ok(addrs)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            DestinationInner::SocketAddr(addr) => write!(f, "{addr}"),
            DestinationInner::HostPort(host, port) => write!(f, "{host}:{port}"),
            DestinationInner::Endpoint(endpoint) => write!(f, "{endpoint}"),
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination { inner: DestinationInner::SocketAddr(addr) }
    }
}

impl From<(&str, u16)> for Destination {
    fn from((host, port): (&str, u16)) -> Self {
        Destination { inner: DestinationInner::HostPort(host.to_string(), port) }
    }
}

impl From<(String, u16)> for Destination {
    fn from((host, port): (String, u16)) -> Self {
        Destination { inner: DestinationInner::HostPort(host, port) }
    }
}

impl From<&str> for Destination {
    fn from(endpoint: &str) -> Self {
        Destination { inner: DestinationInner::Endpoint(endpoint.to_string()) }
    }
}

impl From<String> for Destination {
    fn from(endpoint: String) -> Self {
        Destination { inner: DestinationInner::Endpoint(endpoint) }
    }
}

/// Newtype that keeps credentials out of logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl AsRef<str>) -> Self { Self(s.as_ref().to_string()) }

    #[must_use]
    pub fn get(&self) -> &str { &self.0 }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(*****)")
    }
}

impl<T: AsRef<str>> From<T> for Secret {
    fn from(s: T) -> Self { Self(s.as_ref().to_string()) }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub username:    String,
    pub password:    Secret,
    pub database:    String,
    pub compression: CompressionMethod,
    /// Connection-level settings sent with every query.
    pub settings:    Settings,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            username:    "default".into(),
            password:    Secret::default(),
            database:    "default".into(),
            compression: CompressionMethod::default(),
            settings:    Settings::default(),
        }
    }
}

/// Dial an endpoint, perform the hello handshake, and return a ready
/// connection.
pub async fn connect(
    destination: impl Into<Destination>,
    options: ConnectOptions,
) -> Result<TcpConnection> {
    let destination = destination.into();
    let addrs = destination.resolve().await?;
    let stream = connect_socket(&addrs).await?;
    let local_address = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, read_half);
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, write_half);

    let server = handshake(&mut reader, &mut writer, &options).await?;
    debug!(
        server = %server.name,
        revision = server.revision,
        timezone = ?server.timezone,
        "connected"
    );

    Ok(Connection::new(reader, writer, server, options.compression, options.settings)
        .with_local_address(local_address))
}

/// Connect the TCP socket with throughput-oriented options.
async fn connect_socket(addrs: &[SocketAddr]) -> Result<TcpStream> {
    let addr =
        addrs.first().ok_or_else(|| Error::Protocol("no address to connect to".into()))?;
    let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let socket =
        socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(TCP_READ_BUFFER_SIZE)?;
    socket.set_send_buffer_size(TCP_WRITE_BUFFER_SIZE)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEP_ALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEP_ALIVE_INTERVAL))
        .with_retries(TCP_KEEP_ALIVE_RETRIES);
    socket.set_tcp_keepalive(&keepalive)?;

    let sock_addr = socket2::SockAddr::from(*addr);
    socket.connect_timeout(&sock_addr, Duration::from_secs(TCP_CONNECT_TIMEOUT))?;
    trace!("connected socket for {addr}");

    let stream = std::net::TcpStream::from(socket);
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream)?)
}

async fn handshake<R: ClickHouseRead + 'static, W: ClickHouseWrite>(
    reader: &mut R,
    writer: &mut W,
    options: &ConnectOptions,
) -> Result<ServerInfo> {
    send_hello(writer, options).await?;
    writer.flush().await?;

    let packet = Reader::read_packet_id(reader).await?;
    let server = match packet {
        ServerPacketId::Hello => read_hello(reader).await?,
        ServerPacketId::Exception => {
            return Err(Reader::read_exception(reader).await?.into());
        }
        other => {
            return Err(Error::Protocol(format!(
                "unexpected packet {} during handshake, expected server hello",
                other.as_ref()
            )));
        }
    };

    if Feature::Addendum.is_supported(server.revision) {
        // Quota key addendum; empty unless configured per-query.
        writer.write_string("").await?;
        writer.flush().await?;
    }

    trace!("finished handshake");
    Ok(server)
}

async fn send_hello<W: ClickHouseWrite>(writer: &mut W, options: &ConnectOptions) -> Result<()> {
    writer.write_var_uint(ClientPacketId::Hello as u64).await?;
    writer.write_string(format!("{CLIENT_NAME} {}", env!("CARGO_PKG_VERSION"))).await?;
    writer.write_var_uint(VERSION_MAJOR).await?;
    writer.write_var_uint(VERSION_MINOR).await?;
    writer.write_var_uint(DBMS_TCP_PROTOCOL_VERSION).await?;
    writer.write_string(&options.database).await?;
    writer.write_string(&options.username).await?;
    writer.write_string(options.password.get()).await?;
    Ok(())
}

async fn read_hello<R: ClickHouseRead + 'static>(reader: &mut R) -> Result<ServerInfo> {
    let name = reader.read_utf8_string().await?;
    let major = reader.read_var_uint().await?;
    let minor = reader.read_var_uint().await?;
    // Negotiate down to what this client speaks.
    let revision = reader.read_var_uint().await?.min(DBMS_TCP_PROTOCOL_VERSION);

    let timezone = if Feature::ServerTimezone.is_supported(revision) {
        reader.read_utf8_string().await?.parse().ok()
    } else {
        None
    };
    let display_name = if Feature::ServerDisplayName.is_supported(revision) {
        reader.read_utf8_string().await?
    } else {
        String::new()
    };
    let patch = if Feature::VersionPatch.is_supported(revision) {
        reader.read_var_uint().await?
    } else {
        revision
    };
    if Feature::PasswordComplexityRules.is_supported(revision) {
        let rules = reader.read_var_uint().await?;
        for _ in 0..rules {
            let _rule = reader.read_utf8_string().await?;
        }
    }
    if Feature::InterserverSecretV2.is_supported(revision) {
        let _nonce = reader.read_var_uint().await?;
    }

    Ok(ServerInfo { name, display_name, major, minor, patch, revision, timezone })
}
