use std::{
  io,
  net::SocketAddr,
  path::PathBuf,
  pin::Pin,
  task::{Context, Poll},
};

use bytes::Bytes;
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, BufStream, ReadBuf},
  net::{TcpStream, UnixStream},
};

#[cfg(feature = "ssl")]
use openssl::ssl::SslConnector;
#[cfg(feature = "ssl")]
use tokio::io::AsyncWriteExt;
#[cfg(feature = "ssl")]
use tokio_openssl::SslStream;

#[cfg(feature = "ssl")]
const SSL_HANDSHAKE_CODE: i32 = 80877103;

// Backend frames are small (one CopyData per wal message); anything past
// this is a corrupt length prefix, not a real message.
const MAX_PACKET_LEN: usize = 1 << 30;

/// The socket under a connection. Reads go through a `BufStream`, and bytes
/// are only pulled off the wire when someone asks for a packet.
#[derive(Debug)]
pub enum Stream {
  Tcp(BufStream<TcpStream>),

  Unix(BufStream<UnixStream>),

  #[cfg(feature = "ssl")]
  Ssl(SslStream<BufStream<TcpStream>>),
}

impl Stream {
  pub async fn connect_tcp(addrs: impl Into<Vec<SocketAddr>>) -> io::Result<Self> {
    let addrs = addrs.into();
    let stream = TcpStream::connect(addrs.as_slice()).await.map(BufStream::new)?;
    Ok(Self::Tcp(stream))
  }

  pub async fn connect_unix(path: impl Into<PathBuf>) -> io::Result<Self> {
    let stream = UnixStream::connect(path.into()).await.map(BufStream::new)?;
    Ok(Self::Unix(stream))
  }

  #[cfg(feature = "ssl")]
  pub async fn connect_ssl(
    addrs: impl Into<Vec<SocketAddr>>,
    domain: impl Into<String>,
    ssl_connector: SslConnector,
  ) -> io::Result<Self> {
    let addrs = addrs.into();
    let domain = domain.into();
    let mut stream = TcpStream::connect(addrs.as_slice()).await.map(BufStream::new)?;

    // https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-SSL
    stream.write_i32(8).await?;
    stream.write_i32(SSL_HANDSHAKE_CODE).await?;
    stream.flush().await?;

    match stream.read_u8().await? {
      b'S' => {
        let ssl = ssl_connector
          .configure()
          .and_then(|c| c.into_ssl(domain.as_str()))
          .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

        let mut ssl_stream =
          SslStream::new(ssl, stream).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

        Pin::new(&mut ssl_stream)
          .connect()
          .await
          .map_err(|err| io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string()))?;

        Ok(Self::Ssl(ssl_stream))
      }
      b'N' => Err(io::Error::new(io::ErrorKind::ConnectionReset, "SSL not available")),
      code => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected response to SSLRequest: {:?}", char::from(code)),
      )),
    }
  }

  /// One backend message: tag byte, then the body announced by the length
  /// prefix, read in full.
  pub async fn read_packet(&mut self) -> io::Result<(u8, Bytes)> {
    let op = self.read_u8().await?;
    let len = self.read_i32().await?;
    let len: usize = len
      .checked_sub(4)
      .and_then(|v| usize::try_from(v).ok())
      .filter(|v| *v <= MAX_PACKET_LEN)
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("invalid packet length {}", len)))?;

    let mut buffer = vec![0; len];
    self.read_exact(&mut buffer).await?;
    Ok((op, Bytes::from(buffer)))
  }
}

impl AsyncRead for Stream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
      #[cfg(feature = "ssl")]
      Stream::Ssl(s) => Pin::new(s).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Stream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
      #[cfg(feature = "ssl")]
      Stream::Ssl(s) => Pin::new(s).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
      Stream::Unix(s) => Pin::new(s).poll_flush(cx),
      #[cfg(feature = "ssl")]
      Stream::Ssl(s) => Pin::new(s).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
      #[cfg(feature = "ssl")]
      Stream::Ssl(s) => Pin::new(s).poll_shutdown(cx),
    }
  }
}
