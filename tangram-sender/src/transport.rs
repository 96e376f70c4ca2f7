//! The framer: length-delimited packets over a byte stream.
//!
//! Uses the intermediate framing mode: the writer announces itself with a
//! one-off `0xee 0xee 0xee 0xee` marker, then every packet travels as a
//! 4-byte little-endian length followed by the payload. The server signals
//! transport-level failures as short packets whose 4-byte payload is a
//! signed negative error code.
//!
//! Connections can be tunnelled through a SOCKS5 [`Proxy`]; the framing on
//! top is identical either way.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::errors::InvocationError;

/// Default timeout for establishing a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(65);

/// A SOCKS5 proxy for the sender's connections.
#[derive(Clone, Debug)]
pub struct Proxy {
    addr: String,
    username: Option<String>,
    password: Option<String>,
}

impl Proxy {
    /// Tunnel through the SOCKS5 proxy at `addr`, unauthenticated.
    pub fn socks5(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), username: None, password: None }
    }

    /// Authenticate against the proxy with a username and password.
    pub fn with_login(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    async fn open(&self, target: &str) -> Result<TcpStream, InvocationError> {
        log::debug!("[sender] tunnelling to {target} through {}", self.addr);
        let tunnelled = if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            Socks5Stream::connect_with_password(
                self.addr.as_str(),
                target,
                user.as_str(),
                pass.as_str(),
            )
            .await
        } else {
            Socks5Stream::connect(self.addr.as_str(), target).await
        };
        let stream = tunnelled.map_err(|e| {
            InvocationError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e))
        })?;
        Ok(stream.into_inner())
    }
}

const INIT_MARKER: [u8; 4] = [0xee, 0xee, 0xee, 0xee];

/// Frames smaller than this many bytes carry an error code, not a payload.
const ERROR_SENTINEL_LEN: usize = 16;

/// Upper bound on a sane packet; anything larger means the stream is
/// desynchronized.
const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

/// Reading half of a framed connection. Owned by the receive loop.
pub struct FrameReader {
    stream: OwnedReadHalf,
}

/// Writing half of a framed connection. Shared behind the connection mutex.
pub struct FrameWriter {
    stream: OwnedWriteHalf,
}

/// Open a framed connection to `endpoint`, optionally through a SOCKS5
/// proxy, and send the framing marker.
pub async fn connect(
    endpoint: &str,
    proxy: Option<&Proxy>,
    timeout: Duration,
) -> Result<(FrameReader, FrameWriter), InvocationError> {
    let connect = async {
        let stream = match proxy {
            Some(proxy) => proxy.open(endpoint).await?,
            None => TcpStream::connect(endpoint).await?,
        };
        Ok::<TcpStream, InvocationError>(stream)
    };

    let mut stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| {
            InvocationError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connecting to {endpoint} timed out"),
            ))
        })??;

    stream.write_all(&INIT_MARKER).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((FrameReader { stream: read_half }, FrameWriter { stream: write_half }))
}

impl FrameReader {
    /// Read the next complete packet.
    ///
    /// Short frames (length < 16) are decoded as transport error codes and
    /// surfaced as [`InvocationError::Transport`].
    pub async fn read_packet(&mut self) -> Result<Vec<u8>, InvocationError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len == 0 {
            return Err(InvocationError::Framing("zero-length packet".into()));
        }
        if len < ERROR_SENTINEL_LEN {
            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await?;
            if body.len() < 4 {
                return Err(InvocationError::Framing(format!(
                    "error sentinel of {} bytes",
                    body.len()
                )));
            }
            let code = i32::from_le_bytes(body[..4].try_into().unwrap());
            return Err(InvocationError::Transport { code });
        }
        if len > MAX_PACKET_LEN {
            return Err(InvocationError::Framing(format!(
                "implausible packet length {len}"
            )));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok(body)
    }
}

impl FrameWriter {
    /// Write one packet with a length prefix.
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<(), InvocationError> {
        self.stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
        self.stream.write_all(data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, FrameReader, FrameWriter) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, (reader, writer)) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { connect(&addr.to_string(), None, CONNECT_TIMEOUT).await.unwrap() },
        );
        (peer, reader, writer)
    }

    #[tokio::test]
    async fn init_marker_then_length_prefixed_packets() {
        let (mut peer, _reader, mut writer) = pair().await;

        let mut marker = [0u8; 4];
        peer.read_exact(&mut marker).await.unwrap();
        assert_eq!(marker, INIT_MARKER);

        writer.write_packet(&[1; 20]).await.unwrap();
        let mut len = [0u8; 4];
        peer.read_exact(&mut len).await.unwrap();
        assert_eq!(u32::from_le_bytes(len), 20);
        let mut body = [0u8; 20];
        peer.read_exact(&mut body).await.unwrap();
        assert_eq!(body, [1; 20]);
    }

    #[tokio::test]
    async fn short_frame_surfaces_the_error_code() {
        let (mut peer, mut reader, _writer) = pair().await;

        let code: i32 = -404;
        peer.write_all(&4u32.to_le_bytes()).await.unwrap();
        peer.write_all(&code.to_le_bytes()).await.unwrap();

        match reader.read_packet().await {
            Err(InvocationError::Transport { code }) => assert_eq!(code, -404),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_and_giant_lengths_are_framing_errors() {
        let (mut peer, mut reader, _writer) = pair().await;

        peer.write_all(&0u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_packet().await,
            Err(InvocationError::Framing(_))
        ));

        peer.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_packet().await,
            Err(InvocationError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn round_trip_through_peer() {
        let (mut peer, mut reader, _writer) = pair().await;
        let mut marker = [0u8; 4];
        peer.read_exact(&mut marker).await.unwrap();

        let payload = vec![7u8; 64];
        peer.write_all(&(payload.len() as u32).to_le_bytes()).await.unwrap();
        peer.write_all(&payload).await.unwrap();
        assert_eq!(reader.read_packet().await.unwrap(), payload);
    }
}
