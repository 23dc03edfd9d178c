//! Byte-stream endpoints the broker speaks over.
//!
//! Platform-specific implementations:
//! - **Stdio**: the process's own stdin/stdout pair
//! - **Named**: filesystem Unix socket bound by the parent
//! - **Abstract**: Linux abstract namespace socket (no filesystem entry)
//!
//! The parent owns the listener in every socket case; the worker only connects.

use std::io;
#[cfg(unix)]
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(unix)]
use tokio::net::UnixStream;

/// Where the worker finds its message channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportInfo {
    #[default]
    Stdio,
    #[cfg(unix)]
    Named { path: PathBuf },
    #[cfg(target_os = "linux")]
    Abstract { name: String },
}

impl std::fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            #[cfg(unix)]
            Self::Named { path } => write!(f, "named socket {}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => write!(f, "abstract socket @{}", name),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open duplex channel, split into one reader and one writer.
///
/// The broker takes both halves; nothing else touches them afterwards.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    label: String,
}

impl Transport {
    pub fn from_split<R, W>(reader: R, writer: W, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            label: label.into(),
        }
    }

    pub fn stdio() -> Self {
        Self::from_split(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }

    #[cfg(unix)]
    pub fn from_unix_stream(stream: UnixStream, label: impl Into<String>) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_split(reader, writer, label)
    }

    /// Connect to a filesystem socket the parent is listening on.
    #[cfg(unix)]
    pub async fn connect_named(path: &std::path::Path) -> io::Result<Self> {
        tracing::trace!(path = %path.display(), "Connecting to socket");
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_unix_stream(
            stream,
            format!("named socket {}", path.display()),
        ))
    }

    /// Connect to an abstract namespace socket (Linux only).
    #[cfg(target_os = "linux")]
    pub fn connect_abstract(name: &str) -> io::Result<Self> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::SocketAddr;

        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        tracing::trace!(name = %name, "Connecting to abstract socket");

        // tokio doesn't support abstract sockets directly
        let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;

        Ok(Self::from_unix_stream(
            stream,
            format!("abstract socket @{}", name),
        ))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

pub async fn connect_transport(info: &TransportInfo) -> io::Result<Transport> {
    tracing::debug!(transport = %info, "Opening transport");
    match info {
        TransportInfo::Stdio => Ok(Transport::stdio()),
        #[cfg(unix)]
        TransportInfo::Named { path } => Transport::connect_named(path).await,
        #[cfg(target_os = "linux")]
        TransportInfo::Abstract { name } => Transport::connect_abstract(name),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn default_transport_is_stdio() {
        assert_eq!(TransportInfo::default(), TransportInfo::Stdio);
        let json = serde_json::to_string(&TransportInfo::Stdio).unwrap();
        assert_eq!(json, r#"{"kind":"stdio"}"#);
    }

    #[cfg(unix)]
    #[test]
    fn named_info_roundtrips() {
        let info: TransportInfo =
            serde_json::from_str(r#"{"kind":"named","path":"/tmp/buildlet-1.sock"}"#).unwrap();
        assert_eq!(
            info,
            TransportInfo::Named {
                path: PathBuf::from("/tmp/buildlet-1.sock")
            }
        );
        assert_eq!(info.to_string(), "named socket /tmp/buildlet-1.sock");
    }

    #[tokio::test]
    async fn split_halves_carry_bytes() {
        let (ours, theirs) = tokio::io::duplex(64);
        let (their_read, their_write) = tokio::io::split(theirs);
        let transport = Transport::from_split(their_read, their_write, "memory");
        assert_eq!(transport.label(), "memory");

        let (mut reader, mut writer) = transport.into_split();
        let (mut our_read, mut our_write) = tokio::io::split(ours);

        our_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        writer.write_all(b"pong").await.unwrap();
        our_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connects_to_named_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let info = TransportInfo::Named { path: path.clone() };
        let (transport, accepted) = tokio::join!(connect_transport(&info), listener.accept());
        let transport = transport.unwrap();
        let (mut parent, _) = accepted.unwrap();

        let (_reader, mut writer) = transport.into_split();
        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 5];
        parent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_named_socket_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let info = TransportInfo::Named {
            path: dir.path().join("absent.sock"),
        };
        assert!(connect_transport(&info).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn connects_to_abstract_socket() {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

        let name = format!("buildlet-test-{}", std::process::id());
        let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let std_listener = StdUnixListener::bind_addr(&addr).unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let listener = tokio::net::UnixListener::from_std(std_listener).unwrap();

        let transport = connect_transport(&TransportInfo::Abstract { name: name.clone() })
            .await
            .unwrap();
        assert_eq!(transport.label(), format!("abstract socket @{}", name));

        let (mut parent, _) = listener.accept().await.unwrap();
        parent.write_all(b"ok").await.unwrap();

        let (mut reader, _writer) = transport.into_split();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
