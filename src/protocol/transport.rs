//! Byte transports carrying the transaction protocol.
//!
//! Production connections are TLS over TCP (rustls). Tests drive the same
//! protocol over plain loopback `TcpStream`s.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ServerConfig, ServerConnection, StreamOwned};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::TransportError;

/// A bidirectional byte stream with a configurable read timeout.
pub trait Transport: Read + Write + Send {
    /// Sets the timeout of subsequent reads. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Address of the remote peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// A second handle to the underlying socket, used to shut it down from another thread.
    fn socket_handle(&self) -> io::Result<TcpStream>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn socket_handle(&self) -> io::Result<TcpStream> {
        self.try_clone()
    }
}

impl Transport for StreamOwned<ServerConnection, TcpStream> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock.peer_addr()
    }

    fn socket_handle(&self) -> io::Result<TcpStream> {
        self.sock.try_clone()
    }
}

/// Closes both directions of a socket, waking any thread blocked on it.
pub fn shutdown_socket(socket: &TcpStream) {
    // The peer may already be gone.
    let _ = socket.shutdown(Shutdown::Both);
}

/// Loads the server certificate chain and private key (PEM) into a TLS config.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TransportError> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TransportError::Tls {
            message: format!("reading certificates from {}: {e}", cert_path.display()),
        })?;
    if certs.is_empty() {
        return Err(TransportError::Tls {
            message: format!("no certificates in {}", cert_path.display()),
        });
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| TransportError::Tls {
        message: format!("reading private key from {}: {e}", key_path.display()),
    })?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls { message: e.to_string() })?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls { message: e.to_string() })?;

    Ok(Arc::new(config))
}

/// Performs the server side of the TLS handshake on an accepted socket.
pub fn accept_tls(
    config: &Arc<ServerConfig>,
    mut socket: TcpStream,
    handshake_timeout: Duration,
) -> Result<StreamOwned<ServerConnection, TcpStream>, TransportError> {
    let mut conn = ServerConnection::new(Arc::clone(config)).map_err(|e| TransportError::Tls { message: e.to_string() })?;

    socket
        .set_read_timeout(Some(handshake_timeout))
        .map_err(|e| TransportError::io("set tls handshake timeout", e))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut socket).map_err(|e| TransportError::Tls {
            message: format!("handshake failed: {e}"),
        })?;
    }

    Ok(StreamOwned::new(conn, socket))
}
