//! TCP server for relaying raw byte streams between clients.
//!
//! Accepts connections, spawns one handler task per connection, and fans
//! received chunks out to the sender (echo) and/or all other clients
//! (broadcast) according to the configuration.

use crate::config::Config;
use crate::registry::{ClientHandle, ClientRegistry};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Maximum bytes received per read; chunks are forwarded as-is, unframed
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Pending-connection queue length for the listening socket
const LISTEN_BACKLOG: i32 = 5;

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<ClientRegistry>,
    listener: TcpListener,
}

impl Server {
    /// Bind and listen on the configured port, on all IPv4 addresses.
    ///
    /// Any failure here is fatal; the server cannot run without its
    /// listening socket.
    pub fn bind(config: Config) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let listener = TcpListener::from_std(socket.into())?;

        Ok(Server {
            config,
            registry: Arc::new(ClientRegistry::new()),
            listener,
        })
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until an accept error occurs.
    ///
    /// Each accepted connection is registered, then served by its own
    /// spawned task; the accept loop never waits on a connection. An accept
    /// error is fatal and ends the loop with the error.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!(
            port = self.config.port,
            echo = self.config.echo,
            broadcast = self.config.broadcast,
            "Server listening"
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(e.into());
                }
            };

            let (reader, writer) = stream.into_split();
            let handle = ClientHandle::new(self.registry.next_id(), addr, writer);
            self.registry.add(handle.clone());

            let registry = Arc::clone(&self.registry);
            let echo = self.config.echo;
            let broadcast = self.config.broadcast;

            tokio::spawn(async move {
                handle_connection(reader, handle, registry, echo, broadcast).await;
            });
        }
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}

/// Serve a single client connection until it disconnects.
///
/// Reads opaque chunks, mirrors them to stdout, and forwards them per the
/// echo/broadcast flags. All connection-level errors are handled here;
/// nothing propagates to the accept loop. Cleanup (registry removal and the
/// disconnect log line) runs exactly once, whichever way the loop exits.
async fn handle_connection(
    mut reader: OwnedReadHalf,
    handle: ClientHandle,
    registry: Arc<ClientRegistry>,
    echo: bool,
    broadcast: bool,
) {
    info!(peer = %handle.addr(), id = %handle.id(), "Client connected");

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(peer = %handle.addr(), "Connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, peer = %handle.addr(), "Receive failed");
                break;
            }
        };

        // One allocation shared by stdout, broadcast, and echo
        let payload = Bytes::copy_from_slice(&buf[..n]);

        mirror_to_stdout(&payload);

        if broadcast {
            // Snapshot first; the registry lock is never held while sending
            for peer in registry.snapshot() {
                if peer.id() == handle.id() {
                    continue;
                }
                if let Err(e) = peer.send(&payload).await {
                    // One dead peer must not stop the fan-out
                    warn!(error = %e, peer = %peer.addr(), "Broadcast send failed");
                }
            }
        }

        if echo {
            if let Err(e) = handle.send(&payload).await {
                // Echo failure means the sender itself is gone
                warn!(error = %e, peer = %handle.addr(), "Echo send failed");
                break;
            }
        }
    }

    registry.remove(handle.id());
    info!(peer = %handle.addr(), id = %handle.id(), "Client disconnected");
    // Dropping the read half here, and the write half once the last
    // snapshot reference is gone, closes the socket exactly once.
}

/// Mirror a received payload verbatim to stdout.
///
/// Stdout is an observability sink only; a write failure there must not
/// affect the connection.
fn mirror_to_stdout(payload: &[u8]) {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = stdout.write_all(payload).and_then(|_| stdout.flush()) {
        warn!(error = %e, "Failed to mirror payload to stdout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_test::assert_ok;

    fn test_config(echo: bool, broadcast: bool) -> Config {
        Config {
            port: 0, // ephemeral port for tests
            echo,
            broadcast,
            log_level: "info".to_string(),
        }
    }

    /// Bind on an ephemeral port, run the accept loop in the background,
    /// and return the address plus the shared registry.
    fn start_server(echo: bool, broadcast: bool) -> (SocketAddr, Arc<ClientRegistry>) {
        let server = Server::bind(test_config(echo, broadcast)).unwrap();
        let addr = server.local_addr().unwrap();
        let registry = Arc::clone(server.registry());
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, registry)
    }

    async fn connect(addr: SocketAddr, registry: &ClientRegistry) -> TcpStream {
        let expected = registry.len() + 1;
        let stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(registry, expected).await;
        stream
    }

    /// Poll until the registry reaches the expected size, so tests do not
    /// race the accept loop or disconnect cleanup.
    async fn wait_for_clients(registry: &ClientRegistry, expected: usize) {
        for _ in 0..100 {
            if registry.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "registry never reached {} clients (currently {})",
            expected,
            registry.len()
        );
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        assert_ok!(stream.read_exact(&mut buf).await);
        buf
    }

    /// Assert that nothing arrives on the stream within a grace period.
    async fn assert_silent(stream: &mut TcpStream) {
        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
        assert!(result.is_err(), "unexpected data: {:?}", &buf[..1]);
    }

    #[tokio::test]
    async fn test_echo_returns_payload_once() {
        let (addr, registry) = start_server(true, false);
        let mut client = connect(addr, &registry).await;

        assert_ok!(client.write_all(b"hi").await);
        assert_eq!(read_exactly(&mut client, 2).await, b"hi");

        // Exactly once: nothing further arrives
        assert_silent(&mut client).await;
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (addr, registry) = start_server(false, true);
        let mut a = connect(addr, &registry).await;
        let mut b = connect(addr, &registry).await;

        assert_ok!(a.write_all(b"yo").await);
        assert_eq!(read_exactly(&mut b, 2).await, b"yo");

        // No echo and no self-broadcast
        assert_silent(&mut a).await;
    }

    #[tokio::test]
    async fn test_broadcast_tolerates_dead_peer() {
        let (addr, registry) = start_server(false, true);
        let mut a = connect(addr, &registry).await;

        // Register a handle whose peer has already reset the connection, so
        // the fan-out hits a failing send before reaching the next peer.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let victim = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let (_victim_read, victim_write) = stream.into_split();
        socket2::SockRef::from(&victim)
            .set_linger(Some(Duration::from_secs(0)))
            .unwrap();
        drop(victim); // RST
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.add(ClientHandle::new(registry.next_id(), peer_addr, victim_write));

        let mut c = connect(addr, &registry).await;

        // The dead target is skipped over; the remaining peer still
        // receives, and the sender's own connection is unaffected.
        assert_ok!(a.write_all(b"ping").await);
        assert_eq!(read_exactly(&mut c, 4).await, b"ping");

        assert_ok!(a.write_all(b"pong").await);
        assert_eq!(read_exactly(&mut c, 4).await, b"pong");
        assert_silent(&mut a).await;
    }

    #[tokio::test]
    async fn test_no_flags_delivers_nothing() {
        let (addr, registry) = start_server(false, false);
        let mut a = connect(addr, &registry).await;
        let mut b = connect(addr, &registry).await;

        assert_ok!(a.write_all(b"data").await);
        assert_silent(&mut a).await;
        assert_silent(&mut b).await;

        // The connection stays healthy and writable afterwards
        assert_ok!(a.write_all(b"more").await);
    }

    #[tokio::test]
    async fn test_echo_and_broadcast_scenario() {
        let (addr, registry) = start_server(true, true);

        let mut a = connect(addr, &registry).await;
        assert_ok!(a.write_all(b"hi").await);
        assert_eq!(read_exactly(&mut a, 2).await, b"hi");

        let mut b = connect(addr, &registry).await;
        assert_ok!(a.write_all(b"yo").await);
        assert_eq!(read_exactly(&mut a, 2).await, b"yo");
        assert_eq!(read_exactly(&mut b, 2).await, b"yo");

        // B leaves; A keeps being served
        drop(b);
        wait_for_clients(&registry, 1).await;

        assert_ok!(a.write_all(b"again").await);
        assert_eq!(read_exactly(&mut a, 5).await, b"again");
    }

    #[tokio::test]
    async fn test_max_chunk_payload_uncorrupted() {
        let (addr, registry) = start_server(true, false);
        let mut client = connect(addr, &registry).await;

        let payload: Vec<u8> = (0..65535u32).map(|i| (i % 251) as u8).collect();
        assert_ok!(client.write_all(&payload).await);

        // The kernel may deliver this in several chunks; echo preserves
        // order and content regardless of chunking.
        assert_eq!(read_exactly(&mut client, payload.len()).await, payload);
    }

    #[tokio::test]
    async fn test_disconnect_removes_exactly_one_entry() {
        let (addr, registry) = start_server(true, false);
        let a = connect(addr, &registry).await;
        let _b = connect(addr, &registry).await;
        assert_eq!(registry.len(), 2);

        drop(a);
        wait_for_clients(&registry, 1).await;
    }

    #[tokio::test]
    async fn test_bind_on_taken_port_fails() {
        let (addr, _registry) = start_server(false, false);

        let config = Config {
            port: addr.port(),
            ..test_config(false, false)
        };
        assert!(Server::bind(config).is_err());
    }
}
