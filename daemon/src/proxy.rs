//! The transparent TCP proxy.
//!
//! Redirected connections land here. The proxy recovers where each one was
//! originally headed, opens that destination through the SOCKS5 tunnel into
//! the cluster, and splices bytes both ways until both directions hit EOF.

use anyhow::{Context as _, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Per-direction splice buffer.
const COPY_BUFFER: usize = 64 * 1024;

/// How the proxy learns where a redirected connection was headed.
pub trait DestinationResolver: Send + Sync + 'static {
    fn destination(
        &self,
        conn: &TcpStream,
        peer: SocketAddr,
    ) -> nat_redirect::Result<(Ipv4Addr, String)>;
}

impl DestinationResolver for nat_redirect::Translator {
    fn destination(
        &self,
        conn: &TcpStream,
        peer: SocketAddr,
    ) -> nat_redirect::Result<(Ipv4Addr, String)> {
        self.original_dst(conn, peer)
    }
}

pub struct Proxy<R> {
    listener: TcpListener,
    resolver: Arc<R>,
    socks: SocketAddr,
    slots: Arc<Semaphore>,
}

impl<R: DestinationResolver> Proxy<R> {
    /// Binds the fixed port the NAT rules redirect TCP flows to, after
    /// raising the fd limit: every intercepted connection costs two sockets.
    pub async fn bind(
        port: u16,
        limit: usize,
        socks: SocketAddr,
        resolver: Arc<R>,
    ) -> Result<Self> {
        raise_fd_limit();

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("failed to bind proxy listener on port {port}"))?;

        Ok(Self {
            listener,
            resolver,
            socks,
            slots: Arc::new(Semaphore::new(limit)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            // A slot is held from before accept until both splice directions
            // have finished, so `limit` bounds live connections exactly.
            let slot = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .context("connection semaphore closed")?;

            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("failed to accept intercepted connection: {e}");
                    continue;
                }
            };

            let resolver = self.resolver.clone();
            let socks = self.socks;
            tokio::spawn(async move {
                handle(conn, peer, resolver, socks).await;
                drop(slot);
            });
        }
    }
}

async fn handle<R: DestinationResolver>(
    conn: TcpStream,
    peer: SocketAddr,
    resolver: Arc<R>,
    socks: SocketAddr,
) {
    let (ip, target) = match resolver.destination(&conn, peer) {
        Ok(destination) => destination,
        Err(e) => {
            tracing::info!(%peer, "dropping connection with unknown destination: {e}");
            return;
        }
    };

    tracing::debug!(%peer, %ip, %target, "tunneling intercepted connection");

    let upstream = match socks_connect(socks, &target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::info!(%target, "tunnel dial failed: {e:#}");
            return;
        }
    };

    splice(conn, upstream).await;
}

/// Two independent copy loops; finishing one direction half-closes it and
/// leaves the other to run to its own EOF. Both sockets close fully when the
/// join completes and the halves drop.
async fn splice(client: TcpStream, upstream: TcpStream) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let up = tokio::spawn(copy_half(client_read, upstream_write, "to-cluster"));
    let down = tokio::spawn(copy_half(upstream_read, client_write, "from-cluster"));

    let _ = tokio::join!(up, down);
}

async fn copy_half(mut from: OwnedReadHalf, mut to: OwnedWriteHalf, direction: &'static str) {
    let mut buffer = vec![0u8; COPY_BUFFER];

    loop {
        match from.read(&mut buffer).await {
            // EOF is the normal way for a direction to end.
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = to.write_all(&buffer[..n]).await {
                    tracing::info!(direction, "splice ended: {e}");
                    break;
                }
            }
            Err(e) => {
                tracing::info!(direction, "splice ended: {e}");
                break;
            }
        }
    }

    // Half-close so the far side sees EOF while the reverse direction keeps
    // flowing.
    let _ = to.shutdown().await;
}

/// Dials `target` (`host:port`) through a SOCKS5 proxy with a plain CONNECT
/// handshake, no authentication.
async fn socks_connect(proxy: SocketAddr, target: &str) -> Result<TcpStream> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("target `{target}` is not host:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("target `{target}` has an invalid port"))?;

    let mut stream = TcpStream::connect(proxy)
        .await
        .with_context(|| format!("failed to connect to SOCKS proxy at {proxy}"))?;

    // Method negotiation: offer only "no authentication".
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    anyhow::ensure!(
        method == [0x05, 0x00],
        "SOCKS proxy rejected the no-auth method"
    );

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            anyhow::ensure!(host.len() <= 255, "hostname `{host}` too long for SOCKS");
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    anyhow::ensure!(
        reply[1] == 0x00,
        "SOCKS CONNECT to `{target}` failed with code {}",
        reply[1]
    );

    // Discard the bound address trailing the reply.
    let bound_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => anyhow::bail!("SOCKS reply has unknown address type {other}"),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

fn raise_fd_limit() {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) if soft < hard => {
            match setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
                Ok(()) => tracing::debug!(limit = hard, "Raised file-descriptor limit"),
                Err(e) => tracing::warn!("failed to raise file-descriptor limit: {e}"),
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("failed to read file-descriptor limit: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Minimal SOCKS5 server: performs the no-auth CONNECT handshake,
    /// reports the requested target, then echoes bytes until EOF.
    async fn fake_socks(requests: mpsc::UnboundedSender<String>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut conn, _) = listener.accept().await.unwrap();
                let requests = requests.clone();

                tokio::spawn(async move {
                    let mut greeting = [0u8; 3];
                    conn.read_exact(&mut greeting).await.unwrap();
                    assert_eq!(greeting, [0x05, 0x01, 0x00]);
                    conn.write_all(&[0x05, 0x00]).await.unwrap();

                    let mut head = [0u8; 4];
                    conn.read_exact(&mut head).await.unwrap();
                    assert_eq!(&head[..3], &[0x05, 0x01, 0x00]);
                    let host = match head[3] {
                        0x01 => {
                            let mut ip = [0u8; 4];
                            conn.read_exact(&mut ip).await.unwrap();
                            Ipv4Addr::from(ip).to_string()
                        }
                        0x03 => {
                            let mut len = [0u8; 1];
                            conn.read_exact(&mut len).await.unwrap();
                            let mut host = vec![0u8; len[0] as usize];
                            conn.read_exact(&mut host).await.unwrap();
                            String::from_utf8(host).unwrap()
                        }
                        other => panic!("unexpected address type {other}"),
                    };
                    let mut port = [0u8; 2];
                    conn.read_exact(&mut port).await.unwrap();
                    requests
                        .send(format!("{host}:{}", u16::from_be_bytes(port)))
                        .unwrap();

                    conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();

                    let mut buffer = [0u8; 1024];
                    loop {
                        match conn.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buffer[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        addr
    }

    struct Fixed {
        target: String,
    }

    impl DestinationResolver for Fixed {
        fn destination(
            &self,
            _conn: &TcpStream,
            _peer: SocketAddr,
        ) -> nat_redirect::Result<(Ipv4Addr, String)> {
            Ok((Ipv4Addr::new(10, 0, 0, 1), self.target.clone()))
        }
    }

    async fn start_proxy(limit: usize, socks: SocketAddr, target: &str) -> SocketAddr {
        let proxy = Proxy::bind(
            0,
            limit,
            socks,
            Arc::new(Fixed {
                target: target.to_owned(),
            }),
        )
        .await
        .unwrap();
        let addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());

        addr
    }

    #[tokio::test]
    async fn dials_the_declared_target_through_socks() {
        let (requests, mut seen) = mpsc::unbounded_channel();
        let socks = fake_socks(requests).await;
        let proxy = start_proxy(4, socks, "web.cluster:9000").await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();

        assert_eq!(&reply, b"ping");
        assert_eq!(seen.recv().await.unwrap(), "web.cluster:9000");
    }

    #[tokio::test]
    async fn ipv4_targets_use_the_ipv4_address_type() {
        let (requests, mut seen) = mpsc::unbounded_channel();
        let socks = fake_socks(requests).await;
        let proxy = start_proxy(4, socks, "127.0.0.1:9000").await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut reply = [0u8; 1];
        client.read_exact(&mut reply).await.unwrap();

        assert_eq!(seen.recv().await.unwrap(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn connection_limit_blocks_the_next_accept_until_release() {
        let (requests, _seen) = mpsc::unbounded_channel();
        let socks = fake_socks(requests).await;
        let proxy = start_proxy(1, socks, "web:80").await;

        let mut first = TcpStream::connect(proxy).await.unwrap();
        first.write_all(b"one").await.unwrap();
        let mut reply = [0u8; 3];
        first.read_exact(&mut reply).await.unwrap();

        // The slot is held; the second connection must not be serviced yet.
        let mut second = TcpStream::connect(proxy).await.unwrap();
        second.write_all(b"two").await.unwrap();
        let mut blocked = [0u8; 3];
        let starved =
            tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut blocked))
                .await;
        assert!(starved.is_err(), "second connection proxied while the slot was taken");

        // Fully close the first connection; its slot frees and the second
        // connection gets spliced.
        drop(first);
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut blocked))
            .await
            .expect("second connection was never serviced")
            .unwrap();
        assert_eq!(&blocked, b"two");
    }
}
