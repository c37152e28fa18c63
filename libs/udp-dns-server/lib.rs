//! A UDP DNS server that answers A queries for intercepted names and relays
//! everything else, byte-for-byte, to a fallback resolver.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType, rdata};
use intercept_model::{NameRegistry, Route};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

/// Answer TTL for intercepted names. Short so that route changes propagate
/// quickly through resolver caches we cannot flush.
const TTL: u32 = 60;

/// Where the server looks up intercepted names.
pub trait Resolve: Send + Sync + 'static {
    fn resolve(&self, domain: &str) -> Option<Route>;
}

impl Resolve for NameRegistry {
    fn resolve(&self, domain: &str) -> Option<Route> {
        NameRegistry::resolve(self, domain)
    }
}

pub struct Server {
    sockets: Vec<Arc<UdpSocket>>,
    fallback: SocketAddr,
}

impl Server {
    /// Binds a UDP socket on each of `addrs`. Failure to bind any of them is
    /// fatal; the server is useless if it doesn't own its addresses.
    pub async fn bind(addrs: &[SocketAddr], fallback: SocketAddr) -> Result<Self> {
        let mut sockets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind DNS listener on {addr}"))?;

            tracing::info!(addr = %socket.local_addr()?, "Listening for DNS queries");
            sockets.push(Arc::new(socket));
        }

        Ok(Self { sockets, fallback })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    /// Serves queries until a listener fails at the socket level.
    pub async fn run<R: Resolve>(self, resolver: Arc<R>) -> Result<()> {
        let mut listeners = JoinSet::new();
        for socket in self.sockets {
            listeners.spawn(listen(socket, resolver.clone(), self.fallback));
        }

        while let Some(result) = listeners.join_next().await {
            result.context("DNS listener panicked")??;
        }

        Ok(())
    }
}

async fn listen<R: Resolve>(
    socket: Arc<UdpSocket>,
    resolver: Arc<R>,
    fallback: SocketAddr,
) -> Result<()> {
    // Larger than any plausible UDP query; fits EDNS0 payloads.
    let mut buffer = vec![0u8; 2048];

    loop {
        let (len, from) = socket
            .recv_from(&mut buffer)
            .await
            .context("failed to receive DNS query")?;
        let query = buffer[..len].to_vec();

        // Answering may wait on the fallback resolver; don't hold up the
        // listener for it.
        tokio::spawn(handle_query(
            socket.clone(),
            resolver.clone(),
            fallback,
            query,
            from,
        ));
    }
}

async fn handle_query<R: Resolve>(
    socket: Arc<UdpSocket>,
    resolver: Arc<R>,
    fallback: SocketAddr,
    query: Vec<u8>,
    from: SocketAddr,
) {
    // Not even worth relaying: the fallback couldn't parse it either.
    let message = match Message::from_vec(&query) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(%from, "dropping unparseable DNS query: {e}");
            return;
        }
    };

    let reply = match answer(resolver.as_ref(), &message) {
        Some(reply) => reply,
        None => match forward(fallback, &query).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%fallback, "fallback resolution failed: {e:#}");
                return;
            }
        },
    };

    if let Err(e) = socket.send_to(&reply, from).await {
        tracing::warn!(%from, "failed to send DNS reply: {e}");
    }
}

/// Answers the query locally if its name is intercepted, returning `None`
/// when it should go to the fallback resolver instead.
fn answer<R: Resolve>(resolver: &R, message: &Message) -> Option<Vec<u8>> {
    let question = message.queries().first()?;
    let domain = question.name().to_string().to_lowercase();

    let route = resolver.resolve(&domain)?;

    let mut response = Message::new();
    response
        .set_id(message.id())
        .set_message_type(MessageType::Response)
        .set_op_code(message.op_code())
        .set_authoritative(true)
        .set_recursion_desired(message.recursion_desired())
        // Required: without RA the macOS resolver treats us as lame and
        // chains to the next configured server.
        .set_recursion_available(true)
        .add_query(question.clone());

    if question.query_type() == RecordType::A {
        let ip = match route.ip.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::warn!(%domain, ip = %route.ip, "intercepted route has an unusable IP");
                return None;
            }
        };

        let mut record = Record::new();
        record
            // The question name verbatim; answering with a normalized
            // spelling makes macOS treat the reply as NXDOMAIN.
            .set_name(question.name().clone())
            .set_rr_type(RecordType::A)
            .set_dns_class(DNSClass::IN)
            .set_ttl(TTL)
            .set_data(Some(RData::A(rdata::A(ip))));
        response.add_answer(record);

        tracing::debug!(%domain, %ip, "answered intercepted A query");
    } else {
        // Authoritative empty answer: the client should accept that the
        // record doesn't exist instead of retrying via the fallback.
        tracing::debug!(%domain, qtype = %question.query_type(), "empty answer for intercepted name");
    }

    match response.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(%domain, "failed to encode DNS response: {e}");
            None
        }
    }
}

/// Relays the raw query to the fallback resolver and returns its raw reply.
///
/// No timeout: DNS clients retransmit on their own schedule, and a lost
/// fallback reply should look exactly like a lost packet.
async fn forward(fallback: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind forwarding socket")?;
    socket
        .connect(fallback)
        .await
        .context("failed to connect to fallback resolver")?;
    socket.send(query).await.context("failed to send query")?;

    let mut buffer = vec![0u8; 4096];
    let len = socket
        .recv(&mut buffer)
        .await
        .context("failed to receive fallback reply")?;
    buffer.truncate(len);

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::Name;
    use std::str::FromStr as _;

    fn registry_with(name: &str, ip: &str) -> Arc<NameRegistry> {
        let registry = NameRegistry::new();
        let route = Route {
            name: name.to_owned(),
            ip: ip.to_owned(),
            ..Default::default()
        };
        registry.store(route.domain(), route);

        Arc::new(registry)
    }

    fn a_query(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(4711)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));

        message.to_vec().unwrap()
    }

    async fn start_server(registry: Arc<NameRegistry>, fallback: SocketAddr) -> SocketAddr {
        let server = Server::bind(&["127.0.0.1:0".parse().unwrap()], fallback)
            .await
            .unwrap();
        let addr = server.local_addrs()[0];
        tokio::spawn(server.run(registry));

        addr
    }

    async fn exchange(server: SocketAddr, query: &[u8]) -> Vec<u8> {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(query, server).await.unwrap();

        let mut buffer = vec![0u8; 4096];
        let (len, _) = client.recv_from(&mut buffer).await.unwrap();
        buffer.truncate(len);

        buffer
    }

    #[tokio::test]
    async fn answers_intercepted_a_query_authoritatively() {
        let fallback = "127.0.0.1:1".parse().unwrap(); // Never reached.
        let server = start_server(registry_with("web", "10.0.0.1"), fallback).await;

        let reply = exchange(server, &a_query("Web.", RecordType::A)).await;
        let message = Message::from_vec(&reply).unwrap();

        assert_eq!(message.id(), 4711);
        assert!(message.authoritative());
        assert!(message.recursion_available());
        assert_eq!(message.answers().len(), 1);

        let answer = message.answers().first().unwrap();
        assert_eq!(answer.name().to_string(), "Web.");
        assert_eq!(answer.ttl(), TTL);
        assert_eq!(
            answer.data(),
            Some(&RData::A(rdata::A(Ipv4Addr::new(10, 0, 0, 1))))
        );
    }

    #[tokio::test]
    async fn non_a_query_for_intercepted_name_gets_empty_authoritative_answer() {
        let fallback = "127.0.0.1:1".parse().unwrap();
        let server = start_server(registry_with("web", "10.0.0.1"), fallback).await;

        let reply = exchange(server, &a_query("web.", RecordType::AAAA)).await;
        let message = Message::from_vec(&reply).unwrap();

        assert!(message.authoritative());
        assert!(message.answers().is_empty());
    }

    #[tokio::test]
    async fn unknown_names_are_relayed_to_the_fallback_verbatim() {
        let fallback = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fallback_addr = fallback.local_addr().unwrap();
        let canned = b"\x12\x34canned-fallback-reply".to_vec();
        let expected = canned.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            let (_, from) = fallback.recv_from(&mut buffer).await.unwrap();
            fallback.send_to(&canned, from).await.unwrap();
        });

        let server = start_server(registry_with("web", "10.0.0.1"), fallback_addr).await;

        let reply = exchange(server, &a_query("other.", RecordType::A)).await;

        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn unparseable_queries_are_dropped_not_relayed() {
        let fallback = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fallback_addr = fallback.local_addr().unwrap();
        let (hit, mut was_hit) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            let _ = fallback.recv_from(&mut buffer).await;
            let _ = hit.send(());
        });

        let server = start_server(registry_with("web", "10.0.0.1"), fallback_addr).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"\xffnot a dns message", server).await.unwrap();

        let mut buffer = vec![0u8; 512];
        let no_reply = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            client.recv_from(&mut buffer),
        )
        .await;

        assert!(no_reply.is_err(), "garbage query produced a reply");
        assert!(was_hit.try_recv().is_err(), "garbage query reached the fallback");
    }
}
