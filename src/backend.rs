use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::{MAX_UPSTREAM_DATAGRAM, UPSTREAM_TIMEOUT};
use crate::error::ResolutionError;
use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::Name;
use hickory_proto::rr::RecordType;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::field::Empty;
use tracing::instrument;

const DEFAULT_TARGET_PORT: u16 = 53;

/// Something that can carry one query/response exchange to a remote
/// nameserver (§4.1). `resolve_inner` treats every error this returns as
/// "this candidate is unusable" and moves on to the next one; it never
/// distinguishes connect failure from read timeout from a malformed reply.
#[async_trait]
pub(crate) trait Backend: Debug {
    async fn query(
        &self,
        target: IpAddr,
        to_resolve: &Name,
        record_type: RecordType,
    ) -> Result<Message, ResolutionError>;
}

/// Sends queries over UDP and enforces the connect and read budgets as two
/// independent 5s timeouts (§4.1). No retry, no TCP fallback on truncation:
/// a TC=1 response is simply handed back to the caller as-is.
#[derive(Debug)]
pub(crate) struct UdpBackend {
    target_port: u16,
}

impl UdpBackend {
    pub(crate) fn new() -> Self {
        UdpBackend { target_port: DEFAULT_TARGET_PORT }
    }
}

async fn connect(target: IpAddr, target_port: u16) -> Result<UdpSocket, ResolutionError> {
    let local = SocketAddr::new(
        match target {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        },
        0,
    );
    let socket = UdpSocket::bind(local).await?;
    socket.connect(SocketAddr::new(target, target_port)).await?;
    Ok(socket)
}

#[async_trait]
impl Backend for UdpBackend {
    #[instrument(fields(otel.status_code = "Error", result = Empty, %to_resolve, %record_type, response_code = Empty))]
    async fn query(
        &self,
        target: IpAddr,
        to_resolve: &Name,
        record_type: RecordType,
    ) -> Result<Message, ResolutionError> {
        let socket = timeout(UPSTREAM_TIMEOUT, connect(target, self.target_port))
            .await
            .map_err(|_| timed_out())??;

        let request = make_query(to_resolve, record_type);
        socket.send(request.to_vec()?.as_slice()).await?;

        let mut buf = vec![0u8; MAX_UPSTREAM_DATAGRAM];
        let read_count =
            timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf)).await.map_err(|_| timed_out())??;

        let message = Message::from_bytes(&buf[..read_count])?;
        let span = tracing::Span::current();
        span.record("otel.status_code", "Ok");
        span.record("result", format!("{:?}", message));
        span.record("response_code", format!("{}", message.header().response_code()));
        Ok(message)
    }
}

fn timed_out() -> ResolutionError {
    ResolutionError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out"))
}

/// Builds an iterative query: RD=0, since we are the one doing the recursion
/// and must never ask an authoritative server to recurse on our behalf.
fn make_query(name: &Name, record_type: RecordType) -> Message {
    let mut query = Query::new();
    query.set_name(name.clone()).set_query_type(record_type);
    let mut message = Message::new();
    message.add_query(query);
    message.set_recursion_desired(false);
    message.set_id(rand::random());
    message
}
