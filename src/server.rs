use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Header, Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::MAX_INBOUND_DATAGRAM;
use crate::error::ResolutionError;
use crate::resolver::RecursiveResolver;

/// Serves DNS requests on `bind_addr` until `shutdown` is notified, then
/// waits for in-flight requests to finish before returning (§6).
pub async fn run(
    resolver: Arc<RecursiveResolver>,
    bind_addr: SocketAddr,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    info!(%bind_addr, "listening");

    let mut inflight = JoinSet::new();
    let mut buf = vec![0u8; MAX_INBOUND_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("shutdown requested, draining in-flight requests");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                let (read_count, peer) = result?;
                let datagram = buf[..read_count].to_vec();
                let socket = socket.clone();
                let resolver = resolver.clone();
                inflight.spawn(async move {
                    let response = build_response(&resolver, &datagram).await;
                    let packed = match response.to_vec() {
                        Ok(packed) => packed,
                        Err(e) => {
                            warn!(%peer, error = %e, "failed to pack response");
                            return;
                        }
                    };
                    if let Err(e) = socket.send_to(packed.as_slice(), peer).await {
                        warn!(%peer, error = %e, "failed to send response");
                    }
                });
            }
        }
    }
    while inflight.join_next().await.is_some() {}
    Ok(())
}

/// Builds the response for one inbound datagram, applying the RCODE mapping
/// in §6: malformed datagrams get FormErr against whatever ID we can salvage,
/// unsupported query types get NotImp, NXDOMAIN and server failures are
/// passed through from the resolver.
#[instrument(skip(resolver, datagram))]
async fn build_response(resolver: &RecursiveResolver, datagram: &[u8]) -> Message {
    let request = match Message::from_bytes(datagram) {
        Ok(m) => m,
        Err(_) => return malformed_response(datagram),
    };

    let mut response = header_for(&request);
    let Some(query) = request.query() else {
        return response;
    };

    let result = if query.query_type() != RecordType::A {
        Err(ResolutionError::UnsupportedType(query.query_type()))
    } else {
        resolver.resolve(query.name(), query.query_type()).await
    };

    match result {
        Ok(records) => {
            for record in records {
                response.add_answer(record);
            }
        }
        Err(ResolutionError::NxDomain) => {
            response.set_response_code(ResponseCode::NXDomain);
        }
        Err(ResolutionError::UnsupportedType(t)) => {
            debug!(record_type = %t, "unsupported query type");
            response.set_response_code(ResponseCode::NotImp);
        }
        Err(e) => {
            warn!(error = %e, "resolution failed");
            response.set_response_code(ResponseCode::ServFail);
        }
    }
    response
}

/// A response header echoing the request's ID, opcode and RD bit, with
/// QR=Response, AA=0, TC=0, RA=1 (§6 header contract). The question section
/// is copied through so clients can match it against their query.
fn header_for(request: &Message) -> Message {
    let mut header = Header::default();
    header.set_id(request.id());
    header.set_message_type(MessageType::Response);
    header.set_op_code(request.header().op_code());
    header.set_recursion_desired(request.header().recursion_desired());
    header.set_recursion_available(true);
    header.set_authoritative(false);
    header.set_truncated(false);

    let mut response = Message::new();
    response.set_header(header);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

/// A datagram too malformed to parse at all. We can usually still recover
/// the 2-byte transaction ID (it's the first thing on the wire) and echo it
/// back with FormErr rather than silently dropping the request.
fn malformed_response(datagram: &[u8]) -> Message {
    let mut header = Header::default();
    if datagram.len() >= 2 {
        header.set_id(u16::from_be_bytes([datagram[0], datagram[1]]));
    }
    header.set_message_type(MessageType::Response);
    header.set_response_code(ResponseCode::FormErr);
    header.set_recursion_available(true);
    let mut response = Message::new();
    response.set_header(header);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_backend::FakeBackend;
    use crate::{a, answer, nxdomain};
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::net::{IpAddr, Ipv4Addr};

    fn request(name: &str, record_type: RecordType) -> Message {
        let mut query = Query::new();
        query.set_name(name.parse::<Name>().unwrap()).set_query_type(record_type);
        let mut message = Message::new();
        message.add_query(query);
        message.set_id(42);
        message.set_recursion_desired(true);
        message
    }

    fn resolver_with(b: FakeBackend) -> RecursiveResolver {
        RecursiveResolver::with_backend(b, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))])
    }

    #[tokio::test]
    async fn test_malformed_datagram_gets_formerr_with_salvaged_id() {
        let resolver = resolver_with(FakeBackend::new());
        let datagram = [0x00, 0x2a, 0xff, 0xff, 0xff];
        let response = build_response(&resolver, &datagram).await;
        assert_eq!(response.id(), 0x002a);
        assert_eq!(response.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn test_unsupported_query_type_gets_notimp() {
        let resolver = resolver_with(FakeBackend::new());
        let req = request("example.com", RecordType::MX);
        let response = build_response(&resolver, req.to_vec().unwrap().as_slice()).await;
        assert_eq!(response.response_code(), ResponseCode::NotImp);
        assert_eq!(response.id(), 42);
    }

    #[tokio::test]
    async fn test_nxdomain_is_mapped() {
        let mut b = FakeBackend::new();
        b.add("10.0.0.1", "nowhere.test", RecordType::A, nxdomain!()).unwrap();
        let resolver = resolver_with(b);
        let req = request("nowhere.test", RecordType::A);
        let response = build_response(&resolver, req.to_vec().unwrap().as_slice()).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn test_successful_lookup_echoes_header_contract() {
        let mut b = FakeBackend::new();
        b.add("10.0.0.1", "example.com", RecordType::A, answer!(a!("example.com", "1.2.3.4")))
            .unwrap();
        let resolver = resolver_with(b);
        let req = request("example.com", RecordType::A);
        let response = build_response(&resolver, req.to_vec().unwrap().as_slice()).await;

        assert_eq!(response.id(), 42);
        assert_eq!(response.header().message_type(), MessageType::Response);
        assert_eq!(response.header().op_code(), OpCode::Query);
        assert!(!response.header().authoritative());
        assert!(!response.header().truncated());
        assert!(response.header().recursion_desired());
        assert!(response.header().recursion_available());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
    }
}
