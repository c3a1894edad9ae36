use async_recursion::async_recursion;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType::{A, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, field::Empty, instrument};

use crate::backend::{Backend, UdpBackend};
use crate::cache::{Cache, CacheResponse, DnsCache, Query};
use crate::config::{CACHE_CAPACITY, MAX_RECURSION_DEPTH, ROOT_SERVERS, SWEEP_INTERVAL};
use crate::error::ResolutionError;
use crate::error::ResolutionError::{NxDomain, ServFail};
use crate::resolver::Response::{Answer, CnameAlias, Referral};
use crate::target::{NsProvider, RootsProvider, Target, TargetProvider};

/// Walks the DNS hierarchy from the roots (or a cached delegation) down to
/// an authoritative answer, one query at a time (§4). Owns the process-wide
/// record cache and the background task that sweeps it.
#[derive(Debug)]
pub struct RecursiveResolver {
    backend: Box<dyn Backend + Sync + Send>,
    roots: Vec<IpAddr>,
    cache: Arc<DnsCache>,
    sweeper: JoinHandle<()>,
}

impl RecursiveResolver {
    pub fn new() -> Self {
        let cache = Arc::new(Cache::new(*CACHE_CAPACITY));
        let sweeper = cache.clone().spawn_sweeper(SWEEP_INTERVAL);
        RecursiveResolver {
            backend: Box::new(UdpBackend::new()),
            roots: ROOT_SERVERS.iter().copied().map(IpAddr::V4).collect(),
            cache,
            sweeper,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_backend(
        backend: impl Backend + Send + Sync + 'static,
        roots: Vec<IpAddr>,
    ) -> Self {
        let cache = Arc::new(Cache::new(*CACHE_CAPACITY));
        let sweeper = cache.clone().spawn_sweeper(SWEEP_INTERVAL);
        RecursiveResolver { backend: Box::new(backend), roots, cache, sweeper }
    }

    #[instrument(skip(self), fields(otel.kind = "server", otel.status_code = Empty, otel.status_message = Empty, %to_resolve))]
    pub async fn resolve(
        &self,
        to_resolve: &Name,
        record_type: RecordType,
    ) -> Result<Vec<Record>, ResolutionError> {
        let mut state = ResolutionState::new(self);
        let result = state.resolve_inner(to_resolve, record_type, 1, HashSet::new()).await;
        if let Err(e) = &result {
            let span = tracing::Span::current();
            span.record("otel.status_code", "Error");
            span.record("otel.status_message", e.to_string());
        }
        result
    }
}

impl Drop for RecursiveResolver {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

struct ResolutionState<'a> {
    resolver: &'a RecursiveResolver,
    seen: Vec<(Name, RecordType)>,
    cache: &'a DnsCache,
}

impl<'a> ResolutionState<'a> {
    fn new(resolver: &'a RecursiveResolver) -> Self {
        ResolutionState { resolver, seen: Vec::new(), cache: &resolver.cache }
    }

    /// Walks one name's referral chain to an answer. `visited` is the set of
    /// upstream addresses already queried while resolving *this* name (§3,
    /// §4.3): a candidate address already in it is skipped rather than
    /// re-queried, which bounds referral cycles a misconfigured or hostile
    /// server could otherwise use to loop forever without ever touching
    /// `depth` (following a referral doesn't increment it). It is carried
    /// forward into a CNAME chase (same original question, §4.3: "depth+1,
    /// visited set carried forward") but started fresh for a nested
    /// resolution of a different name (an NS name lacking glue) in
    /// `target_to_ip`, since that is its own independent walk that may
    /// legitimately need to revisit a server already asked about the
    /// original name.
    #[instrument(skip(self, visited), fields(%to_resolve))]
    #[async_recursion]
    async fn resolve_inner(
        &mut self,
        to_resolve: &Name,
        record_type: RecordType,
        depth: u32,
        mut visited: HashSet<IpAddr>,
    ) -> Result<Vec<Record>, ResolutionError> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(ServFail(format!(
                "refusing to recurse deeper than {}",
                MAX_RECURSION_DEPTH
            )));
        }
        let query_key = (to_resolve.clone(), record_type);
        if self.seen.contains(&query_key) {
            return Err(ServFail(format!("broken dns config, saw {:?} twice", query_key)));
        }
        self.seen.push(query_key);

        let query = Query { to_resolve: to_resolve.clone(), record_type };
        let mut candidates: Box<dyn TargetProvider + Send> =
            match self.cache.get_best_record(&query, Instant::now()) {
                CacheResponse::Authoritative(records) => return Ok(records),
                CacheResponse::Referral(ns, glue) => Box::new(NsProvider::new(ns, glue)),
                CacheResponse::None => Box::new(RootsProvider::new(&self.resolver.roots)),
            };
        debug!(hostname = %to_resolve, "resolving");
        loop {
            let target = candidates
                .next(&visited)
                .await?
                .ok_or_else(|| ServFail("no more nameservers to try".to_string()))?;
            let target = self.target_to_ip(target, depth).await?;
            if !visited.insert(target) {
                // a Target::Name resolved to an address we've already
                // queried; the provider couldn't have filtered this out
                // itself since it only knows the name, not the address.
                continue;
            }

            let message = match self.resolver.backend.query(target, to_resolve, record_type).await
            {
                // this candidate is unusable; try the next one rather than
                // failing the whole resolution on one dead or slow server.
                Err(_) => continue,
                Ok(message) => message,
            };

            if message.response_code() == ResponseCode::NXDomain {
                return Err(NxDomain);
            }

            match classify(&message, record_type) {
                None => {
                    // empty reply or non-success RCode on this candidate;
                    // try the next candidate in the current list rather
                    // than treating it as a referral.
                    continue;
                }
                Some(Referral(ns, glue)) => {
                    debug!(?ns, "received a referral");
                    self.cache.store_referral(ns.clone(), glue.clone(), to_resolve, Instant::now());
                    candidates = Box::new(NsProvider::new(ns, glue))
                }
                Some(CnameAlias(alias, target_name)) => {
                    debug!(%target_name, "chasing cname");
                    let mut answers = Box::pin(self.resolve_inner(
                        &target_name,
                        record_type,
                        depth + 1,
                        visited.clone(),
                    ))
                    .await?;
                    let mut result = vec![alias];
                    result.append(&mut answers);
                    self.cache.store(query, result.clone(), Instant::now());
                    return Ok(result);
                }
                Some(Answer(answers)) => {
                    self.cache.store(query, answers.clone(), Instant::now());
                    return Ok(answers);
                }
            }
        }
    }

    async fn target_to_ip(&mut self, target: Target, depth: u32) -> Result<IpAddr, ResolutionError> {
        match target {
            Target::Ip(ip) => Ok(ip),
            Target::Name(name) => first_ip(
                &mut Box::pin(self.resolve_inner(&name, A, depth + 1, HashSet::new())).await?,
            ),
        }
    }
}

enum Response {
    /// An authoritative answer directly satisfying the queried type.
    Answer(Vec<Record>),
    /// An authoritative answer for a CNAME at the queried name; the target
    /// still needs to be resolved for the originally requested type.
    CnameAlias(Record, Name),
    /// A non-authoritative response pointing further down the hierarchy.
    Referral(Vec<Record>, Vec<Record>),
}

/// Classifies a candidate's reply per §4.3's state table. Returns `None` for
/// the "reply empty / RCode≠0" row (try the next candidate in the current
/// list without reseeding), distinguishing it from an actual referral: a
/// non-success RCode, or a non-final reply whose authority section carries
/// no NS records at all, is not a referral just because it failed
/// `is_final` — it's a dead end for this one candidate.
fn classify(message: &Message, record_type: RecordType) -> Option<Response> {
    if message.response_code() != ResponseCode::NoError {
        return None;
    }
    if !is_final(message) {
        let name_servers = message.name_servers().to_vec();
        if name_servers.is_empty() {
            return None;
        }
        return Some(Referral(name_servers, message.additionals().to_vec()));
    }
    let answers = message.answers();
    if answers.iter().any(|r| r.record_type() == record_type) {
        return Some(Answer(answers.to_vec()));
    }
    if let Some(alias) = answers.iter().find(|r| r.record_type() == CNAME) {
        if let Some(target) = get_cname_target(alias) {
            return Some(CnameAlias(alias.clone(), target));
        }
    }
    Some(Answer(answers.to_vec()))
}

fn get_cname_target(record: &Record) -> Option<Name> {
    match record.data() {
        Some(RData::CNAME(name)) => Some(name.0.clone()),
        _ => None,
    }
}

fn is_final(answer: &Message) -> bool {
    answer.header().authoritative() && !answer.answers().is_empty()
}

fn first_ip(result: &mut Vec<Record>) -> Result<IpAddr, ResolutionError> {
    match result.pop() {
        None => Err(ServFail("unexpected empty result".to_string())),
        Some(record) => match record.data() {
            Some(RData::A(a)) => Ok(IpAddr::V4(a.0)),
            _ => Err(ServFail("no rdata, or wrong type of rdata".to_string())),
        },
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use hickory_proto::op::{Header, Message, ResponseCode};
    use hickory_proto::rr::{rdata, Record};
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::net::{IpAddr, Ipv4Addr};
    use tracing::Level;
    use tracing_subscriber::FmtSubscriber;
    use RecordType::A;

    use crate::error::ResolutionError;
    use crate::fake_backend::FakeBackend;
    use crate::resolver::{is_final, RecursiveResolver};
    use crate::{a, answer, cname, ns, nxdomain, refer};

    #[ctor::ctor]
    fn init() {
        let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("could not set global default tracing subscriber");
    }

    #[test]
    fn test_is_final() {
        let m = Message::default();
        assert!(!is_final(&m));

        let mut m = Message::new();
        m.set_header(*Header::new().set_authoritative(true));
        assert!(!is_final(&m));

        m.set_header(Header::new());
        m.add_answer(Record::new());
        assert!(!is_final(&m));

        m.set_header(*Header::new().set_authoritative(true));
        assert!(is_final(&m));
    }

    #[tokio::test]
    async fn test_resolve() -> Result<()> {
        let mut b = FakeBackend::new();
        b.add("10.0.0.1", "a.b", A, refer!(ns!("b", "ns.e.f"), a!("ns.e.f", "10.0.0.2")))?;
        b.add("10.0.0.2", "a.b", A, refer!(ns!["a.b", "ns.c.d"]))?;
        b.add("10.0.0.1", "ns.c.d", A, refer!(ns!("c.d", "ns.c.d"), a!("ns.c.d", "10.0.0.3")))?;
        b.add("10.0.0.3", "ns.c.d", A, answer!(a!("ns.c.d", "10.0.0.3")))?;
        b.add("10.0.0.3", "a.b", A, answer!(a!("a.b", "10.0.0.42")))?;

        let resolver = RecursiveResolver::with_backend(b, vec![IpAddr::V4("10.0.0.1".parse()?)]);

        let result = resolver.resolve(&"a.b".parse()?, A).await?;
        let record = result.first().expect("could not find record in response");
        assert_eq!(*record.name(), "a.b".parse::<Name>()?);
        if let Some(RData::A(rdata::A(addr))) = record.data() {
            assert_eq!(*addr, "10.0.0.42".parse::<Ipv4Addr>()?)
        } else {
            panic!("could not find A record in result")
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_cross_referencing_domains() -> Result<()> {
        let mut b = FakeBackend::new();
        b.add("10.0.0.1", "ns.a.b", A, refer!(ns!("b", "ns.e.f"), a!("ns.e.f", "10.0.0.2")))?;
        b.add("10.0.0.2", "ns.a.b", A, refer!(ns!("a.b", "ns.c.d")))?;
        b.add("10.0.0.1", "ns.c.d", A, refer!(ns!("c.d", "e.f.g"), a!("e.f.g", "10.0.0.3")))?;
        // NS record for ns.c.d points back to ns.a.b.
        b.add("10.0.0.3", "ns.c.d", A, refer!(ns!("c.d", "ns.a.b")))?;

        let resolver = RecursiveResolver::with_backend(b, vec![IpAddr::V4("10.0.0.1".parse()?)]);

        let result = resolver.resolve(&"ns.a.b".parse()?, A).await;

        if let Err(ResolutionError::ServFail(e)) = result {
            assert_eq!(format!("{e}"), "broken dns config, saw (Name(\"ns.a.b\"), A) twice");
        } else {
            panic!("this resolve() call should fail");
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_nxdomain_is_reported() -> Result<()> {
        let mut b = FakeBackend::new();
        b.add("10.0.0.1", "nowhere.test", A, nxdomain!())?;

        let resolver = RecursiveResolver::with_backend(b, vec![IpAddr::V4("10.0.0.1".parse()?)]);
        let result = resolver.resolve(&"nowhere.test".parse()?, A).await;
        assert!(matches!(result, Err(ResolutionError::NxDomain)));
        Ok(())
    }

    #[tokio::test]
    async fn test_cname_is_chased() -> Result<()> {
        let mut b = FakeBackend::new();
        b.add(
            "10.0.0.1",
            "alias.a.b",
            A,
            answer!(cname!("alias.a.b", "canonical.a.b")),
        )?;
        b.add("10.0.0.1", "canonical.a.b", A, answer!(a!("canonical.a.b", "10.0.0.99")))?;

        let resolver = RecursiveResolver::with_backend(b, vec![IpAddr::V4("10.0.0.1".parse()?)]);
        let result = resolver.resolve(&"alias.a.b".parse()?, A).await?;

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].record_type(), RecordType::CNAME);
        assert_eq!(result[1].record_type(), A);
        if let Some(RData::A(rdata::A(addr))) = result[1].data() {
            assert_eq!(addr.to_string(), "10.0.0.99");
        } else {
            panic!("expected an A record after the chased cname");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_upstream_failure_tries_next_candidate() -> Result<()> {
        // two roots; the first is missing from the fixture table entirely,
        // which FakeBackend reports as an error just like a dead server.
        let mut b = FakeBackend::new();
        b.add("10.0.0.2", "a.b", A, answer!(a!("a.b", "10.0.0.50")))?;

        let resolver = RecursiveResolver::with_backend(
            b,
            vec![IpAddr::V4("10.0.0.1".parse()?), IpAddr::V4("10.0.0.2".parse()?)],
        );
        let result = resolver.resolve(&"a.b".parse()?, A).await?;
        assert_eq!(result, vec![a!("a.b", "10.0.0.50")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_exceeding_max_depth_fails() -> Result<()> {
        // each name's nameserver is given without glue, so resolving it
        // requires a nested resolve_inner call one depth deeper; five such
        // hops push the sixth past MAX_RECURSION_DEPTH.
        let mut b = FakeBackend::new();
        let names = ["q0.test", "ns1.test", "ns2.test", "ns3.test", "ns4.test", "ns5.test"];
        for i in 0..names.len() - 1 {
            b.add("10.0.0.1", names[i], A, refer!(ns!("test", names[i + 1])))?;
        }

        let resolver = RecursiveResolver::with_backend(b, vec![IpAddr::V4("10.0.0.1".parse()?)]);
        let result = resolver.resolve(&"q0.test".parse()?, A).await;
        assert!(matches!(result, Err(ResolutionError::ServFail(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_referral_cycle_terminates() -> Result<()> {
        // two servers refer to each other forever without ever chasing a
        // cname or resolving a new name, so depth never advances; only the
        // visited-address set bounds this to a handful of hops.
        let mut b = FakeBackend::new();
        b.add("10.0.0.1", "a.b", A, refer!(ns!("a.b", "ns2.a.b"), a!("ns2.a.b", "10.0.0.2")))?;
        b.add("10.0.0.2", "a.b", A, refer!(ns!("a.b", "ns1.a.b"), a!("ns1.a.b", "10.0.0.1")))?;

        let resolver = RecursiveResolver::with_backend(b, vec![IpAddr::V4("10.0.0.1".parse()?)]);
        let result = resolver.resolve(&"a.b".parse()?, A).await;
        assert!(matches!(result, Err(ResolutionError::ServFail(_))));
        Ok(())
    }
}
