use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::ResolutionError;
use crate::error::ResolutionError::ServFail;
use async_trait::async_trait;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::seq::SliceRandom;
use rand::thread_rng;

/// An exhaustible source of next-hop candidates for one iteration level of
/// the resolver's walk (§4.3). Each candidate is either an address we can
/// query directly, or a nameserver name that itself needs resolving.
/// `visited` is the caller's set of already-queried upstream addresses
/// (§3, §4.3): a provider must never hand back a `Target::Ip` already in it.
/// A `Target::Name` is returned unfiltered, since its address isn't known
/// until the caller resolves it; the caller re-checks against `visited`
/// once it has an address in hand.
#[async_trait]
pub(crate) trait TargetProvider {
    async fn next(&mut self, visited: &HashSet<IpAddr>) -> Result<Option<Target>, ResolutionError>;
}

#[derive(Debug)]
pub(crate) enum Target {
    Ip(IpAddr),
    Name(Name),
}

/// Seeds the walk with the hard-coded root hints, shuffled once per call so
/// load spreads across roots while still being a fixed, exhaustible order
/// for this resolution (§4.3's "arbitrary but deterministic-per-run order").
pub(crate) struct RootsProvider<'a> {
    shuffled: Vec<&'a IpAddr>,
}

impl<'a> RootsProvider<'a> {
    pub(crate) fn new(roots: &'a [IpAddr]) -> Self {
        let mut shuffled: Vec<&IpAddr> = roots.iter().collect();
        shuffled.shuffle(&mut thread_rng());
        RootsProvider { shuffled }
    }
}

#[async_trait]
impl TargetProvider for RootsProvider<'_> {
    async fn next(&mut self, visited: &HashSet<IpAddr>) -> Result<Option<Target>, ResolutionError> {
        while let Some(&ip) = self.shuffled.pop() {
            if !visited.contains(&ip) {
                return Ok(Some(Target::Ip(ip)));
            }
        }
        Ok(None)
    }
}

/// Candidates derived from a referral's NS set, preferring glue when present
/// and falling back to a nameserver name that the caller must resolve
/// separately (§4.3: "glue is always preferred over recursive NS-name
/// resolution when present").
pub(crate) struct NsProvider {
    shuffled_nameservers: Vec<Record>,
    glue: Vec<Record>,
}

impl NsProvider {
    pub(crate) fn new(nameservers: Vec<Record>, glue: Vec<Record>) -> Self {
        let mut shuffled_nameservers: Vec<Record> =
            nameservers.into_iter().filter(|r| r.record_type() == RecordType::NS).collect();
        shuffled_nameservers.shuffle(&mut thread_rng());
        NsProvider { shuffled_nameservers, glue }
    }
}

fn get_target(ns: &Record, glue: &[Record]) -> Result<Target, ResolutionError> {
    let Some(result) = get_name_if_ns(ns) else {
        return Err(ServFail("inconsistent data, NsProvider was fed a non-ns record".into()));
    };
    let name = result?;
    if let Some(ip) = find_in_glue(name, glue) {
        return Ok(Target::Ip(ip));
    }
    Ok(Target::Name(name.to_owned()))
}

#[async_trait]
impl TargetProvider for NsProvider {
    async fn next(&mut self, visited: &HashSet<IpAddr>) -> Result<Option<Target>, ResolutionError> {
        while let Some(ns) = self.shuffled_nameservers.pop() {
            let target = get_target(&ns, &self.glue)?;
            if let Target::Ip(ip) = target {
                if visited.contains(&ip) {
                    continue;
                }
            }
            return Ok(Some(target));
        }
        Ok(None)
    }
}

fn find_in_glue(name: &Name, glue: &[Record]) -> Option<IpAddr> {
    glue.iter()
        .filter(|r| r.record_type() == RecordType::A)
        .filter(|r| r.name() == name)
        .filter_map(
            |r| if let Some(&RData::A(a)) = r.data() { Some(IpAddr::V4(a.0)) } else { None },
        )
        .next()
}

/// `Some(Ok(name))` for a well-formed NS record, `Some(Err(_))` for an NS
/// record with inconsistent or missing rdata, `None` if `record` isn't NS at
/// all (callers use this to distinguish "not an NS record" from "malformed
/// NS record" — only the latter is an error worth reporting).
pub(crate) fn get_name_if_ns(record: &Record) -> Option<Result<&Name, ResolutionError>> {
    if record.record_type() != RecordType::NS {
        return None;
    }
    match record.data() {
        Some(RData::NS(ns)) => Some(Ok(&ns.0)),
        Some(_) => Some(Err(ServFail("inconsistent rdata type".to_string()))),
        _ => Some(Err(ServFail("no rdata".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use crate::target::{find_in_glue, get_name_if_ns, get_target};
    use crate::{a, ns};
    use anyhow::Result;
    use hickory_proto::rr::{rdata, IntoName, Name, RData, Record, RecordType};
    use std::str::FromStr;

    macro_rules! name {
        ($name:expr) => {
            Name::from_str($name)?
        };
    }

    #[test]
    fn test_find_in_glue() -> Result<()> {
        let ip0 = "172.104.148.31";
        let glue = vec![a!("ns0.c.d", ip0), a!("ns1.c.d", "140.238.85.157")];
        let result = find_in_glue(&"ns0.c.d".into_name()?, &glue);
        assert_eq!(Some(ip0.parse()?), result);
        Ok(())
    }

    #[test]
    fn test_get_name_if_ns() -> Result<()> {
        assert_eq!(&name!("ns0.com."), get_name_if_ns(&ns!("com.", "ns0.com.")).unwrap()?);
        assert!(get_name_if_ns(&a!("foo.com.", "127.0.0.1")).is_none());

        let r = Record::with(name!("ns0.com"), RecordType::NS, 60);
        assert_eq!(
            "server failure: no rdata",
            get_name_if_ns(&r).unwrap().unwrap_err().to_string()
        );

        let mut r = a!("ns0.com.", "127.0.0.1");
        r.set_rr_type(RecordType::NS);
        assert_eq!(
            "server failure: inconsistent rdata type",
            get_name_if_ns(&r).unwrap().unwrap_err().to_string()
        );
        Ok(())
    }

    #[test]
    fn test_get_target_invalid_input() -> Result<()> {
        let result = get_target(&a!("a.b.", "1.2.3.4"), &[]).unwrap_err();
        assert_eq!(
            "server failure: inconsistent data, NsProvider was fed a non-ns record",
            result.to_string()
        );

        let mut r = a!("ns0.com.", "127.0.0.1");
        r.set_rr_type(RecordType::NS);
        let result = get_target(&r, &[]).unwrap_err();
        assert_eq!("server failure: inconsistent rdata type", result.to_string());
        Ok(())
    }
}
