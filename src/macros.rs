/// Default TTL baked into the `ns!`/`a!`/`cname!` fixture records. Non-zero
/// so fixture-built responses round-trip through [`crate::cache::DnsCache`]
/// without tripping its zero-TTL "don't cache this" rule.
pub(crate) const FIXTURE_TTL: u32 = 3600;

#[macro_export]
macro_rules! ns {
    ($name:expr, $target:expr) => {
        Record::from_rdata(
            $name.parse()?,
            $crate::macros::FIXTURE_TTL,
            RData::NS(rdata::NS($target.parse()?)),
        )
    };
}

#[macro_export]
macro_rules! a {
    ($name:expr, $target:expr) => {
        Record::from_rdata(
            $name.parse()?,
            $crate::macros::FIXTURE_TTL,
            RData::A(rdata::A(($target.parse()?))),
        )
    };
}

#[macro_export]
macro_rules! cname {
    ($name:expr, $target:expr) => {
        Record::from_rdata(
            $name.parse()?,
            $crate::macros::FIXTURE_TTL,
            RData::CNAME(rdata::CNAME($target.parse()?)),
        )
    };
}

#[macro_export]
macro_rules! refer {
    ($nameservers:expr) => {{
        let mut msg = Message::new();
        msg.insert_name_servers(vec![$nameservers]);
        msg
    }};
    ($nameservers:expr, $glue:expr) => {{
        let mut msg = Message::new();
        msg.insert_name_servers(vec![$nameservers]);
        msg.insert_additionals(vec![$glue]);
        msg
    }};
}

#[macro_export]
macro_rules! answer {
    ($($record:expr),+ $(,)?) => {{
        let mut msg = Message::new();
        let mut header = Header::default();
        header.set_authoritative(true);
        msg.set_header(header);
        msg.insert_answers(vec![$($record),+]);
        msg
    }};
}

#[macro_export]
macro_rules! nxdomain {
    () => {{
        let mut msg = Message::new();
        let mut header = Header::default();
        header.set_authoritative(true);
        header.set_response_code(ResponseCode::NXDomain);
        msg.set_header(header);
        msg
    }};
}
