//! Bootstrap configuration: one netlink-framed message on the init pipe.

use std::{fmt, io::Read, str::FromStr};

use crate::namespaces::Namespaces;

pub const INIT_MSG: u16 = 62000;
pub const NLMSG_HDRLEN: usize = 16;
pub const NLA_HDRLEN: usize = 4;
const NLMSG_ERROR: u16 = 2;
const NLM_F_REQUEST: u16 = 1;

pub const CLONE_FLAGS_ATTR: u16 = 27281;
pub const NS_PATHS_ATTR: u16 = 27282;
pub const UIDMAP_ATTR: u16 = 27283;
pub const GIDMAP_ATTR: u16 = 27284;
pub const SETGROUP_ATTR: u16 = 27285;
pub const OOM_SCORE_ADJ_ATTR: u16 = 27286;
pub const ROOTLESS_EUID_ATTR: u16 = 27287;
pub const UIDMAPPATH_ATTR: u16 = 27288;
pub const GIDMAPPATH_ATTR: u16 = 27289;
pub const TIMENSOFFSET_ATTR: u16 = 27290;

// anything bigger is not a config blob
const MAX_PAYLOAD: usize = 16 << 20;

fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("failed to read bootstrap data")]
    Io(#[from] std::io::Error),
    #[error("invalid netlink header length {0}")]
    ShortHeader(usize),
    #[error("failed to read netlink message")]
    NetlinkError,
    #[error("unexpected msg type {0}")]
    UnexpectedType(u16),
    #[error("invalid netlink message length {0}")]
    BadLength(u32),
    #[error("failed to allocate {0} bytes for netlink payload")]
    Alloc(usize),
    #[error("failed to read netlink payload, {got} != {want}")]
    ShortPayload { got: usize, want: usize },
    #[error("truncated attribute at offset {0}")]
    TruncatedAttribute(usize),
    #[error("attribute {tag} has invalid length {len}")]
    BadAttributeLength { tag: u16, len: usize },
    #[error("unknown netlink message type {0}")]
    UnknownAttribute(u16),
    #[error("malformed {what}: {line:?}")]
    Malformed { what: &'static str, line: String },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("attribute {tag} payload of {len} bytes does not fit in a netlink attribute")]
    AttributeTooLong { tag: u16, len: usize },
}

/// One decoded attribute. Byte payloads borrow from the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute<'a> {
    CloneFlags(u32),
    NsPaths(&'a [u8]),
    UidMap(&'a [u8]),
    GidMap(&'a [u8]),
    Setgroup(bool),
    OomScoreAdj(&'a [u8]),
    RootlessEuid(bool),
    UidMapPath(&'a [u8]),
    GidMapPath(&'a [u8]),
    TimeOffsets(&'a [u8]),
    Unrecognized(u16),
}

// byte attributes are NUL-terminated on the wire
fn strip_nul(payload: &[u8]) -> &[u8] {
    payload.strip_suffix(b"\0").unwrap_or(payload)
}

impl<'a> Attribute<'a> {
    fn parse(tag: u16, payload: &'a [u8]) -> Result<Self, DecodeError> {
        let bad_len = || DecodeError::BadAttributeLength {
            tag,
            len: payload.len(),
        };
        Ok(match tag {
            CLONE_FLAGS_ATTR => {
                let bytes: [u8; 4] = payload.try_into().map_err(|_| bad_len())?;
                Attribute::CloneFlags(u32::from_ne_bytes(bytes))
            }
            SETGROUP_ATTR | ROOTLESS_EUID_ATTR => {
                let value = *payload.first().ok_or_else(bad_len)? != 0;
                if tag == SETGROUP_ATTR {
                    Attribute::Setgroup(value)
                } else {
                    Attribute::RootlessEuid(value)
                }
            }
            NS_PATHS_ATTR => Attribute::NsPaths(strip_nul(payload)),
            UIDMAP_ATTR => Attribute::UidMap(strip_nul(payload)),
            GIDMAP_ATTR => Attribute::GidMap(strip_nul(payload)),
            OOM_SCORE_ADJ_ATTR => Attribute::OomScoreAdj(strip_nul(payload)),
            UIDMAPPATH_ATTR => Attribute::UidMapPath(strip_nul(payload)),
            GIDMAPPATH_ATTR => Attribute::GidMapPath(strip_nul(payload)),
            TIMENSOFFSET_ATTR => Attribute::TimeOffsets(strip_nul(payload)),
            other => Attribute::Unrecognized(other),
        })
    }
}

/// Walks the attribute area of a message payload.
pub struct Attributes<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Attributes<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Attributes { data, offset: 0 }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<Attribute<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.offset..];
        if rest.is_empty() {
            return None;
        }
        if rest.len() < NLA_HDRLEN {
            let at = self.offset;
            self.offset = self.data.len();
            return Some(Err(DecodeError::TruncatedAttribute(at)));
        }

        let len = u16::from_ne_bytes([rest[0], rest[1]]) as usize;
        let tag = u16::from_ne_bytes([rest[2], rest[3]]);
        if len < NLA_HDRLEN || len > rest.len() {
            self.offset = self.data.len();
            return Some(Err(DecodeError::BadAttributeLength { tag, len }));
        }

        let payload = &rest[NLA_HDRLEN..len];
        // padding of the final attribute may be omitted
        self.offset += nla_align(len).min(rest.len());
        Some(Attribute::parse(tag, payload))
    }
}

/// Decoded bootstrap configuration. Byte fields are kept uninterpreted; see
/// [`BootstrapConfig::uid_mappings`] and friends for the parsed views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub clone_flags: u32,
    pub ns_paths: Option<Vec<u8>>,
    pub uid_map: Option<Vec<u8>>,
    pub gid_map: Option<Vec<u8>>,
    pub setgroup: bool,
    pub oom_score_adj: Option<Vec<u8>>,
    pub rootless_euid: bool,
    pub uid_map_path: Option<Vec<u8>>,
    pub gid_map_path: Option<Vec<u8>>,
    pub time_offsets: Option<Vec<u8>>,
}

fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

impl BootstrapConfig {
    /// Reads exactly one message (header + payload) from `r`.
    pub fn read_from(mut r: impl Read) -> Result<Self, DecodeError> {
        let mut header = [0u8; NLMSG_HDRLEN];
        let got = read_full(&mut r, &mut header)?;
        if got != NLMSG_HDRLEN {
            return Err(DecodeError::ShortHeader(got));
        }

        let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let ty = u16::from_ne_bytes([header[4], header[5]]);
        if ty == NLMSG_ERROR {
            return Err(DecodeError::NetlinkError);
        }
        if ty != INIT_MSG {
            return Err(DecodeError::UnexpectedType(ty));
        }
        let want = (len as usize)
            .checked_sub(NLMSG_HDRLEN)
            .filter(|&n| n <= MAX_PAYLOAD)
            .ok_or(DecodeError::BadLength(len))?;

        let mut payload = Vec::new();
        payload
            .try_reserve_exact(want)
            .map_err(|_| DecodeError::Alloc(want))?;
        payload.resize(want, 0);
        let got = read_full(&mut r, &mut payload)?;
        if got != want {
            return Err(DecodeError::ShortPayload { got, want });
        }

        Self::from_attributes(&payload)
    }

    /// Decodes a complete message held in memory. Trailing bytes are an error.
    pub fn decode(message: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = message;
        let config = Self::read_from(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(DecodeError::BadLength(message.len() as u32));
        }
        Ok(config)
    }

    pub fn from_attributes(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut config = BootstrapConfig::default();
        for attr in Attributes::new(payload) {
            match attr? {
                Attribute::CloneFlags(flags) => config.clone_flags = flags,
                Attribute::NsPaths(v) => config.ns_paths = Some(v.to_vec()),
                Attribute::UidMap(v) => config.uid_map = Some(v.to_vec()),
                Attribute::GidMap(v) => config.gid_map = Some(v.to_vec()),
                Attribute::Setgroup(v) => config.setgroup = v,
                Attribute::OomScoreAdj(v) => config.oom_score_adj = Some(v.to_vec()),
                Attribute::RootlessEuid(v) => config.rootless_euid = v,
                Attribute::UidMapPath(v) => config.uid_map_path = Some(v.to_vec()),
                Attribute::GidMapPath(v) => config.gid_map_path = Some(v.to_vec()),
                Attribute::TimeOffsets(v) => config.time_offsets = Some(v.to_vec()),
                Attribute::Unrecognized(tag) => return Err(DecodeError::UnknownAttribute(tag)),
            }
        }
        Ok(config)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut msg = MessageBuilder::new(INIT_MSG);
        msg.add_u32(CLONE_FLAGS_ATTR, self.clone_flags);
        let bytes = [
            (NS_PATHS_ATTR, &self.ns_paths),
            (UIDMAP_ATTR, &self.uid_map),
            (GIDMAP_ATTR, &self.gid_map),
            (OOM_SCORE_ADJ_ATTR, &self.oom_score_adj),
            (UIDMAPPATH_ATTR, &self.uid_map_path),
            (GIDMAPPATH_ATTR, &self.gid_map_path),
            (TIMENSOFFSET_ATTR, &self.time_offsets),
        ];
        for (tag, value) in bytes {
            if let Some(value) = value {
                msg.add_bytes(tag, value)?;
            }
        }
        msg.add_bool(SETGROUP_ATTR, self.setgroup);
        msg.add_bool(ROOTLESS_EUID_ATTR, self.rootless_euid);
        Ok(msg.finish())
    }

    pub fn namespaces(&self) -> Namespaces {
        Namespaces::from_bits_retain(self.clone_flags)
    }

    /// The raw join list. An attribute that was sent empty comes back as
    /// `Some("")`, which the namespace joiner rejects.
    pub fn ns_paths(&self) -> Result<Option<&str>, DecodeError> {
        self.ns_paths
            .as_deref()
            .map(|v| utf8("namespace paths", v))
            .transpose()
    }

    pub fn uid_mappings(&self) -> Result<Vec<IdMap>, DecodeError> {
        IdMap::parse_table(self.uid_map.as_deref().unwrap_or_default())
    }

    pub fn gid_mappings(&self) -> Result<Vec<IdMap>, DecodeError> {
        IdMap::parse_table(self.gid_map.as_deref().unwrap_or_default())
    }

    pub fn time_offsets(&self) -> Result<Vec<TimeOffset>, DecodeError> {
        TimeOffset::parse_table(self.time_offsets.as_deref().unwrap_or_default())
    }

    /// Parsed oom_score_adj, if one was sent.
    pub fn oom_score_adj(&self) -> Result<Option<i32>, DecodeError> {
        let Some(raw) = self.oom_score_adj.as_deref().filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let text = utf8("oom_score_adj", raw)?;
        text.trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| DecodeError::Malformed {
                what: "oom_score_adj",
                line: text.to_string(),
            })
    }
}

fn utf8<'a>(what: &'static str, raw: &'a [u8]) -> Result<&'a str, DecodeError> {
    std::str::from_utf8(raw).map_err(|_| DecodeError::Malformed {
        what,
        line: String::from_utf8_lossy(raw).into_owned(),
    })
}

/// Builds a netlink-framed message the way the runtime sends it.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(ty: u16) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&ty.to_ne_bytes());
        buf.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
        // seq, pid
        buf.extend_from_slice(&[0u8; 8]);
        MessageBuilder { buf }
    }

    // callers guarantee len fits in the u16 length field
    fn push(&mut self, tag: u16, payload: &[u8]) -> &mut Self {
        let len = NLA_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&tag.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(self.buf.len() + nla_align(len) - len, 0);
        self
    }

    pub fn add_raw(&mut self, tag: u16, payload: &[u8]) -> Result<&mut Self, EncodeError> {
        let len = NLA_HDRLEN + payload.len();
        if len > u16::MAX as usize {
            return Err(EncodeError::AttributeTooLong {
                tag,
                len: payload.len(),
            });
        }
        Ok(self.push(tag, payload))
    }

    pub fn add_u32(&mut self, tag: u16, value: u32) -> &mut Self {
        self.push(tag, &value.to_ne_bytes())
    }

    pub fn add_bool(&mut self, tag: u16, value: bool) -> &mut Self {
        self.push(tag, &[value as u8])
    }

    pub fn add_bytes(&mut self, tag: u16, value: &[u8]) -> Result<&mut Self, EncodeError> {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value);
        payload.push(0);
        self.add_raw(tag, &payload)
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// One line of a uid_map/gid_map table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    pub fn parse_table(raw: &[u8]) -> Result<Vec<IdMap>, DecodeError> {
        utf8("id mapping", raw)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn render_table(maps: &[IdMap]) -> Vec<u8> {
        maps.iter().map(|m| m.to_string()).collect::<String>().into_bytes()
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.container_id, self.host_id, self.size)
    }
}

impl FromStr for IdMap {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || DecodeError::Malformed {
            what: "id mapping",
            line: line.to_string(),
        };
        let fields = line
            .split_whitespace()
            .map(|f| f.parse::<u32>().map_err(|_| malformed()))
            .collect::<Result<Vec<_>, _>>()?;
        match fields[..] {
            [container_id, host_id, size] => Ok(IdMap {
                container_id,
                host_id,
                size,
            }),
            _ => Err(malformed()),
        }
    }
}

/// Per-clock offset for a new time namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeOffset {
    pub clock: String,
    pub secs: i64,
    pub nanosecs: u32,
}

impl TimeOffset {
    pub fn parse_table(raw: &[u8]) -> Result<Vec<TimeOffset>, DecodeError> {
        utf8("time offsets", raw)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn render_table(offsets: &[TimeOffset]) -> Vec<u8> {
        offsets
            .iter()
            .map(|o| o.to_string())
            .collect::<String>()
            .into_bytes()
    }
}

impl fmt::Display for TimeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.clock, self.secs, self.nanosecs)
    }
}

impl FromStr for TimeOffset {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || DecodeError::Malformed {
            what: "time offset",
            line: line.to_string(),
        };
        let mut fields = line.split_whitespace();
        let (Some(clock), Some(secs), Some(nanosecs), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };
        Ok(TimeOffset {
            clock: clock.to_string(),
            secs: secs.parse().map_err(|_| malformed())?,
            nanosecs: nanosecs.parse().map_err(|_| malformed())?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn full_config() -> BootstrapConfig {
        BootstrapConfig {
            clone_flags: (Namespaces::USER | Namespaces::MNT | Namespaces::TIME).bits(),
            ns_paths: Some(b"net:/proc/1/ns/net,ipc:/proc/1/ns/ipc".to_vec()),
            uid_map: Some(b"0 1000 1\n1 100000 65536\n".to_vec()),
            gid_map: Some(b"0 1000 1\n".to_vec()),
            setgroup: true,
            oom_score_adj: Some(b"-500".to_vec()),
            rootless_euid: true,
            uid_map_path: Some(b"/usr/bin/newuidmap".to_vec()),
            gid_map_path: Some(b"/usr/bin/newgidmap".to_vec()),
            time_offsets: Some(b"monotonic 3600 0\n".to_vec()),
        }
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let config = full_config();
        let wire = config.encode().unwrap();
        assert_eq!(wire.len() % 4, 0);
        assert_eq!(BootstrapConfig::decode(&wire).unwrap(), config);

        let empty = BootstrapConfig::default();
        assert_eq!(BootstrapConfig::decode(&empty.encode().unwrap()).unwrap(), empty);
    }

    #[test]
    fn reads_exactly_one_message_from_stream() {
        let mut stream = full_config().encode().unwrap();
        stream.extend_from_slice(b"trailing data for someone else");
        let mut reader = &stream[..];
        let config = BootstrapConfig::read_from(&mut reader).unwrap();
        assert_eq!(config, full_config());
        assert_eq!(reader, b"trailing data for someone else");
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let mut msg = MessageBuilder::new(INIT_MSG);
        msg.add_u32(CLONE_FLAGS_ATTR, 0).add_bytes(0xffff, b"surprise").unwrap();
        let err = BootstrapConfig::decode(&msg.finish()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownAttribute(0xffff)));
    }

    #[test]
    fn wrong_message_type() {
        let wire = MessageBuilder::new(61999).finish();
        assert!(matches!(
            BootstrapConfig::decode(&wire),
            Err(DecodeError::UnexpectedType(61999))
        ));
        let wire = MessageBuilder::new(NLMSG_ERROR).finish();
        assert!(matches!(
            BootstrapConfig::decode(&wire),
            Err(DecodeError::NetlinkError)
        ));
    }

    #[test]
    fn length_mismatches() {
        let wire = full_config().encode().unwrap();
        assert!(matches!(
            BootstrapConfig::decode(&wire[..10]),
            Err(DecodeError::ShortHeader(10))
        ));
        assert!(matches!(
            BootstrapConfig::decode(&wire[..wire.len() - 4]),
            Err(DecodeError::ShortPayload { .. })
        ));

        let mut bad = wire.clone();
        bad[..4].copy_from_slice(&8u32.to_ne_bytes());
        assert!(matches!(
            BootstrapConfig::decode(&bad),
            Err(DecodeError::BadLength(8))
        ));
    }

    #[test]
    fn malformed_attributes() {
        let mut msg = MessageBuilder::new(INIT_MSG);
        msg.add_raw(CLONE_FLAGS_ATTR, &[1, 2]).unwrap();
        assert!(matches!(
            BootstrapConfig::decode(&msg.finish()),
            Err(DecodeError::BadAttributeLength {
                tag: CLONE_FLAGS_ATTR,
                len: 2
            })
        ));

        // attribute claims more bytes than the message holds
        let mut wire = MessageBuilder::new(INIT_MSG);
        wire.add_bytes(NS_PATHS_ATTR, b"net:/x").unwrap();
        let mut wire = wire.finish();
        wire[NLMSG_HDRLEN..NLMSG_HDRLEN + 2].copy_from_slice(&200u16.to_ne_bytes());
        assert!(matches!(
            BootstrapConfig::decode(&wire),
            Err(DecodeError::BadAttributeLength { len: 200, .. })
        ));
    }

    #[test]
    fn truncated_attribute_reports_its_offset() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u16.to_ne_bytes());
        payload.extend_from_slice(&CLONE_FLAGS_ATTR.to_ne_bytes());
        payload.extend_from_slice(&0u32.to_ne_bytes());
        payload.extend_from_slice(&[1, 2]);
        assert!(matches!(
            BootstrapConfig::from_attributes(&payload),
            Err(DecodeError::TruncatedAttribute(8))
        ));
    }

    #[test]
    fn oversized_attribute_is_refused() {
        let config = BootstrapConfig {
            ns_paths: Some(vec![b'a'; 70000]),
            ..Default::default()
        };
        assert_eq!(
            config.encode().unwrap_err(),
            EncodeError::AttributeTooLong {
                tag: NS_PATHS_ATTR,
                len: 70001
            }
        );

        // the largest payload that still fits
        let mut msg = MessageBuilder::new(INIT_MSG);
        assert!(msg.add_raw(UIDMAP_ATTR, &vec![0; u16::MAX as usize - NLA_HDRLEN]).is_ok());
        assert!(msg.add_raw(UIDMAP_ATTR, &vec![0; u16::MAX as usize - NLA_HDRLEN + 1]).is_err());
    }

    #[test]
    fn empty_ns_paths_survive_decoding() {
        let config = BootstrapConfig {
            ns_paths: Some(vec![]),
            ..Default::default()
        };
        let decoded = BootstrapConfig::decode(&config.encode().unwrap()).unwrap();
        assert_eq!(decoded.ns_paths().unwrap(), Some(""));
        assert_eq!(BootstrapConfig::default().ns_paths().unwrap(), None);
    }

    #[test]
    fn parsed_views() {
        let config = full_config();
        assert_eq!(
            config.uid_mappings().unwrap(),
            vec![
                IdMap {
                    container_id: 0,
                    host_id: 1000,
                    size: 1
                },
                IdMap {
                    container_id: 1,
                    host_id: 100000,
                    size: 65536
                },
            ]
        );
        assert_eq!(IdMap::render_table(&config.uid_mappings().unwrap()), config.uid_map.clone().unwrap());
        assert_eq!(config.oom_score_adj().unwrap(), Some(-500));
        assert_eq!(
            config.time_offsets().unwrap(),
            vec![TimeOffset {
                clock: "monotonic".to_string(),
                secs: 3600,
                nanosecs: 0
            }]
        );
        assert!(config.namespaces().contains(Namespaces::USER | Namespaces::TIME));
        assert_eq!(config.ns_paths().unwrap(), Some("net:/proc/1/ns/net,ipc:/proc/1/ns/ipc"));

        assert!("0 1000".parse::<IdMap>().is_err());
        assert!("boottime x 0".parse::<TimeOffset>().is_err());
        assert_eq!(BootstrapConfig::default().uid_mappings().unwrap(), vec![]);
    }
}
