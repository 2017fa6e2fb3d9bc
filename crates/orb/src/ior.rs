//! Interoperable object references.
//!
//! A reference names a remote (or local) object: a repository type id plus a
//! list of tagged profiles, each describing one way to reach the object. The
//! engine understands the internet profile (tag 0: version, host, port,
//! object key, tagged components); foreign profiles are preserved opaquely so
//! a reference that merely passes through survives re-encoding byte for byte.
//!
//! Two printable forms are accepted: the hex-stringified form (`IOR:...`,
//! the CDR encapsulation of the reference) and `corbaloc:iiop:` URLs with an
//! optional comma-separated address list.

use crate::error::{OrbError, Result};
use bytes::Bytes;
use cdr::{CdrReader, CdrWriter};
use giop::{GIOP_MAJOR, GIOP_MINOR};
use std::fmt;
use std::str::FromStr;

/// Profile tag of the internet (IIOP) profile.
pub const TAG_INTERNET_IOP: u32 = 0;
/// Profile tag of the multiple-components profile.
pub const TAG_MULTIPLE_COMPONENTS: u32 = 1;
/// Port assumed by `corbaloc` addresses that give none.
pub const DEFAULT_CORBALOC_PORT: u16 = 2809;

/// An uninterpreted component inside a profile (code sets, security, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedComponent {
    pub tag: u32,
    pub data: Bytes,
}

impl TaggedComponent {
    fn encode(&self, w: &mut CdrWriter) {
        w.write_u32(self.tag);
        w.write_octet_seq(&self.data);
    }

    fn decode(r: &mut CdrReader) -> Result<Self> {
        let tag = r.read_u32()?;
        let data = r.read_octet_seq()?;
        Ok(Self { tag, data })
    }
}

/// The internet profile: one dialable endpoint plus the object key the
/// target dispatcher resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IiopProfile {
    pub major: u8,
    pub minor: u8,
    pub host: String,
    pub port: u16,
    pub object_key: Bytes,
    pub components: Vec<TaggedComponent>,
}

impl IiopProfile {
    pub fn new(host: impl Into<String>, port: u16, object_key: Bytes) -> Self {
        Self {
            major: GIOP_MAJOR,
            minor: GIOP_MINOR,
            host: host.into(),
            port,
            object_key,
            components: Vec::new(),
        }
    }

    /// `host:port` form used as a connection key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn encode(&self, w: &mut CdrWriter) {
        let mut encap = CdrWriter::encapsulation(w.little_endian());
        encap.write_octet(self.major);
        encap.write_octet(self.minor);
        encap.write_string(&self.host);
        encap.write_u16(self.port);
        encap.write_octet_seq(&self.object_key);
        // profiles of version 1.0 carry no component list
        if !(self.major == 1 && self.minor == 0) {
            encap.write_u32(self.components.len() as u32);
            for component in &self.components {
                component.encode(&mut encap);
            }
        }
        w.write_encapsulation(encap);
    }

    fn decode(data: Bytes) -> Result<Self> {
        let mut r = CdrReader::encapsulation(data)?;
        let major = r.read_octet()?;
        let minor = r.read_octet()?;
        let host = r.read_string()?;
        let port = r.read_u16()?;
        let object_key = r.read_octet_seq()?;
        let mut components = Vec::new();
        if !(major == 1 && minor == 0) {
            let count = r.read_seq_len(8)?;
            for _ in 0..count {
                components.push(TaggedComponent::decode(&mut r)?);
            }
        }
        Ok(Self {
            major,
            minor,
            host,
            port,
            object_key,
            components,
        })
    }
}

/// One profile of a reference. Unknown tags keep their encapsulated octets
/// so they re-encode unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedProfile {
    Iiop(IiopProfile),
    Other { tag: u32, data: Bytes },
}

impl TaggedProfile {
    fn encode(&self, w: &mut CdrWriter) {
        match self {
            TaggedProfile::Iiop(profile) => {
                w.write_u32(TAG_INTERNET_IOP);
                profile.encode(w);
            }
            TaggedProfile::Other { tag, data } => {
                w.write_u32(*tag);
                w.write_octet_seq(data);
            }
        }
    }

    fn decode(r: &mut CdrReader) -> Result<Self> {
        let tag = r.read_u32()?;
        let data = r.read_octet_seq()?;
        if tag == TAG_INTERNET_IOP {
            Ok(TaggedProfile::Iiop(IiopProfile::decode(data)?))
        } else {
            Ok(TaggedProfile::Other { tag, data })
        }
    }
}

/// An interoperable object reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ior {
    pub type_id: String,
    pub profiles: Vec<TaggedProfile>,
}

impl Ior {
    /// The nil reference: empty type id, no profiles.
    pub fn nil() -> Self {
        Self {
            type_id: String::new(),
            profiles: Vec::new(),
        }
    }

    /// A single-profile reference for an object served at `host:port`.
    pub fn new(type_id: impl Into<String>, profile: IiopProfile) -> Self {
        Self {
            type_id: type_id.into(),
            profiles: vec![TaggedProfile::Iiop(profile)],
        }
    }

    pub fn is_nil(&self) -> bool {
        self.type_id.is_empty() && self.profiles.is_empty()
    }

    /// Internet profiles in their listed order, which is also the order the
    /// resolver attempts them.
    pub fn iiop_profiles(&self) -> impl Iterator<Item = &IiopProfile> {
        self.profiles.iter().filter_map(|p| match p {
            TaggedProfile::Iiop(profile) => Some(profile),
            TaggedProfile::Other { .. } => None,
        })
    }

    /// First internet profile, if any.
    pub fn primary_profile(&self) -> Option<&IiopProfile> {
        self.iiop_profiles().next()
    }

    /// Object key of the first internet profile.
    pub fn object_key(&self) -> Option<&Bytes> {
        self.primary_profile().map(|p| &p.object_key)
    }

    /// Write the reference into a surrounding CDR stream (the form used
    /// inside message bodies).
    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_string(&self.type_id);
        w.write_u32(self.profiles.len() as u32);
        for profile in &self.profiles {
            profile.encode(w);
        }
    }

    /// Read a reference embedded in a CDR stream.
    pub fn decode(r: &mut CdrReader) -> Result<Self> {
        let type_id = r.read_string()?;
        let count = r.read_seq_len(8)?;
        let mut profiles = Vec::with_capacity(count);
        for _ in 0..count {
            profiles.push(TaggedProfile::decode(r)?);
        }
        Ok(Self { type_id, profiles })
    }

    /// The octets behind the `IOR:` printable form: an endian flag octet
    /// followed by the encoded reference.
    pub fn to_wire(&self) -> Bytes {
        let mut w = CdrWriter::encapsulation(false);
        self.encode(&mut w);
        w.into_bytes()
    }

    /// Parse the octet form produced by [`to_wire`](Self::to_wire).
    pub fn from_wire(data: Bytes) -> Result<Self> {
        let mut r = CdrReader::encapsulation(data)?;
        Self::decode(&mut r)
    }

    fn parse_stringified(hex: &str) -> Result<Self> {
        let data = hex_decode(hex)?;
        Self::from_wire(Bytes::from(data))
    }

    /// Parse a `corbaloc:` URL. Each address in the comma-separated list
    /// becomes one internet profile carrying the shared object key, so a
    /// multi-address URL yields the same fallback order as a multi-profile
    /// reference. Addresses without a version default to the engine's own
    /// protocol version rather than the standard's 1.0.
    fn parse_corbaloc(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("corbaloc:")
            .ok_or_else(|| OrbError::UnresolvableReference(url.to_string()))?;
        let (addr_list, key_str) = rest.split_once('/').ok_or_else(|| {
            OrbError::UnresolvableReference(format!("corbaloc without object key: {url}"))
        })?;
        let object_key = Bytes::from(unescape_key(key_str)?);

        let mut profiles = Vec::new();
        for addr in addr_list.split(',') {
            let addr = addr.strip_prefix("iiop").unwrap_or(addr);
            let addr = addr.strip_prefix(':').ok_or_else(|| {
                OrbError::UnresolvableReference(format!("unsupported corbaloc address: {addr}"))
            })?;

            let (version, hostport) = match addr.split_once('@') {
                Some((v, rest)) => (parse_version(v)?, rest),
                None => ((GIOP_MAJOR, GIOP_MINOR), addr),
            };
            let (host, port) = match hostport.rsplit_once(':') {
                Some((host, port)) if !port.is_empty() => {
                    let port = port.parse::<u16>().map_err(|_| {
                        OrbError::UnresolvableReference(format!("bad corbaloc port: {port}"))
                    })?;
                    (host, port)
                }
                _ => (hostport, DEFAULT_CORBALOC_PORT),
            };
            if host.is_empty() {
                return Err(OrbError::UnresolvableReference(format!(
                    "corbaloc address without host: {url}"
                )));
            }

            let mut profile = IiopProfile::new(host, port, object_key.clone());
            profile.major = version.0;
            profile.minor = version.1;
            profiles.push(TaggedProfile::Iiop(profile));
        }

        Ok(Self {
            type_id: String::new(),
            profiles,
        })
    }
}

impl fmt::Display for Ior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IOR:")?;
        for byte in self.to_wire().iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Ior {
    type Err = OrbError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(hex) = s.strip_prefix("IOR:") {
            Self::parse_stringified(hex)
        } else if s.starts_with("corbaloc:") {
            Self::parse_corbaloc(s)
        } else {
            Err(OrbError::UnresolvableReference(format!(
                "not an IOR or corbaloc string: {s}"
            )))
        }
    }
}

fn parse_version(v: &str) -> Result<(u8, u8)> {
    let (major, minor) = v
        .split_once('.')
        .ok_or_else(|| OrbError::UnresolvableReference(format!("bad corbaloc version: {v}")))?;
    match (major.parse::<u8>(), minor.parse::<u8>()) {
        (Ok(major), Ok(minor)) => Ok((major, minor)),
        _ => Err(OrbError::UnresolvableReference(format!(
            "bad corbaloc version: {v}"
        ))),
    }
}

fn unescape_key(key: &str) -> Result<Vec<u8>> {
    let raw = key.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            if i + 3 > raw.len() {
                return Err(OrbError::UnresolvableReference(format!(
                    "truncated escape in corbaloc key: {key}"
                )));
            }
            let hi = hex_digit(raw[i + 1])?;
            let lo = hex_digit(raw[i + 2])?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        other => Err(OrbError::UnresolvableReference(format!(
            "invalid hex digit {:?}",
            other as char
        ))),
    }
}

fn hex_decode(hex: &str) -> Result<Vec<u8>> {
    let raw = hex.as_bytes();
    if raw.len() % 2 != 0 {
        return Err(OrbError::UnresolvableReference(
            "odd-length hex string".into(),
        ));
    }
    let mut out = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        out.push(hex_digit(pair[0])? << 4 | hex_digit(pair[1])?);
    }
    Ok(out)
}
