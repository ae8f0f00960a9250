//! Reference identifier grammar.
//!
//! All identifiers are opaque ASCII strings with a fixed grammar:
//! - endpoint ids: `v<n>` (vat) or `r<n>` (remote kernel),
//! - kernel refs: `ko<n>` (object) or `kp<n>` (promise),
//! - endpoint refs: `<space><kind><direction><n>`, e.g. `vo+3` for the third
//!   object exported by a vat, `rp-12` for a promise imported by a remote.
//!
//! The direction tag is always relative to the endpoint that minted or
//! received the reference: `+` means "this endpoint exported it", `-` means
//! "this endpoint imported it".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RefParseError {
    #[error("empty reference string")]
    Empty,
    #[error("unknown reference prefix in {0:?}")]
    UnknownPrefix(String),
    #[error("missing direction tag in {0:?}")]
    MissingDirection(String),
    #[error("invalid reference index in {0:?}")]
    BadIndex(String),
}

fn parse_index(digits: &str, whole: &str) -> Result<u64, RefParseError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RefParseError::BadIndex(whole.to_string()));
    }
    digits
        .parse::<u64>()
        .map_err(|_| RefParseError::BadIndex(whole.to_string()))
}

/// A vat or a remote-kernel connection, as seen from this kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EndpointId {
    Vat(u64),
    Remote(u64),
}

impl EndpointId {
    pub fn space(&self) -> RefSpace {
        match self {
            EndpointId::Vat(_) => RefSpace::Vat,
            EndpointId::Remote(_) => RefSpace::Remote,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(n) => write!(f, "v{n}"),
            EndpointId::Remote(n) => write!(f, "r{n}"),
        }
    }
}

impl FromStr for EndpointId {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match chars.next() {
            None => Err(RefParseError::Empty),
            Some('v') => Ok(EndpointId::Vat(parse_index(chars.as_str(), s)?)),
            Some('r') => Ok(EndpointId::Remote(parse_index(chars.as_str(), s)?)),
            Some(_) => Err(RefParseError::UnknownPrefix(s.to_string())),
        }
    }
}

impl TryFrom<String> for EndpointId {
    type Error = RefParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> String {
        id.to_string()
    }
}

/// Kernel-global capability identifier: `ko<n>` or `kp<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KRef {
    Object(u64),
    Promise(u64),
}

impl KRef {
    pub fn kind(&self) -> RefKind {
        match self {
            KRef::Object(_) => RefKind::Object,
            KRef::Promise(_) => RefKind::Promise,
        }
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, KRef::Promise(_))
    }

    pub fn index(&self) -> u64 {
        match self {
            KRef::Object(n) | KRef::Promise(n) => *n,
        }
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(n) => write!(f, "ko{n}"),
            KRef::Promise(n) => write!(f, "kp{n}"),
        }
    }
}

impl FromStr for KRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RefParseError::Empty);
        }
        if let Some(rest) = s.strip_prefix("ko") {
            Ok(KRef::Object(parse_index(rest, s)?))
        } else if let Some(rest) = s.strip_prefix("kp") {
            Ok(KRef::Promise(parse_index(rest, s)?))
        } else {
            Err(RefParseError::UnknownPrefix(s.to_string()))
        }
    }
}

impl TryFrom<String> for KRef {
    type Error = RefParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<KRef> for String {
    fn from(kref: KRef) -> String {
        kref.to_string()
    }
}

/// Name-space tag of an endpoint reference: vat or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefSpace {
    Vat,
    Remote,
}

impl RefSpace {
    fn tag(&self) -> char {
        match self {
            RefSpace::Vat => 'v',
            RefSpace::Remote => 'r',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    Object,
    Promise,
}

impl RefKind {
    fn tag(&self) -> char {
        match self {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
        }
    }
}

/// Direction tag relative to the endpoint: `+` exported, `-` imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefDirection {
    Export,
    Import,
}

impl RefDirection {
    fn tag(&self) -> char {
        match self {
            RefDirection::Export => '+',
            RefDirection::Import => '-',
        }
    }
}

/// Endpoint-local capability identifier, e.g. `vo+3` or `rp-12`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ERef {
    pub space: RefSpace,
    pub kind: RefKind,
    pub direction: RefDirection,
    pub index: u64,
}

impl ERef {
    pub fn new(space: RefSpace, kind: RefKind, direction: RefDirection, index: u64) -> Self {
        ERef {
            space,
            kind,
            direction,
            index,
        }
    }

    /// The `<space>o+<n>` export form for an object.
    pub fn object_export(space: RefSpace, index: u64) -> Self {
        ERef::new(space, RefKind::Object, RefDirection::Export, index)
    }

    pub fn object_import(space: RefSpace, index: u64) -> Self {
        ERef::new(space, RefKind::Object, RefDirection::Import, index)
    }

    pub fn promise_export(space: RefSpace, index: u64) -> Self {
        ERef::new(space, RefKind::Promise, RefDirection::Export, index)
    }

    pub fn promise_import(space: RefSpace, index: u64) -> Self {
        ERef::new(space, RefKind::Promise, RefDirection::Import, index)
    }
}

impl fmt::Display for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            self.space.tag(),
            self.kind.tag(),
            self.direction.tag(),
            self.index
        )
    }
}

impl FromStr for ERef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let space = match chars.next() {
            None => return Err(RefParseError::Empty),
            Some('v') => RefSpace::Vat,
            Some('r') => RefSpace::Remote,
            Some(_) => return Err(RefParseError::UnknownPrefix(s.to_string())),
        };
        let kind = match chars.next() {
            Some('o') => RefKind::Object,
            Some('p') => RefKind::Promise,
            _ => return Err(RefParseError::UnknownPrefix(s.to_string())),
        };
        let direction = match chars.next() {
            Some('+') => RefDirection::Export,
            Some('-') => RefDirection::Import,
            _ => return Err(RefParseError::MissingDirection(s.to_string())),
        };
        let index = parse_index(chars.as_str(), s)?;
        Ok(ERef {
            space,
            kind,
            direction,
            index,
        })
    }
}

impl TryFrom<String> for ERef {
    type Error = RefParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ERef> for String {
    fn from(eref: ERef) -> String {
        eref.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_id_round_trip() {
        for raw in ["v0", "v1", "v42", "r7"] {
            let id: EndpointId = raw.parse().expect("parse");
            assert_eq!(id.to_string(), raw);
        }
        assert_eq!(
            "x1".parse::<EndpointId>(),
            Err(RefParseError::UnknownPrefix("x1".into()))
        );
        assert_eq!(
            "v".parse::<EndpointId>(),
            Err(RefParseError::BadIndex("v".into()))
        );
        assert_eq!("".parse::<EndpointId>(), Err(RefParseError::Empty));
    }

    #[test]
    fn kref_round_trip() {
        assert_eq!("ko3".parse::<KRef>(), Ok(KRef::Object(3)));
        assert_eq!("kp12".parse::<KRef>(), Ok(KRef::Promise(12)));
        assert_eq!(KRef::Object(3).to_string(), "ko3");
        assert!("kq1".parse::<KRef>().is_err());
        assert!("ko".parse::<KRef>().is_err());
        assert!("ko1x".parse::<KRef>().is_err());
    }

    #[test]
    fn eref_round_trip() {
        for raw in ["vo+0", "vo-3", "vp+5", "vp-9", "ro+1", "rp-12"] {
            let eref: ERef = raw.parse().expect("parse");
            assert_eq!(eref.to_string(), raw);
        }
    }

    #[test]
    fn eref_rejects_missing_direction() {
        assert_eq!(
            "vo3".parse::<ERef>(),
            Err(RefParseError::MissingDirection("vo3".into()))
        );
        assert!("vq+3".parse::<ERef>().is_err());
        assert!("vo+".parse::<ERef>().is_err());
    }

    #[test]
    fn refs_serialize_as_strings() {
        let kref = KRef::Promise(4);
        assert_eq!(serde_json::to_string(&kref).expect("json"), "\"kp4\"");
        let back: KRef = serde_json::from_str("\"kp4\"").expect("json");
        assert_eq!(back, kref);

        let eref = ERef::object_import(RefSpace::Vat, 2);
        assert_eq!(serde_json::to_string(&eref).expect("json"), "\"vo-2\"");
        assert_eq!(ERef::promise_export(RefSpace::Vat, 1).to_string(), "vp+1");
        assert_eq!(ERef::promise_import(RefSpace::Remote, 4).to_string(), "rp-4");
    }
}
