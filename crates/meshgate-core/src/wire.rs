//! Meshgate wire format — on-wire types for all overlay traffic.
//!
//! These types ARE the protocol. Every field, every size, every tag byte is
//! part of the wire format; changing anything here is a breaking change for
//! every edge and every federated supernode.
//!
//! A datagram is a 4-byte nonce, a 22-byte common header, and a
//! message-type-specific body. The common header may be sealed by a
//! [`HeaderCipher`](crate::crypto::HeaderCipher); the codec itself is pure
//! and stateless given a [`KeyResolver`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use bytes::{BufMut, Bytes};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::HeaderCipher;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol magic. Rejected datagrams never get a reply.
pub const MAGIC: [u8; 2] = [0x6D, 0x47];

/// Current wire format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Nonce prefix carried in the clear on every datagram.
pub const NONCE_SIZE: usize = 4;

/// Size of the common header, before sealing.
pub const HEADER_SIZE: usize = 22;

/// AEAD tag overhead added by a sealed header.
pub const SEAL_OVERHEAD: usize = 16;

/// Sealed header block size.
pub const SEALED_HEADER_SIZE: usize = HEADER_SIZE + SEAL_OVERHEAD;

/// Maximum community name length in bytes (no terminator slack).
pub const COMMUNITY_SIZE: usize = 16;

/// Maximum length of version/description strings carried on the wire.
pub const VERSION_STR_MAX: usize = 19;

/// Initial TTL stamped on locally-originated datagrams.
pub const DEFAULT_TTL: u8 = 2;

/// Header flag: datagram was relayed by a supernode. Suppresses
/// supernode-to-supernode re-broadcast.
pub const FLAG_FROM_SUPERNODE: u8 = 0x01;

// ── MAC addresses ─────────────────────────────────────────────────────────────

/// A 6-byte Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const NULL: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn is_null(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }

    /// Group bit set — includes the broadcast address.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

impl FromStr for MacAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, WireError> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or(WireError::Malformed("mac"))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| WireError::Malformed("mac"))?;
        }
        if parts.next().is_some() {
            return Err(WireError::Malformed("mac"));
        }
        Ok(MacAddr(out))
    }
}

// ── Community names ───────────────────────────────────────────────────────────

/// A community name: 1..=16 bytes of UTF-8, compared case-sensitively.
/// A leading `*` marks a federation community.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommunityName {
    bytes: [u8; COMMUNITY_SIZE],
    len: u8,
}

impl CommunityName {
    pub fn new(name: &str) -> Result<Self, WireError> {
        if name.is_empty() || name.len() > COMMUNITY_SIZE {
            return Err(WireError::BadCommunityName);
        }
        let mut bytes = [0u8; COMMUNITY_SIZE];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(CommunityName {
            bytes,
            len: name.len() as u8,
        })
    }

    /// Parse the null-padded wire field.
    pub fn from_wire(field: &[u8; COMMUNITY_SIZE]) -> Result<Self, WireError> {
        let len = field.iter().position(|&b| b == 0).unwrap_or(COMMUNITY_SIZE);
        let name = std::str::from_utf8(&field[..len]).map_err(|_| WireError::BadCommunityName)?;
        CommunityName::new(name)
    }

    pub fn as_str(&self) -> &str {
        // Constructed from validated UTF-8 only.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn wire_bytes(&self) -> [u8; COMMUNITY_SIZE] {
        self.bytes
    }

    pub fn is_federation(&self) -> bool {
        self.bytes[0] == b'*'
    }
}

impl fmt::Display for CommunityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CommunityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommunityName({:?})", self.as_str())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors arising when interpreting or producing wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,

    #[error("unknown magic or wire version")]
    UnknownMagic,

    #[error("unknown community")]
    UnknownCommunity,

    #[error("header authentication failed")]
    AuthFailure,

    #[error("malformed {0} field")]
    Malformed(&'static str),

    #[error("unknown message type 0x{0:02x}")]
    UnknownMsgType(u8),

    #[error("community name must be 1..={COMMUNITY_SIZE} bytes of UTF-8")]
    BadCommunityName,

    #[error("string exceeds {VERSION_STR_MAX} bytes")]
    StringTooLong,
}

// ── Message kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Register = 0x01,
    RegisterAck = 0x02,
    RegisterNak = 0x03,
    Packet = 0x04,
    QueryPeer = 0x05,
    PeerInfo = 0x06,
    RegisterSuper = 0x07,
    RegisterSuperAck = 0x08,
    RegisterSuperNak = 0x09,
    UnregisterSuper = 0x0A,
    FederationInfo = 0x0B,
}

impl TryFrom<u8> for MsgKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(MsgKind::Register),
            0x02 => Ok(MsgKind::RegisterAck),
            0x03 => Ok(MsgKind::RegisterNak),
            0x04 => Ok(MsgKind::Packet),
            0x05 => Ok(MsgKind::QueryPeer),
            0x06 => Ok(MsgKind::PeerInfo),
            0x07 => Ok(MsgKind::RegisterSuper),
            0x08 => Ok(MsgKind::RegisterSuperAck),
            0x09 => Ok(MsgKind::RegisterSuperNak),
            0x0A => Ok(MsgKind::UnregisterSuper),
            0x0B => Ok(MsgKind::FederationInfo),
            other => Err(WireError::UnknownMsgType(other)),
        }
    }
}

/// Reason carried in REGISTER_NAK / REGISTER_SUPER_NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NakReason {
    Auth = 0x01,
    Community = 0x02,
    MacInUse = 0x03,
    NotRegistered = 0x04,
}

impl TryFrom<u8> for NakReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(NakReason::Auth),
            0x02 => Ok(NakReason::Community),
            0x03 => Ok(NakReason::MacInUse),
            0x04 => Ok(NakReason::NotRegistered),
            _ => Err(WireError::Malformed("nak reason")),
        }
    }
}

// ── Common header ─────────────────────────────────────────────────────────────

/// The common overlay header. Wire size: 22 bytes.
///
/// When a community uses header encryption this block travels sealed; the
/// nonce prefix always stays in the clear.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct OverlayHeader {
    pub magic: [u8; 2],
    pub version: u8,
    pub msg_type: u8,
    pub ttl: u8,
    pub flags: u8,
    pub community: [u8; COMMUNITY_SIZE],
}

assert_eq_size!(OverlayHeader, [u8; HEADER_SIZE]);

impl OverlayHeader {
    fn valid_magic(&self) -> bool {
        self.magic == MAGIC && self.version == WIRE_VERSION
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub cookie: u32,
    pub src_mac: MacAddr,
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterAck {
    pub cookie: u32,
    pub mac: MacAddr,
    pub auto_ip: Ipv4Addr,
    pub auto_ip_bitlen: u8,
    pub observed: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterNak {
    pub cookie: u32,
    pub reason: NakReason,
}

/// Relayed user payload. The codec pins the opaque boundary after the two
/// Ethernet MAC fields; everything past them is never inspected.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketData {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPeer {
    pub src_mac: MacAddr,
    pub target_mac: MacAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfoMsg {
    pub requester_mac: MacAddr,
    pub target_mac: MacAddr,
    pub sock: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSuper {
    pub cookie: u32,
    pub src_mac: MacAddr,
    pub selection: u32,
    pub uptime: u64,
    pub version: String,
    pub communities: Vec<CommunityName>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSuperAck {
    pub cookie: u32,
    pub mac: MacAddr,
    pub selection: u32,
    pub communities: Vec<CommunityName>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSuperNak {
    pub cookie: u32,
    pub reason: NakReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnregisterSuper {
    pub src_mac: MacAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FederationInfo {
    pub communities: Vec<CommunityName>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Register(Register),
    RegisterAck(RegisterAck),
    RegisterNak(RegisterNak),
    Packet(PacketData),
    QueryPeer(QueryPeer),
    PeerInfo(PeerInfoMsg),
    RegisterSuper(RegisterSuper),
    RegisterSuperAck(RegisterSuperAck),
    RegisterSuperNak(RegisterSuperNak),
    UnregisterSuper(UnregisterSuper),
    FederationInfo(FederationInfo),
}

impl Body {
    pub fn kind(&self) -> MsgKind {
        match self {
            Body::Register(_) => MsgKind::Register,
            Body::RegisterAck(_) => MsgKind::RegisterAck,
            Body::RegisterNak(_) => MsgKind::RegisterNak,
            Body::Packet(_) => MsgKind::Packet,
            Body::QueryPeer(_) => MsgKind::QueryPeer,
            Body::PeerInfo(_) => MsgKind::PeerInfo,
            Body::RegisterSuper(_) => MsgKind::RegisterSuper,
            Body::RegisterSuperAck(_) => MsgKind::RegisterSuperAck,
            Body::RegisterSuperNak(_) => MsgKind::RegisterSuperNak,
            Body::UnregisterSuper(_) => MsgKind::UnregisterSuper,
            Body::FederationInfo(_) => MsgKind::FederationInfo,
        }
    }
}

/// A fully-parsed overlay datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub ttl: u8,
    pub flags: u8,
    pub community: CommunityName,
    pub body: Body,
}

impl Frame {
    pub fn new(community: CommunityName, body: Body) -> Self {
        Frame {
            ttl: DEFAULT_TTL,
            flags: 0,
            community,
            body,
        }
    }

    pub fn from_supernode(&self) -> bool {
        self.flags & FLAG_FROM_SUPERNODE != 0
    }
}

// ── Header authentication ─────────────────────────────────────────────────────

/// How the common header of a decoded datagram was authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAuth {
    /// Community runs without header encryption.
    Clear,
    /// Sealed with the community-wide key.
    Community,
    /// Sealed with a per-user key; the username is the proven identity.
    User(String),
}

impl HeaderAuth {
    /// Whether the sender proved possession of a community or user key.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, HeaderAuth::Clear)
    }
}

/// Whether a cleartext header is acceptable for a community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearPolicy {
    Accept,
    Reject,
    UnknownCommunity,
}

/// One key the decoder may try against a sealed header.
pub struct KeyCandidate {
    pub community: CommunityName,
    pub auth: HeaderAuth,
    pub cipher: Arc<dyn HeaderCipher>,
}

/// Resolves which keys may seal a header. Implemented by the community
/// registry; the codec never holds key state of its own.
pub trait KeyResolver {
    fn clear_policy(&self, community: &CommunityName) -> ClearPolicy;

    /// Candidates in a fixed, deterministic order.
    fn candidates(&self) -> Vec<KeyCandidate>;
}

/// Result of [`decode`].
#[derive(Debug)]
pub struct Decoded {
    pub frame: Frame,
    pub auth: HeaderAuth,
}

// ── Decoding ──────────────────────────────────────────────────────────────────

pub fn decode(buf: &[u8], resolver: &dyn KeyResolver) -> Result<Decoded, WireError> {
    if buf.len() < NONCE_SIZE + HEADER_SIZE {
        return Err(WireError::Truncated);
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&buf[..NONCE_SIZE]);

    // Cleartext header first.
    if let Some(header) = OverlayHeader::read_from(&buf[NONCE_SIZE..NONCE_SIZE + HEADER_SIZE]) {
        if header.valid_magic() {
            let community = CommunityName::from_wire(&header.community)?;
            return match resolver.clear_policy(&community) {
                ClearPolicy::Accept => {
                    let body = decode_body(header.msg_type, &buf[NONCE_SIZE + HEADER_SIZE..])?;
                    Ok(Decoded {
                        frame: Frame {
                            ttl: header.ttl,
                            flags: header.flags,
                            community,
                            body,
                        },
                        auth: HeaderAuth::Clear,
                    })
                }
                ClearPolicy::Reject => Err(WireError::AuthFailure),
                ClearPolicy::UnknownCommunity => Err(WireError::UnknownCommunity),
            };
        }
    }

    // Sealed header: try every candidate key in order.
    if buf.len() < NONCE_SIZE + SEALED_HEADER_SIZE {
        return Err(WireError::UnknownMagic);
    }
    let mut sealed = [0u8; SEALED_HEADER_SIZE];
    sealed.copy_from_slice(&buf[NONCE_SIZE..NONCE_SIZE + SEALED_HEADER_SIZE]);

    let candidates = resolver.candidates();
    let tried_any = !candidates.is_empty();
    for candidate in candidates {
        let Some(opened) = candidate.cipher.open(&nonce, &sealed) else {
            continue;
        };
        let Some(header) = OverlayHeader::read_from(&opened[..]) else {
            continue;
        };
        if !header.valid_magic() {
            continue;
        }
        let community = CommunityName::from_wire(&header.community)?;
        if community != candidate.community {
            continue;
        }
        let body = decode_body(header.msg_type, &buf[NONCE_SIZE + SEALED_HEADER_SIZE..])?;
        return Ok(Decoded {
            frame: Frame {
                ttl: header.ttl,
                flags: header.flags,
                community,
                body,
            },
            auth: candidate.auth,
        });
    }

    if tried_any {
        Err(WireError::AuthFailure)
    } else {
        Err(WireError::UnknownMagic)
    }
}

fn decode_body(msg_type: u8, buf: &[u8]) -> Result<Body, WireError> {
    let kind = MsgKind::try_from(msg_type)?;
    let mut r = Reader::new(buf);

    let body = match kind {
        MsgKind::Register => Body::Register(Register {
            cookie: r.u32()?,
            src_mac: r.mac()?,
            desc: r.short_str()?,
        }),
        MsgKind::RegisterAck => Body::RegisterAck(RegisterAck {
            cookie: r.u32()?,
            mac: r.mac()?,
            auto_ip: Ipv4Addr::from(r.u32()?),
            auto_ip_bitlen: r.u8()?,
            observed: r.sock()?,
        }),
        MsgKind::RegisterNak => Body::RegisterNak(RegisterNak {
            cookie: r.u32()?,
            reason: NakReason::try_from(r.u8()?)?,
        }),
        MsgKind::Packet => {
            let dst_mac = r.mac()?;
            let src_mac = r.mac()?;
            Body::Packet(PacketData {
                dst_mac,
                src_mac,
                payload: Bytes::copy_from_slice(r.rest()),
            })
        }
        MsgKind::QueryPeer => Body::QueryPeer(QueryPeer {
            src_mac: r.mac()?,
            target_mac: r.mac()?,
        }),
        MsgKind::PeerInfo => Body::PeerInfo(PeerInfoMsg {
            requester_mac: r.mac()?,
            target_mac: r.mac()?,
            sock: r.sock()?,
        }),
        MsgKind::RegisterSuper => Body::RegisterSuper(RegisterSuper {
            cookie: r.u32()?,
            src_mac: r.mac()?,
            selection: r.u32()?,
            uptime: r.u64()?,
            version: r.short_str()?,
            communities: r.name_list()?,
        }),
        MsgKind::RegisterSuperAck => Body::RegisterSuperAck(RegisterSuperAck {
            cookie: r.u32()?,
            mac: r.mac()?,
            selection: r.u32()?,
            communities: r.name_list()?,
        }),
        MsgKind::RegisterSuperNak => Body::RegisterSuperNak(RegisterSuperNak {
            cookie: r.u32()?,
            reason: NakReason::try_from(r.u8()?)?,
        }),
        MsgKind::UnregisterSuper => Body::UnregisterSuper(UnregisterSuper { src_mac: r.mac()? }),
        MsgKind::FederationInfo => Body::FederationInfo(FederationInfo {
            communities: r.name_list()?,
        }),
    };

    Ok(body)
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode a frame. `cipher` seals the common header; `None` leaves it in the
/// clear (the nonce field is then all-zero on the wire).
pub fn encode(frame: &Frame, cipher: Option<&dyn HeaderCipher>, nonce: [u8; NONCE_SIZE]) -> Vec<u8> {
    let header = OverlayHeader {
        magic: MAGIC,
        version: WIRE_VERSION,
        msg_type: frame.body.kind() as u8,
        ttl: frame.ttl,
        flags: frame.flags,
        community: frame.community.wire_bytes(),
    };

    let mut out = Vec::with_capacity(NONCE_SIZE + SEALED_HEADER_SIZE + 64);
    match cipher {
        Some(cipher) => {
            out.extend_from_slice(&nonce);
            let mut clear = [0u8; HEADER_SIZE];
            clear.copy_from_slice(header.as_bytes());
            out.extend_from_slice(&cipher.seal(&nonce, &clear));
        }
        None => {
            out.extend_from_slice(&[0u8; NONCE_SIZE]);
            out.extend_from_slice(header.as_bytes());
        }
    }

    encode_body(&frame.body, &mut out);
    out
}

fn encode_body(body: &Body, out: &mut Vec<u8>) {
    match body {
        Body::Register(b) => {
            out.put_u32(b.cookie);
            out.extend_from_slice(&b.src_mac.0);
            put_short_str(out, &b.desc);
        }
        Body::RegisterAck(b) => {
            out.put_u32(b.cookie);
            out.extend_from_slice(&b.mac.0);
            out.put_u32(u32::from(b.auto_ip));
            out.put_u8(b.auto_ip_bitlen);
            put_sock(out, &b.observed);
        }
        Body::RegisterNak(b) => {
            out.put_u32(b.cookie);
            out.put_u8(b.reason as u8);
        }
        Body::Packet(b) => {
            out.extend_from_slice(&b.dst_mac.0);
            out.extend_from_slice(&b.src_mac.0);
            out.extend_from_slice(&b.payload);
        }
        Body::QueryPeer(b) => {
            out.extend_from_slice(&b.src_mac.0);
            out.extend_from_slice(&b.target_mac.0);
        }
        Body::PeerInfo(b) => {
            out.extend_from_slice(&b.requester_mac.0);
            out.extend_from_slice(&b.target_mac.0);
            put_sock(out, &b.sock);
        }
        Body::RegisterSuper(b) => {
            out.put_u32(b.cookie);
            out.extend_from_slice(&b.src_mac.0);
            out.put_u32(b.selection);
            out.put_u64(b.uptime);
            put_short_str(out, &b.version);
            put_name_list(out, &b.communities);
        }
        Body::RegisterSuperAck(b) => {
            out.put_u32(b.cookie);
            out.extend_from_slice(&b.mac.0);
            out.put_u32(b.selection);
            put_name_list(out, &b.communities);
        }
        Body::RegisterSuperNak(b) => {
            out.put_u32(b.cookie);
            out.put_u8(b.reason as u8);
        }
        Body::UnregisterSuper(b) => {
            out.extend_from_slice(&b.src_mac.0);
        }
        Body::FederationInfo(b) => {
            put_name_list(out, &b.communities);
        }
    }
}

fn put_short_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(VERSION_STR_MAX);
    out.put_u8(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

fn put_sock(out: &mut Vec<u8>, sock: &SocketAddr) {
    match sock.ip() {
        IpAddr::V4(ip) => {
            out.put_u8(4);
            out.put_u16(sock.port());
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.put_u8(6);
            out.put_u16(sock.port());
            out.extend_from_slice(&ip.octets());
        }
    }
}

fn put_name_list(out: &mut Vec<u8>, names: &[CommunityName]) {
    out.put_u16(names.len() as u16);
    for name in names {
        let s = name.as_str().as_bytes();
        out.put_u8(s.len() as u8);
        out.extend_from_slice(s);
    }
}

// ── Body reader ───────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    fn mac(&mut self) -> Result<MacAddr, WireError> {
        let b = self.take(6)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(b);
        Ok(MacAddr(mac))
    }

    fn short_str(&mut self) -> Result<String, WireError> {
        let len = self.u8()? as usize;
        if len > VERSION_STR_MAX {
            return Err(WireError::StringTooLong);
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Malformed("string"))
    }

    fn sock(&mut self) -> Result<SocketAddr, WireError> {
        let family = self.u8()?;
        let port = self.u16()?;
        match family {
            4 => {
                let b = self.take(4)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(b);
                Ok(SocketAddr::from((Ipv4Addr::from(octets), port)))
            }
            6 => {
                let b = self.take(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                Ok(SocketAddr::from((Ipv6Addr::from(octets), port)))
            }
            _ => Err(WireError::Malformed("socket family")),
        }
    }

    fn name_list(&mut self) -> Result<Vec<CommunityName>, WireError> {
        let count = self.u16()? as usize;
        let mut names = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let len = self.u8()? as usize;
            if len > COMMUNITY_SIZE {
                return Err(WireError::BadCommunityName);
            }
            let bytes = self.take(len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| WireError::BadCommunityName)?;
            names.push(CommunityName::new(s)?);
        }
        Ok(names)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, StandardProvider};

    /// Resolver accepting any community in the clear, with no sealed keys.
    struct OpenResolver;

    impl KeyResolver for OpenResolver {
        fn clear_policy(&self, _community: &CommunityName) -> ClearPolicy {
            ClearPolicy::Accept
        }

        fn candidates(&self) -> Vec<KeyCandidate> {
            Vec::new()
        }
    }

    /// Resolver that requires a sealed header for one community.
    struct SealedResolver {
        community: CommunityName,
        cipher: Arc<dyn HeaderCipher>,
    }

    impl SealedResolver {
        fn new(name: &str) -> Self {
            let provider = StandardProvider::generate();
            let community = CommunityName::new(name).unwrap();
            SealedResolver {
                cipher: provider.community_cipher(&community),
                community,
            }
        }
    }

    impl KeyResolver for SealedResolver {
        fn clear_policy(&self, _community: &CommunityName) -> ClearPolicy {
            ClearPolicy::Reject
        }

        fn candidates(&self) -> Vec<KeyCandidate> {
            vec![KeyCandidate {
                community: self.community,
                auth: HeaderAuth::Community,
                cipher: self.cipher.clone(),
            }]
        }
    }

    fn name(s: &str) -> CommunityName {
        CommunityName::new(s).unwrap()
    }

    fn round_trip(frame: &Frame) -> Frame {
        let bytes = encode(frame, None, [0; NONCE_SIZE]);
        let decoded = decode(&bytes, &OpenResolver).expect("decode");
        assert_eq!(decoded.auth, HeaderAuth::Clear);
        decoded.frame
    }

    #[test]
    fn header_is_22_bytes() {
        assert_eq!(std::mem::size_of::<OverlayHeader>(), HEADER_SIZE);
    }

    #[test]
    fn register_round_trip() {
        let frame = Frame::new(
            name("alpha"),
            Body::Register(Register {
                cookie: 0xDEAD_BEEF,
                src_mac: MacAddr([2, 0, 0, 0, 0, 1]),
                desc: "edge-one".into(),
            }),
        );
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn register_ack_round_trip() {
        let frame = Frame::new(
            name("alpha"),
            Body::RegisterAck(RegisterAck {
                cookie: 7,
                mac: MacAddr([2, 0, 0, 0, 0, 1]),
                auto_ip: Ipv4Addr::new(10, 128, 255, 42),
                auto_ip_bitlen: 24,
                observed: "192.0.2.10:30000".parse().unwrap(),
            }),
        );
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn register_super_round_trip() {
        let frame = Frame::new(
            name("*fed"),
            Body::RegisterSuper(RegisterSuper {
                cookie: 3,
                src_mac: MacAddr([2, 0, 0, 0, 0, 9]),
                selection: 12,
                uptime: 86_400,
                version: "meshgate-0.4".into(),
                communities: vec![name("alpha"), name("beta")],
            }),
        );
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn packet_round_trip_preserves_payload() {
        let frame = Frame::new(
            name("alpha"),
            Body::Packet(PacketData {
                dst_mac: MacAddr::BROADCAST,
                src_mac: MacAddr([2, 0, 0, 0, 0, 1]),
                payload: Bytes::from_static(b"opaque ethernet payload"),
            }),
        );
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn peer_info_with_v6_sock() {
        let frame = Frame::new(
            name("alpha"),
            Body::PeerInfo(PeerInfoMsg {
                requester_mac: MacAddr([2, 0, 0, 0, 0, 1]),
                target_mac: MacAddr([2, 0, 0, 0, 0, 2]),
                sock: "[2001:db8::1]:7654".parse().unwrap(),
            }),
        );
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn truncated_datagram_rejected() {
        let frame = Frame::new(name("alpha"), Body::UnregisterSuper(UnregisterSuper {
            src_mac: MacAddr([2, 0, 0, 0, 0, 1]),
        }));
        let bytes = encode(&frame, None, [0; NONCE_SIZE]);
        for cut in [0, 3, NONCE_SIZE + HEADER_SIZE - 1] {
            assert_eq!(
                decode(&bytes[..cut], &OpenResolver).unwrap_err(),
                WireError::Truncated
            );
        }
        // Header intact, body short.
        assert_eq!(
            decode(&bytes[..bytes.len() - 1], &OpenResolver).unwrap_err(),
            WireError::Truncated
        );
    }

    #[test]
    fn bad_magic_rejected() {
        let frame = Frame::new(name("alpha"), Body::QueryPeer(QueryPeer {
            src_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            target_mac: MacAddr([2, 0, 0, 0, 0, 2]),
        }));
        let mut bytes = encode(&frame, None, [0; NONCE_SIZE]);
        bytes[NONCE_SIZE] ^= 0xFF;
        assert_eq!(
            decode(&bytes, &OpenResolver).unwrap_err(),
            WireError::UnknownMagic
        );
    }

    #[test]
    fn unknown_version_rejected() {
        let frame = Frame::new(name("alpha"), Body::QueryPeer(QueryPeer {
            src_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            target_mac: MacAddr([2, 0, 0, 0, 0, 2]),
        }));
        let mut bytes = encode(&frame, None, [0; NONCE_SIZE]);
        bytes[NONCE_SIZE + 2] = 0x7F;
        assert_eq!(
            decode(&bytes, &OpenResolver).unwrap_err(),
            WireError::UnknownMagic
        );
    }

    #[test]
    fn community_name_boundaries() {
        assert!(CommunityName::new("exactly16bytes!!").is_ok());
        assert_eq!(
            CommunityName::new("seventeen-bytes!!").unwrap_err(),
            WireError::BadCommunityName
        );
        assert_eq!(CommunityName::new("").unwrap_err(), WireError::BadCommunityName);
    }

    #[test]
    fn federation_names_start_with_star() {
        assert!(name("*Federation").is_federation());
        assert!(!name("alpha").is_federation());
    }

    #[test]
    fn sealed_round_trip() {
        let resolver = SealedResolver::new("alpha");
        let frame = Frame::new(
            name("alpha"),
            Body::Register(Register {
                cookie: 99,
                src_mac: MacAddr([2, 0, 0, 0, 0, 5]),
                desc: String::new(),
            }),
        );
        let bytes = encode(&frame, Some(&*resolver.cipher), [1, 2, 3, 4]);
        let decoded = decode(&bytes, &resolver).expect("sealed decode");
        assert_eq!(decoded.frame, frame);
        assert_eq!(decoded.auth, HeaderAuth::Community);
    }

    #[test]
    fn sealed_header_with_wrong_key_is_auth_failure() {
        // Sealed for a community the receiver has no key for.
        let sender = SealedResolver::new("beta");
        let receiver = SealedResolver::new("alpha");
        let frame = Frame::new(name("beta"), Body::UnregisterSuper(UnregisterSuper {
            src_mac: MacAddr([2, 0, 0, 0, 0, 5]),
        }));
        let bytes = encode(&frame, Some(&*sender.cipher), [9, 9, 9, 9]);
        assert_eq!(
            decode(&bytes, &receiver).unwrap_err(),
            WireError::AuthFailure
        );
    }

    #[test]
    fn clear_header_for_sealed_community_is_auth_failure() {
        let resolver = SealedResolver::new("alpha");
        let frame = Frame::new(name("alpha"), Body::UnregisterSuper(UnregisterSuper {
            src_mac: MacAddr([2, 0, 0, 0, 0, 5]),
        }));
        let bytes = encode(&frame, None, [0; NONCE_SIZE]);
        assert_eq!(
            decode(&bytes, &resolver).unwrap_err(),
            WireError::AuthFailure
        );
    }

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "02:00:00:00:00:2a".parse().unwrap();
        assert_eq!(mac.0, [2, 0, 0, 0, 0, 0x2A]);
        assert_eq!(mac.to_string(), "02:00:00:00:00:2a");
        assert!("02:00:00".parse::<MacAddr>().is_err());
        assert!("zz:00:00:00:00:00".parse::<MacAddr>().is_err());
    }

    #[test]
    fn broadcast_and_multicast_bits() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());
        assert!(MacAddr([0x01, 0, 0x5E, 0, 0, 1]).is_multicast());
        assert!(!MacAddr([0x02, 0, 0, 0, 0, 1]).is_multicast());
    }
}
