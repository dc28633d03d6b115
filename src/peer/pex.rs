//! Peer exchange entries and the compact wire format
//!
//! IPv4 peers travel as 6-byte groups (4 address + 2 port, big-endian),
//! IPv6 peers as 18-byte groups. An optional parallel `added.f` byte array
//! carries one flag byte per peer.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::peer::PexFlags;

/// Bytes per IPv4 compact entry.
const COMPACT_IPV4_BYTES: usize = 6;
/// Bytes per IPv6 compact entry.
const COMPACT_IPV6_BYTES: usize = 18;

/// One peer-exchange entry: an address plus its advertisement flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pex {
    /// Advertised listening IP.
    pub addr: IpAddr,
    /// Advertised listening port.
    pub port: u16,
    /// PEX advertisement flags.
    pub flags: PexFlags,
}

impl Pex {
    /// Creates an entry.
    pub fn new(addr: IpAddr, port: u16, flags: PexFlags) -> Self {
        Self { addr, port, flags }
    }

    /// The advertised listening endpoint.
    pub fn socket_address(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Whether the entry can describe a reachable peer at all.
    pub fn is_valid_for_peers(&self) -> bool {
        self.port != 0 && !self.addr.is_unspecified() && !self.addr.is_multicast()
    }

    /// Decodes IPv4 compact entries, pairing flags when `added_f` matches.
    pub fn from_compact_ipv4(compact: &[u8], added_f: Option<&[u8]>) -> Vec<Pex> {
        let n = compact.len() / COMPACT_IPV4_BYTES;
        let added_f = checked_flag_array(added_f, n);
        let mut walk = &compact[..n * COMPACT_IPV4_BYTES];
        let mut pex = Vec::with_capacity(n);

        for i in 0..n {
            let addr = Ipv4Addr::from(walk.get_u32());
            let port = walk.get_u16();
            let flags = entry_flags(added_f, i);
            pex.push(Pex::new(IpAddr::V4(addr), port, flags));
        }

        pex
    }

    /// Decodes IPv6 compact entries, pairing flags when `added_f` matches.
    pub fn from_compact_ipv6(compact: &[u8], added_f: Option<&[u8]>) -> Vec<Pex> {
        let n = compact.len() / COMPACT_IPV6_BYTES;
        let added_f = checked_flag_array(added_f, n);
        let mut walk = &compact[..n * COMPACT_IPV6_BYTES];
        let mut pex = Vec::with_capacity(n);

        for i in 0..n {
            let addr = Ipv6Addr::from(walk.get_u128());
            let port = walk.get_u16();
            let flags = entry_flags(added_f, i);
            pex.push(Pex::new(IpAddr::V6(addr), port, flags));
        }

        pex
    }

    /// Encodes entries into compact form plus the parallel flag array.
    ///
    /// Entries whose family differs from the batch's first entry are
    /// skipped; callers split by family before encoding.
    pub fn to_compact(pex: &[Pex]) -> (BytesMut, BytesMut) {
        let mut compact = BytesMut::new();
        let mut added_f = BytesMut::new();

        for entry in pex {
            match entry.addr {
                IpAddr::V4(addr) => compact.put_u32(addr.into()),
                IpAddr::V6(addr) => compact.put_u128(addr.into()),
            }
            compact.put_u16(entry.port);
            added_f.put_u8(entry.flags.bits());
        }

        (compact, added_f)
    }
}

impl PartialOrd for Pex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| self.port.cmp(&other.port))
    }
}

/// Validates the parallel flag array against the peer count.
///
/// A length mismatch means the sender paired the arrays wrong; the
/// addresses are still usable, so the flags are dropped rather than the
/// whole batch.
fn checked_flag_array(added_f: Option<&[u8]>, n: usize) -> Option<&[u8]> {
    match added_f {
        Some(bytes) if bytes.len() == n => Some(bytes),
        Some(bytes) => {
            debug!(
                peers = n,
                flag_bytes = bytes.len(),
                "pex flag array length mismatch; ignoring flags"
            );
            None
        }
        None => None,
    }
}

fn entry_flags(added_f: Option<&[u8]>, i: usize) -> PexFlags {
    added_f.map_or_else(PexFlags::default, |bytes| PexFlags::from_bits(bytes[i]))
}
