//! File and Blob Identifiers
//!
//! A FID names one primary file and is globally unique without coordination:
//!
//! FID structure (10 bytes, big-endian):
//! - 4 bytes: seconds since the Unix epoch
//! - 4 bytes: IPv4 address of the owning node
//! - 2 bytes: per-second sequence
//!
//! Lexicographic byte order is chronological for ids minted by one machine.
//! A blob id appends the byte offset (8 bytes) and length (4 bytes) of one
//! payload inside that file; both ids travel as lowercase hex strings.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Encoded FID length in bytes
pub const FID_LEN: usize = 10;

/// Encoded blob id length in bytes
pub const BLOB_ID_LEN: usize = FID_LEN + 8 + 4;

/// Hex-rendered lengths
pub const FID_HEX_LEN: usize = FID_LEN * 2;
pub const BLOB_ID_HEX_LEN: usize = BLOB_ID_LEN * 2;

const MAX_SEQUENCE: u64 = u16::MAX as u64;

/// 10-byte file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fid {
    secs: u32,
    ip: u32,
    seq: u16,
}

impl Fid {
    /// Assemble a fid from its parts
    pub fn new(secs: u32, ip: Ipv4Addr, seq: u16) -> Self {
        Self {
            secs,
            ip: u32::from(ip),
            seq,
        }
    }

    /// Seconds since the Unix epoch at allocation time
    pub fn timestamp_secs(&self) -> u32 {
        self.secs
    }

    /// Wall-clock instant at allocation time
    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.secs as u64)
    }

    /// IPv4 address of the node that allocated this fid
    pub fn machine_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// Per-second sequence number
    pub fn sequence(&self) -> u16 {
        self.seq
    }

    /// Encode to the 10-byte wire form
    pub fn to_bytes(&self) -> [u8; FID_LEN] {
        let mut bytes = [0u8; FID_LEN];
        bytes[0..4].copy_from_slice(&self.secs.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.ip.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.seq.to_be_bytes());
        bytes
    }

    /// Decode from the 10-byte wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FID_LEN {
            return Err(Error::InvalidId(format!(
                "fid must be {} bytes, got {}",
                FID_LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            secs: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            ip: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            seq: u16::from_be_bytes(bytes[8..10].try_into().unwrap()),
        })
    }

    /// Render as 20 lowercase hex characters
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parse from the 20-character hex form
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != FID_HEX_LEN {
            return Err(Error::InvalidId(format!(
                "fid hex must be {} chars, got {}",
                FID_HEX_LEN,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| Error::InvalidId(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Render using a `%`-token pattern:
    ///
    /// - `%T` — allocation time, seconds since epoch
    /// - `%L` — owning node address, dotted quad
    /// - `%K` — sequence number
    /// - `%F` — full hex fid
    /// - `%%` — literal percent
    pub fn render(&self, pattern: &str) -> String {
        let mut out = String::with_capacity(pattern.len() + FID_HEX_LEN);
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('T') => out.push_str(&self.secs.to_string()),
                Some('L') => out.push_str(&self.machine_ip().to_string()),
                Some('K') => out.push_str(&self.seq.to_string()),
                Some('F') => out.push_str(&self.to_hex()),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Fid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Identifier of one stored payload: the owning fid plus the byte range
/// inside that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId {
    pub fid: Fid,
    pub offset: u64,
    pub length: u32,
}

impl BlobId {
    pub fn new(fid: Fid, offset: u64, length: u32) -> Self {
        Self {
            fid,
            offset,
            length,
        }
    }

    /// Encode to the 20-byte wire form
    pub fn to_bytes(&self) -> [u8; BLOB_ID_LEN] {
        let mut bytes = [0u8; BLOB_ID_LEN];
        bytes[0..FID_LEN].copy_from_slice(&self.fid.to_bytes());
        bytes[FID_LEN..FID_LEN + 8].copy_from_slice(&self.offset.to_be_bytes());
        bytes[FID_LEN + 8..].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Render as 40 lowercase hex characters
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parse from the 40-character hex form; any deviation is a client error
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != BLOB_ID_HEX_LEN {
            return Err(Error::InvalidId(format!(
                "blob id must be {} chars, got {}",
                BLOB_ID_HEX_LEN,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| Error::InvalidId(e.to_string()))?;
        let fid = Fid::from_bytes(&bytes[0..FID_LEN])?;
        let offset = u64::from_be_bytes(bytes[FID_LEN..FID_LEN + 8].try_into().unwrap());
        let length = u32::from_be_bytes(bytes[FID_LEN + 8..].try_into().unwrap());
        Ok(Self {
            fid,
            offset,
            length,
        })
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BlobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// FID allocator
///
/// Thread-safe allocator producing unique fids for one node. The timestamp
/// and sequence are packed into a single atomic word and advanced with a CAS
/// loop; sequence exhaustion within one second spins until the clock moves.
pub struct FidAllocator {
    ip: u32,
    /// Packed state: upper 48 bits = last timestamp (secs), lower 16 = sequence
    state: AtomicU64,
}

impl FidAllocator {
    /// Create an allocator stamping ids with the given node address
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip: u32::from(ip),
            state: AtomicU64::new(0),
        }
    }

    /// Allocate the next fid
    pub fn next(&self) -> Fid {
        loop {
            let now = Self::current_time_secs();
            let old_state = self.state.load(Ordering::Relaxed);
            let old_secs = old_state >> 16;
            let old_seq = old_state & MAX_SEQUENCE;

            let (new_secs, new_seq) = if now > old_secs {
                (now, 0)
            } else if now == old_secs {
                let next_seq = old_seq + 1;
                if next_seq > MAX_SEQUENCE {
                    // Sequence exhausted for this second
                    std::thread::yield_now();
                    continue;
                }
                (now, next_seq)
            } else {
                // Clock went backwards; keep issuing against the old second
                let next_seq = old_seq + 1;
                if next_seq > MAX_SEQUENCE {
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                (old_secs, next_seq)
            };

            let new_state = (new_secs << 16) | new_seq;
            if self
                .state
                .compare_exchange(old_state, new_state, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Fid {
                    secs: new_secs as u32,
                    ip: self.ip,
                    seq: new_seq as u16,
                };
            }
            // CAS failed, retry
        }
    }

    fn current_time_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards before UNIX epoch")
            .as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn test_ip() -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 2, 3)
    }

    #[test]
    fn test_allocate_unique_fids() {
        let alloc = FidAllocator::new(test_ip());
        let mut seen = HashSet::new();
        for _ in 0..10000 {
            let fid = alloc.next();
            assert!(seen.insert(fid), "Duplicate fid allocated: {}", fid);
        }
    }

    #[test]
    fn test_fids_are_ordered() {
        let alloc = FidAllocator::new(test_ip());
        let mut last: Option<Fid> = None;
        for _ in 0..1000 {
            let fid = alloc.next();
            if let Some(prev) = last {
                assert!(fid > prev, "fids should be strictly increasing");
                assert!(fid.to_bytes() > prev.to_bytes(), "byte order matches");
            }
            last = Some(fid);
        }
    }

    #[test]
    fn test_concurrent_allocation() {
        let alloc = Arc::new(FidAllocator::new(test_ip()));
        let mut handles = vec![];

        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| alloc.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for fid in handle.join().unwrap() {
                assert!(all.insert(fid), "Duplicate fid in concurrent test");
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn test_fid_decomposition() {
        let alloc = FidAllocator::new(test_ip());
        let fid = alloc.next();
        assert_eq!(fid.machine_ip(), test_ip());
        assert!(fid.timestamp() <= SystemTime::now());
    }

    #[test]
    fn test_fid_hex_round_trip() {
        let fid = Fid::new(1_700_000_000, test_ip(), 42);
        let hex = fid.to_hex();
        assert_eq!(hex.len(), FID_HEX_LEN);
        assert_eq!(Fid::from_hex(&hex).unwrap(), fid);
    }

    #[test]
    fn test_blob_id_round_trip() {
        let fid = Fid::new(1_700_000_000, test_ip(), 7);
        let id = BlobId::new(fid, 4096, 1234);
        let hex = id.to_hex();
        assert_eq!(hex.len(), BLOB_ID_HEX_LEN);
        let parsed = BlobId::parse(&hex).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.fid.machine_ip(), test_ip());
        assert_eq!(parsed.offset, 4096);
        assert_eq!(parsed.length, 1234);
    }

    #[test]
    fn test_blob_id_parse_failures() {
        assert!(BlobId::parse("").is_err());
        assert!(BlobId::parse("abc").is_err());
        // Right length, not hex
        assert!(BlobId::parse(&"z".repeat(BLOB_ID_HEX_LEN)).is_err());
        // Fid-only hex is not a blob id
        let fid = Fid::new(1, test_ip(), 0);
        assert!(BlobId::parse(&fid.to_hex()).is_err());
    }

    #[test]
    fn test_render_patterns() {
        let fid = Fid::new(1000, Ipv4Addr::new(192, 168, 0, 9), 5);
        assert_eq!(fid.render("%T"), "1000");
        assert_eq!(fid.render("%L"), "192.168.0.9");
        assert_eq!(fid.render("%K"), "5");
        assert_eq!(fid.render("%F"), fid.to_hex());
        assert_eq!(fid.render("a%%b"), "a%b");
        assert_eq!(fid.render("seq=%K ip=%L"), "seq=5 ip=192.168.0.9");
    }
}
