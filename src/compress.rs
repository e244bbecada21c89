//! Compression tiers used by adaptive GET
//!
//! Each tier is a gzip stream at a fixed level. Tiers are ordered by cost and
//! walked strictly Fast -> Balanced -> Max.

use std::fmt;
use std::io::{self, Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Tier {
    Fast,
    Balanced,
    Max,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Balanced, Tier::Max];

    /// gzip level for this tier
    pub fn level(self) -> u32 {
        match self {
            Tier::Fast => 1,
            Tier::Balanced => 3,
            Tier::Max => 9,
        }
    }

    /// 1-based position in the transfer order
    pub fn index(self) -> u8 {
        match self {
            Tier::Fast => 1,
            Tier::Balanced => 2,
            Tier::Max => 3,
        }
    }

    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Fast => Some(Tier::Balanced),
            Tier::Balanced => Some(Tier::Max),
            Tier::Max => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{} (gzip {})", self.index(), self.level())
    }
}

pub fn compress(tier: Tier, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(tier.level()));
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
