//! Program image container and serialization.
//!
//! The on-disk format is intentionally simple: a fixed header (magic,
//! version, flags) followed by a serde_json-encoded body. Easy to audit,
//! easy to evolve behind the version number.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use super::program::Program;

const MAGIC: [u8; 4] = *b"RILB";
pub const CURRENT_VERSION: u16 = 2;
const HEADER_LEN: usize = 10;

/// Flags describing how the image was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageFlags(u32);

impl ImageFlags {
    pub const NONE: ImageFlags = ImageFlags(0);
    /// Function names and global names were stripped.
    pub const STRIPPED: ImageFlags = ImageFlags(1 << 0);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> ImageFlags {
        ImageFlags(bits)
    }

    #[inline]
    pub const fn contains(self, other: ImageFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: ImageFlags) {
        self.0 |= other.0;
    }
}

/// Optional provenance metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMeta {
    pub source: Option<String>,
    pub checksum: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ImageMeta {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.checksum.is_none() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ProgramImage {
    pub version: u16,
    pub flags: ImageFlags,
    pub program: Program,
    pub meta: Option<ImageMeta>,
}

#[derive(Serialize, Deserialize)]
struct ImageBody {
    program: Program,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<ImageMeta>,
}

impl ProgramImage {
    pub fn new(program: Program) -> Self {
        Self {
            version: CURRENT_VERSION,
            flags: ImageFlags::NONE,
            program,
            meta: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(&ImageBody {
            program: self.program.clone(),
            meta: self.meta.clone(),
        })
        .context("serialize image body")?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<ProgramImage> {
        ensure!(bytes.len() >= HEADER_LEN, "image truncated: {} bytes", bytes.len());
        if bytes[..4] != MAGIC {
            bail!("not a rill image (bad magic)");
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        ensure!(
            version <= CURRENT_VERSION && version > 0,
            "unsupported image version {version} (runtime supports up to {CURRENT_VERSION})"
        );
        let flags = ImageFlags::from_bits(u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]));
        let body: ImageBody = serde_json::from_slice(&bytes[HEADER_LEN..]).context("parse image body")?;
        body.program.validate().context("validate program")?;
        Ok(ProgramImage {
            version,
            flags,
            program: body.program,
            meta: body.meta,
        })
    }
}
