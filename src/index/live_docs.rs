//! Live-docs bitmaps.
//!
//! One bit per document slot, set while the document is live. A segment
//! without deletions has no live-docs file at all. Each write produces a new
//! generation file `_S_G.liv`; earlier generations are never modified.

use bit_vec::BitVec;

use crate::error::{HalberdError, Result};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const LIVE_DOCS_MAGIC: u32 = 0x4C49_5644; // "LIVD"
const LIVE_DOCS_VERSION: u32 = 1;

/// Bitmap of live documents (bit set = live).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs {
    bits: BitVec,
    live_count: u32,
}

impl LiveDocs {
    /// All `max_doc` documents live.
    pub fn all_live(max_doc: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(max_doc as usize, true),
            live_count: max_doc,
        }
    }

    /// Check if a document is live. Out-of-range ids are not live.
    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Mark a document deleted. Returns `true` if it was live before.
    pub fn delete(&mut self, doc: u32) -> bool {
        if self.is_live(doc) {
            self.bits.set(doc as usize, false);
            self.live_count -= 1;
            true
        } else {
            false
        }
    }

    pub fn max_doc(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn num_live(&self) -> u32 {
        self.live_count
    }

    pub fn num_deleted(&self) -> u32 {
        self.max_doc() - self.live_count
    }

    /// Live doc ids in increasing order.
    pub fn iter_live(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, live)| *live)
            .map(|(doc, _)| doc as u32)
    }

    /// Write this bitmap as `name`.
    pub fn write(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_header(LIVE_DOCS_MAGIC, LIVE_DOCS_VERSION)?;
        writer.write_u32(self.max_doc())?;
        writer.write_u32(self.num_deleted())?;
        writer.write_bytes(&self.bits.to_bytes())?;
        writer.close()
    }

    /// Read a bitmap and check it against the catalog's view of the segment.
    pub fn read(storage: &dyn Storage, name: &str, max_doc: u32, expected_deleted: u32) -> Result<Self> {
        let mut reader = StructReader::open(storage, name)?;
        reader.check_header(LIVE_DOCS_MAGIC, LIVE_DOCS_VERSION, LIVE_DOCS_VERSION)?;

        let stored_max_doc = reader.read_u32()?;
        let stored_deleted = reader.read_u32()?;
        if stored_max_doc != max_doc {
            return Err(HalberdError::corruption(
                name,
                format!("live docs cover {stored_max_doc} docs, segment has {max_doc}"),
            ));
        }

        let mut bits = BitVec::from_bytes(&reader.read_bytes()?);
        if bits.len() < max_doc as usize {
            return Err(HalberdError::corruption(name, "live docs bitmap truncated"));
        }
        bits.truncate(max_doc as usize);

        let live_count = bits.iter().filter(|b| *b).count() as u32;
        let deleted = max_doc - live_count;
        if deleted != stored_deleted || deleted != expected_deleted {
            return Err(HalberdError::corruption(
                name,
                format!(
                    "live docs deleted count {deleted} disagrees with header {stored_deleted} / catalog {expected_deleted}"
                ),
            ));
        }

        Ok(LiveDocs { bits, live_count })
    }
}
