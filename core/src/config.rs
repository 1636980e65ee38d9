//! # Constants & Tunables
//!
//! Every magic number in Quill lives here. Hash domain tags, namespaces, page
//! geometry, scheduler budgets. If you are hardcoding one of these anywhere
//! else, move it here first.
//!
//! Several of these values are baked into bytes that end up on disk or on the
//! wire (hash tags, the oplog page size, the signable namespace). Changing
//! them after data exists means every existing log stops verifying.

// ---------------------------------------------------------------------------
// Hash Domain Tags
// ---------------------------------------------------------------------------

/// Prefix byte for leaf hashes: `H(0x00 ‖ u64be(len) ‖ data)`.
pub const TAG_LEAF: u8 = 0;

/// Prefix byte for parent hashes: `H(0x01 ‖ u64be(size) ‖ left ‖ right)`.
pub const TAG_PARENT: u8 = 1;

/// Prefix byte for the root-set hash.
pub const TAG_ROOT: u8 = 2;

/// Output length of every hash in the tree. BLAKE3, 256 bits.
pub const HASH_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

/// ASCII domain string keyed with the public key to derive the discovery key.
///
/// Peers announce and look up logs by the discovery key, so a rendezvous
/// server learns nothing that lets it verify or forge the log.
pub const DISCOVERY_NAMESPACE: &[u8] = b"quill-discovery";

/// BLAKE3 `derive_key` context for the signable prefix.
pub const SIGNABLE_CONTEXT: &str = "quill 2026-01 tree signable";

// ---------------------------------------------------------------------------
// Keys & Signatures
// ---------------------------------------------------------------------------

/// Ed25519 public key length.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 secret key (seed) length.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

// ---------------------------------------------------------------------------
// Oplog
// ---------------------------------------------------------------------------

/// Default size of each of the two oplog header slots. One filesystem page,
/// so a header commit is a single-sector write.
pub const DEFAULT_OPLOG_PAGE_SIZE: usize = 4096;

/// Bytes of framing in front of every oplog record: checksum + length/bit.
pub const OPLOG_RECORD_HEADER: usize = 8;

/// Default entry-log size after which `DiskStorage` checkpoints its metadata
/// into a fresh header and drops the entries.
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 64 * 1024;

// ---------------------------------------------------------------------------
// Bitfield
// ---------------------------------------------------------------------------

/// Bytes per bitfield page.
pub const BITFIELD_PAGE_BYTES: usize = 4096;

/// Bits (block indices) tracked per bitfield page.
pub const BITFIELD_PAGE_BITS: u64 = (BITFIELD_PAGE_BYTES as u64) * 8;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Version stamp written into `DataInfo` for freshly created logs.
pub const STORAGE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Replication Scheduling
// ---------------------------------------------------------------------------

/// A block with this many requests in flight (or more) is never hotswapped.
pub const MAX_HOTSWAP_INFLIGHT: usize = 3;

/// Number of hotswap buckets: in-flight counts 1 and 2.
pub const HOTSWAP_BUCKETS: usize = MAX_HOTSWAP_INFLIGHT - 1;

/// Blocks a single `pick` yields per bucket weight unit.
pub const HOTSWAP_PICKS: usize = 4;

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity for writer events.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Oplog geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplogConfig {
    /// Size of each header slot. Entries start at `2 * page_size`.
    pub page_size: usize,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_OPLOG_PAGE_SIZE,
        }
    }
}

/// Knobs for the on-disk storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskConfig {
    /// Oplog header page size.
    pub page_size: usize,

    /// Entry-log size that triggers a metadata checkpoint.
    pub checkpoint_bytes: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_OPLOG_PAGE_SIZE,
            checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
        }
    }
}

/// Writer knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Capacity of the broadcast channel behind [`crate::writer::Writer::subscribe`].
    /// Slow subscribers past this many events see `Lagged`.
    pub event_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
