//! The published code segment and the immutable module artifact.

use std::sync::OnceLock;

use kestrel_env::{DataSegment, ElemSegment, Export, Import, Tier};

use crate::metadata::{LinkDataTier, Metadata, MetadataTier};
use crate::{Assumptions, ShareableBytes};

/// A finalized, published code segment.
///
/// Publication here applies the internal links (package-local labels
/// resolved to absolute module offsets). Mapping the bytes executable,
/// applying symbolic links against live builtin addresses, and flushing
/// instruction caches are the embedder's concern.
#[derive(Debug)]
pub struct CodeSegment {
    bytes: Box<[u8]>,
}

impl CodeSegment {
    #[must_use]
    pub fn publish(mut bytes: Vec<u8>, link_data: &LinkDataTier) -> Self {
        for link in &link_data.internal_links {
            let at = link.patch_at_offset as usize;
            bytes[at..at + 4].copy_from_slice(&link.target_offset.to_le_bytes());
        }
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Tier-1 dispatch table: function index → tier-entry code offset.
///
/// Sized to the full function index space; import indices (which have no
/// function body in this module) keep the zero sentinel. Published
/// addresses are `segment base + offset`, so entries stay valid wherever
/// the embedder maps the segment.
#[derive(Debug)]
pub struct JumpTable {
    entries: Box<[u32]>,
}

impl JumpTable {
    #[must_use]
    pub fn new(entries: Vec<u32>) -> Self {
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entry_offset(&self, func_index: u32) -> u32 {
        self.entries[func_index as usize]
    }
}

/// One tier's worth of published code: its metadata, the link data the
/// embedder still needs (symbolic links), and the code segment itself.
#[derive(Debug)]
pub struct TierArtifact {
    pub tier: Tier,
    pub metadata: MetadataTier,
    pub link_data: LinkDataTier,
    pub segment: CodeSegment,
}

/// The immutable result of module generation.
///
/// A module starts with one tier of code. A tier-2 generator may later
/// publish an optimized tier into the running module; the slot is
/// write-once and readers either see it fully initialized or not at all.
#[derive(Debug)]
pub struct Module {
    assumptions: Assumptions,
    bytecode: ShareableBytes,
    imports: Vec<Import>,
    exports: Vec<Export>,
    data_segments: Vec<DataSegment>,
    elem_segments: Vec<ElemSegment>,
    metadata: Metadata,
    primary: TierArtifact,
    tier2: OnceLock<TierArtifact>,
    debug_bytes: Option<Vec<u8>>,
    jump_table: Option<JumpTable>,
}

impl Module {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub(crate) fn new(
        assumptions: Assumptions,
        bytecode: ShareableBytes,
        imports: Vec<Import>,
        exports: Vec<Export>,
        data_segments: Vec<DataSegment>,
        elem_segments: Vec<ElemSegment>,
        metadata: Metadata,
        primary: TierArtifact,
        debug_bytes: Option<Vec<u8>>,
        jump_table: Option<JumpTable>,
    ) -> Self {
        Self {
            assumptions,
            bytecode,
            imports,
            exports,
            data_segments,
            elem_segments,
            metadata,
            primary,
            tier2: OnceLock::new(),
            debug_bytes,
            jump_table,
        }
    }

    #[must_use]
    pub fn assumptions(&self) -> &Assumptions {
        &self.assumptions
    }

    #[must_use]
    pub fn bytecode(&self) -> &ShareableBytes {
        &self.bytecode
    }

    #[must_use]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    #[must_use]
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    #[must_use]
    pub fn data_segments(&self) -> &[DataSegment] {
        &self.data_segments
    }

    #[must_use]
    pub fn elem_segments(&self) -> &[ElemSegment] {
        &self.elem_segments
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The tier the module was generated with.
    #[must_use]
    pub fn primary_tier(&self) -> &TierArtifact {
        &self.primary
    }

    /// The hot-swapped optimized tier, once published.
    #[must_use]
    pub fn tier2(&self) -> Option<&TierArtifact> {
        self.tier2.get()
    }

    /// The best available code for dispatch: tier-2 once published,
    /// otherwise the primary tier.
    #[must_use]
    pub fn best_tier(&self) -> &TierArtifact {
        self.tier2.get().unwrap_or(&self.primary)
    }

    #[must_use]
    pub fn debug_bytes(&self) -> Option<&[u8]> {
        self.debug_bytes.as_deref()
    }

    #[must_use]
    pub fn jump_table(&self) -> Option<&JumpTable> {
        self.jump_table.as_ref()
    }

    /// Atomically install the tier-2 artifact. Publishing twice is a
    /// programming error.
    pub(crate) fn publish_tier2(&self, artifact: TierArtifact) {
        debug_assert_eq!(artifact.tier, Tier::Optimized);
        if self.tier2.set(artifact).is_err() {
            panic!("tier-2 code already published");
        }
    }
}
