//! Relocation and metadata records carried by a [`crate::CompiledCode`]
//! package. Every offset is relative to the package's byte 0 until the
//! link editor shifts it by the package's placement offset.

/// A `[begin, end)` byte interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Offsets {
    pub begin: u32,
    pub end: u32,
}

impl Offsets {
    pub fn offset_by(&mut self, delta: u32) {
        self.begin += delta;
        self.end += delta;
    }
}

/// Entry points of a function body, relative to the range's `begin`.
///
/// The normal entry is what intra-module direct calls target. The tier
/// entry skips the tier-check prologue and is what the jump table and
/// cross-tier transfers use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuncOffsets {
    pub normal_entry: u32,
    pub tier_entry: u32,
}

/// Runtime trap kinds with dedicated exit stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Unreachable,
    IntegerOverflow,
    InvalidConversionToInteger,
    IntegerDivideByZero,
    IndirectCallToNull,
    IndirectCallBadSig,
    OutOfBounds,
    UnalignedAccess,
    StackOverflow,
    ThrowReported,
}

impl Trap {
    pub const COUNT: usize = 10;

    pub const ALL: [Trap; Trap::COUNT] = [
        Trap::Unreachable,
        Trap::IntegerOverflow,
        Trap::InvalidConversionToInteger,
        Trap::IntegerDivideByZero,
        Trap::IndirectCallToNull,
        Trap::IndirectCallBadSig,
        Trap::OutOfBounds,
        Trap::UnalignedAccess,
        Trap::StackOverflow,
        Trap::ThrowReported,
    ];

    /// Dense index for trap-keyed arrays.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// What a code range is, plus its kind-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRangeKind {
    /// A function body. Entry offsets are relative to the range's begin.
    Function {
        func_index: u32,
        line_or_bytecode: u32,
        entries: FuncOffsets,
    },
    /// The callable entry thunk for an exported function.
    Entry { func_index: u32 },
    /// Fast-path exit into jitted import code.
    ImportJitExit { func_index: u32 },
    /// Slow-path exit into the interpreter for an import.
    ImportInterpExit { func_index: u32 },
    /// Shared out-of-line exit for one trap kind.
    TrapExit(Trap),
    /// The shared debug-trap handler stub.
    DebugTrap,
    /// Memory-access out-of-bounds exit stub.
    OutOfBoundsExit,
    /// Unaligned-access exit stub.
    UnalignedExit,
    /// Interrupt-check exit stub.
    Interrupt,
    /// Throw stub; jumped to by other stubs, no side index.
    Throw,
    /// Link-editor-inserted island extending direct-call reach.
    FarJumpIsland,
    /// Link-editor-inserted thunk to a builtin.
    BuiltinThunk,
}

/// One tagged `[begin, end)` region of the aggregate code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    begin: u32,
    end: u32,
    kind: CodeRangeKind,
}

impl CodeRange {
    #[must_use]
    pub fn new(offsets: Offsets, kind: CodeRangeKind) -> Self {
        debug_assert!(offsets.begin <= offsets.end);
        Self {
            begin: offsets.begin,
            end: offsets.end,
            kind,
        }
    }

    #[must_use]
    pub fn begin(&self) -> u32 {
        self.begin
    }

    #[must_use]
    pub fn end(&self) -> u32 {
        self.end
    }

    #[must_use]
    pub fn kind(&self) -> CodeRangeKind {
        self.kind
    }

    pub fn offset_by(&mut self, delta: u32) {
        self.begin += delta;
        self.end += delta;
    }

    #[must_use]
    pub fn is_function(&self) -> bool {
        matches!(self.kind, CodeRangeKind::Function { .. })
    }

    /// The function index carried by Function/Entry/Import* ranges.
    #[must_use]
    pub fn func_index(&self) -> u32 {
        match self.kind {
            CodeRangeKind::Function { func_index, .. }
            | CodeRangeKind::Entry { func_index }
            | CodeRangeKind::ImportJitExit { func_index }
            | CodeRangeKind::ImportInterpExit { func_index } => func_index,
            _ => unreachable!("code range kind carries no function index"),
        }
    }

    /// Absolute offset of the normal entry of a Function range.
    #[must_use]
    pub fn func_normal_entry(&self) -> u32 {
        match self.kind {
            CodeRangeKind::Function { entries, .. } => self.begin + entries.normal_entry,
            _ => unreachable!("not a function range"),
        }
    }

    /// Absolute offset of the tier entry of a Function range.
    #[must_use]
    pub fn func_tier_entry(&self) -> u32 {
        match self.kind {
            CodeRangeKind::Function { entries, .. } => self.begin + entries.tier_entry,
            _ => unreachable!("not a function range"),
        }
    }
}

/// Kinds of patchable (or bookkept) call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteKind {
    /// Direct call to another function in this module.
    Func,
    /// Indirect call through a table; resolved at runtime.
    Dynamic,
    /// Call to a builtin via a symbolic address; patched at publication.
    Symbolic,
    /// Out-of-line call into a trap exit stub.
    TrapExit,
    /// Debug breakpoint site.
    Breakpoint,
    /// Debug frame-entry site.
    EnterFrame,
    /// Debug frame-exit site.
    LeaveFrame,
}

/// A call instruction whose displacement the link editor resolves. The
/// recorded offset is of the *return address* (the byte after the
/// displacement field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub kind: CallSiteKind,
    pub return_address_offset: u32,
}

impl CallSite {
    pub fn offset_by(&mut self, delta: u32) {
        self.return_address_offset += delta;
    }
}

/// Resolution target paired 1:1 with a [`CallSite`]. Sites that need no
/// link-time target (dynamic, symbolic, debug) carry `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteTarget {
    None,
    Func(u32),
    Trap(Trap),
}

impl CallSiteTarget {
    #[must_use]
    pub fn func_index(&self) -> u32 {
        match self {
            CallSiteTarget::Func(func_index) => *func_index,
            _ => unreachable!("call-site target is not a function"),
        }
    }

    #[must_use]
    pub fn trap(&self) -> Trap {
        match self {
            CallSiteTarget::Trap(trap) => *trap,
            _ => unreachable!("call-site target is not a trap"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessKind {
    Load,
    Store,
}

/// A linear-memory access whose faulting offset the runtime needs for
/// signal-handler recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub insn_offset: u32,
    pub kind: MemoryAccessKind,
}

impl MemoryAccess {
    pub fn offset_by(&mut self, delta: u32) {
        self.insn_offset += delta;
    }
}

/// Builtin entry points referenced symbolically from generated code and
/// bound to real addresses at publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolicAddress {
    HandleThrow,
    ReportTrap,
    HandleDebugTrap,
    CallImport,
    MemoryGrow,
    MemorySize,
    Interrupt,
}

impl SymbolicAddress {
    pub const COUNT: usize = 7;

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A patchable reference to a [`SymbolicAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolicAccess {
    pub patch_at: u32,
    pub target: SymbolicAddress,
}

/// An internal label: a patch location and its target, both local to the
/// package that emitted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLabel {
    pub patch_at: u32,
    pub target: u32,
}

/// Handle to the 4-byte target slot of an emitted far-jump sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHandle(pub(crate) u32);

impl PatchHandle {
    /// Handle to a far-jump slot at `slot_offset`. Function compilers use
    /// this for the far-jump sequences they emit inside their own
    /// packages; the offset is package-relative until merged.
    #[must_use]
    pub fn at_slot(slot_offset: u32) -> Self {
        Self(slot_offset)
    }

    /// Absolute offset of the patch slot.
    #[must_use]
    pub fn slot_offset(&self) -> u32 {
        self.0
    }

    pub fn offset_by(&mut self, delta: u32) {
        self.0 += delta;
    }
}

/// A far jump that must eventually land on a function's normal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFarJump {
    pub func_index: u32,
    pub jump: PatchHandle,
}

impl CallFarJump {
    pub fn offset_by(&mut self, delta: u32) {
        self.jump.offset_by(delta);
    }
}

/// A far jump that must eventually land on a trap exit stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFarJump {
    pub trap: Trap,
    pub jump: PatchHandle,
}

impl TrapFarJump {
    pub fn offset_by(&mut self, delta: u32) {
        self.jump.offset_by(delta);
    }
}
