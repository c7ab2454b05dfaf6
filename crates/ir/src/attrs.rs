//! Parameter and function attribute sets.
//!
//! Only the attributes the analyses consume are modeled; everything else is
//! dropped by the reader.

use bitflags::bitflags;

bitflags! {
    /// Attributes attached to a function parameter or a call-site argument.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ParamAttrs: u16 {
        /// The callee does not capture the pointer (`nocapture` /
        /// `captures(none)`).
        const NOCAPTURE = 1 << 0;
        /// The callee does not write through the pointer.
        const READONLY = 1 << 1;
        /// The callee neither reads nor writes through the pointer.
        const READNONE = 1 << 2;
        /// The callee only writes through the pointer.
        const WRITEONLY = 1 << 3;
        /// Pass-by-value aggregate.
        const BYVAL = 1 << 4;
        /// Pass-by-reference aggregate.
        const BYREF = 1 << 5;
        /// The pointer is known non-null.
        const NONNULL = 1 << 6;
        /// Structure return slot.
        const SRET = 1 << 7;
    }
}

bitflags! {
    /// Function-level attributes.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FnAttrs: u16 {
        /// `memory(none)` / `readnone`: does not access memory.
        const READNONE = 1 << 0;
        /// `memory(read)` / `readonly`: only reads memory.
        const READONLY = 1 << 1;
        /// Never returns to the caller.
        const NORETURN = 1 << 2;
        /// Does not unwind.
        const NOUNWIND = 1 << 3;
    }
}

impl FnAttrs {
    /// Does the function provably not write memory?
    pub fn only_reads_memory(self) -> bool {
        self.intersects(FnAttrs::READNONE | FnAttrs::READONLY)
    }

    /// Does the function provably not access memory at all?
    pub fn does_not_access_memory(self) -> bool {
        self.contains(FnAttrs::READNONE)
    }
}
