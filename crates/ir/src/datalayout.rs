//! Target data layout: type sizes, alignments, and the stack alignment.
//!
//! Parses the subset of the `target datalayout` specification string the
//! analyses need. Unspecified components fall back to the usual x86-64
//! defaults, except the stack alignment which stays unspecified (callers
//! treat that as "no rounding"), matching how the analyzer's frame
//! computation behaves when a target does not state one.

use crate::entities::TypeId;
use crate::types::{TypeData, TypeStore};

#[derive(Clone, Debug)]
pub struct DataLayout {
    /// Size of a pointer in address space 0, in bytes.
    pub ptr_bytes: u64,
    /// `S<bits>` component, in bytes; 0 when the string did not specify one.
    stack_align: u64,
    /// `i<bits>:<abi>` overrides, sorted by bit width.
    int_aligns: Vec<(u32, u64)>,
    /// `a:<abi>` aggregate alignment floor in bytes.
    agg_align: u64,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self {
            ptr_bytes: 8,
            stack_align: 0,
            int_aligns: vec![(1, 1), (8, 1), (16, 2), (32, 4), (64, 8)],
            agg_align: 1,
        }
    }
}

impl DataLayout {
    /// Parse a `target datalayout` specification. Unrecognized components
    /// are ignored.
    pub fn parse(spec: &str) -> Self {
        let mut dl = DataLayout::default();
        for part in spec.split('-') {
            if part.is_empty() {
                continue;
            }
            let bytes = part.as_bytes();
            match bytes[0] {
                b'p' => {
                    // p[n]:<size>:<abi>[...]; only address space 0 matters.
                    let rest = &part[1..];
                    let mut fields = rest.split(':');
                    let addrspace = fields.next().unwrap_or("");
                    if !addrspace.is_empty() && addrspace != "0" {
                        continue;
                    }
                    if let Some(size) = fields.next().and_then(|s| s.parse::<u64>().ok()) {
                        dl.ptr_bytes = size / 8;
                    }
                }
                b'i' => {
                    let mut fields = part[1..].split(':');
                    let bits = fields.next().and_then(|s| s.parse::<u32>().ok());
                    let abi = fields.next().and_then(|s| s.parse::<u64>().ok());
                    if let (Some(bits), Some(abi)) = (bits, abi) {
                        let abi_bytes = abi / 8;
                        match dl.int_aligns.iter_mut().find(|(b, _)| *b == bits) {
                            Some(entry) => entry.1 = abi_bytes.max(1),
                            None => dl.int_aligns.push((bits, abi_bytes.max(1))),
                        }
                        dl.int_aligns.sort_by_key(|(b, _)| *b);
                    }
                }
                b'S' => {
                    if let Ok(bits) = part[1..].parse::<u64>() {
                        dl.stack_align = bits / 8;
                    }
                }
                b'a' => {
                    if let Some(abi) = part
                        .split(':')
                        .nth(1)
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        dl.agg_align = (abi / 8).max(1);
                    }
                }
                _ => {}
            }
        }
        dl
    }

    /// Stack alignment in bytes; 1 when the target did not specify one.
    pub fn stack_align_bytes(&self) -> u64 {
        self.stack_align.max(1)
    }

    fn int_align(&self, bits: u32) -> u64 {
        // Exact match first, else the alignment of the next larger width,
        // else the largest specified.
        if let Some(&(_, a)) = self.int_aligns.iter().find(|(b, _)| *b == bits) {
            return a;
        }
        if let Some(&(_, a)) = self.int_aligns.iter().find(|(b, _)| *b > bits) {
            return a;
        }
        self.int_aligns.last().map(|&(_, a)| a).unwrap_or(1)
    }

    /// ABI alignment of a type, in bytes.
    pub fn abi_align(&self, types: &TypeStore, ty: TypeId) -> u64 {
        match types.resolved(ty) {
            TypeData::Void | TypeData::Label | TypeData::Metadata | TypeData::Token => 1,
            TypeData::Int(bits) => self.int_align(*bits),
            TypeData::Half => 2,
            TypeData::Float => 4,
            TypeData::Double => 8,
            TypeData::X86Fp80 | TypeData::Fp128 => 16,
            TypeData::Ptr | TypeData::Func { .. } => self.ptr_bytes,
            TypeData::Array { elem, .. } => self.abi_align(types, *elem),
            TypeData::Struct { fields, packed } => {
                if *packed {
                    return 1;
                }
                let mut align = self.agg_align;
                for &field in fields {
                    align = align.max(self.abi_align(types, field));
                }
                align
            }
            TypeData::Vector { elem, len } => {
                // Natural vector alignment: the total size rounded to a
                // power of two.
                let size = self.alloc_size(types, *elem) * len;
                size.next_power_of_two().max(1)
            }
            TypeData::Named(_) | TypeData::Opaque => 1,
        }
    }

    /// Number of bytes an object of this type occupies on the stack,
    /// including tail padding. Unresolvable types yield 0.
    pub fn alloc_size(&self, types: &TypeStore, ty: TypeId) -> u64 {
        match types.resolved(ty) {
            TypeData::Void | TypeData::Label | TypeData::Metadata | TypeData::Token => 0,
            TypeData::Int(bits) => {
                let bytes = (*bits as u64 + 7) / 8;
                align_to(bytes, self.int_align(*bits))
            }
            TypeData::Half => 2,
            TypeData::Float => 4,
            TypeData::Double => 8,
            TypeData::X86Fp80 | TypeData::Fp128 => 16,
            TypeData::Ptr | TypeData::Func { .. } => self.ptr_bytes,
            TypeData::Array { elem, len } => self.alloc_size(types, *elem) * len,
            TypeData::Struct { fields, packed } => {
                let (_, size) = self.struct_layout_fields(types, fields, *packed);
                size
            }
            TypeData::Vector { elem, len } => self.alloc_size(types, *elem) * len,
            TypeData::Named(_) | TypeData::Opaque => 0,
        }
    }

    /// Byte offsets of each struct field plus the padded total size.
    pub fn struct_layout(
        &self,
        types: &TypeStore,
        ty: TypeId,
    ) -> Option<(Vec<u64>, u64)> {
        match types.resolved(ty) {
            TypeData::Struct { fields, packed } => {
                Some(self.struct_layout_fields(types, fields, *packed))
            }
            _ => None,
        }
    }

    fn struct_layout_fields(
        &self,
        types: &TypeStore,
        fields: &[TypeId],
        packed: bool,
    ) -> (Vec<u64>, u64) {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0u64;
        let mut max_align = if packed { 1 } else { self.agg_align };
        for &field in fields {
            let align = if packed {
                1
            } else {
                self.abi_align(types, field)
            };
            max_align = max_align.max(align);
            offset = align_to(offset, align);
            offsets.push(offset);
            offset += self.alloc_size(types, field);
        }
        (offsets, align_to(offset, max_align))
    }
}

/// Round `value` up to a multiple of `align` (which may be 1).
pub fn align_to(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    const X86_64: &str =
        "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128";

    #[test]
    fn parses_stack_alignment() {
        let dl = DataLayout::parse(X86_64);
        assert_eq!(dl.stack_align_bytes(), 16);
        assert_eq!(dl.ptr_bytes, 8);
    }

    #[test]
    fn scalar_sizes() {
        let dl = DataLayout::parse(X86_64);
        let mut types = TypeStore::new();
        let i8t = types.int(8);
        let i32t = types.int(32);
        let i64t = types.int(64);
        let p = types.ptr();
        assert_eq!(dl.alloc_size(&types, i8t), 1);
        assert_eq!(dl.alloc_size(&types, i32t), 4);
        assert_eq!(dl.alloc_size(&types, i64t), 8);
        assert_eq!(dl.alloc_size(&types, p), 8);
    }

    #[test]
    fn array_and_struct_sizes() {
        let dl = DataLayout::parse(X86_64);
        let mut types = TypeStore::new();
        let i8t = types.int(8);
        let i32t = types.int(32);
        let arr = types.intern(TypeData::Array { elem: i8t, len: 10 });
        assert_eq!(dl.alloc_size(&types, arr), 10);

        // struct { i8, i32, i8 } -> offsets 0, 4, 8; size 12.
        let st = types.intern(TypeData::Struct {
            fields: vec![i8t, i32t, i8t],
            packed: false,
        });
        let (offsets, size) = dl.struct_layout(&types, st).unwrap();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(size, 12);
        assert_eq!(dl.abi_align(&types, st), 4);
    }

    #[test]
    fn unspecified_stack_alignment_is_one() {
        let dl = DataLayout::parse("e-m:e-i64:64");
        assert_eq!(dl.stack_align_bytes(), 1);
    }
}
