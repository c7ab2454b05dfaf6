//! Function bodies: blocks, instructions, values, and their def-use links.

use crate::attrs::{FnAttrs, ParamAttrs};
use crate::entities::{Block, Inst, MdId, TypeId, Value};
use crate::instructions::InstData;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};

/// A function parameter.
#[derive(Clone, Debug)]
pub struct Param {
    /// The SSA value the parameter is bound to in the body (also present
    /// for declarations, where it is simply unused).
    pub value: Value,
    pub ty: TypeId,
    pub attrs: ParamAttrs,
}

/// One basic block: a label and the instructions in layout order.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    pub name: String,
    pub insts: Vec<Inst>,
}

/// Where a value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueDef {
    /// The n'th function parameter.
    Param(usize),
    /// The result of an instruction.
    Inst(Inst),
    /// A value referenced before its definition was seen. The reader
    /// resolves these; any that remain are treated as opaque.
    Unresolved,
}

#[derive(Clone, Debug)]
pub struct ValueData {
    pub def: ValueDef,
    pub ty: TypeId,
    pub name: Option<String>,
}

/// A function, declared or defined.
#[derive(Debug)]
pub struct Function {
    /// Raw symbol name, without the leading `@`.
    pub name: String,
    pub ret_ty: TypeId,
    pub params: Vec<Param>,
    pub vararg: bool,
    pub is_declaration: bool,
    pub attrs: FnAttrs,

    /// Blocks in layout order.
    pub blocks: PrimaryMap<Block, BlockData>,
    pub insts: PrimaryMap<Inst, InstData>,
    pub values: PrimaryMap<Value, ValueData>,

    /// `!dbg` attachment per instruction.
    debug_locs: SecondaryMap<Inst, PackedOption<MdId>>,
    /// The function's `DISubprogram`, when debug info is present.
    pub subprogram: Option<MdId>,

    results: SecondaryMap<Inst, PackedOption<Value>>,
    inst_blocks: SecondaryMap<Inst, PackedOption<Block>>,
    /// Layout sequence number per instruction, for same-block ordering.
    positions: SecondaryMap<Inst, u32>,
    /// Instructions using each value. Built by `finish()`.
    uses: SecondaryMap<Value, Vec<Inst>>,
}

impl Function {
    pub fn new(name: String, ret_ty: TypeId) -> Self {
        Self {
            name,
            ret_ty,
            params: Vec::new(),
            vararg: false,
            is_declaration: true,
            attrs: FnAttrs::default(),
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            values: PrimaryMap::new(),
            debug_locs: SecondaryMap::new(),
            subprogram: None,
            results: SecondaryMap::new(),
            inst_blocks: SecondaryMap::new(),
            positions: SecondaryMap::new(),
            uses: SecondaryMap::new(),
        }
    }

    /// Create a fresh value.
    pub fn make_value(&mut self, def: ValueDef, ty: TypeId, name: Option<String>) -> Value {
        self.values.push(ValueData { def, ty, name })
    }

    /// Create a new empty block.
    pub fn make_block(&mut self, name: String) -> Block {
        self.blocks.push(BlockData {
            name,
            insts: Vec::new(),
        })
    }

    /// Append an instruction to a block; if `result_ty` is given, a result
    /// value is created and returned through `inst_result`.
    pub fn append_inst(
        &mut self,
        block: Block,
        data: InstData,
        result: Option<(TypeId, Option<String>)>,
        debug_loc: Option<MdId>,
    ) -> Inst {
        let inst = self.insts.push(data);
        self.inst_blocks[inst] = block.into();
        if let Some(loc) = debug_loc {
            self.debug_locs[inst] = loc.into();
        }
        if let Some((ty, name)) = result {
            let value = self.make_value(ValueDef::Inst(inst), ty, name);
            self.results[inst] = value.into();
        }
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Attach `value` as the result of `inst`, resolving a possibly
    /// forward-referenced value.
    pub fn bind_result(&mut self, inst: Inst, value: Value, ty: TypeId) {
        self.results[inst] = value.into();
        let data = &mut self.values[value];
        data.def = ValueDef::Inst(inst);
        data.ty = ty;
    }

    /// Finalize layout bookkeeping: instruction positions and use lists.
    /// Must be called once the body is complete.
    pub fn finish(&mut self) {
        let mut position = 0u32;
        let mut uses: SecondaryMap<Value, Vec<Inst>> = SecondaryMap::new();
        for (_, block_data) in self.blocks.iter() {
            for &inst in &block_data.insts {
                self.positions[inst] = position;
                position += 1;
                for operand in self.insts[inst].operands() {
                    if let Some(value) = operand.as_value() {
                        let list = &mut uses[value];
                        if list.last() != Some(&inst) {
                            list.push(inst);
                        }
                    }
                }
            }
        }
        self.uses = uses;
    }

    pub fn entry_block(&self) -> Option<Block> {
        self.blocks.iter().next().map(|(block, _)| block)
    }

    pub fn value_def(&self, value: Value) -> ValueDef {
        self.values[value].def
    }

    /// The instruction defining `value`, if it is an instruction result.
    pub fn value_inst(&self, value: Value) -> Option<Inst> {
        match self.values[value].def {
            ValueDef::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    /// The parameter index of `value`, if it is a parameter.
    pub fn value_param_index(&self, value: Value) -> Option<usize> {
        match self.values[value].def {
            ValueDef::Param(index) => Some(index),
            _ => None,
        }
    }

    pub fn value_type(&self, value: Value) -> TypeId {
        self.values[value].ty
    }

    pub fn value_name(&self, value: Value) -> Option<&str> {
        self.values[value].name.as_deref()
    }

    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst].expand()
    }

    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.inst_blocks[inst].expand()
    }

    pub fn inst_position(&self, inst: Inst) -> u32 {
        self.positions[inst]
    }

    pub fn debug_loc(&self, inst: Inst) -> Option<MdId> {
        self.debug_locs[inst].expand()
    }

    /// Instructions that use `value` as an operand, in layout order of
    /// discovery.
    pub fn uses_of(&self, value: Value) -> &[Inst] {
        &self.uses[value]
    }

    /// The terminator of a block: its last instruction.
    pub fn block_terminator(&self, block: Block) -> Option<Inst> {
        self.blocks[block].insts.last().copied()
    }

    /// Iterate all instructions in layout order.
    pub fn insts_in_order(&self) -> impl Iterator<Item = (Block, Inst)> + '_ {
        self.blocks
            .iter()
            .flat_map(|(block, data)| data.insts.iter().map(move |&inst| (block, inst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::{InstData, Operand};
    use crate::types::TypeStore;

    #[test]
    fn def_use_round_trip() {
        let mut types = TypeStore::new();
        let i32t = types.int(32);
        let ptr = types.ptr();

        let mut func = Function::new("f".to_string(), i32t);
        func.is_declaration = false;
        let block = func.make_block("entry".to_string());
        let slot = func.append_inst(
            block,
            InstData::Alloca {
                allocated_ty: i32t,
                count: Operand::Const(crate::constant::Constant::int(32, 1)),
                align: 4,
            },
            Some((ptr, Some("x".to_string()))),
            None,
        );
        let slot_val = func.inst_result(slot).unwrap();
        let load = func.append_inst(
            block,
            InstData::Load {
                ty: i32t,
                ptr: Operand::Value(slot_val),
            },
            Some((i32t, None)),
            None,
        );
        let load_val = func.inst_result(load).unwrap();
        func.append_inst(
            block,
            InstData::Ret {
                value: Some(Operand::Value(load_val)),
            },
            None,
            None,
        );
        func.finish();

        assert_eq!(func.uses_of(slot_val), &[load]);
        assert_eq!(func.value_inst(slot_val), Some(slot));
        assert_eq!(func.value_name(slot_val), Some("x"));
        assert!(func.inst_position(load) > func.inst_position(slot));
        assert_eq!(func.entry_block(), Some(block));
    }
}
