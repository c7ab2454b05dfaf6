//! Direct call graph over the module's defined functions.

use cranelift_entity::SecondaryMap;
use stackscan_ir::{FuncId, InstData, Module};

/// For each function, the unique direct callees that have a body.
pub struct CallGraph {
    callees: SecondaryMap<FuncId, Vec<FuncId>>,
}

impl CallGraph {
    pub fn build(module: &Module) -> Self {
        let mut callees: SecondaryMap<FuncId, Vec<FuncId>> = SecondaryMap::new();

        for func_id in module.defined_functions() {
            let func = &module.functions[func_id];
            let list = &mut callees[func_id];
            for (_, inst) in func.insts_in_order() {
                let Some(target) = func.insts[inst].direct_callee() else {
                    continue;
                };
                if module.functions[target].is_declaration {
                    continue;
                }
                if !list.contains(&target) {
                    list.push(target);
                }
            }
        }

        Self { callees }
    }

    pub fn callees(&self, func: FuncId) -> &[FuncId] {
        &self.callees[func]
    }
}

/// Does `func` directly call a defined function other than itself?
pub fn has_non_self_call(module: &Module, func_id: FuncId) -> bool {
    let func = &module.functions[func_id];
    for (_, inst) in func.insts_in_order() {
        if let Some(callee) = func.insts[inst].direct_callee() {
            if callee != func_id && !module.functions[callee].is_declaration {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackscan_reader::parse_module;

    #[test]
    fn unique_defined_callees() {
        let text = r#"
declare void @external()

define void @leaf() {
entry:
  ret void
}

define void @mid() {
entry:
  call void @leaf()
  call void @leaf()
  call void @external()
  ret void
}

define void @top() {
entry:
  call void @mid()
  call void @top()
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let cg = CallGraph::build(&module);
        let leaf = module.func_by_name("leaf").unwrap();
        let mid = module.func_by_name("mid").unwrap();
        let top = module.func_by_name("top").unwrap();

        assert!(cg.callees(leaf).is_empty());
        assert_eq!(cg.callees(mid), &[leaf]);
        assert_eq!(cg.callees(top), &[mid, top]);

        assert!(has_non_self_call(&module, mid));
        assert!(has_non_self_call(&module, top));
        assert!(!has_non_self_call(&module, leaf));
    }
}
