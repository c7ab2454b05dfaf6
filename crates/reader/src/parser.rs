//! Parser for textual LLVM IR.
//!
//! The grammar covered here is the subset the analyzer models; any
//! instruction outside it is recorded as an opaque `Unknown` instruction
//! and the rest of its line is skipped. Metadata nodes keep only the fields
//! the debug-info queries consume.

use crate::error::{err, Location, ParseResult};
use crate::lexer::{Lexer, Token};
use rustc_hash::FxHashMap;
use stackscan_ir::{
    BinOp, CallArg, CastOp, Constant, DataLayout, DebugRecordKind, DwTag, FnAttrs, FuncId,
    Function, InstData, IntPredicate, MdId, MdNode, Module, Operand, ParamAttrs, TypeData, TypeId,
    Value, ValueDef,
};
use stackscan_ir::entities::Block;

/// Parse one module from textual IR.
pub fn parse_module(text: &str) -> ParseResult<Module> {
    Parser::new(text).run()
}

#[derive(Default)]
struct BodyCtx {
    values: FxHashMap<String, Value>,
    blocks: FxHashMap<String, Block>,
}

enum MdField {
    Md(MdId),
    Str(String),
    Int(i64),
    Ident(String),
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<Token>,
    loc: Location,
    module: Module,
    attr_groups: FxHashMap<u32, FnAttrs>,
    pending_fn_groups: Vec<(FuncId, u32)>,
}

fn is_int_type(s: &str) -> bool {
    s.len() > 1 && s.starts_with('i') && s[1..].bytes().all(|b| b.is_ascii_digit())
}

fn is_type_keyword(s: &str) -> bool {
    matches!(
        s,
        "void"
            | "half"
            | "bfloat"
            | "float"
            | "double"
            | "x86_fp80"
            | "fp128"
            | "ppc_fp128"
            | "ptr"
            | "label"
            | "metadata"
            | "token"
            | "opaque"
    ) || is_int_type(s)
}

fn token_starts_type(tok: &Token) -> bool {
    match tok {
        Token::Ident(s) => is_type_keyword(s),
        Token::LBracket | Token::LBrace | Token::LAngle => true,
        _ => false,
    }
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lexer: Lexer::new(text),
            lookahead: None,
            loc: Location::default(),
            module: Module::new(),
            attr_groups: FxHashMap::default(),
            pending_fn_groups: Vec::new(),
        }
    }

    // ---- token plumbing --------------------------------------------------

    fn peek(&mut self) -> Option<&Token> {
        if self.lookahead.is_none() {
            if let Some((loc, tok)) = self.lexer.next_token() {
                self.loc = loc;
                self.lookahead = Some(tok);
            }
        }
        self.lookahead.as_ref()
    }

    fn take(&mut self) -> Option<Token> {
        self.peek();
        self.lookahead.take()
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.take();
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == kw) {
            self.take();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token, what: &str) -> ParseResult<()> {
        match self.take() {
            Some(t) if t == tok => Ok(()),
            other => err!(self.loc, "expected {}, got {:?}", what, other),
        }
    }

    fn expect_ident(&mut self, kw: &str) -> ParseResult<()> {
        match self.take() {
            Some(Token::Ident(s)) if s == kw => Ok(()),
            other => err!(self.loc, "expected '{}', got {:?}", kw, other),
        }
    }

    fn take_ident(&mut self, what: &str) -> ParseResult<String> {
        match self.take() {
            Some(Token::Ident(s)) => Ok(s),
            other => err!(self.loc, "expected {}, got {:?}", what, other),
        }
    }

    fn take_local(&mut self) -> ParseResult<String> {
        match self.take() {
            Some(Token::LocalId(s)) => Ok(s),
            other => err!(self.loc, "expected local name, got {:?}", other),
        }
    }

    fn take_global(&mut self) -> ParseResult<String> {
        match self.take() {
            Some(Token::GlobalId(s)) => Ok(s),
            other => err!(self.loc, "expected global name, got {:?}", other),
        }
    }

    fn take_integer(&mut self, what: &str) -> ParseResult<i128> {
        match self.take() {
            Some(Token::Integer(v)) => Ok(v),
            other => err!(self.loc, "expected {}, got {:?}", what, other),
        }
    }

    /// Consume tokens through the end of the current line.
    fn skip_line(&mut self) {
        while let Some(tok) = self.take() {
            if tok == Token::Newline {
                break;
            }
        }
    }

    /// Consume a balanced bracket group whose opener is the next token.
    fn skip_balanced(&mut self) -> ParseResult<()> {
        let mut depth = 0i32;
        loop {
            match self.take() {
                Some(
                    Token::LParen | Token::LBracket | Token::LBrace | Token::LAngle,
                ) => depth += 1,
                Some(
                    Token::RParen | Token::RBracket | Token::RBrace | Token::RAngle,
                ) => {
                    depth -= 1;
                    if depth <= 0 {
                        return Ok(());
                    }
                }
                Some(_) => {}
                None => return err!(self.loc, "unexpected end of file in bracketed group"),
            }
            if depth == 0 {
                return Ok(());
            }
        }
    }

    // ---- types -----------------------------------------------------------

    fn int_bits_or(&self, ty: TypeId, default: u32) -> u32 {
        match self.module.types.resolved(ty) {
            TypeData::Int(bits) => *bits,
            _ => default,
        }
    }

    fn parse_type(&mut self) -> ParseResult<TypeId> {
        let mut ty = match self.take() {
            Some(Token::Ident(s)) => match s.as_str() {
                "void" => self.module.types.void(),
                "half" | "bfloat" => self.module.types.intern(TypeData::Half),
                "float" => self.module.types.intern(TypeData::Float),
                "double" => self.module.types.intern(TypeData::Double),
                "x86_fp80" => self.module.types.intern(TypeData::X86Fp80),
                "fp128" | "ppc_fp128" => self.module.types.intern(TypeData::Fp128),
                "ptr" => self.module.types.ptr(),
                "label" => self.module.types.intern(TypeData::Label),
                "metadata" => self.module.types.intern(TypeData::Metadata),
                "token" => self.module.types.intern(TypeData::Token),
                "opaque" => self.module.types.intern(TypeData::Opaque),
                _ if is_int_type(&s) => {
                    let bits: u32 = s[1..].parse().unwrap_or(32);
                    self.module.types.int(bits)
                }
                _ => return err!(self.loc, "expected type, got '{}'", s),
            },
            Some(Token::LocalId(name)) => self.module.types.intern(TypeData::Named(name)),
            Some(Token::LBracket) => {
                let len = self.take_integer("array length")? as u64;
                self.expect_ident("x")?;
                let elem = self.parse_type()?;
                self.expect(Token::RBracket, "]")?;
                self.module.types.intern(TypeData::Array { elem, len })
            }
            Some(Token::LBrace) => self.parse_struct_body(false)?,
            Some(Token::LAngle) => {
                if self.eat(&Token::LBrace) {
                    let body = self.parse_struct_body(true)?;
                    self.expect(Token::RAngle, ">")?;
                    body
                } else {
                    if self.eat_ident("vscale") {
                        self.expect_ident("x")?;
                    }
                    let len = self.take_integer("vector length")? as u64;
                    self.expect_ident("x")?;
                    let elem = self.parse_type()?;
                    self.expect(Token::RAngle, ">")?;
                    self.module.types.intern(TypeData::Vector { elem, len })
                }
            }
            other => return err!(self.loc, "expected type, got {:?}", other),
        };

        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.take();
                    ty = self.module.types.ptr();
                }
                Some(Token::Ident(s)) if s == "addrspace" => {
                    self.take();
                    self.skip_balanced()?;
                }
                Some(Token::LParen) => {
                    self.take();
                    let mut params = Vec::new();
                    let mut vararg = false;
                    if !self.eat(&Token::RParen) {
                        loop {
                            if self.eat(&Token::Ellipsis) {
                                vararg = true;
                                self.expect(Token::RParen, ")")?;
                                break;
                            }
                            params.push(self.parse_type()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(Token::RParen, ")")?;
                            break;
                        }
                    }
                    ty = self.module.types.intern(TypeData::Func {
                        ret: ty,
                        params,
                        vararg,
                    });
                }
                _ => break,
            }
        }
        Ok(ty)
    }

    /// Parse `ty, ty, ...}` after the opening brace has been consumed.
    fn parse_struct_body(&mut self, packed: bool) -> ParseResult<TypeId> {
        let mut fields = Vec::new();
        if !self.eat(&Token::RBrace) {
            loop {
                fields.push(self.parse_type()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RBrace, "}")?;
                break;
            }
        }
        Ok(self.module.types.intern(TypeData::Struct { fields, packed }))
    }

    // ---- constants -------------------------------------------------------

    fn const_to_operand(c: Constant) -> Operand {
        match c {
            Constant::Global(g) => Operand::Global(g),
            Constant::Func(f) => Operand::Func(f),
            other => Operand::Const(other),
        }
    }

    fn parse_const(&mut self, ty: TypeId) -> ParseResult<Constant> {
        let bits = self.int_bits_or(ty, 64);
        match self.take() {
            Some(Token::Integer(v)) => Ok(Constant::Int {
                bits,
                value: v as u64,
            }),
            Some(Token::FloatLit(text)) => Ok(Constant::Float(
                text.parse::<f64>().map(f64::to_bits).unwrap_or(0),
            )),
            Some(Token::GlobalId(name)) => {
                if let Some(f) = self.module.func_by_name(&name) {
                    Ok(Constant::Func(f))
                } else {
                    let ptr = self.module.types.ptr();
                    Ok(Constant::Global(self.module.ensure_global(&name, ptr)))
                }
            }
            Some(Token::LBracket) => self.parse_aggregate_const(Token::RBracket),
            Some(Token::LBrace) => self.parse_aggregate_const(Token::RBrace),
            Some(Token::LAngle) => {
                if self.eat(&Token::LBrace) {
                    let agg = self.parse_aggregate_const(Token::RBrace)?;
                    self.expect(Token::RAngle, ">")?;
                    Ok(agg)
                } else {
                    self.parse_aggregate_const(Token::RAngle)
                }
            }
            Some(Token::Ident(s)) => match s.as_str() {
                "null" => Ok(Constant::Null),
                "undef" | "poison" | "none" => Ok(Constant::Undef),
                "zeroinitializer" => Ok(Constant::Zero),
                "true" => Ok(Constant::Int { bits: 1, value: 1 }),
                "false" => Ok(Constant::Int { bits: 1, value: 0 }),
                "c" => match self.take() {
                    Some(Token::Str(bytes)) => Ok(Constant::Str(bytes)),
                    other => err!(self.loc, "expected string after 'c', got {:?}", other),
                },
                "getelementptr" => self.parse_const_gep(),
                "add" | "sub" | "mul" => {
                    let op = BinOp::from_keyword(&s).unwrap();
                    self.parse_const_binop(op)
                }
                _ => {
                    if let Some(op) = CastOp::from_keyword(&s) {
                        self.parse_const_cast(op)
                    } else {
                        err!(self.loc, "unexpected token in constant: '{}'", s)
                    }
                }
            },
            other => err!(self.loc, "expected constant, got {:?}", other),
        }
    }

    fn parse_aggregate_const(&mut self, close: Token) -> ParseResult<Constant> {
        let mut elems = Vec::new();
        if !self.eat(&close) {
            loop {
                let ty = self.parse_type()?;
                elems.push(self.parse_const(ty)?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(close.clone(), "aggregate close")?;
                break;
            }
        }
        Ok(Constant::Aggregate(elems))
    }

    fn parse_const_cast(&mut self, op: CastOp) -> ParseResult<Constant> {
        self.expect(Token::LParen, "(")?;
        let src_ty = self.parse_type()?;
        let value = Self::const_to_operand(self.parse_const(src_ty)?);
        self.expect_ident("to")?;
        let to_ty = self.parse_type()?;
        self.expect(Token::RParen, ")")?;
        Ok(Constant::Expr(Box::new(stackscan_ir::ConstExpr::Cast {
            op,
            value,
            to_ty,
        })))
    }

    fn parse_const_gep(&mut self) -> ParseResult<Constant> {
        let mut inbounds = false;
        loop {
            if self.eat_ident("inbounds") {
                inbounds = true;
            } else if self.eat_ident("nuw") || self.eat_ident("nusw") {
            } else {
                break;
            }
        }
        self.expect(Token::LParen, "(")?;
        let source_ty = self.parse_type()?;
        self.expect(Token::Comma, ",")?;
        let base_ty = self.parse_type()?;
        let base = Self::const_to_operand(self.parse_const(base_ty)?);
        let mut indices = Vec::new();
        while self.eat(&Token::Comma) {
            let ity = self.parse_type()?;
            indices.push(Self::const_to_operand(self.parse_const(ity)?));
        }
        self.expect(Token::RParen, ")")?;
        Ok(Constant::Expr(Box::new(
            stackscan_ir::ConstExpr::GetElementPtr {
                source_ty,
                base,
                indices,
                inbounds,
            },
        )))
    }

    fn parse_const_binop(&mut self, op: BinOp) -> ParseResult<Constant> {
        while self.eat_ident("nuw") || self.eat_ident("nsw") {}
        self.expect(Token::LParen, "(")?;
        let lty = self.parse_type()?;
        let lhs = Self::const_to_operand(self.parse_const(lty)?);
        self.expect(Token::Comma, ",")?;
        let rty = self.parse_type()?;
        let rhs = Self::const_to_operand(self.parse_const(rty)?);
        self.expect(Token::RParen, ")")?;
        Ok(Constant::Expr(Box::new(stackscan_ir::ConstExpr::Binary {
            op,
            lhs,
            rhs,
        })))
    }

    // ---- operands --------------------------------------------------------

    fn ensure_local(&mut self, ctx: &mut BodyCtx, func: &mut Function, name: &str) -> Value {
        if let Some(&v) = ctx.values.get(name) {
            return v;
        }
        let void = self.module.types.void();
        let v = func.make_value(ValueDef::Unresolved, void, Some(name.to_string()));
        ctx.values.insert(name.to_string(), v);
        v
    }

    fn ensure_block(&mut self, ctx: &mut BodyCtx, func: &mut Function, name: &str) -> Block {
        if let Some(&b) = ctx.blocks.get(name) {
            return b;
        }
        let b = func.make_block(name.to_string());
        ctx.blocks.insert(name.to_string(), b);
        b
    }

    fn parse_operand_value(
        &mut self,
        ctx: &mut BodyCtx,
        func: &mut Function,
        ty: TypeId,
    ) -> ParseResult<Operand> {
        if matches!(self.module.types.data(ty), TypeData::Metadata) {
            return self.parse_metadata_operand(ctx, func);
        }
        match self.peek() {
            Some(Token::LocalId(_)) => {
                let Some(Token::LocalId(name)) = self.take() else {
                    unreachable!()
                };
                Ok(Operand::Value(self.ensure_local(ctx, func, &name)))
            }
            Some(Token::GlobalId(_)) => {
                let Some(Token::GlobalId(name)) = self.take() else {
                    unreachable!()
                };
                if let Some(f) = self.module.func_by_name(&name) {
                    Ok(Operand::Func(f))
                } else {
                    let ptr = self.module.types.ptr();
                    Ok(Operand::Global(self.module.ensure_global(&name, ptr)))
                }
            }
            _ => Ok(Self::const_to_operand(self.parse_const(ty)?)),
        }
    }

    fn parse_metadata_operand(
        &mut self,
        ctx: &mut BodyCtx,
        func: &mut Function,
    ) -> ParseResult<Operand> {
        match self.peek() {
            Some(tok) if token_starts_type(tok) => {
                let ty = self.parse_type()?;
                self.parse_operand_value(ctx, func, ty)
            }
            Some(Token::MetadataRef(_)) => {
                let Some(Token::MetadataRef(n)) = self.take() else {
                    unreachable!()
                };
                Ok(Operand::Metadata(self.module.metadata.ensure_indexed(n)))
            }
            Some(Token::MetadataName(_)) => {
                let Some(Token::MetadataName(kind)) = self.take() else {
                    unreachable!()
                };
                let node = self.parse_md_specialized(kind)?;
                Ok(Operand::Metadata(self.module.metadata.add(node)))
            }
            Some(Token::Bang) => {
                let node = self.parse_md_bang()?;
                Ok(Operand::Metadata(self.module.metadata.add(node)))
            }
            _ => {
                let void = self.module.types.void();
                Ok(Self::const_to_operand(self.parse_const(void)?))
            }
        }
    }

    // ---- attributes ------------------------------------------------------

    fn parse_param_attrs(&mut self) -> ParseResult<ParamAttrs> {
        let mut attrs = ParamAttrs::default();
        loop {
            let Some(Token::Ident(s)) = self.peek() else {
                break;
            };
            let kw = s.clone();
            match kw.as_str() {
                "nocapture" => {
                    self.take();
                    attrs |= ParamAttrs::NOCAPTURE;
                }
                "readonly" => {
                    self.take();
                    attrs |= ParamAttrs::READONLY;
                }
                "readnone" => {
                    self.take();
                    attrs |= ParamAttrs::READNONE;
                }
                "writeonly" => {
                    self.take();
                    attrs |= ParamAttrs::WRITEONLY;
                }
                "nonnull" => {
                    self.take();
                    attrs |= ParamAttrs::NONNULL;
                }
                "byval" => {
                    self.take();
                    attrs |= ParamAttrs::BYVAL;
                    if self.peek() == Some(&Token::LParen) {
                        self.skip_balanced()?;
                    }
                }
                "byref" => {
                    self.take();
                    attrs |= ParamAttrs::BYREF;
                    if self.peek() == Some(&Token::LParen) {
                        self.skip_balanced()?;
                    }
                }
                "sret" => {
                    self.take();
                    attrs |= ParamAttrs::SRET;
                    if self.peek() == Some(&Token::LParen) {
                        self.skip_balanced()?;
                    }
                }
                "captures" => {
                    // captures(none) is the successor spelling of nocapture.
                    self.take();
                    if self.peek() == Some(&Token::LParen) {
                        self.take();
                        let mut none = false;
                        loop {
                            match self.take() {
                                Some(Token::RParen) | None => break,
                                Some(Token::Ident(w)) if w == "none" => none = true,
                                Some(_) => {}
                            }
                        }
                        if none {
                            attrs |= ParamAttrs::NOCAPTURE;
                        }
                    }
                }
                "align" => {
                    self.take();
                    if matches!(self.peek(), Some(Token::Integer(_))) {
                        self.take();
                    } else if self.peek() == Some(&Token::LParen) {
                        self.skip_balanced()?;
                    }
                }
                "noundef" | "noalias" | "signext" | "zeroext" | "inreg" | "returned"
                | "immarg" | "noescape" | "nofree" | "nest" | "swiftself" | "swifterror"
                | "dead_on_unwind" | "dead_on_return" | "writable" | "allocalign"
                | "allocptr" | "inalloca" | "preallocated" | "elementtype" | "range"
                | "dereferenceable" | "dereferenceable_or_null" | "initializes" => {
                    self.take();
                    if self.peek() == Some(&Token::LParen) {
                        self.skip_balanced()?;
                    }
                }
                _ => break,
            }
        }
        Ok(attrs)
    }

    fn apply_fn_attr_ident(&mut self, attrs: &mut FnAttrs, kw: &str) -> ParseResult<()> {
        match kw {
            "readnone" => *attrs |= FnAttrs::READNONE,
            "readonly" => *attrs |= FnAttrs::READONLY,
            "nounwind" => *attrs |= FnAttrs::NOUNWIND,
            "noreturn" => *attrs |= FnAttrs::NORETURN,
            "memory" => {
                if self.peek() == Some(&Token::LParen) {
                    self.take();
                    let mut words = Vec::new();
                    loop {
                        match self.take() {
                            Some(Token::RParen) | None => break,
                            Some(Token::Ident(w)) => words.push(w),
                            Some(_) => {}
                        }
                    }
                    // memory(none) and memory(read) are the only forms the
                    // analyses act on; argmem-qualified forms stay unknown.
                    if words == ["none"] {
                        *attrs |= FnAttrs::READNONE;
                    } else if words == ["read"] {
                        *attrs |= FnAttrs::READONLY;
                    }
                }
            }
            _ => {
                if self.peek() == Some(&Token::LParen) {
                    self.skip_balanced()?;
                }
            }
        }
        Ok(())
    }

    // ---- top level -------------------------------------------------------

    fn run(mut self) -> ParseResult<Module> {
        loop {
            match self.peek() {
                None => break,
                Some(Token::Newline) => {
                    self.take();
                }
                Some(Token::Ident(s)) => match s.as_str() {
                    "source_filename" => {
                        self.take();
                        self.expect(Token::Equal, "=")?;
                        if let Some(Token::Str(bytes)) = self.take() {
                            self.module.source_filename =
                                String::from_utf8_lossy(&bytes).into_owned();
                        }
                        self.skip_line();
                    }
                    "target" => {
                        self.take();
                        let which = self.take_ident("datalayout or triple")?;
                        self.expect(Token::Equal, "=")?;
                        if let Some(Token::Str(bytes)) = self.take() {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            match which.as_str() {
                                "datalayout" => {
                                    self.module.data_layout = DataLayout::parse(&text);
                                }
                                "triple" => self.module.target_triple = text,
                                _ => {}
                            }
                        }
                        self.skip_line();
                    }
                    "define" => self.parse_define()?,
                    "declare" => self.parse_declare()?,
                    "attributes" => self.parse_attr_group()?,
                    _ => self.skip_line(),
                },
                Some(Token::LocalId(_)) => self.parse_type_def()?,
                Some(Token::GlobalId(_)) => self.parse_global()?,
                Some(Token::MetadataRef(_)) => {
                    let Some(Token::MetadataRef(n)) = self.take() else {
                        unreachable!()
                    };
                    self.parse_md_def(n)?;
                }
                Some(_) => self.skip_line(),
            }
        }
        for (func_id, group) in std::mem::take(&mut self.pending_fn_groups) {
            if let Some(&attrs) = self.attr_groups.get(&group) {
                self.module.functions[func_id].attrs |= attrs;
            }
        }
        Ok(self.module)
    }

    fn parse_type_def(&mut self) -> ParseResult<()> {
        let name = self.take_local()?;
        self.expect(Token::Equal, "=")?;
        self.expect_ident("type")?;
        let body = self.parse_type()?;
        self.module.types.define_struct(&name, body);
        self.skip_line();
        Ok(())
    }

    fn parse_global(&mut self) -> ParseResult<()> {
        let name = self.take_global()?;
        self.expect(Token::Equal, "=")?;
        let mut is_constant = false;
        loop {
            match self.peek() {
                Some(Token::Ident(s)) if s == "global" => {
                    self.take();
                    break;
                }
                Some(Token::Ident(s)) if s == "constant" => {
                    self.take();
                    is_constant = true;
                    break;
                }
                Some(Token::Ident(s)) if s == "alias" || s == "ifunc" => {
                    self.skip_line();
                    return Ok(());
                }
                Some(Token::Ident(_)) => {
                    self.take();
                    if self.peek() == Some(&Token::LParen) {
                        self.skip_balanced()?;
                    }
                }
                Some(Token::Str(_)) | Some(Token::Integer(_)) | Some(Token::Comma) => {
                    self.take();
                }
                _ => {
                    self.skip_line();
                    return Ok(());
                }
            }
        }
        let ty = self.parse_type()?;
        let init = match self.peek() {
            Some(Token::Comma) | Some(Token::Newline) | None => None,
            _ => self.parse_const(ty).ok(),
        };
        let id = self.module.ensure_global(&name, ty);
        let global = &mut self.module.globals[id];
        global.ty = ty;
        global.is_constant = is_constant;
        global.init = init;
        self.skip_line();
        Ok(())
    }

    fn parse_attr_group(&mut self) -> ParseResult<()> {
        self.expect_ident("attributes")?;
        let group = match self.take() {
            Some(Token::AttrGroupRef(n)) => n,
            other => return err!(self.loc, "expected attribute group id, got {:?}", other),
        };
        self.expect(Token::Equal, "=")?;
        self.expect(Token::LBrace, "{")?;
        let mut attrs = FnAttrs::default();
        loop {
            match self.take() {
                Some(Token::RBrace) | None => break,
                Some(Token::Ident(kw)) => self.apply_fn_attr_ident(&mut attrs, &kw)?,
                Some(_) => {}
            }
        }
        self.attr_groups.insert(group, attrs);
        self.skip_line();
        Ok(())
    }

    /// Skip linkage, visibility, calling convention, and return attribute
    /// tokens before the type of a `define`/`declare`/`call`.
    fn skip_decl_modifiers(&mut self) -> ParseResult<()> {
        loop {
            match self.peek() {
                Some(Token::Ident(s)) if !is_type_keyword(s) => {
                    let kw = s.clone();
                    self.take();
                    if kw == "cc" || kw == "align" {
                        if matches!(self.peek(), Some(Token::Integer(_))) {
                            self.take();
                        }
                    }
                    if self.peek() == Some(&Token::LParen) {
                        self.skip_balanced()?;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_signature(
        &mut self,
        func: &mut Function,
        ctx: &mut BodyCtx,
    ) -> ParseResult<()> {
        self.expect(Token::LParen, "(")?;
        let mut index = 0usize;
        if !self.eat(&Token::RParen) {
            loop {
                if self.eat(&Token::Ellipsis) {
                    func.vararg = true;
                    self.expect(Token::RParen, ")")?;
                    break;
                }
                let ty = self.parse_type()?;
                let attrs = self.parse_param_attrs()?;
                let pname = if matches!(self.peek(), Some(Token::LocalId(_))) {
                    let Some(Token::LocalId(n)) = self.take() else {
                        unreachable!()
                    };
                    Some(n)
                } else {
                    None
                };
                let value = func.make_value(ValueDef::Param(index), ty, pname.clone());
                if let Some(n) = &pname {
                    ctx.values.insert(n.clone(), value);
                }
                func.params.push(stackscan_ir::Param { value, ty, attrs });
                index += 1;
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, ")")?;
                break;
            }
        }
        Ok(())
    }

    fn parse_declare(&mut self) -> ParseResult<()> {
        self.expect_ident("declare")?;
        self.skip_decl_modifiers()?;
        // Return attributes may repeat after the modifiers; modifiers above
        // already swallowed them since none are type keywords.
        let ret_ty = self.parse_type()?;
        let name = self.take_global()?;
        let func_id = self.module.ensure_func(&name, ret_ty);
        let mut func = Function::new(name, ret_ty);
        let mut ctx = BodyCtx::default();
        self.parse_signature(&mut func, &mut ctx)?;
        loop {
            match self.peek() {
                Some(Token::Newline) | None => break,
                Some(Token::AttrGroupRef(_)) => {
                    let Some(Token::AttrGroupRef(n)) = self.take() else {
                        unreachable!()
                    };
                    self.pending_fn_groups.push((func_id, n));
                }
                Some(Token::Ident(_)) => {
                    let Some(Token::Ident(kw)) = self.take() else {
                        unreachable!()
                    };
                    let mut attrs = func.attrs;
                    self.apply_fn_attr_ident(&mut attrs, &kw)?;
                    func.attrs = attrs;
                }
                Some(_) => {
                    self.take();
                }
            }
        }
        self.skip_line();
        if self.module.functions[func_id].is_declaration {
            self.module.functions[func_id] = func;
        }
        Ok(())
    }

    fn parse_define(&mut self) -> ParseResult<()> {
        self.expect_ident("define")?;
        self.skip_decl_modifiers()?;
        let ret_ty = self.parse_type()?;
        let name = self.take_global()?;
        let func_id = self.module.ensure_func(&name, ret_ty);
        let mut func = Function::new(name, ret_ty);
        func.is_declaration = false;
        let mut ctx = BodyCtx::default();
        self.parse_signature(&mut func, &mut ctx)?;

        // Header tail: attributes, metadata, personality, up to the body.
        loop {
            match self.peek() {
                None => return err!(self.loc, "unexpected end of file in function header"),
                Some(Token::LBrace) => {
                    self.take();
                    break;
                }
                Some(Token::AttrGroupRef(_)) => {
                    let Some(Token::AttrGroupRef(n)) = self.take() else {
                        unreachable!()
                    };
                    self.pending_fn_groups.push((func_id, n));
                }
                Some(Token::MetadataName(s)) if s == "dbg" => {
                    self.take();
                    if let Some(Token::MetadataRef(n)) = self.peek().cloned() {
                        self.take();
                        func.subprogram = Some(self.module.metadata.ensure_indexed(n));
                    }
                }
                Some(Token::MetadataName(_)) => {
                    self.take();
                    if matches!(self.peek(), Some(Token::MetadataRef(_))) {
                        self.take();
                    }
                }
                Some(Token::Ident(s)) if s == "personality" => {
                    self.take();
                    let pty = self.parse_type()?;
                    let _ = self.parse_operand_value(&mut ctx, &mut func, pty)?;
                }
                Some(Token::Ident(_)) => {
                    let Some(Token::Ident(kw)) = self.take() else {
                        unreachable!()
                    };
                    let mut attrs = func.attrs;
                    self.apply_fn_attr_ident(&mut attrs, &kw)?;
                    func.attrs = attrs;
                    if kw == "align" || kw == "section" || kw == "comdat" || kw == "gc" {
                        if matches!(
                            self.peek(),
                            Some(Token::Integer(_)) | Some(Token::Str(_))
                        ) {
                            self.take();
                        }
                    }
                }
                Some(_) => {
                    self.take();
                }
            }
        }

        // Body.
        let mut current: Option<Block> = None;
        loop {
            match self.peek() {
                None => return err!(self.loc, "unexpected end of file in function body"),
                Some(Token::Newline) => {
                    self.take();
                }
                Some(Token::RBrace) => {
                    self.take();
                    break;
                }
                Some(Token::LabelDecl(_)) => {
                    let Some(Token::LabelDecl(label)) = self.take() else {
                        unreachable!()
                    };
                    current = Some(self.ensure_block(&mut ctx, &mut func, &label));
                }
                Some(_) => {
                    let block = match current {
                        Some(b) => b,
                        None => {
                            let b = func.make_block(String::new());
                            current = Some(b);
                            b
                        }
                    };
                    self.parse_instruction(&mut ctx, &mut func, block)?;
                }
            }
        }

        func.finish();
        for (name, &value) in &ctx.values {
            if matches!(func.value_def(value), ValueDef::Unresolved) {
                log::warn!(
                    "use of value %{name} with no visible definition in function {}",
                    func.name
                );
            }
        }
        self.module.functions[func_id] = func;
        Ok(())
    }

    // ---- instructions ----------------------------------------------------

    /// Consume attachments and leftovers through the end of the line,
    /// capturing a `!dbg` reference when present.
    fn finish_inst_line(&mut self) -> ParseResult<Option<MdId>> {
        let mut dbg = None;
        loop {
            match self.peek() {
                None => break,
                Some(Token::Newline) => {
                    self.take();
                    break;
                }
                Some(Token::MetadataName(s)) if s == "dbg" => {
                    self.take();
                    if let Some(Token::MetadataRef(n)) = self.peek().cloned() {
                        self.take();
                        dbg = Some(self.module.metadata.ensure_indexed(n));
                    }
                }
                Some(Token::MetadataName(_)) => {
                    self.take();
                    match self.peek() {
                        Some(Token::MetadataRef(_)) => {
                            self.take();
                        }
                        Some(Token::LParen) => {
                            self.skip_balanced()?;
                        }
                        _ => {}
                    }
                }
                Some(
                    Token::LParen | Token::LBracket | Token::LBrace | Token::LAngle,
                ) => {
                    self.skip_balanced()?;
                }
                Some(_) => {
                    self.take();
                }
            }
        }
        Ok(dbg)
    }

    fn parse_instruction(
        &mut self,
        ctx: &mut BodyCtx,
        func: &mut Function,
        block: Block,
    ) -> ParseResult<()> {
        let result_name = if matches!(self.peek(), Some(Token::LocalId(_))) {
            let Some(Token::LocalId(name)) = self.take() else {
                unreachable!()
            };
            self.expect(Token::Equal, "=")?;
            Some(name)
        } else {
            None
        };

        let opcode = match self.take() {
            Some(Token::Ident(s)) => s,
            Some(Token::HashIdent(head)) => {
                return self.parse_dbg_record(ctx, func, block, &head);
            }
            Some(Token::Newline) | None => return Ok(()),
            Some(_) => {
                self.skip_line();
                return Ok(());
            }
        };

        let (data, result_ty) = self.parse_inst_body(ctx, func, &opcode)?;
        let dbg = self.finish_inst_line()?;
        let inst = func.append_inst(block, data, None, dbg);
        if let Some(name) = result_name {
            let value = self.ensure_local(ctx, func, &name);
            let ty = result_ty.unwrap_or_else(|| self.module.types.void());
            func.bind_result(inst, value, ty);
        }
        Ok(())
    }

    fn parse_inst_body(
        &mut self,
        ctx: &mut BodyCtx,
        func: &mut Function,
        opcode: &str,
    ) -> ParseResult<(InstData, Option<TypeId>)> {
        match opcode {
            "alloca" => self.parse_alloca(ctx, func),
            "load" => {
                while self.eat_ident("volatile") || self.eat_ident("atomic") {}
                let ty = self.parse_type()?;
                self.expect(Token::Comma, ",")?;
                let pty = self.parse_type()?;
                let ptr = self.parse_operand_value(ctx, func, pty)?;
                Ok((InstData::Load { ty, ptr }, Some(ty)))
            }
            "store" => {
                while self.eat_ident("volatile") || self.eat_ident("atomic") {}
                let vty = self.parse_type()?;
                let value = self.parse_operand_value(ctx, func, vty)?;
                self.expect(Token::Comma, ",")?;
                let pty = self.parse_type()?;
                let ptr = self.parse_operand_value(ctx, func, pty)?;
                Ok((InstData::Store { value, ptr }, None))
            }
            "getelementptr" => {
                let mut inbounds = false;
                loop {
                    if self.eat_ident("inbounds") {
                        inbounds = true;
                    } else if self.eat_ident("nuw") || self.eat_ident("nusw") {
                    } else if self.eat_ident("inrange") {
                        if self.peek() == Some(&Token::LParen) {
                            self.skip_balanced()?;
                        }
                    } else {
                        break;
                    }
                }
                let source_ty = self.parse_type()?;
                self.expect(Token::Comma, ",")?;
                let bty = self.parse_type()?;
                let base = self.parse_operand_value(ctx, func, bty)?;
                let mut indices = Vec::new();
                while self.eat(&Token::Comma) {
                    match self.peek() {
                        Some(tok) if token_starts_type(tok) => {
                            let ity = self.parse_type()?;
                            indices.push(self.parse_operand_value(ctx, func, ity)?);
                        }
                        _ => break,
                    }
                }
                let ptr = self.module.types.ptr();
                Ok((
                    InstData::GetElementPtr {
                        source_ty,
                        base,
                        indices,
                        inbounds,
                    },
                    Some(ptr),
                ))
            }
            "icmp" => {
                let pred_kw = self.take_ident("icmp predicate")?;
                let Some(pred) = IntPredicate::from_keyword(&pred_kw) else {
                    self.skip_to_line_end_tokens()?;
                    let i1 = self.module.types.int(1);
                    return Ok((
                        InstData::Unknown {
                            opcode: "icmp".to_string(),
                        },
                        Some(i1),
                    ));
                };
                self.eat_ident("samesign");
                let ty = self.parse_type()?;
                let lhs = self.parse_operand_value(ctx, func, ty)?;
                self.expect(Token::Comma, ",")?;
                let rhs = self.parse_operand_value(ctx, func, ty)?;
                let i1 = self.module.types.int(1);
                Ok((InstData::ICmp { pred, lhs, rhs }, Some(i1)))
            }
            "fcmp" => {
                self.skip_to_line_end_tokens()?;
                let i1 = self.module.types.int(1);
                Ok((
                    InstData::Unknown {
                        opcode: "fcmp".to_string(),
                    },
                    Some(i1),
                ))
            }
            "phi" => {
                while self.eat_ident("fast")
                    || self.eat_ident("nnan")
                    || self.eat_ident("ninf")
                    || self.eat_ident("nsz")
                {}
                let ty = self.parse_type()?;
                let mut incoming = Vec::new();
                loop {
                    self.expect(Token::LBracket, "[")?;
                    let value = self.parse_operand_value(ctx, func, ty)?;
                    self.expect(Token::Comma, ",")?;
                    let label = self.take_local()?;
                    let pred = self.ensure_block(ctx, func, &label);
                    self.expect(Token::RBracket, "]")?;
                    incoming.push((value, pred));
                    if self.eat(&Token::Comma) {
                        if matches!(self.peek(), Some(Token::LBracket)) {
                            continue;
                        }
                        break;
                    }
                    break;
                }
                Ok((InstData::Phi { ty, incoming }, Some(ty)))
            }
            "select" => {
                while self.eat_ident("fast") {}
                let cty = self.parse_type()?;
                let cond = self.parse_operand_value(ctx, func, cty)?;
                self.expect(Token::Comma, ",")?;
                let tty = self.parse_type()?;
                let if_true = self.parse_operand_value(ctx, func, tty)?;
                self.expect(Token::Comma, ",")?;
                let fty = self.parse_type()?;
                let if_false = self.parse_operand_value(ctx, func, fty)?;
                Ok((
                    InstData::Select {
                        cond,
                        if_true,
                        if_false,
                    },
                    Some(tty),
                ))
            }
            "br" => {
                let ty = self.parse_type()?;
                if matches!(self.module.types.data(ty), TypeData::Label) {
                    let label = self.take_local()?;
                    let dest = self.ensure_block(ctx, func, &label);
                    Ok((InstData::Br { dest }, None))
                } else {
                    let cond = self.parse_operand_value(ctx, func, ty)?;
                    self.expect(Token::Comma, ",")?;
                    self.expect_ident("label")?;
                    let then_label = self.take_local()?;
                    let then_dest = self.ensure_block(ctx, func, &then_label);
                    self.expect(Token::Comma, ",")?;
                    self.expect_ident("label")?;
                    let else_label = self.take_local()?;
                    let else_dest = self.ensure_block(ctx, func, &else_label);
                    Ok((
                        InstData::CondBr {
                            cond,
                            then_dest,
                            else_dest,
                        },
                        None,
                    ))
                }
            }
            "switch" => {
                let ty = self.parse_type()?;
                let value = self.parse_operand_value(ctx, func, ty)?;
                self.expect(Token::Comma, ",")?;
                self.expect_ident("label")?;
                let default_label = self.take_local()?;
                let default_dest = self.ensure_block(ctx, func, &default_label);
                self.expect(Token::LBracket, "[")?;
                let mut cases = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::Newline) => {
                            self.take();
                        }
                        Some(Token::RBracket) => {
                            self.take();
                            break;
                        }
                        None => return err!(self.loc, "unexpected end of file in switch"),
                        _ => {
                            let cty = self.parse_type()?;
                            let c = self.parse_const(cty)?;
                            self.expect(Token::Comma, ",")?;
                            self.expect_ident("label")?;
                            let label = self.take_local()?;
                            let dest = self.ensure_block(ctx, func, &label);
                            cases.push((c.sext_value().unwrap_or(0), dest));
                        }
                    }
                }
                Ok((
                    InstData::Switch {
                        value,
                        default_dest,
                        cases,
                    },
                    None,
                ))
            }
            "ret" => {
                let ty = self.parse_type()?;
                if matches!(self.module.types.data(ty), TypeData::Void) {
                    Ok((InstData::Ret { value: None }, None))
                } else {
                    let value = self.parse_operand_value(ctx, func, ty)?;
                    Ok((InstData::Ret { value: Some(value) }, None))
                }
            }
            "unreachable" => Ok((InstData::Unreachable, None)),
            "call" => self.parse_call(ctx, func, false),
            "tail" | "musttail" | "notail" => {
                self.expect_ident("call")?;
                self.parse_call(ctx, func, false)
            }
            "invoke" => self.parse_call(ctx, func, true),
            "atomicrmw" => {
                self.eat_ident("volatile");
                let _op = self.take_ident("atomicrmw operation")?;
                let pty = self.parse_type()?;
                let ptr = self.parse_operand_value(ctx, func, pty)?;
                self.expect(Token::Comma, ",")?;
                let vty = self.parse_type()?;
                let value = self.parse_operand_value(ctx, func, vty)?;
                Ok((InstData::AtomicRmw { ptr, value }, Some(vty)))
            }
            "cmpxchg" => {
                while self.eat_ident("weak") || self.eat_ident("volatile") {}
                let pty = self.parse_type()?;
                let ptr = self.parse_operand_value(ctx, func, pty)?;
                self.expect(Token::Comma, ",")?;
                let ety = self.parse_type()?;
                let expected = self.parse_operand_value(ctx, func, ety)?;
                self.expect(Token::Comma, ",")?;
                let nty = self.parse_type()?;
                let replacement = self.parse_operand_value(ctx, func, nty)?;
                Ok((
                    InstData::CmpXchg {
                        ptr,
                        expected,
                        replacement,
                    },
                    Some(ety),
                ))
            }
            _ => {
                if let Some(op) = BinOp::from_keyword(opcode) {
                    while self.eat_ident("nuw")
                        || self.eat_ident("nsw")
                        || self.eat_ident("exact")
                        || self.eat_ident("disjoint")
                        || self.eat_ident("fast")
                        || self.eat_ident("nnan")
                        || self.eat_ident("ninf")
                        || self.eat_ident("nsz")
                        || self.eat_ident("arcp")
                        || self.eat_ident("contract")
                        || self.eat_ident("afn")
                        || self.eat_ident("reassoc")
                    {}
                    let ty = self.parse_type()?;
                    let lhs = self.parse_operand_value(ctx, func, ty)?;
                    self.expect(Token::Comma, ",")?;
                    let rhs = self.parse_operand_value(ctx, func, ty)?;
                    return Ok((InstData::Binary { op, lhs, rhs }, Some(ty)));
                }
                if let Some(op) = CastOp::from_keyword(opcode) {
                    let ty = self.parse_type()?;
                    let value = self.parse_operand_value(ctx, func, ty)?;
                    let to_ty = if op == CastOp::Freeze {
                        ty
                    } else {
                        self.expect_ident("to")?;
                        self.parse_type()?
                    };
                    return Ok((InstData::Cast { op, value, to_ty }, Some(to_ty)));
                }
                // Unmodeled instruction: drop the rest of the line.
                self.skip_to_line_end_tokens()?;
                Ok((
                    InstData::Unknown {
                        opcode: opcode.to_string(),
                    },
                    Some(self.module.types.void()),
                ))
            }
        }
    }

    /// Consume tokens up to (but not including) the end-of-line newline,
    /// balancing brackets, so `finish_inst_line` terminates cleanly.
    fn skip_to_line_end_tokens(&mut self) -> ParseResult<()> {
        loop {
            match self.peek() {
                None | Some(Token::Newline) => return Ok(()),
                Some(
                    Token::LParen | Token::LBracket | Token::LBrace | Token::LAngle,
                ) => {
                    self.skip_balanced()?;
                }
                Some(_) => {
                    self.take();
                }
            }
        }
    }

    fn parse_alloca(
        &mut self,
        ctx: &mut BodyCtx,
        func: &mut Function,
    ) -> ParseResult<(InstData, Option<TypeId>)> {
        self.eat_ident("inalloca");
        let allocated_ty = self.parse_type()?;
        let mut count = Operand::Const(Constant::Int { bits: 32, value: 1 });
        let mut align = 0u64;
        while self.eat(&Token::Comma) {
            match self.peek() {
                Some(Token::Ident(s)) if s == "align" => {
                    self.take();
                    align = self.take_integer("alignment")? as u64;
                }
                Some(Token::Ident(s)) if s == "addrspace" => {
                    self.take();
                    self.skip_balanced()?;
                }
                Some(tok) if token_starts_type(tok) => {
                    let cty = self.parse_type()?;
                    count = self.parse_operand_value(ctx, func, cty)?;
                }
                _ => break,
            }
        }
        let ptr = self.module.types.ptr();
        Ok((
            InstData::Alloca {
                allocated_ty,
                count,
                align,
            },
            Some(ptr),
        ))
    }

    fn parse_call(
        &mut self,
        ctx: &mut BodyCtx,
        func: &mut Function,
        is_invoke: bool,
    ) -> ParseResult<(InstData, Option<TypeId>)> {
        self.skip_decl_modifiers()?;
        let ty = self.parse_type()?;
        let ret_ty = match self.module.types.data(ty) {
            TypeData::Func { ret, .. } => *ret,
            _ => ty,
        };

        let callee = match self.peek() {
            Some(Token::GlobalId(_)) => {
                let Some(Token::GlobalId(name)) = self.take() else {
                    unreachable!()
                };
                Operand::Func(self.module.ensure_func(&name, ret_ty))
            }
            Some(Token::LocalId(_)) => {
                let Some(Token::LocalId(name)) = self.take() else {
                    unreachable!()
                };
                Operand::Value(self.ensure_local(ctx, func, &name))
            }
            Some(Token::Ident(s)) if CastOp::from_keyword(s).is_some() => {
                let ptr = self.module.types.ptr();
                Self::const_to_operand(self.parse_const(ptr)?)
            }
            _ => {
                // Inline asm and friends: give up on this line.
                self.skip_to_line_end_tokens()?;
                let data = InstData::Unknown {
                    opcode: "call".to_string(),
                };
                let result = if matches!(self.module.types.data(ret_ty), TypeData::Void) {
                    None
                } else {
                    Some(ret_ty)
                };
                return Ok((data, result));
            }
        };

        self.expect(Token::LParen, "(")?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                let aty = self.parse_type()?;
                let attrs = self.parse_param_attrs()?;
                let value = self.parse_operand_value(ctx, func, aty)?;
                args.push(CallArg { value, attrs });
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, ")")?;
                break;
            }
        }

        let result = if matches!(self.module.types.data(ret_ty), TypeData::Void) {
            None
        } else {
            Some(ret_ty)
        };

        if is_invoke {
            loop {
                match self.peek() {
                    Some(Token::Ident(s)) if s == "to" => {
                        self.take();
                        break;
                    }
                    Some(Token::Newline) | None => {
                        return err!(self.loc, "invoke without destination labels")
                    }
                    Some(_) => {
                        self.take();
                    }
                }
            }
            self.expect_ident("label")?;
            let normal_label = self.take_local()?;
            let normal_dest = self.ensure_block(ctx, func, &normal_label);
            self.expect_ident("unwind")?;
            self.expect_ident("label")?;
            let unwind_label = self.take_local()?;
            let unwind_dest = self.ensure_block(ctx, func, &unwind_label);
            return Ok((
                InstData::Invoke {
                    callee,
                    args,
                    ret_ty,
                    normal_dest,
                    unwind_dest,
                },
                result,
            ));
        }

        Ok((
            InstData::Call {
                callee,
                args,
                ret_ty,
            },
            result,
        ))
    }

    fn parse_dbg_record(
        &mut self,
        ctx: &mut BodyCtx,
        func: &mut Function,
        block: Block,
        head: &str,
    ) -> ParseResult<()> {
        let kind = match head {
            "dbg_declare" => DebugRecordKind::Declare,
            "dbg_value" => DebugRecordKind::Value,
            _ => {
                self.skip_line();
                return Ok(());
            }
        };
        self.expect(Token::LParen, "(")?;
        let value = match self.peek() {
            Some(tok) if token_starts_type(tok) => {
                let ty = self.parse_type()?;
                self.parse_operand_value(ctx, func, ty)?
            }
            _ => {
                let meta = self.parse_metadata_operand(ctx, func)?;
                meta
            }
        };
        let variable = if self.eat(&Token::Comma) {
            match self.peek() {
                Some(Token::MetadataRef(_)) => {
                    let Some(Token::MetadataRef(n)) = self.take() else {
                        unreachable!()
                    };
                    Some(self.module.metadata.ensure_indexed(n))
                }
                _ => None,
            }
        } else {
            None
        };
        // Expression, location, and any remaining record arguments.
        let mut depth = 1i32;
        while depth > 0 {
            match self.take() {
                Some(Token::LParen) => depth += 1,
                Some(Token::RParen) => depth -= 1,
                Some(_) => {}
                None => return err!(self.loc, "unterminated debug record"),
            }
        }
        self.skip_line();
        func.append_inst(
            block,
            InstData::DebugRecord {
                kind,
                value,
                variable,
            },
            None,
            None,
        );
        Ok(())
    }

    // ---- metadata --------------------------------------------------------

    fn parse_md_def(&mut self, index: u32) -> ParseResult<()> {
        self.expect(Token::Equal, "=")?;
        self.eat_ident("distinct");
        let node = self.parse_md_node()?;
        self.module.metadata.define_indexed(index, node);
        self.skip_line();
        Ok(())
    }

    fn parse_md_node(&mut self) -> ParseResult<MdNode> {
        match self.take() {
            Some(Token::Bang) => match self.peek() {
                Some(Token::LBrace) => {
                    self.take();
                    self.parse_md_tuple()
                }
                Some(Token::Str(_)) => {
                    let Some(Token::Str(bytes)) = self.take() else {
                        unreachable!()
                    };
                    Ok(MdNode::Str(String::from_utf8_lossy(&bytes).into_owned()))
                }
                other => {
                    let other = other.cloned();
                    err!(self.loc, "expected metadata body, got {:?}", other)
                }
            },
            Some(Token::MetadataName(kind)) => self.parse_md_specialized(kind),
            other => err!(self.loc, "expected metadata node, got {:?}", other),
        }
    }

    fn parse_md_bang(&mut self) -> ParseResult<MdNode> {
        // The `!` has been consumed as Token::Bang by the caller? No: the
        // caller matched Token::Bang without consuming it.
        self.expect(Token::Bang, "!")?;
        match self.peek() {
            Some(Token::LBrace) => {
                self.take();
                self.parse_md_tuple()
            }
            Some(Token::Str(_)) => {
                let Some(Token::Str(bytes)) = self.take() else {
                    unreachable!()
                };
                Ok(MdNode::Str(String::from_utf8_lossy(&bytes).into_owned()))
            }
            other => {
                let other = other.cloned();
                err!(self.loc, "expected metadata body, got {:?}", other)
            }
        }
    }

    /// Parse tuple elements after the opening `{`.
    fn parse_md_tuple(&mut self) -> ParseResult<MdNode> {
        let mut elems = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.take();
                    break;
                }
                Some(Token::Comma) => {
                    self.take();
                }
                Some(Token::MetadataRef(_)) => {
                    let Some(Token::MetadataRef(n)) = self.take() else {
                        unreachable!()
                    };
                    elems.push(Some(self.module.metadata.ensure_indexed(n)));
                }
                Some(Token::Ident(s)) if s == "null" => {
                    self.take();
                    elems.push(None);
                }
                Some(Token::Bang) => {
                    let node = self.parse_md_bang()?;
                    elems.push(Some(self.module.metadata.add(node)));
                }
                Some(Token::MetadataName(_)) => {
                    let Some(Token::MetadataName(kind)) = self.take() else {
                        unreachable!()
                    };
                    let node = self.parse_md_specialized(kind)?;
                    elems.push(Some(self.module.metadata.add(node)));
                }
                Some(tok) if token_starts_type(tok) => {
                    // Module-flag style `i32 7` entries.
                    let ty = self.parse_type()?;
                    let _ = self.parse_const(ty);
                    elems.push(None);
                }
                Some(_) => {
                    self.take();
                }
                None => return err!(self.loc, "unterminated metadata tuple"),
            }
        }
        Ok(MdNode::Tuple(elems))
    }

    fn parse_md_field_value(&mut self) -> ParseResult<Option<MdField>> {
        match self.take() {
            Some(Token::MetadataRef(n)) => {
                Ok(Some(MdField::Md(self.module.metadata.ensure_indexed(n))))
            }
            Some(Token::Str(bytes)) => Ok(Some(MdField::Str(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))),
            Some(Token::Integer(v)) => Ok(Some(MdField::Int(v as i64))),
            Some(Token::Ident(s)) => {
                if s == "null" {
                    Ok(None)
                } else if s == "true" {
                    Ok(Some(MdField::Int(1)))
                } else if s == "false" {
                    Ok(Some(MdField::Int(0)))
                } else {
                    Ok(Some(MdField::Ident(s)))
                }
            }
            Some(Token::MetadataName(kind)) => {
                let node = self.parse_md_specialized(kind)?;
                Ok(Some(MdField::Md(self.module.metadata.add(node))))
            }
            Some(Token::Bang) => {
                // Re-handle inline `!{...}` bodies.
                match self.peek() {
                    Some(Token::LBrace) => {
                        self.take();
                        let node = self.parse_md_tuple()?;
                        Ok(Some(MdField::Md(self.module.metadata.add(node))))
                    }
                    Some(Token::Str(_)) => {
                        let Some(Token::Str(bytes)) = self.take() else {
                            unreachable!()
                        };
                        Ok(Some(MdField::Str(
                            String::from_utf8_lossy(&bytes).into_owned(),
                        )))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    fn parse_md_specialized(&mut self, kind: String) -> ParseResult<MdNode> {
        self.expect(Token::LParen, "(")?;
        let mut fields: FxHashMap<String, MdField> = FxHashMap::default();
        loop {
            match self.peek() {
                Some(Token::RParen) => {
                    self.take();
                    break;
                }
                Some(Token::Comma) => {
                    self.take();
                }
                Some(Token::LabelDecl(_)) => {
                    let Some(Token::LabelDecl(key)) = self.take() else {
                        unreachable!()
                    };
                    if let Some(value) = self.parse_md_field_value()? {
                        fields.insert(key, value);
                    }
                    // Swallow residual value tokens (`flags: A | B`, ...).
                    loop {
                        match self.peek() {
                            Some(Token::Comma) | Some(Token::RParen) | None
                            | Some(Token::Newline) => break,
                            Some(
                                Token::LParen
                                | Token::LBracket
                                | Token::LBrace
                                | Token::LAngle,
                            ) => {
                                self.skip_balanced()?;
                            }
                            Some(_) => {
                                self.take();
                            }
                        }
                    }
                }
                Some(Token::Newline) | None => {
                    return err!(self.loc, "unterminated metadata node");
                }
                Some(_) => {
                    self.take();
                }
            }
        }

        let md = |fields: &FxHashMap<String, MdField>, key: &str| -> Option<MdId> {
            match fields.get(key) {
                Some(MdField::Md(id)) => Some(*id),
                _ => None,
            }
        };
        let int = |fields: &FxHashMap<String, MdField>, key: &str| -> i64 {
            match fields.get(key) {
                Some(MdField::Int(v)) => *v,
                _ => 0,
            }
        };
        let string = |fields: &FxHashMap<String, MdField>, key: &str| -> String {
            match fields.get(key) {
                Some(MdField::Str(s)) => s.clone(),
                _ => String::new(),
            }
        };
        let ident = |fields: &FxHashMap<String, MdField>, key: &str| -> String {
            match fields.get(key) {
                Some(MdField::Ident(s)) => s.clone(),
                _ => String::new(),
            }
        };

        let node = match kind.as_str() {
            "DILocation" => MdNode::Location {
                line: int(&fields, "line") as u32,
                column: int(&fields, "column") as u32,
                scope: md(&fields, "scope"),
            },
            "DIFile" => MdNode::File {
                filename: string(&fields, "filename"),
                directory: string(&fields, "directory"),
            },
            "DISubprogram" => MdNode::Subprogram {
                name: string(&fields, "name"),
                linkage_name: string(&fields, "linkageName"),
                file: md(&fields, "file"),
                line: int(&fields, "line") as u32,
                ty: md(&fields, "type"),
                retained_nodes: md(&fields, "retainedNodes"),
            },
            "DILexicalBlock" | "DILexicalBlockFile" => MdNode::LexicalBlock {
                scope: md(&fields, "scope"),
                file: md(&fields, "file"),
            },
            "DISubroutineType" => MdNode::SubroutineType {
                types: md(&fields, "types"),
            },
            "DILocalVariable" => MdNode::LocalVariable {
                name: string(&fields, "name"),
                arg: int(&fields, "arg") as u32,
                line: int(&fields, "line") as u32,
                ty: md(&fields, "type"),
                scope: md(&fields, "scope"),
            },
            "DIBasicType" => MdNode::BasicType {
                name: string(&fields, "name"),
            },
            "DIDerivedType" => MdNode::DerivedType {
                tag: DwTag::from_name(&ident(&fields, "tag")),
                name: string(&fields, "name"),
                base: md(&fields, "baseType"),
            },
            "DICompositeType" => MdNode::CompositeType {
                tag: DwTag::from_name(&ident(&fields, "tag")),
                name: string(&fields, "name"),
                identifier: string(&fields, "identifier"),
            },
            "DIExpression" => MdNode::Expression,
            _ => MdNode::Unknown,
        };
        Ok(node)
    }
}

#[cfg(test)]
mod tests;
