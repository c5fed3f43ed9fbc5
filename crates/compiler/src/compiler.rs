//! Fused type checker and bytecode emitter
//!
//! A single walk over the AST resolves names, validates operator and call
//! types, and emits opcodes into a [`Chunk`]. Expression compilation returns
//! the expression's type; statements leave the stack balanced. All variables
//! resolve to process-wide global slots (parameters included; the VM saves
//! and restores parameter slots across calls), and functions are emitted
//! inline behind a jump over their body.
//!
//! Integer literals are held wide (`i128`) by the parser and narrowed here
//! once their target type is known: a plain literal fits the smallest of
//! i32 -> i64 -> u64, a `u`-suffixed one u32 -> u64, and a typed context can
//! re-tag a literal (non-negative into u32, any integer into f64).

use std::collections::HashMap;

use orus_core::chunk::{Chunk, Constant};
use orus_core::diag::{Diagnostic, Span};
use orus_core::natives::{self, NativeType};
use orus_core::opcode::OpCode;
use orus_core::types::{FieldDef, StructDef, Type};

use crate::ast::{
    BinaryOp, Expr, ExprKind, FnDecl, Loc, MatchArm, Pattern, Stmt, StmtKind, TypeExpr, UnaryOp,
};
use crate::session::{FunctionInfo, GlobalEntry, ModuleUnit, Session};

/// A loaded module's exports, as seen by an importer.
#[derive(Debug, Clone, Default)]
pub struct ImportedModule {
    pub globals: HashMap<String, u8>,
    pub functions: HashMap<String, u8>,
}

/// Module path (`std/math.orus`) to exports.
pub type ImportMap = HashMap<String, ImportedModule>;

/// Per-compilation options.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions<'a> {
    pub file: &'a str,
    /// `Some` when compiling an imported module; `let` is rejected at module
    /// top level, and `pub` marks exports.
    pub module_name: Option<&'a str>,
    pub chunk_id: u16,
    /// REPL entries print the value of a bare expression statement.
    pub repl: bool,
}

/// Compile a parsed program against a session. On success the session's
/// tables contain everything the unit introduced.
pub fn compile(
    program: &[Stmt],
    opts: &CompileOptions<'_>,
    session: &mut Session,
    imports: &ImportMap,
) -> Result<ModuleUnit, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(opts, session, imports);
    compiler.ensure_error_struct();

    for stmt in program {
        // Statement-level recovery: the diagnostic is already recorded.
        let _ = compiler.statement(stmt);
    }

    if opts.module_name.is_none() {
        compiler.call_main_if_defined();
    }
    compiler.chunk.write_op(OpCode::Nil, compiler.last_line);
    compiler.chunk.write_op(OpCode::Return, compiler.last_line);

    compiler.finish()
}

type CResult<T> = Result<T, ()>;

struct LoopCtx {
    /// Backward target for `continue` in `while` loops.
    continue_back: Option<usize>,
    /// Forward `continue` jumps in `for` loops, patched to the increment.
    continue_jumps: Vec<usize>,
    break_jumps: Vec<usize>,
}

struct FnCtx {
    ret: Type,
    generics: Vec<String>,
}

struct Compiler<'a> {
    chunk: Chunk,
    file: String,
    module_name: Option<String>,
    chunk_id: u16,
    repl: bool,
    session: &'a mut Session,
    imports: &'a ImportMap,
    /// `use` alias -> module path, in source order.
    aliases: HashMap<String, String>,
    import_paths: Vec<String>,
    diagnostics: Vec<Diagnostic>,
    base_global: u8,
    base_function: u8,
    loops: Vec<LoopCtx>,
    current_fn: Option<FnCtx>,
    structs_added: Vec<StructDef>,
    hidden_counter: u32,
    last_line: u32,
}

impl<'a> Compiler<'a> {
    fn new(opts: &CompileOptions<'_>, session: &'a mut Session, imports: &'a ImportMap) -> Self {
        let base_global = session.globals.len() as u8;
        let base_function = session.functions.len() as u8;
        Compiler {
            chunk: Chunk::new(),
            file: opts.file.to_string(),
            module_name: opts.module_name.map(str::to_string),
            chunk_id: opts.chunk_id,
            repl: opts.repl,
            session,
            imports,
            aliases: HashMap::new(),
            import_paths: Vec::new(),
            diagnostics: Vec::new(),
            base_global,
            base_function,
            loops: Vec::new(),
            current_fn: None,
            structs_added: Vec::new(),
            hidden_counter: 0,
            last_line: 1,
        }
    }

    /// `catch` binds its error variable with this struct type.
    fn ensure_error_struct(&mut self) {
        if !self.session.types.contains("Error") {
            let _ = self.session.types.register(StructDef {
                name: "Error".to_string(),
                generics: Vec::new(),
                fields: Vec::new(),
            });
        }
    }

    fn finish(self) -> Result<ModuleUnit, Vec<Diagnostic>> {
        if !self.diagnostics.is_empty() {
            return Err(self.diagnostics);
        }
        let globals = self.session.globals.entries()[self.base_global as usize..].to_vec();
        let functions = self.session.functions.entries()[self.base_function as usize..].to_vec();
        tracing::debug!(
            file = %self.file,
            code_bytes = self.chunk.code.len(),
            constants = self.chunk.constants.len(),
            globals = globals.len(),
            functions = functions.len(),
            "compiled unit"
        );
        Ok(ModuleUnit {
            chunk: self.chunk,
            base_global: self.base_global,
            base_function: self.base_function,
            globals,
            functions,
            structs: self.structs_added,
            imports: self.import_paths,
        })
    }

    fn call_main_if_defined(&mut self) {
        let Some(index) = self.session.functions.resolve("main") else {
            return;
        };
        if (index as usize) < self.base_function as usize {
            return; // not defined by this unit
        }
        let info = self.session.functions.get(index).unwrap();
        if info.arity != 0 {
            return;
        }
        self.chunk.write_op(OpCode::Call, self.last_line);
        self.chunk.write_byte(index, self.last_line);
        self.chunk.write_byte(0, self.last_line);
        self.chunk.write_op(OpCode::Pop, self.last_line);
    }

    // --- Error reporting --------------------------------------------------

    fn span(&self, loc: Loc) -> Span {
        Span::new(self.file.clone(), loc.line, loc.column, loc.length.max(1))
    }

    fn type_error<T>(&mut self, message: impl Into<String>, loc: Loc) -> CResult<T> {
        let diag = Diagnostic::type_error(message, self.span(loc));
        self.diagnostics.push(diag);
        Err(())
    }

    fn name_error<T>(&mut self, message: impl Into<String>, loc: Loc) -> CResult<T> {
        let diag = Diagnostic::name_error(message, self.span(loc));
        self.diagnostics.push(diag);
        Err(())
    }

    // --- Emission helpers -------------------------------------------------

    fn emit(&mut self, op: OpCode, loc: Loc) {
        self.last_line = loc.line;
        self.chunk.write_op(op, loc.line);
    }

    fn emit_byte(&mut self, byte: u8, loc: Loc) {
        self.chunk.write_byte(byte, loc.line);
    }

    fn emit_constant(&mut self, constant: Constant, loc: Loc) -> CResult<()> {
        let Some(index) = self.chunk.add_constant(constant) else {
            return self.type_error("too many constants in one chunk", loc);
        };
        self.emit(OpCode::Constant, loc);
        self.emit_byte(index, loc);
        Ok(())
    }

    /// Emit a forward jump and return the offset of its operand for patching.
    fn emit_jump(&mut self, op: OpCode, loc: Loc) -> usize {
        self.emit(op, loc);
        self.chunk.write_u16(0xffff, loc.line);
        self.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, operand_at: usize, loc: Loc) -> CResult<()> {
        let distance = self.chunk.code.len() - (operand_at + 2);
        if distance > u16::MAX as usize {
            return self.type_error("too much code to jump over", loc);
        }
        self.chunk.patch_u16(operand_at, distance as u16);
        Ok(())
    }

    fn emit_loop(&mut self, target: usize, loc: Loc) -> CResult<()> {
        self.emit(OpCode::Loop, loc);
        let distance = self.chunk.code.len() + 2 - target;
        if distance > u16::MAX as usize {
            return self.type_error("loop body is too large", loc);
        }
        self.chunk.write_u16(distance as u16, loc.line);
        Ok(())
    }

    // --- Types ------------------------------------------------------------

    fn generics_in_scope(&self) -> &[String] {
        self.current_fn
            .as_ref()
            .map(|ctx| ctx.generics.as_slice())
            .unwrap_or(&[])
    }

    fn resolve_type(&mut self, expr: &TypeExpr, loc: Loc) -> CResult<Type> {
        self.resolve_type_with(expr, self.generics_in_scope().to_vec(), loc)
    }

    fn resolve_type_with(
        &mut self,
        expr: &TypeExpr,
        generics: Vec<String>,
        loc: Loc,
    ) -> CResult<Type> {
        match expr {
            TypeExpr::Array(elem) => {
                let elem = self.resolve_type_with(elem, generics, loc)?;
                Ok(Type::Array(Box::new(elem)))
            }
            TypeExpr::Named(name) => match name.as_str() {
                "i32" => Ok(Type::I32),
                "i64" => Ok(Type::I64),
                "u32" => Ok(Type::U32),
                "u64" => Ok(Type::U64),
                "f64" => Ok(Type::F64),
                "bool" => Ok(Type::Bool),
                "string" => Ok(Type::Str),
                "nil" => Ok(Type::Nil),
                "void" => Ok(Type::Void),
                other if generics.iter().any(|g| g == other) => {
                    Ok(Type::Generic(other.to_string()))
                }
                other if self.session.types.contains(other) => {
                    Ok(Type::Struct(other.to_string()))
                }
                other => self.name_error(format!("unknown type '{}'", other), loc),
            },
            TypeExpr::Instantiated { name, args } => {
                let mut resolved = Vec::with_capacity(args.len());
                for arg in args {
                    resolved.push(self.resolve_type_with(arg, generics.clone(), loc)?);
                }
                match self.session.types.instantiate(name, &resolved) {
                    Ok(key) => Ok(Type::Struct(key)),
                    Err(message) => self.type_error(message, loc),
                }
            }
        }
    }

    /// Best-effort type of an expression without emitting code. `None` means
    /// "not known yet" (e.g. an open integer literal).
    fn infer_type(&self, expr: &Expr) -> Option<Type> {
        match &expr.kind {
            ExprKind::Int { .. } => None,
            ExprKind::Float(_) => Some(Type::F64),
            ExprKind::Bool(_) => Some(Type::Bool),
            ExprKind::Str(_) => Some(Type::Str),
            ExprKind::Nil => Some(Type::Nil),
            ExprKind::Variable(name) => {
                let slot = self.session.globals.resolve(name)?;
                Some(self.session.globals.entry(slot)?.ty.clone())
            }
            ExprKind::Call { callee, .. } => match &callee.kind {
                ExprKind::Variable(name) => {
                    if let Some((_, def)) = natives::lookup(name) {
                        return native_ret_type(def.ret, None);
                    }
                    let index = self.session.functions.resolve(name)?;
                    Some(self.session.functions.get(index)?.ret.clone())
                }
                _ => None,
            },
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
                | BinaryOp::And
                | BinaryOp::Or => Some(Type::Bool),
                _ => self.infer_type(lhs).or_else(|| self.infer_type(rhs)),
            },
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not => Some(Type::Bool),
                _ => self.infer_type(operand),
            },
            ExprKind::Index { array, .. } => match self.infer_type(array)? {
                Type::Array(elem) => Some(*elem),
                _ => None,
            },
            _ => None,
        }
    }

    // --- Expressions ------------------------------------------------------

    fn expression(&mut self, expr: &Expr, hint: Option<&Type>) -> CResult<Type> {
        let loc = expr.loc;
        match &expr.kind {
            ExprKind::Int { value, unsigned } => self.int_literal(*value, *unsigned, hint, loc),
            ExprKind::Float(value) => {
                self.emit_constant(Constant::F64(*value), loc)?;
                Ok(Type::F64)
            }
            ExprKind::Bool(value) => {
                self.emit(if *value { OpCode::True } else { OpCode::False }, loc);
                Ok(Type::Bool)
            }
            ExprKind::Nil => {
                self.emit(OpCode::Nil, loc);
                Ok(Type::Nil)
            }
            ExprKind::Str(text) => {
                self.emit_constant(Constant::Str(text.clone()), loc)?;
                Ok(Type::Str)
            }
            ExprKind::Array(items) => self.array_literal(items, hint, loc),
            ExprKind::Variable(name) => self.variable(name, loc),
            ExprKind::Assign { name, value } => self.assign(name, value, loc),
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, hint, loc),
            ExprKind::Unary { op, operand } => self.unary(*op, operand, hint, loc),
            ExprKind::Ternary {
                cond,
                then_value,
                else_value,
            } => self.ternary(cond, then_value, else_value, hint, loc),
            ExprKind::Call { callee, args } => self.call(callee, args, loc),
            ExprKind::Index { array, index } => self.index_get(array, index, loc),
            ExprKind::IndexAssign {
                array,
                index,
                value,
            } => self.index_set(array, index, value, loc),
            ExprKind::Slice { array, start, end } => self.slice(array, start, end, loc),
            ExprKind::Field { object, name } => self.field_get(object, name, loc),
            ExprKind::FieldAssign {
                object,
                name,
                value,
            } => self.field_set(object, name, value, loc),
            ExprKind::Cast { value, target } => self.cast(value, target, loc),
            ExprKind::StructLit {
                name,
                generic_args,
                fields,
            } => self.struct_literal(name, generic_args, fields, loc),
        }
    }

    fn int_literal(
        &mut self,
        value: i128,
        unsigned: bool,
        hint: Option<&Type>,
        loc: Loc,
    ) -> CResult<Type> {
        // Context can re-tag the literal when the value fits.
        if let Some(target) = hint {
            match target {
                Type::I32 if i32::try_from(value).is_ok() => {
                    self.emit_constant(Constant::I32(value as i32), loc)?;
                    return Ok(Type::I32);
                }
                Type::I64 if i64::try_from(value).is_ok() => {
                    self.emit_constant(Constant::I64(value as i64), loc)?;
                    return Ok(Type::I64);
                }
                Type::U32 if u32::try_from(value).is_ok() => {
                    self.emit_constant(Constant::U32(value as u32), loc)?;
                    return Ok(Type::U32);
                }
                Type::U64 if u64::try_from(value).is_ok() => {
                    self.emit_constant(Constant::U64(value as u64), loc)?;
                    return Ok(Type::U64);
                }
                Type::F64 => {
                    self.emit_constant(Constant::F64(value as f64), loc)?;
                    return Ok(Type::F64);
                }
                _ => {}
            }
        }

        // No usable context: smallest fitting type wins.
        if unsigned {
            if let Ok(v) = u32::try_from(value) {
                self.emit_constant(Constant::U32(v), loc)?;
                return Ok(Type::U32);
            }
            if let Ok(v) = u64::try_from(value) {
                self.emit_constant(Constant::U64(v), loc)?;
                return Ok(Type::U64);
            }
        } else {
            if let Ok(v) = i32::try_from(value) {
                self.emit_constant(Constant::I32(v), loc)?;
                return Ok(Type::I32);
            }
            if let Ok(v) = i64::try_from(value) {
                self.emit_constant(Constant::I64(v), loc)?;
                return Ok(Type::I64);
            }
            if let Ok(v) = u64::try_from(value) {
                self.emit_constant(Constant::U64(v), loc)?;
                return Ok(Type::U64);
            }
        }
        self.type_error(format!("integer literal {} is out of range", value), loc)
    }

    fn array_literal(&mut self, items: &[Expr], hint: Option<&Type>, loc: Loc) -> CResult<Type> {
        let elem_hint = match hint {
            Some(Type::Array(elem)) => Some((**elem).clone()),
            _ => None,
        };
        if items.is_empty() {
            let Some(elem) = elem_hint else {
                return self.type_error("cannot infer the element type of an empty array", loc);
            };
            self.emit(OpCode::MakeArray, loc);
            self.emit_byte(0, loc);
            return Ok(Type::Array(Box::new(elem)));
        }
        if items.len() > u8::MAX as usize {
            return self.type_error("array literal has too many elements", loc);
        }

        let first_ty = self.expression(&items[0], elem_hint.as_ref())?;
        for item in &items[1..] {
            let ty = self.expression(item, Some(&first_ty))?;
            if ty != first_ty {
                return self.type_error(
                    format!(
                        "array elements must share one type: expected {}, found {}",
                        first_ty, ty
                    ),
                    item.loc,
                );
            }
        }
        self.emit(OpCode::MakeArray, loc);
        self.emit_byte(items.len() as u8, loc);
        Ok(Type::Array(Box::new(first_ty)))
    }

    fn variable(&mut self, name: &str, loc: Loc) -> CResult<Type> {
        if self.aliases.contains_key(name) {
            return self.type_error(
                format!("'{}' is a module; access its members with '.'", name),
                loc,
            );
        }
        let Some(slot) = self.session.globals.resolve(name) else {
            if self.session.functions.resolve(name).is_some() {
                return self.type_error(
                    format!("function '{}' must be called, it is not a value", name),
                    loc,
                );
            }
            return self.name_error(format!("undefined variable '{}'", name), loc);
        };
        let ty = self.session.globals.entry(slot).unwrap().ty.clone();
        self.emit(OpCode::GetGlobal, loc);
        self.emit_byte(slot, loc);
        Ok(ty)
    }

    fn assign(&mut self, name: &str, value: &Expr, loc: Loc) -> CResult<Type> {
        let Some(slot) = self.session.globals.resolve(name) else {
            return self.name_error(format!("undefined variable '{}'", name), loc);
        };
        let entry = self.session.globals.entry(slot).unwrap().clone();
        if !entry.mutable {
            return self.type_error(
                format!("cannot assign to immutable binding '{}'", name),
                loc,
            );
        }
        let ty = self.expression(value, Some(&entry.ty))?;
        if ty != entry.ty {
            return self.type_error(
                format!(
                    "cannot assign {} to '{}' of type {}",
                    ty, name, entry.ty
                ),
                loc,
            );
        }
        // SET_GLOBAL leaves the value on the stack; statements pop it.
        self.emit(OpCode::SetGlobal, loc);
        self.emit_byte(slot, loc);
        Ok(ty)
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        hint: Option<&Type>,
        loc: Loc,
    ) -> CResult<Type> {
        match op {
            BinaryOp::And | BinaryOp::Or => return self.logical(op, lhs, rhs, loc),
            _ => {}
        }

        let rhs_pre = self.infer_type(rhs);
        let arithmetic = matches!(
            op,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        );

        let lhs_hint = match (hint, &rhs_pre) {
            (Some(h), _) if arithmetic && h.is_numeric() => Some((*h).clone()),
            (_, Some(t)) if t.is_numeric() => Some(t.clone()),
            _ => None,
        };
        let mut lhs_ty = self.expression(lhs, lhs_hint.as_ref())?;

        // Implicit widening: i32/u32 meets f64.
        if arithmetic && rhs_pre == Some(Type::F64) {
            lhs_ty = self.widen_to_f64(lhs_ty, loc)?;
        }

        let rhs_ty = self.expression(rhs, Some(&lhs_ty))?;
        let rhs_ty = if arithmetic && lhs_ty == Type::F64 {
            self.widen_to_f64(rhs_ty, loc)?
        } else {
            rhs_ty
        };

        match op {
            BinaryOp::Equal | BinaryOp::NotEqual => {
                if lhs_ty != rhs_ty {
                    return self.type_error(
                        format!("cannot compare {} with {}", lhs_ty, rhs_ty),
                        loc,
                    );
                }
                self.emit(
                    if op == BinaryOp::Equal {
                        OpCode::Equal
                    } else {
                        OpCode::NotEqual
                    },
                    loc,
                );
                Ok(Type::Bool)
            }
            BinaryOp::Less
            | BinaryOp::LessEqual
            | BinaryOp::Greater
            | BinaryOp::GreaterEqual => {
                if lhs_ty != rhs_ty || !lhs_ty.is_numeric() {
                    return self.type_error(
                        format!(
                            "comparison '{}' needs matching numeric operands, found {} and {}",
                            op.symbol(),
                            lhs_ty,
                            rhs_ty
                        ),
                        loc,
                    );
                }
                let Some(opcode) = comparison_op(op, &lhs_ty) else {
                    return self.type_error(
                        format!("'{}' is not defined for {}", op.symbol(), lhs_ty),
                        loc,
                    );
                };
                self.emit(opcode, loc);
                Ok(Type::Bool)
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                if lhs_ty != rhs_ty || !lhs_ty.is_numeric() {
                    return self.type_error(
                        format!(
                            "operator '{}' needs matching numeric operands, found {} and {}",
                            op.symbol(),
                            lhs_ty,
                            rhs_ty
                        ),
                        loc,
                    );
                }
                if op == BinaryOp::Mod && !lhs_ty.is_integer() {
                    return self.type_error("'%' requires integer operands", loc);
                }
                let Some(opcode) = arith_op(op, &lhs_ty) else {
                    return self.type_error(
                        format!("'{}' is not defined for {}", op.symbol(), lhs_ty),
                        loc,
                    );
                };
                self.emit(opcode, loc);
                Ok(lhs_ty)
            }
            BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::Shl
            | BinaryOp::Shr => {
                if lhs_ty != rhs_ty || !lhs_ty.is_integer() {
                    return self.type_error(
                        format!(
                            "operator '{}' needs matching integer operands, found {} and {}",
                            op.symbol(),
                            lhs_ty,
                            rhs_ty
                        ),
                        loc,
                    );
                }
                let opcode = match op {
                    BinaryOp::BitAnd => OpCode::BitAnd,
                    BinaryOp::BitOr => OpCode::BitOr,
                    BinaryOp::BitXor => OpCode::BitXor,
                    BinaryOp::Shl => OpCode::ShiftLeft,
                    _ => OpCode::ShiftRight,
                };
                self.emit(opcode, loc);
                Ok(lhs_ty)
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn widen_to_f64(&mut self, ty: Type, loc: Loc) -> CResult<Type> {
        match ty {
            Type::I32 => {
                self.emit(OpCode::I32ToF64, loc);
                Ok(Type::F64)
            }
            Type::U32 => {
                self.emit(OpCode::U32ToF64, loc);
                Ok(Type::F64)
            }
            other => Ok(other),
        }
    }

    fn logical(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, loc: Loc) -> CResult<Type> {
        let lhs_ty = self.expression(lhs, Some(&Type::Bool))?;
        if lhs_ty != Type::Bool {
            return self.type_error(
                format!("'{}' needs bool operands, found {}", op.symbol(), lhs_ty),
                loc,
            );
        }
        let short = self.emit_jump(
            if op == BinaryOp::And {
                OpCode::JumpIfFalse
            } else {
                OpCode::JumpIfTrue
            },
            loc,
        );
        self.emit(OpCode::Pop, loc);
        let rhs_ty = self.expression(rhs, Some(&Type::Bool))?;
        if rhs_ty != Type::Bool {
            return self.type_error(
                format!("'{}' needs bool operands, found {}", op.symbol(), rhs_ty),
                loc,
            );
        }
        self.patch_jump(short, loc)?;
        Ok(Type::Bool)
    }

    fn unary(
        &mut self,
        op: UnaryOp,
        operand: &Expr,
        hint: Option<&Type>,
        loc: Loc,
    ) -> CResult<Type> {
        match op {
            UnaryOp::Neg => {
                // A negated integer literal folds into the literal so it can
                // still be narrowed by its context.
                if let ExprKind::Int { value, unsigned } = &operand.kind {
                    if !*unsigned {
                        return self.int_literal(-*value, false, hint, loc);
                    }
                }
                let ty = self.expression(operand, hint.filter(|h| h.is_numeric()))?;
                let opcode = match ty {
                    Type::I32 => OpCode::NegateI32,
                    Type::I64 => OpCode::NegateI64,
                    Type::U32 => OpCode::NegateU32,
                    Type::U64 => OpCode::NegateU64,
                    Type::F64 => OpCode::NegateF64,
                    other => {
                        return self.type_error(
                            format!("unary '-' needs a numeric operand, found {}", other),
                            loc,
                        );
                    }
                };
                self.emit(opcode, loc);
                Ok(ty)
            }
            UnaryOp::Not => {
                let ty = self.expression(operand, Some(&Type::Bool))?;
                if ty != Type::Bool {
                    return self.type_error(
                        format!("'not' needs a bool operand, found {}", ty),
                        loc,
                    );
                }
                self.emit(OpCode::NotBool, loc);
                Ok(Type::Bool)
            }
            UnaryOp::BitNot => {
                let ty = self.expression(operand, hint.filter(|h| h.is_integer()))?;
                if !ty.is_integer() {
                    return self.type_error(
                        format!("'~' needs an integer operand, found {}", ty),
                        loc,
                    );
                }
                self.emit(OpCode::BitNot, loc);
                Ok(ty)
            }
        }
    }

    fn ternary(
        &mut self,
        cond: &Expr,
        then_value: &Expr,
        else_value: &Expr,
        hint: Option<&Type>,
        loc: Loc,
    ) -> CResult<Type> {
        let cond_ty = self.expression(cond, Some(&Type::Bool))?;
        if cond_ty != Type::Bool {
            return self.type_error(
                format!("conditional needs a bool condition, found {}", cond_ty),
                loc,
            );
        }
        let to_else = self.emit_jump(OpCode::JumpIfFalse, loc);
        self.emit(OpCode::Pop, loc);
        let then_ty = self.expression(then_value, hint)?;
        let to_end = self.emit_jump(OpCode::Jump, loc);
        self.patch_jump(to_else, loc)?;
        self.emit(OpCode::Pop, loc);
        let else_ty = self.expression(else_value, Some(&then_ty))?;
        if then_ty != else_ty {
            return self.type_error(
                format!(
                    "conditional branches disagree: {} versus {}",
                    then_ty, else_ty
                ),
                loc,
            );
        }
        self.patch_jump(to_end, loc)?;
        Ok(then_ty)
    }

    // --- Calls ------------------------------------------------------------

    fn call(&mut self, callee: &Expr, args: &[Expr], loc: Loc) -> CResult<Type> {
        match &callee.kind {
            ExprKind::Variable(name) => {
                if let Some((index, def)) = natives::lookup(name) {
                    return self.native_call(index, def, args, loc);
                }
                if let Some(index) = self.session.functions.resolve(name) {
                    return self.function_call(index, None, args, loc);
                }
                self.name_error(format!("undefined function '{}'", name), loc)
            }
            ExprKind::Field { object, name } => {
                // Module member call: `math.sqrt(x)`.
                if let ExprKind::Variable(alias) = &object.kind {
                    if let Some(path) = self.aliases.get(alias).cloned() {
                        let module = &self.imports[&path];
                        let Some(&index) = module.functions.get(name) else {
                            return self.name_error(
                                format!("module '{}' has no function '{}'", alias, name),
                                loc,
                            );
                        };
                        return self.function_call(index, None, args, loc);
                    }
                }
                // Method call: push the receiver, then dispatch Struct_method.
                let recv_ty = self.expression(object, None)?;
                let Type::Struct(struct_name) = &recv_ty else {
                    return self.type_error(
                        format!("type {} has no methods", recv_ty),
                        loc,
                    );
                };
                let base = struct_name.split('<').next().unwrap_or(struct_name);
                let mangled = format!("{}_{}", base, name);
                let Some(index) = self.session.functions.resolve(&mangled) else {
                    return self.name_error(
                        format!("no method '{}' on struct '{}'", name, base),
                        loc,
                    );
                };
                self.function_call(index, Some(recv_ty), args, loc)
            }
            _ => self.type_error("only named functions can be called", loc),
        }
    }

    fn function_call(
        &mut self,
        index: u8,
        receiver: Option<Type>,
        args: &[Expr],
        loc: Loc,
    ) -> CResult<Type> {
        let info = self.session.functions.get(index).unwrap().clone();
        let total = args.len() + usize::from(receiver.is_some());
        if total != info.arity as usize {
            return self.type_error(
                format!(
                    "function '{}' expects {} argument(s), got {}",
                    info.name, info.arity, total
                ),
                loc,
            );
        }

        let mut bindings: HashMap<String, Type> = HashMap::new();
        let mut params = info.params.iter();
        if let Some(recv_ty) = receiver {
            // The receiver was already compiled and pushed.
            let param = params.next().unwrap();
            self.unify_param(param, &recv_ty, &info.name, &mut bindings, loc)?;
        }
        for (arg, param) in args.iter().zip(params) {
            let concrete = substitute_bound(param, &bindings);
            let hint = concrete.as_ref().filter(|t| !has_generics(t));
            let arg_ty = self.expression(arg, hint)?;
            self.unify_param(param, &arg_ty, &info.name, &mut bindings, arg.loc)?;
        }

        self.emit(OpCode::Call, loc);
        self.emit_byte(index, loc);
        self.emit_byte(info.arity, loc);
        Ok(substitute_bound(&info.ret, &bindings).unwrap_or(info.ret))
    }

    fn unify_param(
        &mut self,
        param: &Type,
        arg: &Type,
        fn_name: &str,
        bindings: &mut HashMap<String, Type>,
        loc: Loc,
    ) -> CResult<()> {
        match (param, arg) {
            (Type::Generic(name), _) => match bindings.get(name) {
                Some(bound) if bound != arg => self.type_error(
                    format!(
                        "conflicting types for generic parameter {} in call to '{}': {} versus {}",
                        name, fn_name, bound, arg
                    ),
                    loc,
                ),
                Some(_) => Ok(()),
                None => {
                    bindings.insert(name.clone(), arg.clone());
                    Ok(())
                }
            },
            (Type::Array(p), Type::Array(a)) => {
                self.unify_param(p, a, fn_name, bindings, loc)
            }
            _ if param == arg => Ok(()),
            _ => self.type_error(
                format!(
                    "argument type mismatch in call to '{}': expected {}, found {}",
                    fn_name, param, arg
                ),
                loc,
            ),
        }
    }

    fn native_call(
        &mut self,
        index: u8,
        def: &'static orus_core::natives::NativeDef,
        args: &[Expr],
        loc: Loc,
    ) -> CResult<Type> {
        if args.len() != def.params.len() {
            return self.type_error(
                format!(
                    "native '{}' expects {} argument(s), got {}",
                    def.name,
                    def.params.len(),
                    args.len()
                ),
                loc,
            );
        }
        let mut first_arg_ty = None;
        for (arg, param) in args.iter().zip(def.params) {
            let hint = match param {
                NativeType::F64 => Some(Type::F64),
                NativeType::I32 => Some(Type::I32),
                NativeType::I64 => Some(Type::I64),
                NativeType::Str => Some(Type::Str),
                _ => None,
            };
            let ty = self.expression(arg, hint.as_ref())?;
            let ok = match param {
                NativeType::F64 => ty == Type::F64,
                NativeType::I32 => ty == Type::I32,
                NativeType::I64 => ty == Type::I64,
                NativeType::Str => ty == Type::Str,
                NativeType::Array => matches!(ty, Type::Array(_)),
                NativeType::StrOrArray => ty == Type::Str || matches!(ty, Type::Array(_)),
                NativeType::Any => true,
                NativeType::ElemOfFirst | NativeType::Void => false,
            };
            if !ok {
                return self.type_error(
                    format!(
                        "native '{}' cannot accept an argument of type {}",
                        def.name, ty
                    ),
                    arg.loc,
                );
            }
            if first_arg_ty.is_none() {
                first_arg_ty = Some(ty);
            }
        }
        self.emit(OpCode::CallNative, loc);
        self.emit_byte(index, loc);
        self.emit_byte(args.len() as u8, loc);

        match native_ret_type(def.ret, first_arg_ty.as_ref()) {
            Some(ty) => Ok(ty),
            None => self.type_error(
                format!("cannot determine the result type of '{}'", def.name),
                loc,
            ),
        }
    }

    // --- Arrays, fields, casts --------------------------------------------

    fn index_get(&mut self, array: &Expr, index: &Expr, loc: Loc) -> CResult<Type> {
        let array_ty = self.expression(array, None)?;
        let Type::Array(elem) = &array_ty else {
            return self.type_error(
                format!("only arrays can be indexed, found {}", array_ty),
                loc,
            );
        };
        let elem = (**elem).clone();
        let index_ty = self.expression(index, Some(&Type::I32))?;
        if !index_ty.is_integer() {
            return self.type_error(
                format!("array index must be an integer, found {}", index_ty),
                loc,
            );
        }
        self.emit(OpCode::IndexGet, loc);
        Ok(elem)
    }

    fn index_set(
        &mut self,
        array: &Expr,
        index: &Expr,
        value: &Expr,
        loc: Loc,
    ) -> CResult<Type> {
        let array_ty = self.expression(array, None)?;
        let Type::Array(elem) = &array_ty else {
            return self.type_error(
                format!("only arrays can be indexed, found {}", array_ty),
                loc,
            );
        };
        let elem = (**elem).clone();
        let index_ty = self.expression(index, Some(&Type::I32))?;
        if !index_ty.is_integer() {
            return self.type_error(
                format!("array index must be an integer, found {}", index_ty),
                loc,
            );
        }
        let value_ty = self.expression(value, Some(&elem))?;
        if value_ty != elem {
            return self.type_error(
                format!("cannot store {} in an array of {}", value_ty, elem),
                loc,
            );
        }
        self.emit(OpCode::IndexSet, loc);
        Ok(elem)
    }

    fn slice(&mut self, array: &Expr, start: &Expr, end: &Expr, loc: Loc) -> CResult<Type> {
        let array_ty = self.expression(array, None)?;
        if !matches!(array_ty, Type::Array(_)) {
            return self.type_error(
                format!("only arrays can be sliced, found {}", array_ty),
                loc,
            );
        }
        for bound in [start, end] {
            let ty = self.expression(bound, Some(&Type::I32))?;
            if !ty.is_integer() {
                return self.type_error(
                    format!("slice bounds must be integers, found {}", ty),
                    bound.loc,
                );
            }
        }
        self.emit(OpCode::Slice, loc);
        Ok(array_ty)
    }

    fn field_get(&mut self, object: &Expr, name: &str, loc: Loc) -> CResult<Type> {
        // Module member access: `math.pi`.
        if let ExprKind::Variable(alias) = &object.kind {
            if let Some(path) = self.aliases.get(alias).cloned() {
                let module = &self.imports[&path];
                let Some(&slot) = module.globals.get(name) else {
                    return self.name_error(
                        format!("module '{}' has no export '{}'", alias, name),
                        loc,
                    );
                };
                let ty = self.session.globals.entry(slot).unwrap().ty.clone();
                self.emit(OpCode::GetGlobal, loc);
                self.emit_byte(slot, loc);
                return Ok(ty);
            }
        }

        let object_ty = self.expression(object, None)?;
        let Type::Struct(struct_name) = &object_ty else {
            return self.type_error(
                format!("type {} has no fields", object_ty),
                loc,
            );
        };
        let field = self
            .session
            .types
            .field(struct_name, name)
            .map(|(index, ty)| (index, ty.clone()));
        let Some((field_index, field_ty)) = field else {
            return self.name_error(
                format!("struct '{}' has no field '{}'", struct_name, name),
                loc,
            );
        };
        self.emit_constant(Constant::I32(field_index as i32), loc)?;
        self.emit(OpCode::IndexGet, loc);
        Ok(field_ty)
    }

    fn field_set(
        &mut self,
        object: &Expr,
        name: &str,
        value: &Expr,
        loc: Loc,
    ) -> CResult<Type> {
        if let ExprKind::Variable(alias) = &object.kind {
            if self.aliases.contains_key(alias) {
                return self.type_error("module exports cannot be assigned", loc);
            }
        }
        let object_ty = self.expression(object, None)?;
        let Type::Struct(struct_name) = &object_ty else {
            return self.type_error(
                format!("type {} has no fields", object_ty),
                loc,
            );
        };
        let field = self
            .session
            .types
            .field(struct_name, name)
            .map(|(index, ty)| (index, ty.clone()));
        let Some((field_index, field_ty)) = field else {
            return self.name_error(
                format!("struct '{}' has no field '{}'", struct_name, name),
                loc,
            );
        };
        self.emit_constant(Constant::I32(field_index as i32), loc)?;
        let value_ty = self.expression(value, Some(&field_ty))?;
        if value_ty != field_ty {
            return self.type_error(
                format!(
                    "cannot store {} in field '{}' of type {}",
                    value_ty, name, field_ty
                ),
                loc,
            );
        }
        self.emit(OpCode::IndexSet, loc);
        Ok(field_ty)
    }

    fn cast(&mut self, value: &Expr, target: &TypeExpr, loc: Loc) -> CResult<Type> {
        let target_ty = self.resolve_type(target, loc)?;
        let value_ty = self.expression(value, Some(&target_ty))?;
        if value_ty == target_ty {
            return Ok(target_ty);
        }
        let (Some(from), Some(to)) = (value_ty.cast_code(), target_ty.cast_code()) else {
            return self.type_error(
                format!("cannot cast {} to {}", value_ty, target_ty),
                loc,
            );
        };
        self.emit(OpCode::Cast, loc);
        self.emit_byte(from, loc);
        self.emit_byte(to, loc);
        Ok(target_ty)
    }

    fn struct_literal(
        &mut self,
        name: &str,
        generic_args: &[TypeExpr],
        fields: &[(String, Expr)],
        loc: Loc,
    ) -> CResult<Type> {
        let interned = if generic_args.is_empty() {
            let generic = match self.session.types.get(name) {
                Some(def) => !def.generics.is_empty(),
                None => return self.name_error(format!("unknown struct '{}'", name), loc),
            };
            if generic {
                return self.type_error(
                    format!(
                        "struct '{}' is generic; write '{}<...>' with type arguments",
                        name, name
                    ),
                    loc,
                );
            }
            name.to_string()
        } else {
            let mut args = Vec::with_capacity(generic_args.len());
            for arg in generic_args {
                args.push(self.resolve_type(arg, loc)?);
            }
            match self.session.types.instantiate(name, &args) {
                Ok(key) => key,
                Err(message) => return self.type_error(message, loc),
            }
        };

        let decl_fields: Vec<FieldDef> =
            self.session.types.get(&interned).unwrap().fields.clone();
        if fields.len() != decl_fields.len() {
            return self.type_error(
                format!(
                    "struct '{}' has {} field(s), literal provides {}",
                    interned,
                    decl_fields.len(),
                    fields.len()
                ),
                loc,
            );
        }

        // Fields are emitted in declaration order regardless of source order.
        for decl in &decl_fields {
            let Some((_, value)) = fields.iter().find(|(n, _)| *n == decl.name) else {
                return self.type_error(
                    format!("missing field '{}' in struct literal", decl.name),
                    loc,
                );
            };
            let ty = self.expression(value, Some(&decl.ty))?;
            if ty != decl.ty {
                return self.type_error(
                    format!(
                        "field '{}' of '{}' has type {}, found {}",
                        decl.name, interned, decl.ty, ty
                    ),
                    value.loc,
                );
            }
        }
        self.emit(OpCode::MakeArray, loc);
        self.emit_byte(decl_fields.len() as u8, loc);
        Ok(Type::Struct(interned))
    }

    // --- Statements -------------------------------------------------------

    fn statement(&mut self, stmt: &Stmt) -> CResult<()> {
        let loc = stmt.loc;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                let ty = self.expression(expr, None)?;
                if self.repl && self.current_fn.is_none() && ty != Type::Void {
                    self.emit(OpCode::Print, loc);
                } else {
                    self.emit(OpCode::Pop, loc);
                }
                Ok(())
            }
            StmtKind::Print { args } => self.print_statement(args, loc),
            StmtKind::Let {
                name,
                mutable,
                ty,
                init,
            } => {
                if self.current_fn.is_none() && self.module_name.is_some() {
                    return self.type_error(
                        "'let' is not allowed at module top level; use 'static' or move it into a function",
                        loc,
                    );
                }
                self.define_binding(name, *mutable, false, ty.as_ref(), init, loc)
            }
            StmtKind::Const {
                name,
                ty,
                init,
                public,
            } => {
                if self.current_fn.is_some() {
                    return self.type_error("'const' is not allowed inside a function", loc);
                }
                self.define_binding(name, false, *public, ty.as_ref(), init, loc)
            }
            StmtKind::Static {
                name,
                mutable,
                ty,
                init,
                public,
            } => {
                if self.current_fn.is_some() {
                    return self.type_error("'static' is not allowed inside a function", loc);
                }
                self.define_binding(name, *mutable, *public, ty.as_ref(), init, loc)
            }
            StmtKind::Block(body) => {
                for stmt in body {
                    self.statement(stmt)?;
                }
                Ok(())
            }
            StmtKind::If {
                cond,
                then_body,
                elif_branches,
                else_body,
            } => self.if_statement(cond, then_body, elif_branches, else_body.as_deref(), loc),
            StmtKind::While { cond, body } => self.while_statement(cond, body, loc),
            StmtKind::ForRange {
                var,
                start,
                end,
                step,
                body,
            } => self.for_statement(var, start, end, step.as_ref(), body, loc),
            StmtKind::Function(decl) => self.function_decl(decl, None),
            StmtKind::Impl {
                struct_name,
                generics,
                methods,
            } => {
                if !self.session.types.contains(struct_name) {
                    return self.name_error(
                        format!("'impl' for unknown struct '{}'", struct_name),
                        loc,
                    );
                }
                for method in methods {
                    self.function_decl_with_generics(
                        method,
                        Some(struct_name.as_str()),
                        generics.clone(),
                    )?;
                }
                Ok(())
            }
            StmtKind::Return(value) => self.return_statement(value.as_ref(), loc),
            StmtKind::Break => {
                let jump = self.emit_jump(OpCode::Jump, loc);
                self.loops
                    .last_mut()
                    .expect("parser rejects break outside loops")
                    .break_jumps
                    .push(jump);
                Ok(())
            }
            StmtKind::Continue => {
                let target = self
                    .loops
                    .last()
                    .expect("parser rejects continue outside loops")
                    .continue_back;
                match target {
                    Some(start) => self.emit_loop(start, loc),
                    None => {
                        let jump = self.emit_jump(OpCode::Jump, loc);
                        self.loops.last_mut().unwrap().continue_jumps.push(jump);
                        Ok(())
                    }
                }
            }
            StmtKind::StructDecl {
                name,
                generics,
                fields,
                ..
            } => self.struct_decl(name, generics, fields, loc),
            StmtKind::Match { scrutinee, arms } => self.match_statement(scrutinee, arms, loc),
            StmtKind::TryCatch {
                body,
                err_name,
                handler,
            } => self.try_statement(body, err_name, handler, loc),
            StmtKind::Use { path, alias } => self.use_statement(path, alias.as_deref(), loc),
        }
    }

    fn print_statement(&mut self, args: &[Expr], loc: Loc) -> CResult<()> {
        if args.len() == 1 {
            self.expression(&args[0], None)?;
            self.emit(OpCode::Print, loc);
            return Ok(());
        }

        let template_ty = self.expression(&args[0], Some(&Type::Str))?;
        if template_ty != Type::Str {
            return self.type_error(
                format!(
                    "formatted print needs a string template first, found {}",
                    template_ty
                ),
                args[0].loc,
            );
        }
        if let ExprKind::Str(template) = &args[0].kind {
            let holes = template.matches("{}").count();
            if holes != args.len() - 1 {
                return self.type_error(
                    format!(
                        "format template has {} placeholder(s) but {} argument(s) follow",
                        holes,
                        args.len() - 1
                    ),
                    args[0].loc,
                );
            }
        }
        for arg in &args[1..] {
            self.expression(arg, None)?;
        }
        self.emit(OpCode::FormatPrint, loc);
        self.emit_byte((args.len() - 1) as u8, loc);
        Ok(())
    }

    fn define_binding(
        &mut self,
        name: &str,
        mutable: bool,
        public: bool,
        ty: Option<&TypeExpr>,
        init: &Expr,
        loc: Loc,
    ) -> CResult<()> {
        let declared = match ty {
            Some(expr) => Some(self.resolve_type(expr, loc)?),
            None => None,
        };
        let init_ty = self.expression(init, declared.as_ref())?;
        let final_ty = match declared {
            Some(declared) => {
                if init_ty != declared {
                    return self.type_error(
                        format!(
                            "'{}' is declared {} but initialized with {}",
                            name, declared, init_ty
                        ),
                        loc,
                    );
                }
                declared
            }
            None => init_ty,
        };
        if final_ty == Type::Void {
            return self.type_error(
                format!("'{}' cannot be bound to a void expression", name),
                loc,
            );
        }
        let Some(slot) = self.session.globals.define(GlobalEntry {
            name: name.to_string(),
            ty: final_ty,
            mutable,
            public,
        }) else {
            return self.type_error("too many globals (the table holds 256)", loc);
        };
        self.emit(OpCode::DefineGlobal, loc);
        self.emit_byte(slot, loc);
        Ok(())
    }

    fn if_statement(
        &mut self,
        cond: &Expr,
        then_body: &[Stmt],
        elif_branches: &[(Expr, Vec<Stmt>)],
        else_body: Option<&[Stmt]>,
        loc: Loc,
    ) -> CResult<()> {
        let mut end_jumps = Vec::new();

        let cond_ty = self.expression(cond, Some(&Type::Bool))?;
        if cond_ty != Type::Bool {
            return self.type_error(
                format!("'if' needs a bool condition, found {}", cond_ty),
                loc,
            );
        }
        let mut next = self.emit_jump(OpCode::JumpIfFalse, loc);
        self.emit(OpCode::Pop, loc);
        for stmt in then_body {
            self.statement(stmt)?;
        }
        end_jumps.push(self.emit_jump(OpCode::Jump, loc));

        for (elif_cond, elif_body) in elif_branches {
            self.patch_jump(next, loc)?;
            self.emit(OpCode::Pop, loc);
            let ty = self.expression(elif_cond, Some(&Type::Bool))?;
            if ty != Type::Bool {
                return self.type_error(
                    format!("'elif' needs a bool condition, found {}", ty),
                    elif_cond.loc,
                );
            }
            next = self.emit_jump(OpCode::JumpIfFalse, loc);
            self.emit(OpCode::Pop, loc);
            for stmt in elif_body {
                self.statement(stmt)?;
            }
            end_jumps.push(self.emit_jump(OpCode::Jump, loc));
        }

        self.patch_jump(next, loc)?;
        self.emit(OpCode::Pop, loc);
        if let Some(else_body) = else_body {
            for stmt in else_body {
                self.statement(stmt)?;
            }
        }
        for jump in end_jumps {
            self.patch_jump(jump, loc)?;
        }
        Ok(())
    }

    fn while_statement(&mut self, cond: &Expr, body: &[Stmt], loc: Loc) -> CResult<()> {
        let start = self.chunk.code.len();
        let cond_ty = self.expression(cond, Some(&Type::Bool))?;
        if cond_ty != Type::Bool {
            return self.type_error(
                format!("'while' needs a bool condition, found {}", cond_ty),
                loc,
            );
        }
        let exit = self.emit_jump(OpCode::JumpIfFalse, loc);
        self.emit(OpCode::Pop, loc);

        self.loops.push(LoopCtx {
            continue_back: Some(start),
            continue_jumps: Vec::new(),
            break_jumps: Vec::new(),
        });
        for stmt in body {
            self.statement(stmt)?;
        }
        let ctx = self.loops.pop().unwrap();

        self.emit_loop(start, loc)?;
        self.patch_jump(exit, loc)?;
        self.emit(OpCode::Pop, loc);
        for jump in ctx.break_jumps {
            self.patch_jump(jump, loc)?;
        }
        Ok(())
    }

    fn for_statement(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
        loc: Loc,
    ) -> CResult<()> {
        // `i <- start`; the loop variable's type is the range's type.
        let iter_hint = self.infer_type(end).filter(|t| t.is_integer());
        let iter_ty = self.expression(start, iter_hint.as_ref())?;
        if !iter_ty.is_integer() {
            return self.type_error(
                format!("'for' range must be an integer type, found {}", iter_ty),
                loc,
            );
        }
        let Some(slot) = self.session.globals.define(GlobalEntry {
            name: var.to_string(),
            ty: iter_ty.clone(),
            mutable: true,
            public: false,
        }) else {
            return self.type_error("too many globals (the table holds 256)", loc);
        };
        self.emit(OpCode::DefineGlobal, loc);
        self.emit_byte(slot, loc);

        // cond: i < end
        let cond = self.chunk.code.len();
        self.emit(OpCode::GetGlobal, loc);
        self.emit_byte(slot, loc);
        let end_ty = self.expression(end, Some(&iter_ty))?;
        if end_ty != iter_ty {
            return self.type_error(
                format!(
                    "'for' range bounds disagree: {} versus {}",
                    iter_ty, end_ty
                ),
                end.loc,
            );
        }
        let Some(less) = comparison_op(BinaryOp::Less, &iter_ty) else {
            return self.type_error(format!("'<' is not defined for {}", iter_ty), loc);
        };
        self.emit(less, loc);
        let exit = self.emit_jump(OpCode::JumpIfFalse, loc);
        self.emit(OpCode::Pop, loc);

        self.loops.push(LoopCtx {
            continue_back: None,
            continue_jumps: Vec::new(),
            break_jumps: Vec::new(),
        });
        for stmt in body {
            self.statement(stmt)?;
        }
        let ctx = self.loops.pop().unwrap();

        // incr: i <- i + step
        let incr = self.chunk.code.len();
        for jump in ctx.continue_jumps {
            // Forward continue jumps land here; distance is already final.
            let distance = incr - (jump + 2);
            self.chunk.patch_u16(jump, distance as u16);
        }
        self.emit(OpCode::GetGlobal, loc);
        self.emit_byte(slot, loc);
        match step {
            Some(step) => {
                let step_ty = self.expression(step, Some(&iter_ty))?;
                if step_ty != iter_ty {
                    return self.type_error(
                        format!(
                            "'for' step must match the range type {}, found {}",
                            iter_ty, step_ty
                        ),
                        step.loc,
                    );
                }
            }
            None => {
                self.int_literal(1, false, Some(&iter_ty), loc)?;
            }
        }
        let Some(add) = arith_op(BinaryOp::Add, &iter_ty) else {
            return self.type_error(format!("'+' is not defined for {}", iter_ty), loc);
        };
        self.emit(add, loc);
        self.emit(OpCode::SetGlobal, loc);
        self.emit_byte(slot, loc);
        self.emit(OpCode::Pop, loc);
        self.emit_loop(cond, loc)?;

        self.patch_jump(exit, loc)?;
        self.emit(OpCode::Pop, loc);
        for jump in ctx.break_jumps {
            self.patch_jump(jump, loc)?;
        }
        Ok(())
    }

    fn function_decl(&mut self, decl: &FnDecl, struct_prefix: Option<&str>) -> CResult<()> {
        self.function_decl_with_generics(decl, struct_prefix, Vec::new())
    }

    fn function_decl_with_generics(
        &mut self,
        decl: &FnDecl,
        struct_prefix: Option<&str>,
        outer_generics: Vec<String>,
    ) -> CResult<()> {
        let loc = decl.loc;
        if self.current_fn.is_some() {
            return self.type_error("nested functions are not supported", loc);
        }
        let name = match struct_prefix {
            Some(prefix) => format!("{}_{}", prefix, decl.name),
            None => decl.name.clone(),
        };
        if decl.params.len() > u8::MAX as usize {
            return self.type_error("too many parameters", loc);
        }

        let mut generics = outer_generics;
        generics.extend(decl.generics.iter().cloned());

        let mut params = Vec::with_capacity(decl.params.len());
        for (_, ty) in &decl.params {
            params.push(self.resolve_type_with(ty, generics.clone(), loc)?);
        }
        let ret = match &decl.ret {
            Some(ty) => self.resolve_type_with(ty, generics.clone(), loc)?,
            None => Type::Void,
        };

        // Jump over the inlined body.
        let over = self.emit_jump(OpCode::Jump, loc);
        let entry = self.chunk.code.len() as u32;

        let mut param_slots = Vec::with_capacity(decl.params.len());
        for ((param_name, _), ty) in decl.params.iter().zip(&params) {
            let Some(slot) = self.session.globals.define(GlobalEntry {
                name: param_name.clone(),
                ty: ty.clone(),
                mutable: true,
                public: false,
            }) else {
                return self.type_error("too many globals (the table holds 256)", loc);
            };
            param_slots.push(slot);
        }

        // Register before the body compiles so recursion resolves.
        let info = FunctionInfo {
            name: name.clone(),
            arity: decl.params.len() as u8,
            entry,
            chunk_id: self.chunk_id,
            params,
            param_slots: param_slots.clone(),
            ret: ret.clone(),
            public: decl.public,
        };
        if self.session.functions.define(info).is_none() {
            return self.type_error("too many functions (the table holds 256)", loc);
        }

        // Arguments arrive on the stack; bind them to the parameter slots in
        // reverse so the top of stack pairs with the last parameter.
        for slot in param_slots.iter().rev() {
            self.emit(OpCode::DefineGlobal, loc);
            self.emit_byte(*slot, loc);
        }

        self.current_fn = Some(FnCtx {
            ret: ret.clone(),
            generics,
        });
        let mut body_result = Ok(());
        for stmt in &decl.body {
            body_result = self.statement(stmt);
            if body_result.is_err() {
                break;
            }
        }
        self.current_fn = None;
        body_result?;

        // Safety trailer for bodies that fall off the end.
        self.emit(OpCode::Nil, loc);
        self.emit(OpCode::Return, loc);
        self.patch_jump(over, loc)?;
        Ok(())
    }

    fn return_statement(&mut self, value: Option<&Expr>, loc: Loc) -> CResult<()> {
        let ret = self
            .current_fn
            .as_ref()
            .map(|ctx| ctx.ret.clone())
            .expect("parser rejects return outside functions");
        match value {
            Some(expr) => {
                let ty = self.expression(expr, Some(&ret))?;
                if ty != ret && !matches!(ret, Type::Generic(_)) {
                    return self.type_error(
                        format!("function returns {}, found {}", ret, ty),
                        loc,
                    );
                }
            }
            None => {
                if ret != Type::Void {
                    return self.type_error(
                        format!("function returns {}, but 'return' has no value", ret),
                        loc,
                    );
                }
                self.emit(OpCode::Nil, loc);
            }
        }
        self.emit(OpCode::Return, loc);
        Ok(())
    }

    fn struct_decl(
        &mut self,
        name: &str,
        generics: &[String],
        fields: &[(String, TypeExpr)],
        loc: Loc,
    ) -> CResult<()> {
        let mut defs = Vec::with_capacity(fields.len());
        for (field_name, ty) in fields {
            let ty = self.resolve_type_with(ty, generics.to_vec(), loc)?;
            defs.push(FieldDef {
                name: field_name.clone(),
                ty,
            });
        }
        let def = StructDef {
            name: name.to_string(),
            generics: generics.to_vec(),
            fields: defs,
        };
        if let Err(message) = self.session.types.register(def.clone()) {
            return self.type_error(message, loc);
        }
        self.structs_added.push(def);
        Ok(())
    }

    fn match_statement(&mut self, scrutinee: &Expr, arms: &[MatchArm], loc: Loc) -> CResult<()> {
        // The scrutinee is evaluated once into a hidden slot.
        let ty = self.expression(scrutinee, None)?;
        let hidden = format!("__match{}", self.hidden_counter);
        self.hidden_counter += 1;
        let Some(slot) = self.session.globals.define(GlobalEntry {
            name: hidden,
            ty: ty.clone(),
            mutable: false,
            public: false,
        }) else {
            return self.type_error("too many globals (the table holds 256)", loc);
        };
        self.emit(OpCode::DefineGlobal, loc);
        self.emit_byte(slot, loc);

        let mut end_jumps = Vec::new();
        let mut saw_wildcard = false;
        for arm in arms {
            if saw_wildcard {
                return self.type_error("match arms after '_' are unreachable", arm.loc);
            }
            match &arm.pattern {
                Pattern::Literal(pattern) => {
                    self.emit(OpCode::GetGlobal, arm.loc);
                    self.emit_byte(slot, arm.loc);
                    let pattern_ty = self.expression(pattern, Some(&ty))?;
                    if pattern_ty != ty {
                        return self.type_error(
                            format!(
                                "match pattern type {} does not match value type {}",
                                pattern_ty, ty
                            ),
                            arm.loc,
                        );
                    }
                    self.emit(OpCode::Equal, arm.loc);
                    let next = self.emit_jump(OpCode::JumpIfFalse, arm.loc);
                    self.emit(OpCode::Pop, arm.loc);
                    for stmt in &arm.body {
                        self.statement(stmt)?;
                    }
                    end_jumps.push(self.emit_jump(OpCode::Jump, arm.loc));
                    self.patch_jump(next, arm.loc)?;
                    self.emit(OpCode::Pop, arm.loc);
                }
                Pattern::Wildcard => {
                    saw_wildcard = true;
                    for stmt in &arm.body {
                        self.statement(stmt)?;
                    }
                }
            }
        }
        for jump in end_jumps {
            self.patch_jump(jump, loc)?;
        }
        Ok(())
    }

    fn try_statement(
        &mut self,
        body: &[Stmt],
        err_name: &str,
        handler: &[Stmt],
        loc: Loc,
    ) -> CResult<()> {
        let Some(err_slot) = self.session.globals.define(GlobalEntry {
            name: err_name.to_string(),
            ty: Type::Struct("Error".to_string()),
            mutable: false,
            public: false,
        }) else {
            return self.type_error("too many globals (the table holds 256)", loc);
        };

        self.emit(OpCode::PushTry, loc);
        self.chunk.write_u16(0xffff, loc.line);
        let try_operand = self.chunk.code.len() - 2;
        self.emit_byte(err_slot, loc);

        for stmt in body {
            self.statement(stmt)?;
        }
        self.emit(OpCode::PopTry, loc);
        let over_handler = self.emit_jump(OpCode::Jump, loc);

        // Handler target: offset is measured from after the PushTry operands.
        let handler_start = self.chunk.code.len();
        let distance = handler_start - (try_operand + 3);
        if distance > u16::MAX as usize {
            return self.type_error("try block is too large", loc);
        }
        self.chunk.patch_u16(try_operand, distance as u16);

        for stmt in handler {
            self.statement(stmt)?;
        }
        self.patch_jump(over_handler, loc)?;
        Ok(())
    }

    fn use_statement(&mut self, path: &[String], alias: Option<&str>, loc: Loc) -> CResult<()> {
        let module_path = Stmt::use_module_path(path);
        if !self.imports.contains_key(&module_path) {
            return self.name_error(
                format!("module '{}' was not loaded", module_path),
                loc,
            );
        }
        let alias = alias
            .map(str::to_string)
            .unwrap_or_else(|| path.last().cloned().unwrap_or_default());
        self.aliases.insert(alias, module_path.clone());
        if !self.import_paths.contains(&module_path) {
            self.import_paths.push(module_path.clone());
        }

        let Some(index) = self.chunk.add_constant(Constant::Str(module_path)) else {
            return self.type_error("too many constants in one chunk", loc);
        };
        self.emit(OpCode::Import, loc);
        self.emit_byte(index, loc);
        self.emit(OpCode::Pop, loc);
        Ok(())
    }
}

// --- Operator tables ------------------------------------------------------

fn arith_op(op: BinaryOp, ty: &Type) -> Option<OpCode> {
    let opcode = match (op, ty) {
        (BinaryOp::Add, Type::I32) => OpCode::AddI32,
        (BinaryOp::Sub, Type::I32) => OpCode::SubI32,
        (BinaryOp::Mul, Type::I32) => OpCode::MulI32,
        (BinaryOp::Div, Type::I32) => OpCode::DivI32,
        (BinaryOp::Mod, Type::I32) => OpCode::ModI32,
        (BinaryOp::Add, Type::I64) => OpCode::AddI64,
        (BinaryOp::Sub, Type::I64) => OpCode::SubI64,
        (BinaryOp::Mul, Type::I64) => OpCode::MulI64,
        (BinaryOp::Div, Type::I64) => OpCode::DivI64,
        (BinaryOp::Mod, Type::I64) => OpCode::ModI64,
        (BinaryOp::Add, Type::U32) => OpCode::AddU32,
        (BinaryOp::Sub, Type::U32) => OpCode::SubU32,
        (BinaryOp::Mul, Type::U32) => OpCode::MulU32,
        (BinaryOp::Div, Type::U32) => OpCode::DivU32,
        (BinaryOp::Mod, Type::U32) => OpCode::ModU32,
        (BinaryOp::Add, Type::U64) => OpCode::AddU64,
        (BinaryOp::Sub, Type::U64) => OpCode::SubU64,
        (BinaryOp::Mul, Type::U64) => OpCode::MulU64,
        (BinaryOp::Div, Type::U64) => OpCode::DivU64,
        (BinaryOp::Mod, Type::U64) => OpCode::ModU64,
        (BinaryOp::Add, Type::F64) => OpCode::AddF64,
        (BinaryOp::Sub, Type::F64) => OpCode::SubF64,
        (BinaryOp::Mul, Type::F64) => OpCode::MulF64,
        (BinaryOp::Div, Type::F64) => OpCode::DivF64,
        _ => return None,
    };
    Some(opcode)
}

fn comparison_op(op: BinaryOp, ty: &Type) -> Option<OpCode> {
    let opcode = match (op, ty) {
        (BinaryOp::Less, Type::I32) => OpCode::LessI32,
        (BinaryOp::LessEqual, Type::I32) => OpCode::LessEqualI32,
        (BinaryOp::Greater, Type::I32) => OpCode::GreaterI32,
        (BinaryOp::GreaterEqual, Type::I32) => OpCode::GreaterEqualI32,
        (BinaryOp::Less, Type::I64) => OpCode::LessI64,
        (BinaryOp::LessEqual, Type::I64) => OpCode::LessEqualI64,
        (BinaryOp::Greater, Type::I64) => OpCode::GreaterI64,
        (BinaryOp::GreaterEqual, Type::I64) => OpCode::GreaterEqualI64,
        (BinaryOp::Less, Type::U32) => OpCode::LessU32,
        (BinaryOp::LessEqual, Type::U32) => OpCode::LessEqualU32,
        (BinaryOp::Greater, Type::U32) => OpCode::GreaterU32,
        (BinaryOp::GreaterEqual, Type::U32) => OpCode::GreaterEqualU32,
        (BinaryOp::Less, Type::U64) => OpCode::LessU64,
        (BinaryOp::LessEqual, Type::U64) => OpCode::LessEqualU64,
        (BinaryOp::Greater, Type::U64) => OpCode::GreaterU64,
        (BinaryOp::GreaterEqual, Type::U64) => OpCode::GreaterEqualU64,
        (BinaryOp::Less, Type::F64) => OpCode::LessF64,
        (BinaryOp::LessEqual, Type::F64) => OpCode::LessEqualF64,
        (BinaryOp::Greater, Type::F64) => OpCode::GreaterF64,
        (BinaryOp::GreaterEqual, Type::F64) => OpCode::GreaterEqualF64,
        _ => return None,
    };
    Some(opcode)
}

fn native_ret_type(ret: NativeType, first_arg: Option<&Type>) -> Option<Type> {
    match ret {
        NativeType::F64 => Some(Type::F64),
        NativeType::I32 => Some(Type::I32),
        NativeType::I64 => Some(Type::I64),
        NativeType::Str => Some(Type::Str),
        NativeType::Void => Some(Type::Void),
        NativeType::Any | NativeType::Array | NativeType::StrOrArray => None,
        NativeType::ElemOfFirst => match first_arg {
            Some(Type::Array(elem)) => Some((**elem).clone()),
            _ => None,
        },
    }
}

fn has_generics(ty: &Type) -> bool {
    match ty {
        Type::Generic(_) => true,
        Type::Array(elem) => has_generics(elem),
        Type::Function { params, ret } => {
            params.iter().any(has_generics) || has_generics(ret)
        }
        _ => false,
    }
}

fn substitute_bound(ty: &Type, bindings: &HashMap<String, Type>) -> Option<Type> {
    match ty {
        Type::Generic(name) => bindings.get(name).cloned(),
        Type::Array(elem) => {
            substitute_bound(elem, bindings).map(|e| Type::Array(Box::new(e)))
        }
        other => Some(other.clone()),
    }
}
