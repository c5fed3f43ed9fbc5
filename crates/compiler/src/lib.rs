//! Orus compiler library
//!
//! Turns Orus source text into bytecode [`ModuleUnit`]s: scanner, Pratt
//! parser, and a fused type-check/emission pass that compiles against a
//! shared [`Session`] of global, function, and struct tables. The runtime
//! crate drives this through its module loader and interpreter.
//!
//! ```rust
//! use orusc::{CompileOptions, Session, compile_source};
//!
//! let mut session = Session::new();
//! let opts = CompileOptions {
//!     file: "hello.orus",
//!     module_name: None,
//!     chunk_id: 0,
//!     repl: false,
//! };
//! let unit = compile_source("print(\"hi\")", &opts, &mut session).unwrap();
//! assert!(!unit.chunk.code.is_empty());
//! ```

pub mod ast;
pub mod compiler;
pub mod parser;
pub mod scanner;
pub mod session;
pub mod stdlib_embed;

pub use ast::{Expr, ExprKind, Stmt, StmtKind, use_paths};
pub use compiler::{CompileOptions, ImportMap, ImportedModule, compile};
pub use parser::parse;
pub use scanner::{Token, TokenKind, tokenize};
pub use session::{FunctionInfo, GlobalEntry, ModuleUnit, Session};

use orus_core::diag::Diagnostic;

/// Parse and compile a source string that imports nothing. Convenience for
/// the REPL and for tests; the module loader drives [`compile`] directly.
pub fn compile_source(
    source: &str,
    opts: &CompileOptions<'_>,
    session: &mut Session,
) -> Result<ModuleUnit, Vec<Diagnostic>> {
    let program = parse(source, opts.file)?;
    let imports = ImportMap::new();
    compile(&program, opts, session, &imports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orus_core::opcode::OpCode;

    fn entry_opts() -> CompileOptions<'static> {
        CompileOptions {
            file: "test.orus",
            module_name: None,
            chunk_id: 0,
            repl: false,
        }
    }

    fn compile_ok(source: &str) -> (ModuleUnit, Session) {
        let mut session = Session::new();
        let unit = compile_source(source, &entry_opts(), &mut session)
            .unwrap_or_else(|errors| panic!("compile failed: {:?}", errors));
        (unit, session)
    }

    fn compile_errors(source: &str) -> Vec<Diagnostic> {
        let mut session = Session::new();
        compile_source(source, &entry_opts(), &mut session)
            .err()
            .expect("compile should fail")
    }

    fn has_op(unit: &ModuleUnit, op: OpCode) -> bool {
        // Scan the disassembly so operand bytes are not misread as opcodes.
        unit.chunk.disassemble("t").contains(op.mnemonic())
    }

    #[test]
    fn typed_arithmetic_selects_opcodes() {
        let (unit, _) = compile_ok("fn main() { let x = 1 + 2 }");
        assert!(has_op(&unit, OpCode::AddI32));

        let (unit, _) = compile_ok("fn main() { let x = 1.5 * 2.0 }");
        assert!(has_op(&unit, OpCode::MulF64));
    }

    #[test]
    fn literal_widens_to_f64_initializer() {
        // An integer literal initializing an f64 is re-tagged, not converted.
        let (unit, _) = compile_ok("let x: f64 = 1 + 2.5\nprint(x)");
        assert!(!has_op(&unit, OpCode::I32ToF64));
        assert!(has_op(&unit, OpCode::AddF64));
    }

    #[test]
    fn non_literal_i32_widens_with_conversion() {
        let (unit, _) = compile_ok("fn main() { let a = 1\nlet b = a + 2.5 }");
        assert!(has_op(&unit, OpCode::I32ToF64));
        assert!(has_op(&unit, OpCode::AddF64));
    }

    #[test]
    fn u32_literal_retag() {
        let (unit, session) = compile_ok("fn main() { let x: u32 = 7 }");
        assert!(has_op(&unit, OpCode::DefineGlobal));
        let slot = session.globals.resolve("x").unwrap();
        assert_eq!(
            session.globals.entry(slot).unwrap().ty,
            orus_core::types::Type::U32
        );
    }

    #[test]
    fn negative_literal_cannot_be_u32() {
        let errors = compile_errors("fn main() { let x: u32 = -1 }");
        assert!(!errors.is_empty());
    }

    #[test]
    fn mixed_arithmetic_without_f64_is_an_error() {
        let errors = compile_errors("fn main() { let a = 1\nlet b = 2 as i64\nlet c = a + b }");
        assert!(errors[0].message.contains("matching"));
    }

    #[test]
    fn modulo_rejects_floats() {
        let errors = compile_errors("fn main() { let x = 1.5 % 2.0 }");
        assert!(errors[0].message.contains("integer"));
    }

    #[test]
    fn undefined_variable_is_a_name_error() {
        let errors = compile_errors("print(missing)");
        assert!(matches!(errors[0].kind, orus_core::diag::ErrorKind::Name));
    }

    #[test]
    fn let_rejected_at_module_top_level() {
        let mut session = Session::new();
        let opts = CompileOptions {
            file: "mod.orus",
            module_name: Some("mod"),
            chunk_id: 1,
            repl: false,
        };
        let errors = compile_source("let x = 1", &opts, &mut session)
            .err()
            .expect("module-level let should fail");
        assert!(errors[0].message.contains("module top level"));
    }

    #[test]
    fn const_rejected_inside_functions() {
        let errors = compile_errors("fn main() { const X = 1 }");
        assert!(errors[0].message.contains("const"));
    }

    #[test]
    fn functions_register_with_entry_and_params() {
        let (_, session) = compile_ok("fn add(a: i32, b: i32) -> i32 { return a + b }");
        let index = session.functions.resolve("add").unwrap();
        let info = session.functions.get(index).unwrap();
        assert_eq!(info.arity, 2);
        assert_eq!(info.param_slots.len(), 2);
        assert!(info.entry > 0);
    }

    #[test]
    fn recursion_compiles() {
        let (unit, _) = compile_ok(
            "fn fact(n: i32) -> i32 { if n <= 1 { return 1 } return n * fact(n - 1) }",
        );
        assert!(has_op(&unit, OpCode::Call));
    }

    #[test]
    fn call_arity_is_checked() {
        let errors = compile_errors("fn f(a: i32) -> i32 { return a }\nfn main() { f(1, 2) }");
        assert!(errors[0].message.contains("argument"));
    }

    #[test]
    fn methods_namespace_as_struct_method() {
        let (_, session) = compile_ok(
            "struct Point { x: i32, y: i32 }\n\
             impl Point { fn sum(p: Point) -> i32 { return p.x + p.y } }",
        );
        assert!(session.functions.resolve("Point_sum").is_some());
    }

    #[test]
    fn struct_literal_emits_fields_in_declaration_order() {
        let (unit, _) = compile_ok(
            "struct Point { x: i32, y: i32 }\n\
             fn main() { let p = Point { y: 2, x: 1 } }",
        );
        assert!(has_op(&unit, OpCode::MakeArray));
        // x (1) must be emitted before y (2) despite literal order.
        let listing = unit.chunk.disassemble("t");
        let x_pos = listing.find("; 1").unwrap();
        let y_pos = listing.find("; 2").unwrap();
        assert!(x_pos < y_pos);
    }

    #[test]
    fn forward_jumps_are_patched() {
        let (unit, _) = compile_ok(
            "fn main() { if 1 < 2 { print(1) } elif 2 < 3 { print(2) } else { print(3) } }",
        );
        // No 0xffff placeholder may survive compilation.
        let listing = unit.chunk.disassemble("t");
        assert!(!listing.contains("65535"));
    }

    #[test]
    fn while_loop_and_break() {
        let (unit, _) = compile_ok(
            "fn main() { let mut i = 0\nwhile i < 10 { i += 1\nif i == 5 { break } } }",
        );
        assert!(has_op(&unit, OpCode::Loop));
        assert!(!unit.chunk.disassemble("t").contains("65535"));
    }

    #[test]
    fn formatted_print_checks_placeholders() {
        let errors = compile_errors("print(\"{} {}\", 1)");
        assert!(errors[0].message.contains("placeholder"));
    }

    #[test]
    fn formatted_print_requires_string_template() {
        let errors = compile_errors("print(1, 2)");
        assert!(errors[0].message.contains("template"));
    }

    #[test]
    fn try_catch_compiles_with_error_binding() {
        let (unit, session) = compile_ok("try { print(1) } catch e { print(2) }");
        assert!(has_op(&unit, OpCode::PushTry));
        assert!(has_op(&unit, OpCode::PopTry));
        assert!(session.globals.resolve("e").is_some());
    }

    #[test]
    fn main_is_called_automatically_at_entry() {
        let (unit, _) = compile_ok("fn main() { print(1) }");
        assert!(has_op(&unit, OpCode::Call));
    }

    #[test]
    fn repl_prints_bare_expressions() {
        let mut session = Session::new();
        let opts = CompileOptions {
            file: "<repl>",
            module_name: None,
            chunk_id: 0,
            repl: true,
        };
        let unit = compile_source("1 + 2", &opts, &mut session).unwrap();
        assert!(unit.chunk.disassemble("t").contains("PRINT"));
    }

    #[test]
    fn cast_emits_conversion() {
        let (unit, _) = compile_ok("fn main() { let a = 1\nlet b = a as i64 }");
        assert!(has_op(&unit, OpCode::Cast));
    }

    #[test]
    fn generic_function_calls_unify() {
        let (_, _) = compile_ok(
            "fn first<T>(a: [T]) -> T { return a[0] }\n\
             fn main() { let x = first([1, 2, 3]) + 1 }",
        );
        let errors = compile_errors(
            "fn pair<T>(a: T, b: T) -> T { return a }\n\
             fn main() { let x = pair(1, 2.0) }",
        );
        assert!(errors[0].message.contains("generic"));
    }

    #[test]
    fn unit_records_public_exports() {
        let mut session = Session::new();
        let opts = CompileOptions {
            file: "m.orus",
            module_name: Some("m"),
            chunk_id: 1,
            repl: false,
        };
        let unit = compile_source(
            "pub fn double(x: i32) -> i32 { return x * 2 }\nstatic hidden = 3",
            &opts,
            &mut session,
        )
        .unwrap();
        let fns: Vec<_> = unit.exported_functions().collect();
        assert_eq!(fns.len(), 1);
        assert_eq!(fns[0].0, "double");
        assert_eq!(unit.exported_globals().count(), 0);
    }

    #[test]
    fn match_lowers_to_equality_chain() {
        let (unit, _) = compile_ok(
            "fn main() { let x = 2\nmatch x { 1 => print(\"one\"), _ => print(\"other\") } }",
        );
        assert!(has_op(&unit, OpCode::Equal));
        assert!(!unit.chunk.disassemble("t").contains("65535"));
    }
}
