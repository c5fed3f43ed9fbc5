//! End-to-end scenarios: source text in, stdout out.

use std::fs;

use orus_runtime::{Backend, Interpreter, InterpretError};

fn run(source: &str) -> String {
    let mut interp = Interpreter::new().with_buffered_output();
    interp
        .interpret(source, "test.orus")
        .unwrap_or_else(|e| panic!("program failed: {}", e));
    interp.output_text()
}

fn run_err(source: &str) -> InterpretError {
    let mut interp = Interpreter::new().with_buffered_output();
    interp
        .interpret(source, "test.orus")
        .expect_err("program should fail")
}

#[test]
fn hello_world() {
    assert_eq!(run("print(\"hi\")"), "hi\n");
}

#[test]
fn for_loop_sum() {
    let source = "fn main() {\n\
                  \x20   let mut s = 0\n\
                  \x20   for i in 0..5 { s += i }\n\
                  \x20   print(s)\n\
                  }";
    assert_eq!(run(source), "10\n");
}

#[test]
fn recursive_factorial() {
    let source = "fn fact(n: i32) -> i32 {\n\
                  \x20   if n <= 1 { return 1 }\n\
                  \x20   return n * fact(n - 1)\n\
                  }\n\
                  print(fact(5))";
    assert_eq!(run(source), "120\n");
}

#[test]
fn integer_literal_widens_to_f64() {
    assert_eq!(run("let x: f64 = 1 + 2.5\nprint(x)"), "3.5\n");
}

#[test]
fn array_store_and_load() {
    assert_eq!(run("let a = [1, 2, 3]\na[1] = 9\nprint(a[1])"), "9\n");
}

#[test]
fn try_catch_division_by_zero() {
    assert_eq!(
        run("try { let z = 1 / 0 } catch e { print(\"caught\") }"),
        "caught\n"
    );
}

#[test]
fn stdlib_math_sqrt() {
    assert_eq!(run("use std::math\nprint(math.sqrt(16.0))"), "4\n");
}

#[test]
fn stdlib_math_constants_and_alias() {
    let out = run("use std::math as m\nprint(m.pow(2.0, 8.0))");
    assert_eq!(out, "256\n");
}

#[test]
fn stdlib_arrays_push_and_len() {
    let source = "use std::arrays\n\
                  let a = [1, 2]\n\
                  arrays.push(a, 3)\n\
                  print(arrays.len(a))";
    assert_eq!(run(source), "3\n");
}

#[test]
fn import_cycle_is_a_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("A.orus"), "use B\npub fn a() { }\n").unwrap();
    fs::write(dir.path().join("B.orus"), "use A\npub fn b() { }\n").unwrap();

    let mut interp = Interpreter::new().with_buffered_output();
    interp.set_std_path(Some(dir.path().to_path_buf()));
    let err = interp
        .interpret("use A\n", "main.orus")
        .expect_err("cycle must fail");
    let InterpretError::Compile(diags) = err else {
        panic!("expected a compile-phase failure");
    };
    assert!(
        diags[0]
            .message
            .contains("Import cycle detected for module `B`"),
        "unexpected message: {}",
        diags[0].message
    );
}

#[test]
fn modules_execute_once() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("noisy.orus"),
        "pub fn ping() -> i32 { return 1 }\nstatic mut count = 0\n",
    )
    .unwrap();
    let mut interp = Interpreter::new().with_buffered_output();
    interp.set_std_path(Some(dir.path().to_path_buf()));
    // Two `use` statements for the same module run its chunk once.
    interp
        .interpret("use noisy\nuse noisy as again\nprint(noisy.ping())", "m.orus")
        .unwrap();
    assert_eq!(interp.output_text(), "1\n");
}

#[test]
fn bytecode_cache_round_trip() {
    let modules = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    fs::write(
        modules.path().join("lib.orus"),
        "pub fn triple(x: i32) -> i32 { return x * 3 }\n",
    )
    .unwrap();

    let source = "use lib\nprint(lib.triple(7))";

    let mut first = Interpreter::new().with_buffered_output();
    first.set_std_path(Some(modules.path().to_path_buf()));
    first.set_cache_path(Some(cache.path().to_path_buf()));
    first.interpret(source, "main.orus").unwrap();
    assert_eq!(first.output_text(), "21\n");

    let cache_file = cache.path().join("lib.obc");
    assert!(cache_file.exists(), "cache file should be written");

    // A second interpreter loads the cached image instead of recompiling.
    let mut second = Interpreter::new().with_buffered_output();
    second.set_std_path(Some(modules.path().to_path_buf()));
    second.set_cache_path(Some(cache.path().to_path_buf()));
    second.interpret(source, "main.orus").unwrap();
    assert_eq!(second.output_text(), "21\n");

    // A corrupt cache file is ignored silently.
    fs::write(&cache_file, b"garbage").unwrap();
    let mut third = Interpreter::new().with_buffered_output();
    third.set_std_path(Some(modules.path().to_path_buf()));
    third.set_cache_path(Some(cache.path().to_path_buf()));
    third.interpret(source, "main.orus").unwrap();
    assert_eq!(third.output_text(), "21\n");
}

#[test]
fn runtime_error_without_handler_reports_kind_and_line() {
    let err = run_err("let a = [1]\nprint(a[5])");
    let InterpretError::Runtime(diag) = err else {
        panic!("expected runtime error");
    };
    assert!(diag.to_string().contains("out of bounds"));
    assert_eq!(diag.span.line, 2);
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let err = run_err("fn main() { let x = 1 / 0 }");
    let InterpretError::Runtime(diag) = err else {
        panic!("expected runtime error");
    };
    assert!(diag.to_string().contains("division by zero"));
}

#[test]
fn signed_overflow_raises_unsigned_wraps() {
    let err = run_err("fn main() { let x = 2147483647 + 1 }");
    assert!(matches!(err, InterpretError::Runtime(_)));

    assert_eq!(
        run("let x: u32 = 4294967295\nprint(x + 1)"),
        "0\n"
    );
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let source = "fn forever(n: i32) -> i32 { return forever(n + 1) }\n\
                  try { let x = forever(0) } catch e { print(\"deep\") }";
    assert_eq!(run(source), "deep\n");
}

#[test]
fn nested_try_catches_innermost_first() {
    let source = "try {\n\
                  \x20   try { let z = 1 % 0 } catch inner { print(\"inner\") }\n\
                  \x20   let y = 2 / 0\n\
                  } catch outer { print(\"outer\") }";
    assert_eq!(run(source), "inner\nouter\n");
}

#[test]
fn catch_binds_the_error_value() {
    let source = "try { let z = 1 / 0 } catch e { print(e) }";
    let out = run(source);
    assert!(out.contains("division by zero"), "got: {}", out);
}

#[test]
fn while_loop_with_break_and_continue() {
    let source = "fn main() {\n\
                  \x20   let mut i = 0\n\
                  \x20   let mut total = 0\n\
                  \x20   while i < 100 {\n\
                  \x20       i += 1\n\
                  \x20       if i % 2 == 0 { continue }\n\
                  \x20       if i > 10 { break }\n\
                  \x20       total += i\n\
                  \x20   }\n\
                  \x20   print(total)\n\
                  }";
    // 1 + 3 + 5 + 7 + 9 = 25
    assert_eq!(run(source), "25\n");
}

#[test]
fn for_loop_with_step_and_range_call() {
    assert_eq!(
        run("fn main() { let mut s = 0\nfor i in 0..10..3 { s += i }\nprint(s) }"),
        "18\n"
    );
    assert_eq!(
        run("fn main() { let mut s = 0\nfor i in range(1, 4) { s += i }\nprint(s) }"),
        "6\n"
    );
}

#[test]
fn structs_fields_and_methods() {
    let source = "struct Point { x: i32, y: i32 }\n\
                  impl Point {\n\
                  \x20   fn sum(p: Point) -> i32 { return p.x + p.y }\n\
                  }\n\
                  fn main() {\n\
                  \x20   let p = Point { x: 3, y: 4 }\n\
                  \x20   p.x = 5\n\
                  \x20   print(p.sum())\n\
                  \x20   print(p.y)\n\
                  }";
    assert_eq!(run(source), "9\n4\n");
}

#[test]
fn generic_struct_instantiation() {
    let source = "struct Box<T> { value: T }\n\
                  fn main() {\n\
                  \x20   let b = Box<f64> { value: 2.5 }\n\
                  \x20   print(b.value)\n\
                  }";
    assert_eq!(run(source), "2.5\n");
}

#[test]
fn match_statement_selects_arm() {
    let source = "fn main() {\n\
                  \x20   let x = 2\n\
                  \x20   match x {\n\
                  \x20       1 => print(\"one\"),\n\
                  \x20       2 => print(\"two\"),\n\
                  \x20       _ => print(\"other\"),\n\
                  \x20   }\n\
                  }";
    assert_eq!(run(source), "two\n");
}

#[test]
fn formatted_print() {
    assert_eq!(
        run("print(\"{} + {} = {}\", 1, 2, 3)"),
        "1 + 2 = 3\n"
    );
}

#[test]
fn ternary_and_logical_operators() {
    assert_eq!(run("print(1 < 2 and 3 < 4 ? \"yes\" : \"no\")"), "yes\n");
    assert_eq!(run("print(false or not true)"), "false\n");
}

#[test]
fn slices_copy_out_of_arrays() {
    assert_eq!(run("let a = [1, 2, 3, 4]\nprint(a[1..3])"), "[2, 3]\n");
}

#[test]
fn casts_between_numeric_types() {
    assert_eq!(run("let a = 3.9\nprint(a as i32)"), "3\n");
    assert_eq!(run("let b = 200\nprint(b as i64)"), "200\n");
}

#[test]
fn bitwise_and_shifts() {
    assert_eq!(run("print(6 & 3)"), "2\n");
    assert_eq!(run("print(1 << 4)"), "16\n");
    assert_eq!(run("print(~0)"), "-1\n");
}

#[test]
fn determinism_same_program_same_output() {
    let source = "fn main() {\n\
                  \x20   let mut s = 0\n\
                  \x20   for i in 0..100 { s += i * i }\n\
                  \x20   print(s)\n\
                  }";
    assert_eq!(run(source), run(source));
}

#[test]
fn garbage_is_collected_while_the_program_stays_correct() {
    // Allocates a few MB of short-lived arrays, crossing the GC threshold
    // many times over.
    let source = "fn main() {\n\
                  \x20   let mut total = 0\n\
                  \x20   for i in 0..20000 {\n\
                  \x20       let a = [i, i, i, i, i, i, i, i]\n\
                  \x20       total += a[7]\n\
                  \x20   }\n\
                  \x20   print(total)\n\
                  }";
    assert_eq!(run(source), "199990000\n");
}

#[test]
fn register_backend_matches_stack_backend() {
    // Top-level straight-line and loop code lowers to the register VM.
    let source = "let mut s = 0\n\
                  let mut i = 0\n\
                  while i < 5 {\n\
                  \x20   s += i\n\
                  \x20   i += 1\n\
                  }\n\
                  print(s)\n\
                  print(\"total {}\", s)";

    let mut stack = Interpreter::new().with_buffered_output();
    stack.interpret(source, "t.orus").unwrap();

    let mut register = Interpreter::new()
        .with_buffered_output()
        .with_backend(Backend::Register);
    register.interpret(source, "t.orus").unwrap();

    assert_eq!(stack.output_text(), register.output_text());
    assert_eq!(stack.output_text(), "10\ntotal 10\n");
}

#[test]
fn register_backend_falls_back_for_calls() {
    let source = "fn double(x: i32) -> i32 { return x * 2 }\nprint(double(21))";
    let mut interp = Interpreter::new()
        .with_buffered_output()
        .with_backend(Backend::Register);
    interp.interpret(source, "t.orus").unwrap();
    assert_eq!(interp.output_text(), "42\n");
}

#[test]
fn semicolons_are_rejected_with_guidance() {
    let err = run_err("print(1);");
    let InterpretError::Compile(diags) = err else {
        panic!("expected compile error");
    };
    assert!(diags[0].message.contains("newline"));
}

#[test]
fn shadowing_rebinds_to_a_new_slot() {
    let source = "fn main() {\n\
                  \x20   let x = 1\n\
                  \x20   let x = x + 1\n\
                  \x20   print(x)\n\
                  }";
    assert_eq!(run(source), "2\n");
}
