//! Resource-bound behavior: parameter, constant, jump and frame limits

mod common;

use common::{compile_errors, run_ok, runtime_error};
use pretty_assertions::assert_eq;

/// Build `fun f(p0, p1, …) { } f(0, 1, …);` with the given count
fn function_with_params(count: usize) -> String {
    let params: Vec<String> = (0..count).map(|i| format!("p{}", i)).collect();
    let args: Vec<String> = (0..count).map(|i| i.to_string()).collect();
    format!(
        "fun f({}) {{ }} f({});",
        params.join(", "),
        args.join(", ")
    )
}

#[test]
fn test_255_parameters_are_accepted() {
    assert_eq!(run_ok(&function_with_params(255)), "");
}

#[test]
fn test_256_parameters_are_a_compile_error() {
    let errors = compile_errors(&function_with_params(256));
    assert!(errors
        .iter()
        .any(|e| e.message == "Can't have more than 255 parameters."));
}

#[test]
fn test_256_arguments_are_a_compile_error() {
    let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
    let source = format!("fun f() {{ }} f({});", args.join(", "));
    let errors = compile_errors(&source);
    assert!(errors
        .iter()
        .any(|e| e.message == "Can't have more than 255 arguments."));
}

/// One distinct number literal per statement, one constant each
fn program_with_constants(count: usize) -> String {
    let mut source = String::new();
    for i in 0..count {
        source.push_str(&format!("print {}.5;", i));
    }
    source
}

#[test]
fn test_256_constants_fit_in_one_chunk() {
    let output = run_ok(&program_with_constants(256));
    assert_eq!(output.lines().count(), 256);
}

#[test]
fn test_257th_constant_is_a_compile_error() {
    let errors = compile_errors(&program_with_constants(257));
    assert!(errors
        .iter()
        .any(|e| e.message == "Too many constants in one chunk."));
}

#[test]
fn test_jump_distance_limit() {
    // `print true;` compiles to two bytes and no constants, so a very long
    // then-branch overflows the two-byte jump operand without hitting the
    // constant limit first.
    let mut source = String::from("if (false) { ");
    for _ in 0..33000 {
        source.push_str("print true; ");
    }
    source.push('}');
    let errors = compile_errors(&source);
    assert!(errors
        .iter()
        .any(|e| e.message == "Too much code to jump over."));
}

#[test]
fn test_loop_body_size_limit() {
    let mut source = String::from("while (false) { ");
    for _ in 0..33000 {
        source.push_str("print true; ");
    }
    source.push('}');
    let errors = compile_errors(&source);
    assert!(errors.iter().any(|e| e.message == "Loop body too large."
        || e.message == "Too much code to jump over."));
}

#[test]
fn test_frame_depth_64_is_the_limit() {
    // The script frame occupies one slot; 63 nested calls fit, 64 do not.
    let source = "\
var depth = 0;
fun dive(n) { depth = n; if (n > 0) { dive(n - 1); } }
dive(62);
print depth;";
    assert_eq!(run_ok(source), "0\n");

    let error = runtime_error(
        "fun dive(n) { if (n > 0) { dive(n - 1); } } dive(64);",
    );
    assert_eq!(error.message, "Stack overflow.");
}

#[test]
fn test_deep_but_legal_recursion_unwinds_cleanly() {
    let source = "\
fun sum(n) { if (n == 0) return 0; return n + sum(n - 1); }
print sum(60);";
    assert_eq!(run_ok(source), "1830\n");
}
