//! Compile-error and runtime-error behavior

mod common;

use common::{compile_errors, runtime_error};
use pretty_assertions::assert_eq;
use rstest::rstest;

// ===== Compile errors =====

#[test]
fn test_missing_semicolon_format() {
    let errors = compile_errors("print 1");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "[line 1] Error at end: Expect ';' after value.");
}

#[test]
fn test_expect_expression() {
    let errors = compile_errors("print +;");
    assert_eq!(errors[0].to_string(), "[line 1] Error at '+': Expect expression.");
}

#[test]
fn test_panic_mode_synchronizes_at_statement_boundary() {
    // One error per broken statement, not a cascade per token
    let errors = compile_errors("print +;\nprint -;\nprint 1;");
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].line, 1);
    assert_eq!(errors[1].line, 2);
}

#[test]
fn test_scanner_errors_have_no_lexeme_suffix() {
    let errors = compile_errors("var s = \"unterminated");
    assert_eq!(errors[0].to_string(), "[line 1] Error: Unterminated string.");
}

#[rstest]
#[case("var a = a;", "Can't read local variable in its own initializer.")]
#[case("{ var a = 1; var a = 2; }", "Already a variable with this name in this scope.")]
#[case("return 1;", "Can't return from top-level code.")]
#[case("print this;", "Can't use 'this' outside of a class.")]
#[case("print super.x;", "Can't use 'super' outside of a class.")]
#[case(
    "class A { f() { return super.f(); } }",
    "Can't use 'super' in a class with no superclass."
)]
#[case("break;", "Can't use 'break' outside of a loop or switch.")]
#[case("continue;", "Can't use 'continue' outside of a loop.")]
#[case("while (true) { continue; break; } break;", "Can't use 'break' outside of a loop or switch.")]
#[case("class A < A { }", "A class can't inherit from itself.")]
#[case("class A { init() { return 1; } }", "Can't return a value from an initializer.")]
#[case("1 + 2 = 3;", "Invalid assignment target.")]
#[case("defer { print 1; }", "Can't use 'defer' outside of a function.")]
#[case(
    "fun f() { if (true) { defer { print 1; } } }",
    "'defer' must be declared directly in the function body."
)]
#[case(
    "switch (1) { case 1: print 1; case 2: }",
    "A case with no body must be followed by another case."
)]
#[case(
    "switch (1) { default: print 1; case 2: print 2; }",
    "Can't have a case after 'default'."
)]
fn test_compile_error_cases(#[case] source: &str, #[case] message: &str) {
    // `var a = a;` is only a local-initializer error inside a scope
    let wrapped;
    let source = if source.starts_with("var a = a;") {
        wrapped = format!("{{ {} }}", source);
        &wrapped
    } else {
        source
    };
    let errors = compile_errors(source);
    assert!(
        errors.iter().any(|e| e.message == message),
        "expected {:?} in {:?}",
        message,
        errors
    );
}

// ===== Runtime errors =====

#[test]
fn test_undefined_variable_message() {
    assert_eq!(runtime_error("print nope;").message, "Undefined variable 'nope'.");
}

#[test]
fn test_arity_mismatch() {
    let error = runtime_error("fun two(a, b) { } two(1);");
    assert_eq!(error.message, "Expected 2 arguments but got 1.");
}

#[test]
fn test_class_without_init_rejects_arguments() {
    let error = runtime_error("class A { } A(1);");
    assert_eq!(error.message, "Expected 0 arguments but got 1.");
}

#[rstest]
#[case("print 1 - \"x\";", "Operands must be numbers.")]
#[case("print 1 < \"x\";", "Operands must be numbers.")]
#[case("print -nil;", "Operand must be a number.")]
#[case("print nil + false;", "Operands must be two numbers or two strings.")]
#[case("var x = 1; x();", "Can only call functions and classes.")]
#[case("print true.field;", "Only instances have properties.")]
#[case("true.field = 1;", "Only instances have fields.")]
#[case("var t = 1; print t[0];", "Only arrays and tables can be indexed.")]
#[case("var t = table(); print t[0];", "Table key must be a string.")]
#[case("var a = [1]; print a[\"k\"];", "Array index must be a number.")]
#[case("class A { } class B < A { } var x = 1; class C < x { }", "Superclass must be a class.")]
#[case("class A { } print A().missing;", "Undefined property 'missing'.")]
#[case("class A { } A().missing();", "Undefined property 'missing'.")]
fn test_runtime_error_cases(#[case] source: &str, #[case] message: &str) {
    assert_eq!(runtime_error(source).message, message);
}

#[test]
fn test_stack_overflow_on_runaway_recursion() {
    let error = runtime_error("fun loop() { loop(); } loop();");
    assert_eq!(error.message, "Stack overflow.");
    // The trace is capped by the frame limit
    assert!(error.trace.len() <= 64);
}

#[test]
fn test_trace_lists_frames_innermost_first() {
    let source = "\
fun third() { return 1 + nil; }
fun second() { third(); }
fun first() { second(); }
first();";
    let error = runtime_error(source);
    let names: Vec<Option<&str>> = error.trace.iter().map(|f| f.name.as_deref()).collect();
    assert_eq!(
        names,
        vec![Some("third"), Some("second"), Some("first"), None]
    );
    assert_eq!(error.trace[0].line, 1);
    assert_eq!(error.trace[3].line, 4);
}

#[test]
fn test_vm_recovers_after_runtime_error() {
    use opal_runtime::VmConfig;
    use opal_runtime::Vm;

    let mut vm = Vm::new(VmConfig {
        suppress_print: true,
        ..VmConfig::default()
    });
    assert!(vm.interpret("print nope;").is_err());
    // The stack was reset; further programs run normally
    assert!(vm.interpret("var x = 1; print x;").is_ok());
}
