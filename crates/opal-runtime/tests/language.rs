//! End-to-end language behavior

mod common;

use common::{run_ok, runtime_error};
use pretty_assertions::assert_eq;
use rstest::rstest;

// ===== Closures =====

#[test]
fn test_closures_close_over_variables() {
    let source = "\
fun makeCounter() { var i = 0; fun c() { i = i + 1; print i; } return c; }
var c = makeCounter(); c(); c(); c();";
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn test_sibling_closures_share_one_upvalue() {
    let source = "\
var get; var set;
{
  var shared = 1;
  fun read() { print shared; }
  fun write(v) { shared = v; }
  get = read; set = write;
}
get(); set(9); get();";
    assert_eq!(run_ok(source), "1\n9\n");
}

#[test]
fn test_upvalue_closes_at_scope_exit() {
    let source = "\
var f;
{
  var captured = \"before\";
  fun show() { print captured; }
  captured = \"after\";
  f = show;
}
f();";
    assert_eq!(run_ok(source), "after\n");
}

#[test]
fn test_recursion() {
    let source = "\
fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
print fib(10);";
    assert_eq!(run_ok(source), "55\n");
}

// ===== Classes =====

#[test]
fn test_method_dispatch_and_initializer_return() {
    let source = "\
class A { init(x) { this.x = x; } get() { return this.x; } }
var a = A(42); print a.get();";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn test_superclass_method_via_super() {
    let source = "\
class P { greet() { print \"P\"; } }
class C < P { greet() { super.greet(); print \"C\"; } }
C().greet();";
    assert_eq!(run_ok(source), "P\nC\n");
}

#[test]
fn test_inherited_method_without_override() {
    let source = "\
class P { hello() { print \"hi\"; } }
class C < P { }
C().hello();";
    assert_eq!(run_ok(source), "hi\n");
}

#[test]
fn test_bound_method_keeps_receiver() {
    let source = "\
class Box { init(v) { this.v = v; } show() { print this.v; } }
var m = Box(7).show;
m();";
    assert_eq!(run_ok(source), "7\n");
}

#[test]
fn test_field_shadows_method_on_invoke() {
    let source = "\
class T { hit() { print \"method\"; } }
var t = T();
fun replacement() { print \"field\"; }
t.hit = replacement;
t.hit();";
    assert_eq!(run_ok(source), "field\n");
}

#[test]
fn test_init_returns_the_instance() {
    let source = "\
class A { init() { this.tag = \"made\"; } }
var a = A();
print a.tag;";
    assert_eq!(run_ok(source), "made\n");
}

#[test]
fn test_bare_return_in_init_yields_this() {
    let source = "\
class A { init(n) { this.n = n; if (n == 0) return; this.n = n + 1; } }
print A(0).n; print A(5).n;";
    assert_eq!(run_ok(source), "0\n6\n");
}

// ===== Control flow =====

#[test]
fn test_break_exits_innermost_loop_only() {
    let source = "\
for (var i = 0; i < 3; i = i + 1) { \
for (var j = 0; j < 3; j = j + 1) { if (j == 1) break; print j; } print i; }";
    assert_eq!(run_ok(source), "0\n0\n0\n1\n0\n2\n");
}

#[test]
fn test_continue_runs_the_increment() {
    let source = "\
for (var i = 0; i < 5; i = i + 1) { if (i == 2) continue; print i; }";
    assert_eq!(run_ok(source), "0\n1\n3\n4\n");
}

#[test]
fn test_while_with_break_and_continue() {
    let source = "\
var i = 0;
while (true) {
  i = i + 1;
  if (i == 2) continue;
  if (i > 4) break;
  print i;
}
print \"done\";";
    assert_eq!(run_ok(source), "1\n3\n4\ndone\n");
}

#[test]
fn test_break_pops_block_locals() {
    let source = "\
var x = \"outer\";
for (var i = 0; i < 3; i = i + 1) { var inner = i * 10; if (i == 1) break; print inner; }
print x;";
    assert_eq!(run_ok(source), "0\nouter\n");
}

#[rstest]
#[case("if (1 < 2) print \"yes\"; else print \"no\";", "yes\n")]
#[case("if (2 < 1) print \"yes\"; else print \"no\";", "no\n")]
#[case("print true and \"second\";", "second\n")]
#[case("print false and \"second\";", "false\n")]
#[case("print false or \"fallback\";", "fallback\n")]
#[case("print \"first\" or \"fallback\";", "first\n")]
fn test_branches_and_logic(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_ok(source), expected);
}

// ===== Switch =====

#[test]
fn test_switch_selects_matching_case() {
    let source = "\
switch (2) { case 1: print \"one\"; case 2: print \"two\"; case 3: print \"three\"; }";
    assert_eq!(run_ok(source), "two\n");
}

#[test]
fn test_switch_default() {
    let source = "\
switch (9) { case 1: print \"one\"; default: print \"other\"; }";
    assert_eq!(run_ok(source), "other\n");
}

#[test]
fn test_empty_case_falls_through_to_next_body() {
    let source = "\
switch (1) { case 1: case 2: print \"low\"; default: print \"high\"; }
switch (2) { case 1: case 2: print \"low\"; default: print \"high\"; }
switch (3) { case 1: case 2: print \"low\"; default: print \"high\"; }";
    assert_eq!(run_ok(source), "low\nlow\nhigh\n");
}

#[test]
fn test_switch_scrutinee_evaluated_once() {
    let source = "\
var calls = 0;
fun probe() { calls = calls + 1; return 2; }
switch (probe()) { case 1: print \"one\"; case 2: print \"two\"; }
print calls;";
    assert_eq!(run_ok(source), "two\n1\n");
}

#[test]
fn test_switch_inside_loop_with_continue() {
    let source = "\
for (var i = 0; i < 3; i = i + 1) { switch (i) { case 1: continue; default: print i; } }";
    assert_eq!(run_ok(source), "0\n2\n");
}

#[test]
fn test_explicit_break_in_case_body() {
    let source = "\
switch (1) { case 1: print \"a\"; break; default: print \"d\"; }";
    assert_eq!(run_ok(source), "a\n");
}

// ===== Defer =====

#[test]
fn test_defer_runs_at_return_fifo() {
    let source = "\
fun f() { defer { print \"a\"; } defer { print \"b\"; } print \"body\"; }
f();";
    assert_eq!(run_ok(source), "body\na\nb\n");
}

#[test]
fn test_defer_runs_before_every_return() {
    let source = "\
fun pick(n) { defer { print \"cleanup\"; } if (n > 0) { return \"pos\"; } return \"neg\"; }
print pick(1); print pick(-1);";
    assert_eq!(run_ok(source), "cleanup\npos\ncleanup\nneg\n");
}

#[test]
fn test_defer_sees_final_variable_values() {
    let source = "\
fun f() { var state = \"start\"; defer { print state; } state = \"end\"; }
f();";
    // The defer body closes over the variable, not its value at the
    // declaration point.
    assert_eq!(run_ok(source), "end\n");
}

#[test]
fn test_defer_in_method() {
    let source = "\
class R { go() { defer { print \"after\"; } print \"during\"; } }
R().go();";
    assert_eq!(run_ok(source), "during\nafter\n");
}

// ===== Strings and arithmetic =====

#[test]
fn test_mixed_add_stringifies_numeric_add_does_not() {
    assert_eq!(run_ok("print \"n=\" + 3; print 1 + 2;"), "n=3\n3\n");
}

#[rstest]
#[case("print 1 + 2 * 3 - 4 / 2;", "5\n")]
#[case("print (1 + 2) * (3 - 1);", "6\n")]
#[case("print -(-3);", "3\n")]
#[case("print 0.5 + 0.25;", "0.75\n")]
#[case("print \"a\" + \"b\" + \"c\";", "abc\n")]
#[case("print \"v\" + nil;", "vnil\n")]
#[case("print true + \"!\";", "true!\n")]
fn test_arithmetic_table(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_ok(source), expected);
}

#[test]
fn test_string_equality_is_identity_after_interning() {
    let source = "print \"he\" + \"llo\" == \"hello\"; print \"a\" == \"b\";";
    assert_eq!(run_ok(source), "true\nfalse\n");
}

#[test]
fn test_equality_requires_matching_types() {
    assert_eq!(
        run_ok("print 0 == false; print nil == false; print 1 == 1;"),
        "false\nfalse\ntrue\n"
    );
}

// ===== Arrays and tables =====

#[test]
fn test_array_literals_preserve_order() {
    assert_eq!(run_ok("print [1, 2, 3];"), "[1, 2, 3]\n");
    assert_eq!(run_ok("print [];"), "[]\n");
    assert_eq!(run_ok("print [1, [2, 3], \"x\"];"), "[1, [2, 3], x]\n");
}

#[test]
fn test_array_index_read_and_write() {
    let source = "var a = [10, 20, 30]; print a[1]; a[1] = 99; print a; print a[0] + a[1];";
    assert_eq!(run_ok(source), "20\n[10, 99, 30]\n109\n");
}

#[rstest]
#[case("var a = [1, 2, 3, 4]; print a[1:3];", "[2, 3]\n")]
#[case("var a = [1, 2, 3, 4]; print a[:2];", "[1, 2]\n")]
#[case("var a = [1, 2, 3, 4]; print a[2:];", "[3, 4]\n")]
#[case("var a = [1, 2, 3, 4]; print a[:];", "[1, 2, 3, 4]\n")]
#[case("var a = [1, 2, 3, 4]; print a[2:2];", "[]\n")]
fn test_array_slices(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_ok(source), expected);
}

#[test]
fn test_slice_copies_rather_than_aliases() {
    let source = "var a = [1, 2, 3]; var b = a[:]; b[0] = 99; print a[0]; print b[0];";
    assert_eq!(run_ok(source), "1\n99\n");
}

#[test]
fn test_table_index_with_string_keys() {
    let source = "\
var t = table();
t[\"name\"] = \"opal\";
t[\"count\"] = 2;
print t[\"name\"]; print t[\"count\"]; print t[\"missing\"];";
    assert_eq!(run_ok(source), "opal\n2\nnil\n");
}

#[test]
fn test_array_out_of_bounds_is_runtime_error() {
    assert_eq!(
        runtime_error("var a = [1]; print a[3];").message,
        "Array index out of bounds."
    );
    assert_eq!(
        runtime_error("var a = [1]; a[3] = 0;").message,
        "Array index out of bounds."
    );
}

#[test]
fn test_invalid_slice_range_is_runtime_error() {
    assert_eq!(
        runtime_error("var a = [1, 2]; print a[2:1];").message,
        "Invalid slice range."
    );
    assert_eq!(
        runtime_error("var a = [1, 2]; print a[0:9];").message,
        "Invalid slice range."
    );
}

// ===== Scoping =====

#[test]
fn test_shadowing_restores_outer_binding() {
    let source = "\
var x = \"outer\";
{ var x = \"inner\"; print x; }
print x;";
    assert_eq!(run_ok(source), "inner\nouter\n");
}

#[test]
fn test_globals_are_late_bound() {
    let source = "\
fun show() { print value; }
var value = \"late\";
show();";
    assert_eq!(run_ok(source), "late\n");
}
