//! Default native bindings
//!
//! A small set of host functions registered into the globals table at VM
//! start. Natives follow the native ABI only: they receive the argument
//! slice, may allocate through the heap, and report failures by returning
//! Error values rather than unwinding the VM.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::heap::Heap;
use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;

/// Register the default natives
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", native_clock);
    vm.define_native("len", native_len);
    vm.define_native("str", native_str);
    vm.define_native("push", native_push);
    vm.define_native("pop", native_pop);
    vm.define_native("table", native_table);
    vm.define_native("keys", native_keys);
    vm.define_native("error", native_error);
    vm.define_native("error_message", native_error_message);
    vm.define_native("is_error", native_is_error);
}

fn fail(heap: &mut Heap, message: &str) -> Value {
    Value::Obj(heap.new_error(message, None))
}

/// Seconds since the Unix epoch, as a number
fn native_clock(_heap: &mut Heap, _args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}

/// Length of a string, array or table
fn native_len(heap: &mut Heap, args: &[Value]) -> Value {
    let [value] = args else {
        return fail(heap, "len() takes exactly one argument.");
    };
    let Some(handle) = value.as_obj() else {
        return fail(heap, "len() takes a string, array or table.");
    };
    let length = match heap.get(handle) {
        Obj::Str(s) => s.chars.len(),
        Obj::Array(a) => a.items.len(),
        Obj::Table(t) => t.entries.len(),
        _ => return fail(heap, "len() takes a string, array or table."),
    };
    Value::Number(length as f64)
}

/// Render any value as a string
fn native_str(heap: &mut Heap, args: &[Value]) -> Value {
    let [value] = args else {
        return fail(heap, "str() takes exactly one argument.");
    };
    let text = heap.display(*value);
    Value::Obj(heap.intern(&text))
}

/// Append a value to an array; returns the array
fn native_push(heap: &mut Heap, args: &[Value]) -> Value {
    let [array, value] = args else {
        return fail(heap, "push() takes an array and a value.");
    };
    let Some(handle) = array.as_obj() else {
        return fail(heap, "push() takes an array and a value.");
    };
    match heap.get_mut(handle) {
        Obj::Array(a) => a.items.push(*value),
        _ => return fail(heap, "push() takes an array and a value."),
    }
    heap.note_growth(std::mem::size_of::<Value>());
    *array
}

/// Remove and return the last element of an array (nil when empty)
fn native_pop(heap: &mut Heap, args: &[Value]) -> Value {
    let [array] = args else {
        return fail(heap, "pop() takes exactly one array.");
    };
    let Some(handle) = array.as_obj() else {
        return fail(heap, "pop() takes exactly one array.");
    };
    match heap.get_mut(handle) {
        Obj::Array(a) => a.items.pop().unwrap_or(Value::Nil),
        _ => fail(heap, "pop() takes exactly one array."),
    }
}

/// Construct an empty table
fn native_table(heap: &mut Heap, args: &[Value]) -> Value {
    if !args.is_empty() {
        return fail(heap, "table() takes no arguments.");
    }
    Value::Obj(heap.new_table())
}

/// The keys of a table, as an array of strings
fn native_keys(heap: &mut Heap, args: &[Value]) -> Value {
    let [table] = args else {
        return fail(heap, "keys() takes exactly one table.");
    };
    let Some(handle) = table.as_obj() else {
        return fail(heap, "keys() takes exactly one table.");
    };
    let keys: Vec<Value> = match heap.get(handle) {
        Obj::Table(t) => t.entries.iter().map(|(key, _)| Value::Obj(key)).collect(),
        _ => return fail(heap, "keys() takes exactly one table."),
    };
    Value::Obj(heap.new_array(keys))
}

/// Construct an error value: `error(message)` or `error(message, cause)`
fn native_error(heap: &mut Heap, args: &[Value]) -> Value {
    let (message, cause) = match args {
        [message] => (*message, None),
        [message, cause] => (*message, Some(*cause)),
        _ => return fail(heap, "error() takes a message and an optional cause."),
    };
    let cause = match cause {
        None => None,
        Some(value) => match value.as_obj() {
            Some(handle) if matches!(heap.get(handle), Obj::Error(_)) => Some(handle),
            _ => return fail(heap, "error() cause must be an error."),
        },
    };
    let text = heap.stringify(message);
    let interned = heap.intern(&text);
    Value::Obj(heap.alloc(Obj::Error(crate::object::ErrorObj {
        message: interned,
        cause,
    })))
}

/// The message of an error value
fn native_error_message(heap: &mut Heap, args: &[Value]) -> Value {
    let [value] = args else {
        return fail(heap, "error_message() takes exactly one error.");
    };
    let message = value.as_obj().and_then(|handle| match heap.get(handle) {
        Obj::Error(e) => Some(e.message),
        _ => None,
    });
    match message {
        Some(message) => Value::Obj(message),
        None => fail(heap, "error_message() takes exactly one error."),
    }
}

/// Whether a value is an error
fn native_is_error(heap: &mut Heap, args: &[Value]) -> Value {
    let [value] = args else {
        return fail(heap, "is_error() takes exactly one argument.");
    };
    let is_error = value
        .as_obj()
        .is_some_and(|handle| matches!(heap.get(handle), Obj::Error(_)));
    Value::Bool(is_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_config::VmConfig;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run(source: &str) -> String {
        let mut vm = Vm::new(VmConfig::default());
        let buffer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        vm.set_output(buffer.clone());
        vm.interpret(source).expect("program should run");
        let bytes = buffer.borrow().clone();
        String::from_utf8(bytes).expect("valid utf-8 output")
    }

    #[test]
    fn test_len() {
        assert_eq!(run("print len(\"hello\");"), "5\n");
        assert_eq!(run("print len([1, 2, 3]);"), "3\n");
        assert_eq!(run("var t = table(); t[\"a\"] = 1; print len(t);"), "1\n");
    }

    #[test]
    fn test_str_stringifies() {
        assert_eq!(run("print str(42) + \"!\";"), "42!\n");
        assert_eq!(run("print str(nil);"), "nil\n");
    }

    #[test]
    fn test_push_and_pop() {
        assert_eq!(
            run("var a = [1]; push(a, 2); print a; print pop(a); print a;"),
            "[1, 2]\n2\n[1]\n"
        );
        assert_eq!(run("print pop([]);"), "nil\n");
    }

    #[test]
    fn test_tables_and_keys() {
        assert_eq!(
            run("var t = table(); t[\"x\"] = 1; print len(keys(t));"),
            "1\n"
        );
        assert_eq!(run("var t = table(); print t[\"missing\"];"), "nil\n");
    }

    #[test]
    fn test_error_values_flow_like_values() {
        assert_eq!(run("print is_error(error(\"boom\"));"), "true\n");
        assert_eq!(run("print is_error(42);"), "false\n");
        assert_eq!(run("print error_message(error(\"boom\"));"), "boom\n");
    }

    #[test]
    fn test_error_with_cause() {
        let source = "var inner = error(\"inner\"); var outer = error(\"outer\", inner); \
                      print error_message(outer);";
        assert_eq!(run(source), "outer\n");
    }

    #[test]
    fn test_wrong_arity_returns_error_value() {
        assert_eq!(run("print is_error(len());"), "true\n");
    }

    #[test]
    fn test_clock_is_a_number() {
        assert_eq!(run("print clock() > 0;"), "true\n");
    }
}
