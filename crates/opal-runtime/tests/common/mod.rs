//! Shared helpers for the integration suites

// Each suite links its own copy; not every suite uses every helper.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use opal_runtime::VmConfig;
use opal_runtime::{InterpretError, Vm};

/// Run a program, capturing everything it prints
pub fn run_with_config(config: VmConfig, source: &str) -> Result<String, InterpretError> {
    let mut vm = Vm::new(config);
    let buffer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(buffer.clone());
    let result = vm.interpret(source);
    let bytes = buffer.borrow().clone();
    let text = String::from_utf8(bytes).expect("valid utf-8 output");
    result.map(|_| text)
}

/// Run a program under the default configuration
pub fn run(source: &str) -> Result<String, InterpretError> {
    run_with_config(VmConfig::default(), source)
}

/// Run a program that must succeed; returns its output
pub fn run_ok(source: &str) -> String {
    match run(source) {
        Ok(output) => output,
        Err(error) => panic!("program failed:\n{}\nsource:\n{}", error, source),
    }
}

/// The runtime error a failing program produced
#[allow(dead_code)]
pub fn runtime_error(source: &str) -> opal_runtime::RuntimeError {
    match run(source) {
        Err(InterpretError::Runtime(error)) => error,
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

/// The compile errors a rejected program produced
#[allow(dead_code)]
pub fn compile_errors(source: &str) -> Vec<opal_runtime::CompileError> {
    match run(source) {
        Err(InterpretError::Compile(errors)) => errors,
        other => panic!("expected compile errors, got {:?}", other),
    }
}
