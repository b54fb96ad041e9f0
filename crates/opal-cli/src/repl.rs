//! Interactive read-eval-print loop

use std::path::PathBuf;

use opal_config::VmConfig;
use opal_runtime::{InterpretError, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Run the REPL until EOF or `exit`
pub fn run(config: VmConfig) -> anyhow::Result<()> {
    println!("opal {} — 'exit' or Ctrl-D to quit", opal_runtime::VERSION);

    let mut vm = Vm::new(config);
    let mut editor = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("opal> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" {
                    break;
                }
                let _ = editor.add_history_entry(line);
                report(vm.interpret(line));
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => return Err(error.into()),
        }
    }

    if let Some(path) = &history {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.save_history(path);
    }
    Ok(())
}

/// Errors print in their standard formats; the session continues
fn report(result: Result<(), InterpretError>) {
    match result {
        Ok(()) => {}
        Err(InterpretError::Compile(errors)) => {
            for error in errors {
                eprintln!("{}", error);
            }
        }
        Err(InterpretError::Runtime(error)) => eprintln!("{}", error),
    }
}

fn history_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("opal").join("history.txt"))
}
