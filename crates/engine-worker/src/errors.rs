//! Converts RustPython-level failures into the engine's closed `ErrorKind`
//! set (spec §7), following the error-extraction approach in the embedded
//! interpreter reference (syntax/runtime/module-denied classification).

use engine_common::ErrorKind;
use rustpython_vm::builtins::PyBaseExceptionRef;
use rustpython_vm::{AsObject, VirtualMachine};

#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub traceback: Option<String>,
}

/// Classifies an exception raised during user-code execution. Distinguishes
/// the `ModuleNotAllowed` sentinel (raised by the import hook) from ordinary
/// Python exceptions, which are reported as `UserCodeFailure`.
pub fn classify_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> ClassifiedError {
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "unknown error".to_string());

    if let Some(module_name) = message.strip_prefix("ModuleNotAllowed:") {
        return ClassifiedError {
            kind: ErrorKind::ImportDenied,
            message: format!("import of module '{module_name}' is not permitted"),
            traceback: None,
        };
    }

    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, exc);

    ClassifiedError {
        kind: ErrorKind::UserCodeFailure,
        message,
        traceback: Some(traceback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_not_allowed_prefix_is_stable() {
        let msg = "ModuleNotAllowed:socket";
        assert_eq!(msg.strip_prefix("ModuleNotAllowed:"), Some("socket"));
    }
}
