//! RustPython VM lifecycle: builds one long-lived interpreter per worker
//! process and runs each assigned target inside it (spec §4.3 "Execution
//! step"), following the embedding approach of the reference interpreter
//! (output capture via replaced `sys.stdout`/`stderr`, `__result__`
//! extraction, fresh import-hook install per run).

use crate::errors::{classify_exception, ClassifiedError};
use crate::import_hook::{self, DEFAULT_SYSTEM_ALLOWLIST};
use crate::output::OutputBuffer;
use engine_common::model::{OrgScope, RunTarget};
use engine_store::ModuleStore;
use rustpython_vm::{
    compiler::Mode, function::FuncArgs, AsObject, Interpreter, PyObjectRef, PyResult, Settings,
    VirtualMachine,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;

pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub return_value: Option<Value>,
    pub error: Option<ClassifiedError>,
}

pub struct PyWorkerRuntime {
    interp: Interpreter,
    store: Arc<ModuleStore>,
    handle: Handle,
    system_allowlist: Arc<HashSet<String>>,
}

impl PyWorkerRuntime {
    pub fn new(store: Arc<ModuleStore>, handle: Handle) -> Self {
        let settings = Settings::default();
        let interp = Interpreter::with_init(settings, |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
        });
        Self {
            interp,
            store,
            handle,
            system_allowlist: Arc::new(
                DEFAULT_SYSTEM_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            ),
        }
    }

    /// Runs one assigned target to completion. Binds org scope before any
    /// import resolves and clears it again before returning, per the
    /// isolation contract in spec §4.3.
    pub fn run(&self, org: OrgScope, target: RunTarget, inputs: Value) -> ExecutionOutcome {
        import_hook::bind_org_scope(org);
        let outcome = self.run_inner(org, target, inputs);
        import_hook::clear_org_scope();
        outcome
    }

    /// Fetches a transient inline code blob directly from the store, by its
    /// opaque id, bypassing the restricted import hook entirely: unlike a
    /// `Module` target, an inline blob is not a dotted import path, is not
    /// reusable across runs, and must not ride on the hook's per-worker
    /// compiled-module cache (spec §3 "transient-code descriptor").
    fn fetch_inline_blob(&self, org: OrgScope, code_blob_id: &str) -> Result<Vec<u8>, ClassifiedError> {
        let org_id = match org {
            OrgScope::Global => None,
            OrgScope::Org(id) => Some(id),
        };
        match self.handle.block_on(self.store.get(org_id, code_blob_id)) {
            Ok(Some(record)) => Ok(record.content),
            Ok(None) => Err(ClassifiedError {
                kind: engine_common::ErrorKind::UserCodeFailure,
                message: format!("inline code blob {code_blob_id:?} was not found"),
                traceback: None,
            }),
            Err(e) => Err(ClassifiedError {
                kind: engine_common::ErrorKind::UserCodeFailure,
                message: format!("failed to fetch inline code blob {code_blob_id:?}: {e}"),
                traceback: None,
            }),
        }
    }

    fn run_inner(&self, org: OrgScope, target: RunTarget, inputs: Value) -> ExecutionOutcome {
        let output = OutputBuffer::new(4 * 1024 * 1024);
        let store = Arc::clone(&self.store);
        let handle = self.handle.clone();
        let allowlist = Arc::clone(&self.system_allowlist);

        // Inline blobs are fetched up front, outside the VM: they execute
        // directly in the entry scope rather than through `__import__`, so
        // there is no module object for the entry harness to call into.
        let inline_source = match &target {
            RunTarget::Inline { code_blob_id, .. } => match self.fetch_inline_blob(org, code_blob_id) {
                Ok(content) => Some(content),
                Err(error) => {
                    return ExecutionOutcome {
                        stdout: String::new(),
                        stderr: String::new(),
                        return_value: None,
                        error: Some(error),
                    };
                }
            },
            RunTarget::Module { .. } => None,
        };

        self.interp.enter(|vm| {
            import_hook::install_import_hook(vm, store, handle, allowlist);
            install_output_capture(vm, output.clone());

            let entry_source = match &target {
                RunTarget::Module { path, function_name } => {
                    let module_name = path.trim_start_matches('/').replace('/', ".");
                    format!(
                        "import json as __json\n__m = __import__({module_name:?})\n__inputs__ = __json.loads(__inputs_json__)\n__result__ = __json.dumps(getattr(__m, {function_name:?})(**__inputs__))\n",
                    )
                }
                RunTarget::Inline { function_name, .. } => {
                    let source = String::from_utf8_lossy(
                        inline_source.as_deref().expect("inline_source populated above"),
                    );
                    format!(
                        "import json as __json\n{source}\n__inputs__ = __json.loads(__inputs_json__)\n__result__ = __json.dumps({function_name}(**__inputs__))\n",
                    )
                }
            };

            let code = match vm.compile(&entry_source, Mode::Exec, "<engine>".to_owned()) {
                Ok(c) => c,
                Err(e) => {
                    let (stdout, stderr) = output.into_strings();
                    return ExecutionOutcome {
                        stdout,
                        stderr,
                        return_value: None,
                        error: Some(ClassifiedError {
                            kind: engine_common::ErrorKind::UserCodeFailure,
                            message: format!("failed to build entry point: {e}"),
                            traceback: None,
                        }),
                    };
                }
            };

            let scope = vm.new_scope_with_builtins();
            let inputs_json = serde_json::to_string(&inputs).unwrap_or_else(|_| "{}".to_string());
            let _ = scope
                .globals
                .set_item("__inputs_json__", vm.ctx.new_str(inputs_json).into(), vm);
            let _ = scope
                .globals
                .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);

            let exec_result = vm.run_code_obj(code, scope.clone());
            let (stdout, stderr) = output.into_strings();

            match exec_result {
                Ok(_) => {
                    let return_value = extract_return_value(vm, &scope);
                    ExecutionOutcome {
                        stdout,
                        stderr,
                        return_value,
                        error: None,
                    }
                }
                Err(exc) => ExecutionOutcome {
                    stdout,
                    stderr,
                    return_value: None,
                    error: Some(classify_exception(vm, &exc)),
                },
            }
        })
    }
}

fn extract_return_value(vm: &VirtualMachine, scope: &rustpython_vm::scope::Scope) -> Option<Value> {
    let locals_obj: PyObjectRef = scope.locals.as_ref().to_owned();
    let result_obj = vm
        .call_method(&locals_obj, "get", (vm.ctx.new_str("__result__"),))
        .ok()?;
    if vm.is_none(&result_obj) {
        return None;
    }
    let as_str = result_obj.str(vm).ok()?;
    serde_json::from_str(as_str.as_str()).ok()
}

fn install_output_capture(vm: &VirtualMachine, output: OutputBuffer) {
    let stdout_obj = build_writer_object(vm, output.clone(), true);
    let stderr_obj = build_writer_object(vm, output, false);
    let _ = vm.sys_module.set_attr("stdout", stdout_obj, vm);
    let _ = vm.sys_module.set_attr("stderr", stderr_obj, vm);
}

fn build_writer_object(vm: &VirtualMachine, output: OutputBuffer, is_stdout: bool) -> PyObjectRef {
    let write_output = output.clone();
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            let result = if is_stdout {
                write_output.write_stdout(data.as_bytes())
            } else {
                write_output.write_stderr(data.as_bytes())
            };
            match result {
                Ok(()) => Ok(vm.ctx.new_int(data.len()).into()),
                Err(e) => Err(vm.new_runtime_error(e.to_string())),
            }
        },
    );
    let flush_fn = vm.new_function("flush", |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        Ok(vm.ctx.none())
    });

    let ns = vm.new_module("<engine-writer>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}
