//! Restricted import hook backed by the module store (spec §4.3 "Restricted
//! import"), following the `builtins.__import__` override approach (Option C)
//! the embedded-interpreter reference implementation uses.

use engine_common::model::OrgScope;
use engine_store::ModuleStore;
use rustpython_vm::{function::FuncArgs, AsObject, PyObjectRef, PyResult, VirtualMachine};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;

/// System modules resolvable without going through the module store. Kept
/// deliberately small: no networking, filesystem, or process modules.
pub const DEFAULT_SYSTEM_ALLOWLIST: &[&str] = &[
    "math", "re", "json", "datetime", "collections", "itertools", "functools", "string", "random",
    "sys",
];

thread_local! {
    static CURRENT_ORG: RefCell<Option<OrgScope>> = const { RefCell::new(None) };
    static LOADED_HASHES: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// Binds the current run's org scope for the import hook to read. Must be
/// called before any user import resolves (spec §4.3 "Isolation").
pub fn bind_org_scope(org: OrgScope) {
    CURRENT_ORG.with(|cell| *cell.borrow_mut() = Some(org));
}

/// Clears the thread-local org scope between assignments on a reusable
/// worker (spec §4.3 "Isolation").
pub fn clear_org_scope() {
    CURRENT_ORG.with(|cell| *cell.borrow_mut() = None);
}

/// Evicts import-cache entries for modules whose content hash no longer
/// matches what was last loaded, so the next run sees fresh content
/// (spec §4.3 "Isolation").
pub fn evict_stale_modules(current_hashes: &HashMap<String, String>) {
    LOADED_HASHES.with(|cell| {
        let mut loaded = cell.borrow_mut();
        loaded.retain(|path, hash| current_hashes.get(path) == Some(hash));
    });
}

fn current_org() -> Option<OrgScope> {
    CURRENT_ORG.with(|cell| *cell.borrow())
}

/// Fetches module source from the store for the bound org scope. Runs the
/// async store lookup to completion on a blocking thread — this function is
/// only ever called from inside the worker's dedicated `spawn_blocking` task,
/// never on the async reactor thread.
fn fetch_module_source(store: &ModuleStore, handle: &Handle, module_name: &str) -> Option<(Vec<u8>, String)> {
    let org = current_org()?;
    let org_id = match org {
        OrgScope::Global => None,
        OrgScope::Org(id) => Some(id),
    };
    let path = module_name.replace('.', "/");
    let record = handle
        .block_on(store.get(org_id, &path))
        .ok()
        .flatten()?;
    Some((record.content, record.content_hash))
}

/// Installs the `builtins.__import__` override for the given VM. For
/// allow-listed system modules, delegates to the real import. For any other
/// user-code import, resolves content from `store` and registers it as a
/// module; an unresolvable name raises the `ModuleNotAllowed` sentinel so the
/// caller can classify it as `ImportDenied` (spec §4.3).
pub fn install_import_hook(
    vm: &VirtualMachine,
    store: Arc<ModuleStore>,
    handle: Handle,
    system_allowlist: Arc<HashSet<String>>,
) {
    const SAVED_IMPORT_ATTR: &str = "__engine_original_import__";

    let original_import = if let Ok(saved) = vm.builtins.get_attr(SAVED_IMPORT_ATTR, vm) {
        saved
    } else {
        let real_original = match vm.builtins.get_attr("__import__", vm) {
            Ok(f) => f,
            Err(_) => return,
        };
        let _ = vm
            .builtins
            .set_attr(SAVED_IMPORT_ATTR, real_original.clone(), vm);
        real_original
    };

    #[allow(clippy::arc_with_non_send_sync)]
    let original_import = Arc::new(original_import);

    let hook = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            if system_allowlist.contains(&module_name)
                || system_allowlist.contains(module_name.split('.').next().unwrap_or(""))
            {
                return original_import.call(args, vm);
            }

            match fetch_module_source(&store, &handle, &module_name) {
                Some((source, hash)) => {
                    LOADED_HASHES.with(|cell| {
                        cell.borrow_mut().insert(module_name.clone(), hash);
                    });
                    let source_str = String::from_utf8_lossy(&source).into_owned();
                    let code = vm
                        .compile(
                            &source_str,
                            rustpython_vm::compiler::Mode::Exec,
                            module_name.clone(),
                        )
                        .map_err(|e| vm.new_syntax_error(&e, Some(&source_str)))?;
                    let module = vm.new_module(&module_name, vm.ctx.new_dict(), None);
                    vm.run_code_obj(code, rustpython_vm::scope::Scope::with_builtins(
                        Some(module.dict().expect("module has a dict")),
                        vm.ctx.new_dict(),
                        vm,
                    ))?;
                    Ok(module.into())
                }
                None => Err(vm.new_import_error(
                    format!("ModuleNotAllowed:{module_name}"),
                    vm.ctx.new_str(module_name.clone()),
                )),
            }
        },
    );

    let _ = vm.builtins.set_attr("__import__", hook, vm);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allowlist_contains_only_safe_modules() {
        assert!(DEFAULT_SYSTEM_ALLOWLIST.contains(&"json"));
        assert!(!DEFAULT_SYSTEM_ALLOWLIST.contains(&"socket"));
        assert!(!DEFAULT_SYSTEM_ALLOWLIST.contains(&"subprocess"));
    }

    #[test]
    fn org_scope_binding_round_trips() {
        clear_org_scope();
        assert_eq!(current_org(), None);
        bind_org_scope(OrgScope::Global);
        assert_eq!(current_org(), Some(OrgScope::Global));
        clear_org_scope();
        assert_eq!(current_org(), None);
    }
}
