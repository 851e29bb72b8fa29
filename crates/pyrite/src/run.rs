//! The embedder-facing interpreter.
//!
//! An [`Interp`] owns one heap, one interner, one builtins namespace, and
//! one module cache. `execute` runs a code object in the persistent
//! `__main__` module; `execute_in_module` targets a named module;
//! `execute_with_cancel` threads a cancellation handle through the
//! dispatch loop's periodic poll. The import registry and userdata
//! metatable index are process-wide and reset together via
//! [`Interp::reset_modules`].

use std::{path::PathBuf, rc::Rc, sync::Arc};

use ahash::AHashMap;

use crate::{
    builtins::{Builtins, NativeFn, kernel_namespace},
    bytecode::{Code, CodeBuilder, vm::Vm},
    exception_public::Exception,
    heap::{Heap, HeapId},
    import::{CompileFn, ImportRegistry, ModuleLoader, ModuleSystem},
    intern::{Interns, StringId},
    io::{PrintWriter, StdPrint},
    object::Object,
    resource::{CancelHandle, DEFAULT_CHECK_INTERVAL, LimitedTracker, NoLimitTracker, ResourceLimits, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    value::Value,
};

/// One interpreter instance.
///
/// Single-threaded; only the import registry and the userdata metatable
/// index are shared with other interpreters.
pub struct Interp<T: ResourceTracker = NoLimitTracker> {
    heap: Heap<T>,
    interns: Interns,
    builtins: AHashMap<StringId, Value>,
    natives: Vec<NativeFn>,
    modules: ModuleSystem,
    check_interval: u32,
    /// The persistent `__main__` module for plain `execute` calls.
    main_module: Option<HeapId>,
}

impl Default for Interp<NoLimitTracker> {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp<NoLimitTracker> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracker(NoLimitTracker)
    }
}

impl Interp<LimitedTracker> {
    #[must_use]
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self::with_tracker(LimitedTracker::new(limits))
    }
}

impl<T: ResourceTracker> Interp<T> {
    #[must_use]
    pub fn with_tracker(tracker: T) -> Self {
        let mut interns = Interns::new();
        let builtins = kernel_namespace(&mut interns);
        Self {
            heap: Heap::new(tracker),
            interns,
            builtins,
            natives: Vec::new(),
            modules: ModuleSystem::new(Arc::clone(ImportRegistry::global())),
            check_interval: DEFAULT_CHECK_INTERVAL,
            main_module: None,
        }
    }

    /// The interner, for assembling code objects against this interpreter.
    pub fn interns_mut(&mut self) -> &mut Interns {
        &mut self.interns
    }

    /// Starts a code-object builder bound to this interpreter's interner.
    pub fn builder(&mut self, name: &str, filename: &str) -> CodeBuilder<'_> {
        CodeBuilder::new(&mut self.interns, name, filename)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Instructions between cancellation/deadline polls (default 1000).
    pub fn set_check_interval(&mut self, interval: u32) {
        self.check_interval = interval.max(1);
    }

    /// Adds a directory to the module search path.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.modules.search_paths.push(path.into());
    }

    /// Supplies the compiler used for filesystem imports.
    pub fn set_compile_callback(&mut self, compile: CompileFn) {
        self.modules.compile = Some(compile);
    }

    /// Registers a native builtin under `name`.
    pub fn register_builtin(&mut self, name: &str, native: NativeFn) {
        let index = u32::try_from(self.natives.len()).expect("native registry overflow");
        self.natives.push(native);
        let name_id = self.interns.intern(name);
        self.builtins.insert(name_id, Value::Builtin(Builtins::Native(index)));
    }

    /// Registers a prebuilt module on this interpreter.
    pub fn register_module(&mut self, name: &str, entries: Vec<(String, Object)>) {
        self.modules.register_prebuilt(name, entries);
    }

    /// Registers a loader in the process-wide registry.
    pub fn register_loader(name: &str, loader: ModuleLoader) {
        ImportRegistry::global().register_loader(name, loader);
    }

    /// Installs a userdata value as a resolvable global name.
    ///
    /// The value's methods and properties come from the metatable
    /// registered under `type_id`.
    pub fn install_userdata(
        &mut self,
        name: &str,
        type_id: crate::types::userdata::MetaTypeId,
        data: Box<dyn crate::types::userdata::UserValue>,
    ) -> Result<(), Exception> {
        let userdata = crate::types::UserData { type_id, data };
        let id = self
            .heap
            .allocate(crate::heap::HeapData::UserData(userdata))
            .map_err(|err| Exception::from_run_error(&err.into(), &self.interns))?;
        let name_id = self.interns.intern(name);
        if let Some(old) = self.builtins.insert(name_id, Value::Ref(id)) {
            old.drop_with_heap(&mut self.heap);
        }
        Ok(())
    }

    /// Clears loaded modules, in-flight loads, and the metatable index.
    pub fn reset_modules(&mut self) {
        for module_id in self.modules.drain_loaded() {
            self.heap.dec_ref(module_id);
        }
        if let Some(main_id) = self.main_module.take() {
            self.heap.dec_ref(main_id);
        }
        ImportRegistry::global().reset();
        crate::types::userdata::reset_metatables();
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs a code object in `__main__`, printing to stdout.
    pub fn execute(&mut self, code: &Rc<Code>) -> Result<Object, Exception> {
        let mut print = StdPrint::new();
        self.execute_with(code, &mut print, &mut NoopTracer)
    }

    /// Runs with a cancellation handle polled every check interval.
    pub fn execute_with_cancel(&mut self, code: &Rc<Code>, handle: CancelHandle) -> Result<Object, Exception> {
        let mut print = StdPrint::new();
        self.run_in_module(code, None, &mut print, &mut NoopTracer, Some(handle))
    }

    /// Runs in a named module's namespace (created on first use).
    pub fn execute_in_module(&mut self, code: &Rc<Code>, module_name: &str) -> Result<Object, Exception> {
        let mut print = StdPrint::new();
        self.run_in_module(code, Some(module_name), &mut print, &mut NoopTracer, None)
    }

    /// Runs with explicit print writer and tracer.
    pub fn execute_with(
        &mut self,
        code: &Rc<Code>,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> Result<Object, Exception> {
        self.run_in_module(code, None, print, tracer, None)
    }

    fn run_in_module(
        &mut self,
        code: &Rc<Code>,
        module_name: Option<&str>,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
        cancel: Option<CancelHandle>,
    ) -> Result<Object, Exception> {
        let mut vm = Vm::new(
            &mut self.heap,
            &mut self.interns,
            &self.builtins,
            &self.natives,
            print,
            tracer,
            &mut self.modules,
            self.check_interval,
            cancel,
        );

        // Resolve (or create) the target module.
        let module_id = match module_name {
            Some(name) => match vm.modules.loaded_module(name) {
                Some(id) => id,
                None => {
                    let id = match vm.new_module(name) {
                        Ok(id) => id,
                        Err(err) => return Err(Exception::from_run_error(&err, vm.interns)),
                    };
                    vm.modules.insert_loaded(name, id);
                    id
                }
            },
            None => match self.main_module {
                Some(id) => id,
                None => {
                    let id = match vm.new_module("__main__") {
                        Ok(id) => id,
                        Err(err) => return Err(Exception::from_run_error(&err, vm.interns)),
                    };
                    self.main_module = Some(id);
                    id
                }
            },
        };

        match vm.run_module(Rc::clone(code), module_id) {
            Ok(value) => {
                let object = crate::object::value_to_object(&value, vm.heap, vm.interns);
                value.drop_with_heap(vm.heap);
                Ok(object)
            }
            Err(err) => Err(Exception::from_run_error(&err, vm.interns)),
        }
    }

    /// Snapshot of live heap objects (test support).
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    #[test]
    fn executes_a_trivial_module() {
        let mut interp = Interp::new();
        let code = {
            let mut b = interp.builder("<module>", "test.py");
            b.load_int(41);
            b.load_int(1);
            b.op(Opcode::BinaryAdd);
            b.ret();
            b.finish()
        };
        let result = interp.execute(&code).unwrap();
        assert_eq!(result, Object::Int(42));
    }

    #[test]
    fn main_module_persists_between_executions() {
        let mut interp = Interp::new();
        let store = {
            let mut b = interp.builder("<module>", "test.py");
            b.load_int(7);
            b.store_global("x");
            b.op(Opcode::LoadNone);
            b.ret();
            b.finish()
        };
        interp.execute(&store).unwrap();
        let load = {
            let mut b = interp.builder("<module>", "test.py");
            b.load_global("x");
            b.ret();
            b.finish()
        };
        assert_eq!(interp.execute(&load).unwrap(), Object::Int(7));
    }
}
