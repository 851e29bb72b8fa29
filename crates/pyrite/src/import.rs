//! The import system.
//!
//! Process-wide state — registered loaders and the in-flight load table —
//! is shared by all interpreters behind one read-write lock; module
//! *objects* are per-interpreter (heap values cannot cross interpreters),
//! cached in [`ModuleSystem::loaded`]. The `loading` table acts as a
//! per-name barrier: an interpreter that finds another interpreter
//! mid-load on the same name waits on the done-signal, then proceeds
//! against its own cache. Module bodies always execute without the lock
//! held.
//!
//! Circular imports follow the documented contract: the module object is
//! installed in the cache *before* its body runs, so same-interpreter
//! re-entrance observes the partially-populated module.

use std::{
    path::PathBuf,
    rc::Rc,
    sync::{Arc, Condvar, Mutex, OnceLock, RwLock, atomic::{AtomicU64, Ordering}},
};

use ahash::AHashMap;

use crate::{
    bytecode::Code,
    except::{ExcType, RunError, RunResult},
    exception_public::Exception,
    heap::{HeapData, HeapId},
    intern::{Interns, StaticStrings, StringId},
    io::PrintWriter,
    object::Object,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::Module,
    value::Value,
};

use crate::bytecode::vm::Vm;

/// A registered loader: produces a module namespace as boundary values.
pub type ModuleLoader = Arc<dyn Fn() -> Result<Vec<(String, Object)>, String> + Send + Sync>;

/// Compile callback supplied by the embedder for filesystem imports.
pub type CompileFn = Box<dyn Fn(&std::path::Path, &mut Interns) -> Result<Rc<Code>, Exception>>;

/// One in-flight load.
#[derive(Debug)]
struct LoadRecord {
    owner: u64,
    done: bool,
    error: Option<String>,
    /// Interpreters currently parked on the done-signal.
    waiters: usize,
}

/// Process-wide import state.
#[derive(Default)]
pub struct ImportRegistry {
    /// name -> loader. Reads take the read lock; registration the write.
    loaders: RwLock<AHashMap<String, ModuleLoader>>,
    /// name -> in-flight record, with a condvar as the done-signal.
    loading: Mutex<AHashMap<String, LoadRecord>>,
    loading_done: Condvar,
}

/// What `begin_load` decided for this interpreter.
enum BeginOutcome {
    /// This interpreter owns the load and must call `finish_load`.
    Owner,
    /// Another interpreter finished first; its error, if any.
    Waited(Option<String>),
}

impl ImportRegistry {
    /// The shared process-wide registry.
    pub fn global() -> &'static Arc<ImportRegistry> {
        static REGISTRY: OnceLock<Arc<ImportRegistry>> = OnceLock::new();
        REGISTRY.get_or_init(|| Arc::new(ImportRegistry::default()))
    }

    /// Registers (or replaces) a loader under `name`.
    pub fn register_loader(&self, name: &str, loader: ModuleLoader) {
        self.loaders
            .write()
            .expect("loader registry poisoned")
            .insert(name.to_owned(), loader);
    }

    fn loader_for(&self, name: &str) -> Option<ModuleLoader> {
        self.loaders.read().expect("loader registry poisoned").get(name).cloned()
    }

    /// Clears loaders and in-flight records (test isolation).
    pub fn reset(&self) {
        self.loaders.write().expect("loader registry poisoned").clear();
        self.loading.lock().expect("loading table poisoned").clear();
        self.loading_done.notify_all();
    }

    /// Claims the load of `name`, or waits for the current owner.
    ///
    /// Same-interpreter re-entrance is the circular-import path and is
    /// not expected to reach here (the cache hit handles it).
    fn begin_load(&self, name: &str, interp_id: u64) -> BeginOutcome {
        let mut table = self.loading.lock().expect("loading table poisoned");
        let mut waited = false;
        loop {
            match table.get_mut(name) {
                None => {
                    table.insert(
                        name.to_owned(),
                        LoadRecord {
                            owner: interp_id,
                            done: false,
                            error: None,
                            waiters: 0,
                        },
                    );
                    return BeginOutcome::Owner;
                }
                Some(record) if record.owner == interp_id => {
                    // Re-entrant load by the same interpreter; the caller
                    // handles circularity through its cache.
                    return BeginOutcome::Owner;
                }
                Some(record) if record.done => {
                    let error = record.error.clone();
                    if waited {
                        record.waiters -= 1;
                        if record.waiters == 0 {
                            table.remove(name);
                        }
                        self.loading_done.notify_all();
                        return BeginOutcome::Waited(error);
                    }
                    // A completed failure record from an earlier attempt:
                    // it only concerns the interpreters that waited on it.
                    // Reap it once they drain and claim the load fresh.
                    if record.waiters == 0 {
                        table.remove(name);
                        continue;
                    }
                    return BeginOutcome::Waited(error);
                }
                Some(record) => {
                    record.waiters += 1;
                    waited = true;
                    table = self
                        .loading_done
                        .wait(table)
                        .expect("loading table poisoned");
                }
            }
        }
    }

    /// Completes a load this interpreter owned.
    ///
    /// A successful load removes the barrier; a failed one leaves the
    /// error behind for the interpreters still parked on the signal.
    fn finish_load(&self, name: &str, error: Option<String>) {
        let mut table = self.loading.lock().expect("loading table poisoned");
        match error {
            Some(message) => match table.get_mut(name) {
                Some(record) if record.waiters > 0 => {
                    record.done = true;
                    record.error = Some(message);
                }
                _ => {
                    table.remove(name);
                }
            },
            None => {
                table.remove(name);
            }
        }
        self.loading_done.notify_all();
    }
}

static NEXT_INTERP_ID: AtomicU64 = AtomicU64::new(1);

/// Per-interpreter import state.
pub struct ModuleSystem {
    registry: Arc<ImportRegistry>,
    interp_id: u64,
    /// Module search directories, first match wins.
    pub search_paths: Vec<PathBuf>,
    /// Embedder-supplied compiler for `.py` sources.
    pub compile: Option<CompileFn>,
    /// name -> module object (an owned heap reference).
    loaded: AHashMap<String, HeapId>,
    /// Prebuilt modules registered on this interpreter.
    prebuilt: AHashMap<String, Vec<(String, Object)>>,
}

impl std::fmt::Debug for ModuleSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSystem")
            .field("interp_id", &self.interp_id)
            .field("search_paths", &self.search_paths)
            .field("loaded", &self.loaded.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleSystem {
    #[must_use]
    pub fn new(registry: Arc<ImportRegistry>) -> Self {
        Self {
            registry,
            interp_id: NEXT_INTERP_ID.fetch_add(1, Ordering::Relaxed),
            search_paths: Vec::new(),
            compile: None,
            loaded: AHashMap::new(),
            prebuilt: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn loaded_module(&self, name: &str) -> Option<HeapId> {
        self.loaded.get(name).copied()
    }

    pub fn insert_loaded(&mut self, name: &str, module_id: HeapId) {
        self.loaded.insert(name.to_owned(), module_id);
    }

    pub fn remove_loaded(&mut self, name: &str) -> Option<HeapId> {
        self.loaded.remove(name)
    }

    pub fn register_prebuilt(&mut self, name: &str, entries: Vec<(String, Object)>) {
        self.prebuilt.insert(name.to_owned(), entries);
    }

    /// Drains the per-interpreter cache for reset; the caller releases
    /// the returned references against its heap. Pending prebuilt
    /// registrations are cleared alongside.
    pub fn drain_loaded(&mut self) -> Vec<HeapId> {
        self.prebuilt.clear();
        self.loaded.drain().map(|(_, id)| id).collect()
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// `ImportName`: TOS the fromlist (tuple or None), beneath it the
    /// relative level. Pushes the imported module.
    pub(crate) fn op_import_name(&mut self, name_id: StringId) -> RunResult<()> {
        let fromlist = self.pop();
        let level_value = self.pop();
        let level = level_value.as_int().unwrap_or(0);
        level_value.drop_with_heap(self.heap);
        let has_fromlist = !matches!(fromlist, Value::None)
            && crate::value::py_len(&fromlist, self.heap, self.interns).unwrap_or(0) > 0;
        fromlist.drop_with_heap(self.heap);

        let request = self.interns.get_str(name_id).to_owned();
        let absolute = self.resolve_relative(&request, level)?;

        // Import each dotted prefix in order, wiring children onto their
        // parents.
        let parts: Vec<&str> = absolute.split('.').collect();
        let mut parent: Option<HeapId> = None;
        let mut root: Option<HeapId> = None;
        let mut deepest: Option<HeapId> = None;
        let mut prefix = String::new();
        for part in parts {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(part);
            let module_id = self.import_single(&prefix)?;
            if let Some(parent_id) = parent {
                let attr = self.interns.intern(part);
                self.heap.inc_ref(module_id);
                let HeapData::Module(parent_module) = self.heap.get_mut(parent_id) else {
                    return Err(RunError::internal("parent import is not a module"));
                };
                if let Some(old) = parent_module.namespace.insert(attr, Value::Ref(module_id)) {
                    old.drop_with_heap(self.heap);
                }
            }
            if root.is_none() {
                root = Some(module_id);
            }
            deepest = Some(module_id);
            parent = Some(module_id);
        }

        // The fromlist decides which handle lands on the stack.
        let result = if has_fromlist { deepest } else { root };
        let module_id = result.ok_or_else(|| RunError::internal("import resolved no module"))?;
        self.heap.inc_ref(module_id);
        self.push(Value::Ref(module_id));
        Ok(())
    }

    /// `ImportFrom`: pushes the named attribute of the module at TOS.
    pub(crate) fn op_import_from(&mut self, name_id: StringId) -> RunResult<()> {
        let module_value = self.peek();
        let Value::Ref(module_id) = module_value else {
            return Err(RunError::internal("ImportFrom on a non-module"));
        };
        let module_id = *module_id;
        let (found, module_name) = {
            let HeapData::Module(module) = self.heap.get(module_id) else {
                return Err(RunError::internal("ImportFrom on a non-module"));
            };
            (
                module.namespace.get(&name_id).map(|v| v.clone_with_heap(self.heap)),
                self.interns.get_str(module.name).to_owned(),
            )
        };
        match found {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => {
                let attr = self.interns.get_str(name_id).to_owned();
                Err(ExcType::import_error(
                    &module_name,
                    format!("cannot import name '{attr}' from '{module_name}'"),
                ))
            }
        }
    }

    /// `ImportStar`: copies all non-underscore names into globals.
    pub(crate) fn op_import_star(&mut self) -> RunResult<()> {
        let module_value = self.pop();
        let Value::Ref(module_id) = &module_value else {
            module_value.drop_with_heap(self.heap);
            return Err(RunError::internal("ImportStar on a non-module"));
        };
        let module_id = *module_id;
        let entries: Vec<(StringId, Value)> = {
            let HeapData::Module(module) = self.heap.get(module_id) else {
                module_value.drop_with_heap(self.heap);
                return Err(RunError::internal("ImportStar on a non-module"));
            };
            module
                .namespace
                .iter()
                .filter(|(name, _)| !self.interns.get_str(**name).starts_with('_'))
                .map(|(name, value)| (*name, value.clone_with_heap(self.heap)))
                .collect()
        };
        module_value.drop_with_heap(self.heap);
        let globals_id = self.frame().globals;
        for (name, value) in entries {
            let HeapData::Module(globals) = self.heap.get_mut(globals_id) else {
                value.drop_with_heap(self.heap);
                return Err(RunError::internal("frame globals is not a module"));
            };
            if let Some(old) = globals.namespace.insert(name, value) {
                old.drop_with_heap(self.heap);
            }
        }
        Ok(())
    }

    /// Resolves a possibly-relative request to an absolute module name.
    fn resolve_relative(&mut self, request: &str, level: i64) -> RunResult<String> {
        if level <= 0 {
            return Ok(request.to_owned());
        }
        let base = {
            let globals_id = self.frame().globals;
            let HeapData::Module(module) = self.heap.get(globals_id) else {
                return Err(RunError::internal("frame globals is not a module"));
            };
            match module.package {
                Some(package) => self.interns.get_str(package).to_owned(),
                None => {
                    // Derive the package from the module name.
                    let name = self.interns.get_str(module.name);
                    match name.rsplit_once('.') {
                        Some((package, _)) => package.to_owned(),
                        None => String::new(),
                    }
                }
            }
        };
        let mut segments: Vec<&str> = if base.is_empty() { Vec::new() } else { base.split('.').collect() };
        // Level 1 means "the current package"; each extra dot climbs one.
        for _ in 1..level {
            if segments.pop().is_none() {
                return Err(ExcType::import_error(
                    request,
                    "attempted relative import beyond top-level package",
                ));
            }
        }
        if segments.is_empty() {
            return Err(ExcType::import_error(
                request,
                "attempted relative import with no known parent package",
            ));
        }
        let mut absolute = segments.join(".");
        if !request.is_empty() {
            absolute.push('.');
            absolute.push_str(request);
        }
        Ok(absolute)
    }

    /// Imports one absolute module name, using the cache, registered
    /// loaders, prebuilt modules, and the filesystem, in that order.
    pub(crate) fn import_single(&mut self, name: &str) -> RunResult<HeapId> {
        // Cache hit — including the partially-populated module of a
        // circular import in progress on this interpreter.
        if let Some(module_id) = self.modules.loaded_module(name) {
            return Ok(module_id);
        }

        // Prebuilt modules registered by the embedder.
        if let Some(entries) = self.modules.prebuilt.get(name).cloned() {
            let module_id = self.materialize_module(name, &entries)?;
            self.modules.insert_loaded(name, module_id);
            return Ok(module_id);
        }

        // Registered loaders (shared across interpreters).
        if let Some(loader) = self.modules.registry.loader_for(name) {
            let entries = loader().map_err(|message| {
                ExcType::import_error(name, format!("loader for '{name}' failed: {message}"))
            })?;
            let module_id = self.materialize_module(name, &entries)?;
            self.modules.insert_loaded(name, module_id);
            return Ok(module_id);
        }

        // Filesystem search, coordinated through the per-name barrier.
        let Some(source_path) = self.find_module_file(name) else {
            return Err(ExcType::module_not_found(name));
        };

        loop {
            match self.modules.registry.begin_load(name, self.modules.interp_id) {
                BeginOutcome::Owner => break,
                BeginOutcome::Waited(Some(error)) => {
                    // The original executor failed; propagate its error
                    // wrapped with the module name.
                    return Err(ExcType::import_error(name, format!("import of '{name}' failed: {error}")));
                }
                BeginOutcome::Waited(None) => {
                    // Another interpreter finished; its module is not
                    // visible in this heap, so load again here.
                    if let Some(module_id) = self.modules.loaded_module(name) {
                        return Ok(module_id);
                    }
                    break;
                }
            }
        }

        let result = self.load_from_file(name, &source_path);
        match &result {
            Ok(_) => self.modules.registry.finish_load(name, None),
            Err(err) => {
                let message = crate::exception_public::Exception::from_run_error(err, self.interns).to_string();
                self.modules.registry.finish_load(name, Some(message));
            }
        }
        result
    }

    fn find_module_file(&self, name: &str) -> Option<PathBuf> {
        let relative: PathBuf = format!("{}.py", name.replace('.', "/")).into();
        for base in &self.modules.search_paths {
            let candidate = base.join(&relative);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn load_from_file(&mut self, name: &str, path: &std::path::Path) -> RunResult<HeapId> {
        let Some(compile) = self.modules.compile.as_ref() else {
            return Err(ExcType::import_error(name, "no compile callback configured"));
        };
        let code = compile(path, self.interns)
            .map_err(|exc| ExcType::import_error(name, format!("compilation failed: {exc}")))?;

        // Install the module before executing its body so circular
        // imports observe the partial namespace.
        let module_id = self.new_module(name)?;
        self.modules.insert_loaded(name, module_id);

        self.heap.inc_ref(module_id);
        match self.run_module(code, module_id) {
            Ok(result) => {
                result.drop_with_heap(self.heap);
                self.heap.dec_ref(module_id);
                Ok(module_id)
            }
            Err(err) => {
                // A failed load leaves no cache entry behind.
                if let Some(id) = self.modules.remove_loaded(name) {
                    self.heap.dec_ref(id);
                }
                self.heap.dec_ref(module_id);
                Err(err)
            }
        }
    }

    /// Creates an empty module object with package metadata.
    pub(crate) fn new_module(&mut self, name: &str) -> RunResult<HeapId> {
        let name_id = self.interns.intern(name);
        let package = name.rsplit_once('.').map(|(package, _)| package.to_owned());
        let mut module = Module::new(name_id);
        module.package = package.map(|p| self.interns.intern(&p));
        let dunder_name: StringId = StaticStrings::DunderName.into();
        module.namespace.insert(dunder_name, Value::InternString(name_id));
        let id = self.heap.allocate(HeapData::Module(module))?;
        Ok(id)
    }

    /// Builds a module from boundary entries (loaders, prebuilt modules).
    fn materialize_module(&mut self, name: &str, entries: &[(String, Object)]) -> RunResult<HeapId> {
        let module_id = self.new_module(name)?;
        for (attr, object) in entries {
            let attr_id = self.interns.intern(attr);
            let value = crate::object::object_to_value(object, self.heap, self.interns)?;
            let HeapData::Module(module) = self.heap.get_mut(module_id) else {
                value.drop_with_heap(self.heap);
                return Err(RunError::internal("materialize_module on non-module"));
            };
            if let Some(old) = module.namespace.insert(attr_id, value) {
                old.drop_with_heap(self.heap);
            }
        }
        Ok(module_id)
    }
}
