//! Native CPU-model modules loaded at run time.
//!
//! A module is a shared library exporting four C symbols:
//!
//! * `cosim_elaborate(*const CosimEnvironment) -> *mut c_void` creates the model (which
//!   typically spawns its own execution thread) and returns an opaque model pointer, or null if
//!   it created nothing;
//! * `cosim_notify(*mut c_void)` is called on the kernel thread for every notification the
//!   model requested;
//! * `cosim_irq(*mut c_void, u64 line, u64 value)` delivers a forwarded interrupt;
//! * `cosim_destroy(*mut c_void)` tears the model down. It must join any thread the model
//!   started; no callback may be running or called once it returns.
//!
//! The model talks back through the [`CosimEnvironment`] callback table, which stays valid
//! until `cosim_destroy` has returned.
//!
//! A shared library can only be mapped once per process, so its globals would be shared by
//! every instance. [`ModuleRegistry`] counts live instances per canonical path: the first
//! instance loads the file in place, later ones load a private copy that is deleted again when
//! the instance goes away.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use cosim_mem::{IrqSink, Response, Transaction};
use libloading::Library;

use crate::error::{BridgeError, Result};
use crate::executor::Executor;
use crate::sched::QuantumExit;
use crate::shared::BridgeHandle;

#[derive(Debug, Default)]
struct Entry {
    live: usize,
    copies_made: u64,
}

/// Process-wide bookkeeping of loaded module files.
#[derive(Clone, Debug, Default)]
pub struct ModuleRegistry {
    entries: Arc<Mutex<HashMap<PathBuf, Entry>>>,
    copy_dir: Option<PathBuf>,
}

static GLOBAL_REGISTRY: LazyLock<ModuleRegistry> = LazyLock::new(ModuleRegistry::new);

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose private copies are written to `dir` instead of the system temp dir.
    pub fn with_copy_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            entries: Arc::default(),
            copy_dir: Some(dir.into()),
        }
    }

    pub fn global() -> ModuleRegistry {
        GLOBAL_REGISTRY.clone()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live instances of the module at `path`.
    pub fn live_instances(&self, path: impl AsRef<Path>) -> usize {
        let Ok(canonical) = path.as_ref().canonicalize() else {
            return 0;
        };
        self.entries().get(&canonical).map_or(0, |e| e.live)
    }

    /// Reserves an instance slot for the module at `path` and returns the file to load.
    pub fn acquire(&self, path: impl AsRef<Path>) -> Result<ModuleLease> {
        let path = path.as_ref();
        let canonical = path
            .canonicalize()
            .map_err(|source| BridgeError::ModuleNotFound {
                path: path.to_path_buf(),
                source,
            })?;

        let mut entries = self.entries();
        let entry = entries.entry(canonical.clone()).or_default();
        let copy = if entry.live == 0 {
            None
        } else {
            entry.copies_made += 1;
            let copy = self.copy_path(&canonical, entry.copies_made);
            std::fs::copy(&canonical, &copy).map_err(|source| BridgeError::ModuleCopy {
                path: canonical.clone(),
                source,
            })?;
            tracing::debug!(
                original = %canonical.display(),
                copy = %copy.display(),
                "loading module from a private copy"
            );
            Some(copy)
        };
        entry.live += 1;

        Ok(ModuleLease {
            registry: self.clone(),
            canonical,
            copy,
        })
    }

    fn copy_path(&self, canonical: &Path, n: u64) -> PathBuf {
        let dir = self.copy_dir.clone().unwrap_or_else(std::env::temp_dir);
        let stem = canonical
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".into());
        let mut name = format!("{stem}.{}.{n}", std::process::id());
        if let Some(ext) = canonical.extension() {
            name.push('.');
            name.push_str(&ext.to_string_lossy());
        }
        dir.join(name)
    }

    fn release(&self, canonical: &Path) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(canonical) {
            entry.live = entry.live.saturating_sub(1);
            if entry.live == 0 {
                entries.remove(canonical);
            }
        }
    }
}

/// One live module instance. Dropping it releases the slot and deletes the private copy.
#[derive(Debug)]
pub struct ModuleLease {
    registry: ModuleRegistry,
    canonical: PathBuf,
    copy: Option<PathBuf>,
}

impl ModuleLease {
    /// The file this instance should load.
    pub fn path(&self) -> &Path {
        self.copy.as_deref().unwrap_or(&self.canonical)
    }

    pub fn is_copy(&self) -> bool {
        self.copy.is_some()
    }

    pub fn original(&self) -> &Path {
        &self.canonical
    }
}

impl Drop for ModuleLease {
    fn drop(&mut self) {
        if let Some(copy) = &self.copy {
            if let Err(err) = std::fs::remove_file(copy) {
                tracing::warn!(copy = %copy.display(), "failed to remove module copy: {err}");
            }
        }
        self.registry.release(&self.canonical);
    }
}

/// Bus transaction as seen across the C boundary.
#[repr(C)]
#[derive(Debug)]
pub struct CosimPayload {
    pub address: u64,
    pub data: *mut u8,
    pub size: u32,
    /// Non-zero for writes.
    pub is_write: u32,
    /// Filled in by the bridge: one of the `COSIM_RESPONSE_*` constants.
    pub response: i32,
}

pub const COSIM_RESPONSE_OK: i32 = 0;
pub const COSIM_RESPONSE_ADDRESS_ERROR: i32 = 1;
pub const COSIM_RESPONSE_INCOMPLETE: i32 = 2;

pub const COSIM_QUANTUM_CONTINUE: i32 = 0;
pub const COSIM_QUANTUM_STOPPED: i32 = 1;

/// Callback table handed to `cosim_elaborate`. Every callback takes `ctx` as first argument.
///
/// `end_of_quantum`, `wait_ready` and `memory_transport` may only be called from the model's
/// single execution thread. The others may be called from any thread, including from inside
/// `cosim_notify`.
///
/// `get_string_param` and `param_name` copy a NUL-terminated string into `buf` (truncating to
/// `cap`) and return its full length, or `-1` if there is no such parameter.
#[repr(C)]
pub struct CosimEnvironment {
    pub ctx: *mut c_void,
    pub get_time_ns: extern "C" fn(*mut c_void) -> u64,
    pub request_notify: extern "C" fn(*mut c_void, u64),
    pub request_stop: extern "C" fn(*mut c_void),
    pub get_uint_param: extern "C" fn(*mut c_void, *const c_char) -> u64,
    pub get_int_param: extern "C" fn(*mut c_void, *const c_char) -> i64,
    pub get_string_param: extern "C" fn(*mut c_void, *const c_char, *mut c_char, usize) -> isize,
    pub set_uint_param: extern "C" fn(*mut c_void, *const c_char, u64),
    pub param_count: extern "C" fn(*mut c_void) -> usize,
    /// Name of the `index`-th parameter, in name order.
    pub param_name: extern "C" fn(*mut c_void, usize, *mut c_char, usize) -> isize,
    pub end_of_quantum: extern "C" fn(*mut c_void) -> i32,
    pub wait_ready: extern "C" fn(*mut c_void),
    pub memory_transport: extern "C" fn(*mut c_void, *mut CosimPayload),
}

/// What the callback table's `ctx` points at.
struct ModuleContext {
    handle: BridgeHandle,
    exec: Mutex<Executor>,
}

impl ModuleContext {
    fn exec(&self) -> MutexGuard<'_, Executor> {
        self.exec.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn with_ctx<R: Default>(ctx: *mut c_void, f: impl FnOnce(&ModuleContext) -> R) -> R {
    if ctx.is_null() {
        return R::default();
    }
    // SAFETY: `ctx` is the pointer placed in the environment by `CpuModule`, which frees it
    // only after `cosim_destroy` has returned.
    f(unsafe { &*(ctx as *const ModuleContext) })
}

fn c_name<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    // SAFETY: modules pass NUL-terminated parameter names.
    unsafe { CStr::from_ptr(name) }.to_str().ok()
}

fn copy_out(value: Option<String>, buf: *mut c_char, cap: usize) -> isize {
    let Some(value) = value else {
        return -1;
    };
    let bytes = value.as_bytes();
    if !buf.is_null() && cap > 0 {
        let n = bytes.len().min(cap - 1);
        // SAFETY: the caller provides `cap` writable bytes at `buf`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.cast::<u8>(), n);
            *buf.add(n) = 0;
        }
    }
    isize::try_from(bytes.len()).unwrap_or(isize::MAX)
}

extern "C" fn env_get_time_ns(ctx: *mut c_void) -> u64 {
    with_ctx(ctx, |c| c.handle.now_ns())
}

extern "C" fn env_request_notify(ctx: *mut c_void, delay_ns: u64) {
    with_ctx(ctx, |c| c.handle.request_notify(delay_ns))
}

extern "C" fn env_request_stop(ctx: *mut c_void) {
    with_ctx(ctx, |c| {
        c.handle.request_stop();
    })
}

extern "C" fn env_get_uint_param(ctx: *mut c_void, name: *const c_char) -> u64 {
    with_ctx(ctx, |c| {
        c_name(name)
            .and_then(|n| c.handle.params().get_uint(n))
            .unwrap_or(0)
    })
}

extern "C" fn env_get_int_param(ctx: *mut c_void, name: *const c_char) -> i64 {
    with_ctx(ctx, |c| {
        c_name(name)
            .and_then(|n| c.handle.params().get_int(n))
            .unwrap_or(0)
    })
}

extern "C" fn env_get_string_param(
    ctx: *mut c_void,
    name: *const c_char,
    buf: *mut c_char,
    cap: usize,
) -> isize {
    let value = with_ctx(ctx, |c| c_name(name).and_then(|n| c.handle.params().get_string(n)));
    copy_out(value, buf, cap)
}

extern "C" fn env_set_uint_param(ctx: *mut c_void, name: *const c_char, value: u64) {
    with_ctx(ctx, |c| {
        if let Some(name) = c_name(name) {
            c.handle.params().set(name, value);
        }
    })
}

extern "C" fn env_param_count(ctx: *mut c_void) -> usize {
    with_ctx(ctx, |c| c.handle.params().len())
}

extern "C" fn env_param_name(
    ctx: *mut c_void,
    index: usize,
    buf: *mut c_char,
    cap: usize,
) -> isize {
    let name = with_ctx(ctx, |c| c.handle.params().names().into_iter().nth(index));
    copy_out(name, buf, cap)
}

extern "C" fn env_end_of_quantum(ctx: *mut c_void) -> i32 {
    if ctx.is_null() {
        return COSIM_QUANTUM_STOPPED;
    }
    with_ctx(ctx, |c| match c.exec().end_of_quantum() {
        QuantumExit::Continue => COSIM_QUANTUM_CONTINUE,
        QuantumExit::Stopped => COSIM_QUANTUM_STOPPED,
    })
}

extern "C" fn env_wait_ready(ctx: *mut c_void) {
    with_ctx(ctx, |c| c.exec().wait_ready())
}

extern "C" fn env_memory_transport(ctx: *mut c_void, payload: *mut CosimPayload) {
    if payload.is_null() {
        return;
    }
    // SAFETY: the module passes a valid payload for the duration of the call.
    let payload = unsafe { &mut *payload };
    payload.response = COSIM_RESPONSE_ADDRESS_ERROR;
    let len = payload.size as usize;
    if ctx.is_null() || (len != 0 && payload.data.is_null()) {
        return;
    }
    let mut txn = if payload.is_write != 0 {
        let src: &[u8] = if len == 0 {
            &[]
        } else {
            // SAFETY: `data` is non-null and points at `size` readable bytes.
            unsafe { std::slice::from_raw_parts(payload.data, len) }
        };
        Transaction::write(payload.address, src)
    } else {
        Transaction::read(payload.address, payload.size)
    };

    with_ctx(ctx, |c| c.exec().transport(&mut txn));

    if txn.is_read() && txn.response == Response::Ok && len != 0 {
        // SAFETY: `data` is non-null and points at `size` writable bytes for reads.
        let dst = unsafe { std::slice::from_raw_parts_mut(payload.data, len) };
        dst.copy_from_slice(&txn.data);
    }
    payload.response = response_code(txn.response);
}

fn response_code(response: Response) -> i32 {
    match response {
        Response::Ok => COSIM_RESPONSE_OK,
        Response::AddressError => COSIM_RESPONSE_ADDRESS_ERROR,
        Response::Incomplete => COSIM_RESPONSE_INCOMPLETE,
    }
}

pub type ElaborateFn = unsafe extern "C" fn(*const CosimEnvironment) -> *mut c_void;
pub type NotifyFn = unsafe extern "C" fn(*mut c_void);
pub type IrqFn = unsafe extern "C" fn(*mut c_void, u64, u64);
pub type DestroyFn = unsafe extern "C" fn(*mut c_void);

/// The four module exports.
#[derive(Clone, Copy)]
pub struct ModuleEntryPoints {
    pub elaborate: ElaborateFn,
    pub notify: NotifyFn,
    pub irq: IrqFn,
    pub destroy: DestroyFn,
}

impl ModuleEntryPoints {
    fn resolve(library: &Library, path: &Path) -> Result<Self> {
        Ok(Self {
            elaborate: symbol(library, path, "cosim_elaborate")?,
            notify: symbol(library, path, "cosim_notify")?,
            irq: symbol(library, path, "cosim_irq")?,
            destroy: symbol(library, path, "cosim_destroy")?,
        })
    }
}

struct LoadedModule {
    name: PathBuf,
    model: *mut c_void,
    entry: ModuleEntryPoints,
    // Dropped in this order after `cosim_destroy`: unload the library, then delete its file,
    // then free the callback table and its context.
    _library: Option<Library>,
    lease: Option<ModuleLease>,
    _env: Box<CosimEnvironment>,
    _ctx: Box<ModuleContext>,
}

// SAFETY: the model pointer is only ever handed back to the module's own entry points, which
// the module contract requires to be callable from the kernel thread.
unsafe impl Send for LoadedModule {}
unsafe impl Sync for LoadedModule {}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        // SAFETY: `model` came from this module's `cosim_elaborate` and is destroyed once.
        unsafe { (self.entry.destroy)(self.model) }
        tracing::debug!(module = %self.name.display(), "CPU module destroyed");
    }
}

/// A loaded and elaborated CPU-model module. The model is destroyed when the last clone is
/// dropped.
///
/// `cosim_destroy` waits for the model's thread, so drop the last clone only once the bridge
/// has halted.
#[derive(Clone)]
pub struct CpuModule {
    inner: Arc<LoadedModule>,
}

impl std::fmt::Debug for CpuModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuModule")
            .field("name", &self.inner.name)
            .field("copy", &self.inner.lease.as_ref().is_some_and(ModuleLease::is_copy))
            .finish_non_exhaustive()
    }
}

fn symbol<T: Copy>(library: &Library, path: &Path, name: &'static str) -> Result<T> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    // SAFETY: the symbol types above are the documented module ABI.
    let sym = unsafe { library.get::<T>(&bytes) }.map_err(|source| BridgeError::MissingSymbol {
        path: path.to_path_buf(),
        symbol: name,
        source,
    })?;
    Ok(*sym)
}

impl CpuModule {
    /// Loads the module at `path`, binds `exec` to it and runs its elaboration.
    pub fn load(registry: &ModuleRegistry, path: impl AsRef<Path>, exec: Executor) -> Result<Self> {
        let lease = registry.acquire(path)?;
        let file = lease.path().to_path_buf();

        // SAFETY: loading a library runs its initialisers; modules are trusted code.
        let library = unsafe { Library::new(&file) }.map_err(|source| BridgeError::LibraryLoad {
            path: file.clone(),
            source,
        })?;
        let entry = ModuleEntryPoints::resolve(&library, &file)?;
        tracing::info!(path = %file.display(), copy = lease.is_copy(), "CPU module loaded");

        // SAFETY: the entry points were resolved from `library`, which the module keeps loaded.
        unsafe { Self::elaborate(file, entry, Some(library), Some(lease), exec) }
    }

    /// Elaborates a model whose entry points are linked into this process.
    ///
    /// # Safety
    ///
    /// `entry` must follow the module ABI described at the top of this module.
    pub unsafe fn from_entry_points(
        name: impl Into<PathBuf>,
        entry: ModuleEntryPoints,
        exec: Executor,
    ) -> Result<Self> {
        Self::elaborate(name.into(), entry, None, None, exec)
    }

    unsafe fn elaborate(
        name: PathBuf,
        entry: ModuleEntryPoints,
        library: Option<Library>,
        lease: Option<ModuleLease>,
        exec: Executor,
    ) -> Result<Self> {
        let ctx = Box::new(ModuleContext {
            handle: exec.handle(),
            exec: Mutex::new(exec),
        });
        let env = Box::new(CosimEnvironment {
            ctx: &*ctx as *const ModuleContext as *mut c_void,
            get_time_ns: env_get_time_ns,
            request_notify: env_request_notify,
            request_stop: env_request_stop,
            get_uint_param: env_get_uint_param,
            get_int_param: env_get_int_param,
            get_string_param: env_get_string_param,
            set_uint_param: env_set_uint_param,
            param_count: env_param_count,
            param_name: env_param_name,
            end_of_quantum: env_end_of_quantum,
            wait_ready: env_wait_ready,
            memory_transport: env_memory_transport,
        });

        // SAFETY: `env` stays boxed, at a fixed address, until after `cosim_destroy`.
        let model = unsafe { (entry.elaborate)(&*env) };
        if model.is_null() {
            return Err(BridgeError::Elaboration { path: name });
        }
        tracing::debug!(module = %name.display(), "CPU module elaborated");

        Ok(Self {
            inner: Arc::new(LoadedModule {
                name,
                model,
                entry,
                _library: library,
                lease,
                _env: env,
                _ctx: ctx,
            }),
        })
    }

    /// Calls `cosim_notify`. Kernel thread only.
    pub fn notify(&self) {
        // SAFETY: `model` came from this module's `cosim_elaborate` and is still alive.
        unsafe { (self.inner.entry.notify)(self.inner.model) }
    }

    /// Calls `cosim_irq`.
    pub fn irq(&self, line: u64, value: u64) {
        // SAFETY: as for `notify`.
        unsafe { (self.inner.entry.irq)(self.inner.model, line, value) }
    }

    /// Interrupt sink that forwards to this module.
    pub fn irq_sink(&self) -> ModuleIrqSink {
        ModuleIrqSink {
            module: self.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModuleIrqSink {
    module: CpuModule,
}

impl IrqSink for ModuleIrqSink {
    fn transport(&mut self, txn: &mut Transaction) {
        if txn.is_read() {
            txn.response = Response::AddressError;
            return;
        }
        self.module.irq(txn.address, txn.value_le());
        txn.response = Response::Ok;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeBuilder, HaltReason};
    use crate::config::BridgeConfig;
    use cosim_mem::{DenseRam, MemoryMap};
    use std::ffi::CString;

    /// A model linked into the test binary. It logs what happens to it into `EVENTS`.
    mod fixture {
        use super::*;
        use std::thread::JoinHandle;

        static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());

        fn log(event: impl Into<String>) {
            EVENTS
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.into());
        }

        pub fn take_events() -> Vec<String> {
            std::mem::take(&mut *EVENTS.lock().unwrap_or_else(PoisonError::into_inner))
        }

        struct Callbacks {
            ctx: usize,
            wait_ready: extern "C" fn(*mut c_void),
            end_of_quantum: extern "C" fn(*mut c_void) -> i32,
            memory_transport: extern "C" fn(*mut c_void, *mut CosimPayload),
            request_notify: extern "C" fn(*mut c_void, u64),
        }

        struct Model {
            thread: Option<JoinHandle<()>>,
        }

        fn run(cb: Callbacks) {
            let ctx = cb.ctx as *mut c_void;
            (cb.wait_ready)(ctx);

            let mut word = 0xABu32.to_le_bytes();
            let mut write = CosimPayload {
                address: 0x1000,
                data: word.as_mut_ptr(),
                size: 4,
                is_write: 1,
                response: COSIM_RESPONSE_INCOMPLETE,
            };
            (cb.memory_transport)(ctx, &mut write);
            let mut back = [0u8; 4];
            let mut read = CosimPayload {
                address: 0x1000,
                data: back.as_mut_ptr(),
                size: 4,
                is_write: 0,
                response: COSIM_RESPONSE_INCOMPLETE,
            };
            (cb.memory_transport)(ctx, &mut read);
            log(format!("readback {} {:#x}", read.response, u32::from_le_bytes(back)));

            (cb.request_notify)(ctx, 0);
            let mut quanta = 0;
            while (cb.end_of_quantum)(ctx) == COSIM_QUANTUM_CONTINUE {
                quanta += 1;
            }
            log(format!("stopped after {quanta}"));
        }

        unsafe extern "C" fn elaborate(env: *const CosimEnvironment) -> *mut c_void {
            let env = &*env;
            let cb = Callbacks {
                ctx: env.ctx as usize,
                wait_ready: env.wait_ready,
                end_of_quantum: env.end_of_quantum,
                memory_transport: env.memory_transport,
                request_notify: env.request_notify,
            };
            let thread = std::thread::spawn(move || run(cb));
            log("elaborate");
            Box::into_raw(Box::new(Model {
                thread: Some(thread),
            }))
            .cast()
        }

        unsafe extern "C" fn refuse(_env: *const CosimEnvironment) -> *mut c_void {
            std::ptr::null_mut()
        }

        unsafe extern "C" fn notify(_model: *mut c_void) {
            log("notify");
        }

        unsafe extern "C" fn irq(_model: *mut c_void, line: u64, value: u64) {
            log(format!("irq {line} {value}"));
        }

        unsafe extern "C" fn destroy(model: *mut c_void) {
            let mut model = Box::from_raw(model.cast::<Model>());
            if let Some(thread) = model.thread.take() {
                if thread.join().is_err() {
                    log("model thread panicked");
                }
            }
            log("destroy");
        }

        pub const ENTRY: ModuleEntryPoints = ModuleEntryPoints {
            elaborate,
            notify,
            irq,
            destroy,
        };

        pub const REFUSING: ModuleEntryPoints = ModuleEntryPoints {
            elaborate: refuse,
            ..ENTRY
        };
    }

    fn executor() -> (crate::Bridge, Executor) {
        let mut map = MemoryMap::new();
        map.map_ram(0x1000, DenseRam::new(0x100).unwrap()).unwrap();
        let config = BridgeConfig {
            gdb_port: Some(1234),
            kernel_cmd: Some("console=ttyS0".into()),
            ..BridgeConfig::default()
        };
        BridgeBuilder::new(config).transport(map).build().unwrap()
    }

    #[test]
    fn second_instance_loads_a_private_copy() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libcpu.so");
        std::fs::write(&lib, b"not really a library").unwrap();
        let registry = ModuleRegistry::with_copy_dir(dir.path());

        let first = registry.acquire(&lib).unwrap();
        assert!(!first.is_copy());
        assert_eq!(first.path(), lib.canonicalize().unwrap());

        let second = registry.acquire(&lib).unwrap();
        assert!(second.is_copy());
        assert_ne!(second.path(), first.path());
        assert_eq!(std::fs::read(second.path()).unwrap(), b"not really a library");
        assert_eq!(registry.live_instances(&lib), 2);

        let copy = second.path().to_path_buf();
        drop(second);
        assert!(!copy.exists());
        assert_eq!(registry.live_instances(&lib), 1);

        drop(first);
        assert_eq!(registry.live_instances(&lib), 0);
        assert!(lib.exists());
    }

    #[test]
    fn missing_module_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::new();
        let err = registry.acquire(dir.path().join("nope.so")).unwrap_err();
        assert!(matches!(err, BridgeError::ModuleNotFound { .. }));
    }

    #[test]
    fn non_library_file_fails_to_load_and_releases_its_slot() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libbroken.so");
        std::fs::write(&lib, b"garbage").unwrap();
        let registry = ModuleRegistry::with_copy_dir(dir.path());

        let (_bridge, exec) = executor();
        let err = CpuModule::load(&registry, &lib, exec).unwrap_err();
        assert!(matches!(err, BridgeError::LibraryLoad { .. }));
        assert_eq!(registry.live_instances(&lib), 0);
    }

    #[test]
    fn callbacks_reach_the_bridge() {
        let (_bridge, exec) = executor();
        let ctx = ModuleContext {
            handle: exec.handle(),
            exec: Mutex::new(exec),
        };
        let ptr = &ctx as *const ModuleContext as *mut c_void;

        let port = CString::new("gdb_port").unwrap();
        assert_eq!(env_get_uint_param(ptr, port.as_ptr()), 1234);

        let cmd = CString::new("kernel_cmd").unwrap();
        let mut buf = [0 as c_char; 8];
        let len = env_get_string_param(ptr, cmd.as_ptr(), buf.as_mut_ptr(), buf.len());
        assert_eq!(len, "console=ttyS0".len() as isize);
        let truncated = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(truncated.to_str().unwrap(), "console");

        let missing = CString::new("nope").unwrap();
        assert_eq!(
            env_get_string_param(ptr, missing.as_ptr(), buf.as_mut_ptr(), buf.len()),
            -1
        );

        let custom = CString::new("cpu.id").unwrap();
        let before = env_param_count(ptr);
        env_set_uint_param(ptr, custom.as_ptr(), 3);
        assert_eq!(env_get_int_param(ptr, custom.as_ptr()), 3);
        assert_eq!(env_param_count(ptr), before + 1);

        assert_eq!(env_get_time_ns(ptr), 0);
        assert_eq!(env_get_time_ns(std::ptr::null_mut()), 0);
    }

    #[test]
    fn parameter_names_can_be_enumerated() {
        let (_bridge, exec) = executor();
        let ctx = ModuleContext {
            handle: exec.handle(),
            exec: Mutex::new(exec),
        };
        let ptr = &ctx as *const ModuleContext as *mut c_void;

        let mut names = Vec::new();
        let mut buf = [0 as c_char; 64];
        for index in 0..env_param_count(ptr) {
            let len = env_param_name(ptr, index, buf.as_mut_ptr(), buf.len());
            assert!(len > 0);
            let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
            names.push(name.to_str().unwrap().to_owned());
        }
        assert_eq!(names, ctx.handle.params().names());
        assert!(names.iter().any(|n| n == "gdb_port"));
        assert!(names.iter().any(|n| n == "kernel_cmd"));
        assert!(names.windows(2).all(|w| w[0] < w[1]));

        let past_end = names.len();
        assert_eq!(env_param_name(ptr, past_end, buf.as_mut_ptr(), buf.len()), -1);
        // Length query without a buffer.
        assert_eq!(
            env_param_name(ptr, 0, std::ptr::null_mut(), 0),
            names[0].len() as isize
        );
    }

    #[test]
    fn empty_payload_needs_no_buffer() {
        let (bridge, exec) = executor();
        drop(bridge);
        let ctx = ModuleContext {
            handle: exec.handle(),
            exec: Mutex::new(exec),
        };
        let ptr = &ctx as *const ModuleContext as *mut c_void;

        let mut payload = CosimPayload {
            address: 0x1000,
            data: std::ptr::null_mut(),
            size: 0,
            is_write: 1,
            response: COSIM_RESPONSE_INCOMPLETE,
        };
        env_memory_transport(ptr, &mut payload);
        assert_eq!(payload.response, COSIM_RESPONSE_ADDRESS_ERROR);

        payload.is_write = 0;
        payload.response = COSIM_RESPONSE_INCOMPLETE;
        env_memory_transport(ptr, &mut payload);
        assert_eq!(payload.response, COSIM_RESPONSE_ADDRESS_ERROR);

        // A non-empty payload without a buffer is refused before it reaches the bridge.
        payload.size = 4;
        payload.response = COSIM_RESPONSE_INCOMPLETE;
        env_memory_transport(ptr, &mut payload);
        assert_eq!(payload.response, COSIM_RESPONSE_ADDRESS_ERROR);
        assert_eq!(ctx.handle.transactions_posted(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn library_without_module_exports_is_rejected() {
        let candidates = [
            "/lib/x86_64-linux-gnu/libc.so.6",
            "/lib/aarch64-linux-gnu/libc.so.6",
            "/usr/lib64/libc.so.6",
            "/lib64/libc.so.6",
            "/usr/lib/libc.so.6",
        ];
        let Some(libc) = candidates.iter().map(Path::new).find(|p| p.exists()) else {
            eprintln!("no libc found, skipping");
            return;
        };
        let registry = ModuleRegistry::new();

        let (_bridge, exec) = executor();
        let err = CpuModule::load(&registry, libc, exec).unwrap_err();
        assert!(
            matches!(
                err,
                BridgeError::MissingSymbol {
                    symbol: "cosim_elaborate",
                    ..
                }
            ),
            "{err:?}"
        );
        assert_eq!(registry.live_instances(libc), 0);
    }

    #[test]
    fn null_model_is_an_elaboration_error() {
        let (mut bridge, exec) = executor();
        let err = unsafe { CpuModule::from_entry_points("refusing", fixture::REFUSING, exec) }
            .unwrap_err();
        assert!(
            matches!(&err, BridgeError::Elaboration { path } if path == Path::new("refusing")),
            "{err:?}"
        );
        // The executor went down with the failed module, so the kernel does not wait for it.
        assert_eq!(bridge.run().unwrap().reason, HaltReason::StopRequested);
    }

    #[test]
    fn in_process_module_runs_through_its_whole_lifecycle() {
        let mut map = MemoryMap::new();
        map.map_ram(0x1000, DenseRam::new(0x100).unwrap()).unwrap();
        let config = BridgeConfig {
            quantum_ns: 1_000,
            max_quanta: Some(3),
            ..BridgeConfig::default()
        };
        let (mut bridge, exec) = BridgeBuilder::new(config).transport(map).build().unwrap();
        let module =
            unsafe { CpuModule::from_entry_points("in-process", fixture::ENTRY, exec) }.unwrap();
        bridge.set_irq_sink(module.irq_sink());
        let notifier = module.clone();
        bridge.set_notify_handler(move |_now| notifier.notify());

        assert_eq!(bridge.irq(5, 9), Response::Ok);
        let mut read = Transaction::read(5, 8);
        module.irq_sink().transport(&mut read);
        assert_eq!(read.response, Response::AddressError);

        let report = bridge.run().unwrap();
        assert_eq!(report.reason, HaltReason::QuantumLimit);
        assert_eq!(report.quanta, 3);
        assert_eq!(report.transactions, 2);

        drop(bridge);
        drop(module);
        let events = fixture::take_events();
        assert_eq!(events.first().map(String::as_str), Some("elaborate"), "{events:?}");
        for expected in ["irq 5 9", "readback 0 0xab", "notify", "stopped after 2"] {
            assert_eq!(
                events.iter().filter(|e| *e == expected).count(),
                1,
                "{expected}: {events:?}"
            );
        }
        assert_eq!(events.last().map(String::as_str), Some("destroy"), "{events:?}");
    }

    #[test]
    fn transport_on_a_halted_bridge_reports_an_address_error() {
        let (bridge, exec) = executor();
        drop(bridge);
        let ctx = ModuleContext {
            handle: exec.handle(),
            exec: Mutex::new(exec),
        };
        let ptr = &ctx as *const ModuleContext as *mut c_void;

        let mut word = 0u32.to_le_bytes();
        let mut payload = CosimPayload {
            address: 0x1000,
            data: word.as_mut_ptr(),
            size: 4,
            is_write: 0,
            response: COSIM_RESPONSE_INCOMPLETE,
        };
        env_memory_transport(ptr, &mut payload);
        assert_eq!(payload.response, COSIM_RESPONSE_ADDRESS_ERROR);
        assert_eq!(env_end_of_quantum(ptr), COSIM_QUANTUM_STOPPED);
    }
}
