//! Loads a compiled guest module and drives one call into it at a time
//! (§4.F). Mirrors the alloc → write → call → unpack → bounds-check →
//! read marshalling the closest sibling in the retrieval pack uses for
//! its own sandboxed calls (`nova-ext::wasm::runtime::call_vec`), adapted
//! to this host's packed `(ptr << 32) | len` convention, its own set of
//! exported entry points, and §4.F.3's "the guest owns all memory it
//! returns" rule — unlike that sibling, this host never calls back into
//! the guest to free a buffer.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use wasmtime::{Engine, ExternType, Instance, Linker, Memory, Module, Store, TypedFunc, Val};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use crate::error::AbiError;

use super::engine::{engine, timeout_to_epoch_deadline, unpack_ptr_len};
use super::host_imports::{add_host_imports, HostState};

const REQUIRED_EXPORTS: &[&str] = &["memory", "solobase_alloc", "handle_request"];

/// The minimal WASI preview1 surface a guest is allowed to actually
/// reach (§4.F.2, §9): stdio writes, randomness, the clock, orderly
/// exit, the two scheduling primitives a guest's own async runtime (if
/// any) might poll on, and enough of `args_*`/`environ_*`/`fd_*` to let
/// a guest's libc start up without tripping over missing imports. Every
/// other WASI preview1 call a guest module declares is shadowed with a
/// stub that returns `ENOSYS` instead of running the real
/// implementation (§4.F.2 "all other WASI file/socket calls return
/// `ENOSYS` (28)").
const ALLOWED_WASI_IMPORTS: &[&str] = &[
    "fd_write",
    "random_get",
    "clock_time_get",
    "proc_exit",
    "poll_oneoff",
    "sched_yield",
    "args_get",
    "args_sizes_get",
    "environ_get",
    "environ_sizes_get",
    "fd_close",
    "fd_fdstat_get",
    "fd_prestat_get",
    "fd_prestat_dir_name",
];

const WASI_ERRNO_ENOSYS: i32 = 28;

/// Shadows every `wasi_snapshot_preview1` import the guest declares
/// that isn't in `ALLOWED_WASI_IMPORTS` with a stub returning `ENOSYS`.
/// Pulls each stub's signature straight off the module's own import
/// type rather than hand-listing one per WASI call, so this covers
/// whichever subset of the ~40-call surface a given guest happens to
/// import.
fn restrict_wasi_surface(linker: &mut Linker<HostState>, module: &Module) -> Result<(), AbiError> {
    linker.allow_shadowing(true);
    for import in module.imports() {
        if import.module() != "wasi_snapshot_preview1" || ALLOWED_WASI_IMPORTS.contains(&import.name()) {
            continue;
        }
        let ExternType::Func(func_ty) = import.ty() else {
            continue;
        };
        linker
            .func_new(import.module(), import.name(), func_ty, |_caller, _params, results| {
                if let Some(errno) = results.first_mut() {
                    *errno = Val::I32(WASI_ERRNO_ENOSYS);
                }
                Ok(())
            })
            .map_err(|e| AbiError::Trap(e.to_string()))?;
    }
    Ok(())
}

/// A compiled module, probed once at load time so a missing export
/// fails fast at `Initialize` rather than on the first request.
pub struct GuestModule {
    module: Module,
}

impl GuestModule {
    pub fn load(path: &Path) -> Result<Self, AbiError> {
        let bytes = std::fs::read(path)
            .map_err(|e| AbiError::MalformedEnvelope(format!("reading `{}`: {e}", path.display())))?;
        Self::load_bytes(&bytes)
    }

    pub fn load_bytes(bytes: &[u8]) -> Result<Self, AbiError> {
        let module = Module::new(engine(), bytes)
            .map_err(|e| AbiError::MalformedEnvelope(format!("not a valid wasm module: {e}")))?;
        probe_exports(&module)?;
        Ok(Self { module })
    }

    pub fn engine(&self) -> &Engine {
        self.module.engine()
    }
}

fn probe_exports(module: &Module) -> Result<(), AbiError> {
    for name in REQUIRED_EXPORTS {
        if module.get_export_index(name).is_none() {
            return Err(AbiError::MissingExport(name));
        }
    }
    Ok(())
}

/// One instantiated guest plus the `Store` that owns its memory. Guest
/// calls are not reentrant with themselves, so every call into a
/// session takes a mutex — a guest this host talks to is one extension
/// worth of work, not a pool of concurrent workers.
pub struct GuestSession {
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    store: Store<HostState>,
    instance: Instance,
    call_timeout: Duration,
}

impl GuestSession {
    pub fn instantiate(
        module: &GuestModule,
        db_pool: sqlx::SqlitePool,
        config: std::collections::HashMap<String, String>,
        call_timeout: Duration,
    ) -> Result<Self, AbiError> {
        let wasi = WasiCtxBuilder::new().inherit_stdio().build_p1();
        let runtime = tokio::runtime::Handle::current();
        let state = HostState::new(wasi, db_pool, runtime, config);

        let engine = module.engine();
        let mut store = Store::new(engine, state);
        store.set_epoch_deadline(timeout_to_epoch_deadline(call_timeout));
        store.set_fuel(u64::MAX).map_err(|e| AbiError::Trap(e.to_string()))?;

        let mut linker: Linker<HostState> = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| AbiError::Trap(e.to_string()))?;
        restrict_wasi_surface(&mut linker, &module.module)?;
        add_host_imports(&mut linker).map_err(|e| AbiError::Trap(e.to_string()))?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| AbiError::Trap(e.to_string()))?;

        if let Ok(start) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            start
                .call(&mut store, ())
                .map_err(|e| AbiError::Trap(e.to_string()))?;
        }

        Ok(Self {
            inner: Mutex::new(SessionInner {
                store,
                instance,
                call_timeout,
            }),
        })
    }

    /// Serializes `request` as JSON, hands it to the guest's
    /// `handle_request` export, and deserializes whatever it returns.
    /// `T`/`R` are the envelope types in `super::envelope`.
    pub fn call<T: Serialize, R: DeserializeOwned>(&self, request: &T) -> Result<R, AbiError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| AbiError::MalformedEnvelope(e.to_string()))?;

        let mut guard = self.inner.lock().expect("guest session lock poisoned");
        let SessionInner {
            store,
            instance,
            call_timeout,
        } = &mut *guard;

        store.set_epoch_deadline(timeout_to_epoch_deadline(*call_timeout));

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or(AbiError::MissingExport("memory"))?;
        let alloc: TypedFunc<i32, i32> = instance
            .get_typed_func(&mut *store, "solobase_alloc")
            .map_err(|_| AbiError::MissingExport("solobase_alloc"))?;
        let handle_request: TypedFunc<(i32, i32), i64> = instance
            .get_typed_func(&mut *store, "handle_request")
            .map_err(|_| AbiError::MissingExport("handle_request"))?;

        // solobase_alloc hands back a guest-owned region; per §4.F.3 ownership
        // of the bytes we write into it transfers to the guest once passed to
        // handle_request, so this host never calls back in to free it.
        let req_ptr = alloc
            .call(&mut *store, payload.len() as i32)
            .map_err(|e| AbiError::Trap(e.to_string()))?;
        let mem_len_before = memory.data_size(&*store);
        memory
            .write(&mut *store, req_ptr as usize, &payload)
            .map_err(|_| AbiError::OutOfBounds {
                ptr: req_ptr as u32,
                len: payload.len() as u32,
                memory_len: mem_len_before,
            })?;

        let packed = handle_request
            .call(&mut *store, (req_ptr, payload.len() as i32))
            .map_err(|e| {
                if e.to_string().contains("epoch") {
                    AbiError::Timeout(*call_timeout)
                } else {
                    AbiError::Trap(e.to_string())
                }
            })?;

        if packed == 0 {
            return Err(AbiError::ZeroLengthReturn("handle_request".to_string()));
        }
        let (resp_ptr, resp_len) = unpack_ptr_len(packed as u64);

        let memory_len = memory.data_size(&*store);
        if resp_ptr as usize + resp_len as usize > memory_len {
            return Err(AbiError::OutOfBounds {
                ptr: resp_ptr,
                len: resp_len,
                memory_len,
            });
        }

        // The read must complete before any further guest call (§4.F.3); once
        // it has, the guest is free to reuse `resp_ptr` on its own — the host
        // never frees guest memory itself.
        let mut buf = vec![0u8; resp_len as usize];
        memory
            .read(&*store, resp_ptr as usize, &mut buf)
            .map_err(|_| AbiError::OutOfBounds {
                ptr: resp_ptr,
                len: resp_len,
                memory_len,
            })?;

        serde_json::from_slice(&buf).map_err(|e| AbiError::MalformedEnvelope(e.to_string()))
    }

    /// Runs `call` on a blocking thread. `call` drives the guest's
    /// `handle_request` export, and any host import the guest invokes
    /// from inside that (`db_query`, `db_exec`, ...) itself `block_on`s
    /// back into this runtime (§4.F.2) — calling `call` directly from an
    /// async task would panic the instant a guest touched the database,
    /// since that worker thread is already driving this task. Routing
    /// through `spawn_blocking` gives `block_on` a thread that isn't.
    pub async fn call_async<T, R>(self: &Arc<Self>, request: T) -> Result<R, AbiError>
    where
        T: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.call(&request))
            .await
            .unwrap_or_else(|e| Err(AbiError::Trap(format!("guest call panicked: {e}"))))
    }

    pub fn memory_size(&self) -> usize {
        let mut guard = self.inner.lock().expect("guest session lock poisoned");
        let SessionInner { store, instance, .. } = &mut *guard;
        instance
            .get_memory(&mut *store, "memory")
            .map(|m: Memory| m.data_size(&*store))
            .unwrap_or(0)
    }
}
