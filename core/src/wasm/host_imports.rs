//! Host-exported imports a guest module may call (§4.F.2). Database
//! calls come in synchronous from the guest's perspective but must run
//! against an async `sqlx` pool; the bridge is `tokio::runtime::Handle`
//! captured before the guest call and driven with `block_on` from
//! inside the blocking thread the whole guest call already runs on.
//! Every caller reaches `GuestSession::call` through
//! `GuestSession::call_async`, which runs it inside
//! `tokio::task::spawn_blocking`, so `block_on` here never runs on a
//! thread that is itself driving the runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool, pool::PoolConnection, sqlite::Sqlite};
use wasmtime::{Caller, Linker, Memory, TypedFunc};
use wasmtime_wasi::preview1::WasiP1Ctx;

use super::engine::pack_ptr_len;
use super::envelope::{ExecEnvelope, QueryEnvelope, TransactionEnvelope};

pub struct HostState {
    pub wasi: WasiP1Ctx,
    pub db_pool: SqlitePool,
    pub runtime: tokio::runtime::Handle,
    pub config: HashMap<String, String>,
    pub open_transactions: HashMap<u32, PoolConnection<Sqlite>>,
    next_tx_id: AtomicU32,
}

impl HostState {
    pub fn new(
        wasi: WasiP1Ctx,
        db_pool: SqlitePool,
        runtime: tokio::runtime::Handle,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            wasi,
            db_pool,
            runtime,
            config,
            open_transactions: HashMap::new(),
            next_tx_id: AtomicU32::new(1),
        }
    }
}

fn read_guest_utf8(caller: &mut Caller<'_, HostState>, memory: Memory, ptr: u32, len: u32) -> anyhow::Result<String> {
    let mut buf = vec![0u8; len as usize];
    memory.read(&mut *caller, ptr as usize, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

/// Allocates `bytes.len()` in the guest via its own `solobase_alloc`
/// export, writes `bytes` into that region, and returns the packed
/// `(ptr, len)` the guest is expected to hand back to its caller.
fn write_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    alloc: TypedFunc<i32, i32>,
    memory: Memory,
    bytes: &[u8],
) -> anyhow::Result<u64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let ptr = alloc.call(&mut *caller, bytes.len() as i32)?;
    memory.write(&mut *caller, ptr as u32 as usize, bytes)?;
    Ok(pack_ptr_len(ptr as u32, bytes.len() as u32))
}

fn get_memory_and_alloc(caller: &mut Caller<'_, HostState>) -> anyhow::Result<(Memory, TypedFunc<i32, i32>)> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest does not export `memory`"))?;
    let alloc = caller
        .get_export("solobase_alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow::anyhow!("guest does not export `solobase_alloc`"))?
        .typed::<i32, i32>(&mut *caller)?;
    Ok((memory, alloc))
}

fn json_scalar_to_sql(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Registers every Host ABI import on `linker` (§4.F.2). WASI preview1
/// is added separately by the caller, the same split the teacher keeps
/// in `extensions::loader::load_wasm_module`.
pub fn add_host_imports(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "get_config",
        |mut caller: Caller<'_, HostState>, key_ptr: u32, key_len: u32| -> anyhow::Result<u64> {
            let (memory, alloc) = get_memory_and_alloc(&mut caller)?;
            let key = read_guest_utf8(&mut caller, memory, key_ptr, key_len)?;
            let value = caller.data().config.get(&key).cloned().unwrap_or_default();
            write_guest_bytes(&mut caller, alloc, memory, value.as_bytes())
        },
    )?;

    linker.func_wrap(
        "env",
        "db_query",
        |mut caller: Caller<'_, HostState>, q_ptr: u32, q_len: u32, args_ptr: u32, args_len: u32| -> anyhow::Result<u64> {
            let (memory, alloc) = get_memory_and_alloc(&mut caller)?;
            let query = read_guest_utf8(&mut caller, memory, q_ptr, q_len)?;
            let args_json = read_guest_utf8(&mut caller, memory, args_ptr, args_len)?;
            let args: Vec<JsonValue> = serde_json::from_str(&args_json).unwrap_or_default();

            let pool = caller.data().db_pool.clone();
            let handle = caller.data().runtime.clone();
            let envelope = handle.block_on(run_query(pool, query, args));

            let bytes = serde_json::to_vec(&envelope)?;
            write_guest_bytes(&mut caller, alloc, memory, &bytes)
        },
    )?;

    linker.func_wrap(
        "env",
        "db_exec",
        |mut caller: Caller<'_, HostState>, q_ptr: u32, q_len: u32, args_ptr: u32, args_len: u32| -> anyhow::Result<u64> {
            let (memory, alloc) = get_memory_and_alloc(&mut caller)?;
            let query = read_guest_utf8(&mut caller, memory, q_ptr, q_len)?;
            let args_json = read_guest_utf8(&mut caller, memory, args_ptr, args_len)?;
            let args: Vec<JsonValue> = serde_json::from_str(&args_json).unwrap_or_default();

            let pool = caller.data().db_pool.clone();
            let handle = caller.data().runtime.clone();
            let envelope = handle.block_on(run_exec(pool, query, args));

            let bytes = serde_json::to_vec(&envelope)?;
            write_guest_bytes(&mut caller, alloc, memory, &bytes)
        },
    )?;

    linker.func_wrap(
        "env",
        "db_begin",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<u64> {
            let (memory, alloc) = get_memory_and_alloc(&mut caller)?;
            let pool = caller.data().db_pool.clone();
            let handle = caller.data().runtime.clone();

            let conn_result = handle.block_on(async {
                let mut conn = pool.acquire().await?;
                sqlx::query("BEGIN").execute(&mut *conn).await?;
                Ok::<_, sqlx::Error>(conn)
            });

            let envelope = match conn_result {
                Ok(conn) => {
                    let tx_id = caller.data().next_tx_id.fetch_add(1, Ordering::SeqCst);
                    caller.data_mut().open_transactions.insert(tx_id, conn);
                    TransactionEnvelope {
                        tx_id: Some(tx_id),
                        error: None,
                    }
                }
                Err(e) => TransactionEnvelope {
                    tx_id: None,
                    error: Some(e.to_string()),
                },
            };

            let bytes = serde_json::to_vec(&envelope)?;
            write_guest_bytes(&mut caller, alloc, memory, &bytes)
        },
    )?;

    // The source `db_commit`/`db_rollback` return a bare `u32`, the one
    // inconsistency in an otherwise uniform ABI (§9 Open Question). This
    // host resolves it the way the spec directs: both return `packed_u64`
    // pointing at a Transaction envelope, so a guest always decodes the
    // result the same way and gets the actual error string instead of a
    // bare nonzero code.
    linker.func_wrap(
        "env",
        "db_commit",
        |mut caller: Caller<'_, HostState>, tx_id: u32| -> anyhow::Result<u64> {
            let (memory, alloc) = get_memory_and_alloc(&mut caller)?;
            let envelope = match caller.data_mut().open_transactions.remove(&tx_id) {
                Some(mut conn) => {
                    let handle = caller.data().runtime.clone();
                    match handle.block_on(async { sqlx::query("COMMIT").execute(&mut *conn).await }) {
                        Ok(_) => TransactionEnvelope {
                            tx_id: Some(tx_id),
                            error: None,
                        },
                        Err(e) => TransactionEnvelope {
                            tx_id: Some(tx_id),
                            error: Some(e.to_string()),
                        },
                    }
                }
                None => TransactionEnvelope {
                    tx_id: None,
                    error: Some(format!("no open transaction `{tx_id}`")),
                },
            };
            let bytes = serde_json::to_vec(&envelope)?;
            write_guest_bytes(&mut caller, alloc, memory, &bytes)
        },
    )?;

    linker.func_wrap(
        "env",
        "db_rollback",
        |mut caller: Caller<'_, HostState>, tx_id: u32| -> anyhow::Result<u64> {
            let (memory, alloc) = get_memory_and_alloc(&mut caller)?;
            let envelope = match caller.data_mut().open_transactions.remove(&tx_id) {
                Some(mut conn) => {
                    let handle = caller.data().runtime.clone();
                    match handle.block_on(async { sqlx::query("ROLLBACK").execute(&mut *conn).await }) {
                        Ok(_) => TransactionEnvelope {
                            tx_id: Some(tx_id),
                            error: None,
                        },
                        Err(e) => TransactionEnvelope {
                            tx_id: Some(tx_id),
                            error: Some(e.to_string()),
                        },
                    }
                }
                None => TransactionEnvelope {
                    tx_id: None,
                    error: Some(format!("no open transaction `{tx_id}` (unsupported on this dialect)")),
                },
            };
            let bytes = serde_json::to_vec(&envelope)?;
            write_guest_bytes(&mut caller, alloc, memory, &bytes)
        },
    )?;

    Ok(())
}

async fn run_query(pool: SqlitePool, query: String, args: Vec<JsonValue>) -> QueryEnvelope {
    let mut q = sqlx::query(&query);
    for arg in &args {
        q = q.bind(json_scalar_to_sql(arg));
    }
    match q.fetch_all(&pool).await {
        Ok(rows) => {
            let columns: Vec<String> = rows
                .first()
                .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let out_rows = rows
                .iter()
                .map(|r| {
                    (0..r.len())
                        .map(|i| {
                            r.try_get::<String, _>(i)
                                .map(JsonValue::String)
                                .unwrap_or(JsonValue::Null)
                        })
                        .collect()
                })
                .collect();
            QueryEnvelope {
                columns,
                rows: out_rows,
                error: None,
            }
        }
        Err(e) => QueryEnvelope {
            columns: vec![],
            rows: vec![],
            error: Some(e.to_string()),
        },
    }
}

async fn run_exec(pool: SqlitePool, query: String, args: Vec<JsonValue>) -> ExecEnvelope {
    let mut q = sqlx::query(&query);
    for arg in &args {
        q = q.bind(json_scalar_to_sql(arg));
    }
    match q.execute(&pool).await {
        Ok(result) => ExecEnvelope {
            rows_affected: result.rows_affected() as i64,
            last_insert_id: result.last_insert_rowid(),
            error: None,
        },
        Err(e) => ExecEnvelope {
            rows_affected: 0,
            last_insert_id: 0,
            error: Some(e.to_string()),
        },
    }
}
