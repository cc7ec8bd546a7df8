//! Minimal WASM guest exercising the raw Host ABI end to end: allocates
//! its own response buffers, answers lifecycle pings, and otherwise
//! echoes whatever request it was handed back to the caller. Ships as a
//! `cdylib` built for `wasm32-wasip1`; nothing here links against the
//! host crate, the guest and host only agree on the wire shape.

use std::alloc::{alloc, Layout};
use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    method: String,
    path: String,
    #[serde(default)]
    headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    body: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    status: u16,
    headers: HashMap<String, Vec<String>>,
    body: String,
}

impl ResponseEnvelope {
    fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: BASE64.encode(body.into()),
        }
    }
}

fn pack_ptr_len(ptr: u32, len: u32) -> u64 {
    ((ptr as u64) << 32) | (len as u64)
}

/// Allocates `len` bytes the host can write a request into, or a guest
/// can write a response into. The host never frees this; the guest's
/// own allocator owns it for the lifetime of the instance.
#[no_mangle]
pub extern "C" fn solobase_alloc(len: i32) -> i32 {
    if len <= 0 {
        return 0;
    }
    let layout = Layout::array::<u8>(len as usize).expect("allocation size overflow");
    unsafe { alloc(layout) as i32 }
}

/// Optional export the host calls once after instantiation, before any
/// `handle_request` call, if present. This guest has no state to set up.
#[no_mangle]
pub extern "C" fn _initialize() {}

/// Required export: decodes the request at `(ptr, len)`, answers
/// lifecycle pings directly, and echoes everything else back.
#[no_mangle]
pub extern "C" fn handle_request(ptr: i32, len: i32) -> i64 {
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) };
    let response = match serde_json::from_slice::<RequestEnvelope>(bytes) {
        Ok(req) => route(req),
        Err(e) => ResponseEnvelope::text(400, format!("bad request envelope: {e}")),
    };
    respond(&response)
}

fn route(req: RequestEnvelope) -> ResponseEnvelope {
    if req.method == "LIFECYCLE" {
        return match req.path.as_str() {
            "/initialize" | "/start" | "/stop" | "/health" => ResponseEnvelope::text(200, "ok"),
            other => ResponseEnvelope::text(404, format!("unknown lifecycle path {other}")),
        };
    }

    let echoed = serde_json::json!({
        "method": req.method,
        "path": req.path,
        "headers": req.headers,
        "body": String::from_utf8_lossy(&req.body),
    });
    ResponseEnvelope::text(200, echoed.to_string())
}

fn respond(response: &ResponseEnvelope) -> i64 {
    let bytes = serde_json::to_vec(response).expect("response envelope always serializes");
    let ptr = solobase_alloc(bytes.len() as i32);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
    }
    pack_ptr_len(ptr as u32, bytes.len() as u32) as i64
}
