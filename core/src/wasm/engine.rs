//! Process-wide Wasmtime `Engine` (§4.F). One engine is shared by every
//! guest module; epoch interruption backs per-call timeouts and a
//! background ticker thread drives the epoch clock, the same scheme the
//! closest sibling to this ABI in the retrieval pack uses for its own
//! wasm sandbox (`nova-ext::wasm::runtime::engine`).

use std::sync::OnceLock;
use std::time::Duration;

use wasmtime::Engine;

/// One epoch tick per this duration; `Store::set_epoch_deadline` takes a
/// tick budget, so a call's wall-clock timeout is approximated as
/// `timeout / EPOCH_TICK` ticks.
pub const EPOCH_TICK: Duration = Duration::from_millis(1);

pub fn engine() -> &'static Engine {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    ENGINE.get_or_init(|| {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        config.consume_fuel(true);
        let engine = Engine::new(&config).expect("wasmtime engine construction should not fail");

        let ticker_engine = engine.clone();
        std::thread::Builder::new()
            .name("solobase-wasm-epoch".to_string())
            .spawn(move || {
                loop {
                    std::thread::sleep(EPOCH_TICK);
                    ticker_engine.increment_epoch();
                }
            })
            .expect("spawning the wasmtime epoch ticker thread should not fail");

        engine
    })
}

pub fn timeout_to_epoch_deadline(timeout: Duration) -> u64 {
    let timeout_ms = timeout.as_millis();
    let tick_ms = EPOCH_TICK.as_millis().max(1);
    let ticks = timeout_ms.div_ceil(tick_ms).max(1);
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// `packed_u64 = (ptr << 32) | len`, per the guest ABI contract.
pub fn pack_ptr_len(ptr: u32, len: u32) -> u64 {
    ((ptr as u64) << 32) | (len as u64)
}

pub fn unpack_ptr_len(v: u64) -> (u32, u32) {
    let ptr = (v >> 32) as u32;
    let len = (v & 0xFFFF_FFFF) as u32;
    (ptr, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let (ptr, len) = unpack_ptr_len(pack_ptr_len(0x1234, 0x56));
        assert_eq!(ptr, 0x1234);
        assert_eq!(len, 0x56);
    }

    #[test]
    fn epoch_deadline_is_at_least_one_tick() {
        assert_eq!(timeout_to_epoch_deadline(Duration::from_millis(0)), 1);
        assert_eq!(timeout_to_epoch_deadline(Duration::from_millis(10)), 10);
    }
}
