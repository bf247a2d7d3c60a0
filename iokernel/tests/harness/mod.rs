//! Test harness for dataplane integration tests
//!
//! Provides a scriptable NIC, a simulated runtime process and packet
//! builders for cipher datagrams.

#![allow(dead_code)]

pub mod nic;
pub mod packets;
pub mod runtime;

pub use nic::MockNic;
pub use runtime::TestRuntime;

use iokernel::cipher::ChaChaCiphers;
use iokernel::{Dataplane, DataplaneHandle, IokernelConfig, control_channel};

/// A dataplane over a `MockNic` with statistics logging off.
pub fn dataplane(
    config: IokernelConfig,
    nic: MockNic,
    ciphers: ChaChaCiphers,
) -> (Dataplane<MockNic>, DataplaneHandle) {
    let (handle, rx) = control_channel();
    let config = IokernelConfig {
        stats_interval_ms: 0,
        ..config
    };
    (Dataplane::new(config, nic, Box::new(ciphers), rx), handle)
}

/// Run `n` loop iterations.
pub fn spin(dp: &mut Dataplane<MockNic>, n: usize) {
    for _ in 0..n {
        dp.run_once();
    }
}
