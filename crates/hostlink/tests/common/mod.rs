//! Shared fixtures for SDK integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use hostlink::{Function, Kernel, KernelConfig, PTR, UserData};

/// Path of a guest under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture_bytes(name: &str) -> Vec<u8> {
    std::fs::read(fixture(name)).expect("read fixture")
}

/// A private kernel with a fast epoch tick for timeout tests.
pub fn kernel() -> Kernel {
    Kernel::new(KernelConfig::default().with_epoch_tick_ms(5)).expect("kernel")
}

/// `hello_world(i64) -> i64`: checks the guest passed `testing` and returns `test`.
pub fn hello_world() -> Function {
    Function::new(
        "hello_world",
        [PTR],
        [PTR],
        UserData::<()>::none(),
        |plugin, _| {
            assert_eq!(plugin.input_str(0)?, "testing");
            plugin.output_str("test", 0);
            Ok(())
        },
    )
    .expect("hello_world")
}
