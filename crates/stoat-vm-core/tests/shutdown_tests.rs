//! Uncaught-exception reporting through the outermost frame.
//!
//! Shutdown flips process-wide state, so this binary holds exactly one
//! test.

use stoat_vm_core::throw;
use stoat_vm_core::{vm, VmError};

#[test]
fn uncaught_exception_surfaces_to_the_host_and_shuts_down() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let result = vm::run_vm(|ctx| Err(throw::throw_runtime(ctx, "boom")));

    match result {
        Err(VmError::UncaughtException {
            thread,
            class,
            message,
        }) => {
            assert_eq!(thread, "main");
            assert_eq!(class, "java/lang/RuntimeException");
            assert_eq!(message, "boom");
        }
        other => panic!("expected an uncaught exception, got {other:?}"),
    }

    // Shutdown happened regardless of how main ended.
    assert!(matches!(
        vm::run_vm(|_| Ok(())),
        Err(VmError::ShuttingDown)
    ));
}
