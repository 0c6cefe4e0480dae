//! The seam between the protocol state machine and whatever is actually
//! being debugged (spec §4.4).
//!
//! Register and memory handling are hardcoded stub responses at the
//! connection layer (see [`crate::connection`]), mirroring the original
//! debug server's own placeholder behavior; this trait only carries the two
//! events a real backend needs to observe. `on_continue` is handed a
//! [`HostIoHandle`] so a backend can issue Host I/O calls (e.g. to read a
//! core file) while the target runs, without blocking the dispatch loop that
//! calls it — the connection always runs `on_continue` on its own task.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::hostio::HostIoHandle;

/// Notified of break requests and continue commands. Implementations are
/// shared across every connection on a server and must be `Send + Sync`.
#[async_trait]
pub trait Debugger: Send + Sync {
    /// The client sent the break byte, or an `F` reply carried the `C`
    /// (ctrl-c) flag.
    fn on_break(&self);

    /// The client sent a `c` (continue) packet. Runs on its own task, so
    /// awaiting Host I/O calls against `hostio` here does not stall the
    /// connection's dispatch loop.
    async fn on_continue(&self, hostio: Arc<dyn HostIoHandle>);
}

/// A `Debugger` that only logs. Useful for exercising the protocol layer
/// without a real target attached.
#[derive(Debug, Default)]
pub struct NullDebugger;

#[async_trait]
impl Debugger for NullDebugger {
    fn on_break(&self) {
        info!("break requested, no backend attached");
    }

    async fn on_continue(&self, _hostio: Arc<dyn HostIoHandle>) {
        info!("continue requested, no backend attached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_debugger_does_not_panic() {
        let debugger = NullDebugger;
        debugger.on_break();

        struct NeverCalled;
        #[async_trait]
        impl HostIoHandle for NeverCalled {
            async fn open(&self, _: &str, _: i32, _: i32) -> crate::error::Result<i32> {
                unreachable!()
            }
            async fn read(&self, _: i32, _: usize) -> crate::error::Result<Vec<u8>> {
                unreachable!()
            }
            async fn pread(&self, _: i32, _: usize, _: i64) -> crate::error::Result<Vec<u8>> {
                unreachable!()
            }
            async fn write(&self, _: i32, _: &[u8]) -> crate::error::Result<usize> {
                unreachable!()
            }
            async fn pwrite(&self, _: i32, _: &[u8], _: i64) -> crate::error::Result<usize> {
                unreachable!()
            }
            async fn lseek(&self, _: i32, _: i64, _: i32) -> crate::error::Result<i64> {
                unreachable!()
            }
            async fn close(&self, _: i32) -> crate::error::Result<()> {
                unreachable!()
            }
            async fn unlink(&self, _: &str) -> crate::error::Result<()> {
                unreachable!()
            }
            async fn system(&self, _: &str) -> crate::error::Result<i32> {
                unreachable!()
            }
        }

        debugger.on_continue(Arc::new(NeverCalled)).await;
    }
}
