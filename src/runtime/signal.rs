//! SIGINT/SIGTERM turned into a graceful shutdown.
//!
//! The signals are blocked on the calling thread, which every thread spawned
//! afterwards inherits, and a dedicated thread collects them with `sigwait`.

use crate::runtime::event_loop::ShutdownHandle;
use std::io;
use std::mem::MaybeUninit;
use std::thread;
use tracing::{info, warn};

/// Signal set holding SIGINT and SIGTERM.
fn shutdown_signals() -> io::Result<libc::sigset_t> {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initializes the set before it is read.
    unsafe {
        if libc::sigemptyset(set.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut set = set.assume_init();
        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaddset(&mut set, sig) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(set)
    }
}

/// Block SIGINT/SIGTERM and spawn a thread that stops the server on either.
///
/// Must be called before any other thread is started.
pub fn shutdown_on_signal(handle: ShutdownHandle) -> io::Result<()> {
    let set = shutdown_signals()?;

    // SAFETY: `set` is an initialized signal set.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            let mut sig: libc::c_int = 0;
            // SAFETY: `set` is initialized and blocked in this thread.
            let rc = unsafe { libc::sigwait(&set, &mut sig) };
            if rc != 0 {
                warn!(error = %io::Error::from_raw_os_error(rc), "sigwait failed");
                return;
            }
            info!(signal = sig, "Received signal, shutting down");
            if let Err(e) = handle.shutdown() {
                warn!(error = %e, "Failed to wake event loop");
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_set() {
        let set = shutdown_signals().unwrap();
        // SAFETY: `set` was initialized by shutdown_signals.
        unsafe {
            assert_eq!(libc::sigismember(&set, libc::SIGINT), 1);
            assert_eq!(libc::sigismember(&set, libc::SIGTERM), 1);
            assert_eq!(libc::sigismember(&set, libc::SIGHUP), 0);
        }
    }
}
