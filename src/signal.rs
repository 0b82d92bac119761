//! Process signal handling.
//!
//! SIGINT and SIGTERM are blocked on the calling thread (and therefore on
//! every thread spawned afterwards) and collected by a dedicated thread with
//! `sigwait`, which then triggers the reactor's stop handle.

use crate::reactor::StopHandle;
use std::io;
use std::ptr;
use std::thread;
use tracing::{info, warn};

/// Route SIGINT/SIGTERM to `stop`. Call before spawning any other thread.
pub fn stop_on_signal(stop: StopHandle) -> io::Result<thread::JoinHandle<()>> {
    // SAFETY: `set` is a plain sigset_t initialised by sigemptyset before use.
    let set = unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);

        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        set
    };

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            let mut signal: libc::c_int = 0;
            // SAFETY: both pointers refer to live locals.
            let rc = unsafe { libc::sigwait(&set, &mut signal) };
            if rc == 0 {
                info!(signal, "Stop signal received");
            } else {
                warn!(error = %io::Error::from_raw_os_error(rc), "sigwait failed");
            }
            stop.stop();
        })
}
