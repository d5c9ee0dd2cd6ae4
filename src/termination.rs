//! Orderly shutdown on termination signals
//!
//! The handlers only store the signal number; dump and restore poll it at
//! every batch boundary and unwind with [`Terminated`], so the session
//! teardown runs on the normal error path. The process then exits with the
//! signal number as its status.

use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::Error;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_signal(signal: libc::c_int) {
    // Nothing but the async-signal-safe store happens here.
    PENDING_SIGNAL.store(signal, Ordering::Relaxed);
}

/// The operation was aborted by a termination signal.
#[derive(thiserror::Error, Debug)]
#[error("terminated by signal {0}")]
pub struct Terminated(pub i32);

/// Install handlers for hangup, interrupt and terminate.
pub fn install_handlers() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe { signal::sigaction(signal, &action) }?;
    }
    Ok(())
}

/// Poll for a pending termination signal. Called between batches so the
/// current library call completes before we unwind.
pub fn check_termination() -> Result<(), Error> {
    match PENDING_SIGNAL.load(Ordering::Relaxed) {
        0 => Ok(()),
        signal => Err(Terminated(signal).into()),
    }
}

/// The process exit status a failed operation asks for: the signal number
/// for signal-driven termination, none for ordinary errors.
pub fn termination_exit_code(err: &Error) -> Option<i32> {
    err.downcast_ref::<Terminated>().map(|terminated| terminated.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pending_signal_surfaces_as_exit_code() {
        assert!(check_termination().is_ok());

        handle_signal(15);
        let err = check_termination().unwrap_err();
        assert_eq!(termination_exit_code(&err), Some(15));

        PENDING_SIGNAL.store(0, Ordering::Relaxed);
        assert!(check_termination().is_ok());

        let plain = anyhow::format_err!("some other failure");
        assert_eq!(termination_exit_code(&plain), None);
    }
}
