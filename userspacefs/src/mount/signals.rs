//! Forwarding OS signals to the watchdog.
//!
//! Signals are never handled asynchronously. They are blocked on the server
//! thread before any helper thread starts, so every thread inherits the
//! mask, and a dedicated thread collects them with `sigwait` and turns them
//! into [`WatchdogToken`]s.

use std::io;
use std::sync::mpsc::Sender;

use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, warn};

use super::watchdog::WatchdogToken;

/// Turns process signals into watchdog tokens.
pub trait SignalRelay: Send + Sync {
    /// Hold back the relayed signals on the calling thread. Must run before
    /// helper threads are spawned.
    fn block(&self) -> io::Result<()>;

    /// Start delivering relayed signals to `tokens`.
    fn forward(&self, tokens: Sender<WatchdogToken>) -> io::Result<()>;
}

/// SIGTERM and SIGINT request shutdown; SIGUSR1 reports a completed mount.
pub fn token_for(signal: Signal) -> Option<WatchdogToken> {
    match signal {
        Signal::SIGTERM | Signal::SIGINT => Some(WatchdogToken::Kill),
        Signal::SIGUSR1 => Some(WatchdogToken::Mounted),
        _ => None,
    }
}

fn relayed_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGUSR1);
    set
}

/// [`SignalRelay`] over real process signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSignalRelay;

impl SignalRelay for UnixSignalRelay {
    fn block(&self) -> io::Result<()> {
        relayed_signals().thread_block()?;
        Ok(())
    }

    fn forward(&self, tokens: Sender<WatchdogToken>) -> io::Result<()> {
        let set = relayed_signals();
        std::thread::Builder::new()
            .name("signal-relay".to_string())
            .spawn(move || loop {
                let signal = match set.wait() {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!(error = %e, "sigwait failed, no longer relaying signals");
                        return;
                    }
                };
                let Some(token) = token_for(signal) else {
                    continue;
                };
                debug!(?signal, ?token, "Relaying signal");
                if tokens.send(token).is_err() {
                    return;
                }
            })?;
        Ok(())
    }
}
