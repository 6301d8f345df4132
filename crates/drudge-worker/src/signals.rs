use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalEvent {
    Interrupt,
    Terminate,
    User1,
    User2,
    Hangup,
}

impl SignalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SignalEvent::Interrupt => "INT",
            SignalEvent::Terminate => "TERM",
            SignalEvent::User1 => "USR1",
            SignalEvent::User2 => "USR2",
            SignalEvent::Hangup => "HUP",
        }
    }

    /// Whether the signal asks the worker to stop
    pub fn is_termination(&self) -> bool {
        matches!(self, SignalEvent::Interrupt | SignalEvent::Terminate)
    }
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Start one forwarding task per supported signal. Listeners only push the
/// event; SIGINT and SIGTERM request shutdown, the others a state dump.
#[cfg(unix)]
pub fn install(events: UnboundedSender<SignalEvent>) -> Vec<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::warn;

    let kinds = [
        (SignalEvent::Interrupt, SignalKind::interrupt()),
        (SignalEvent::Terminate, SignalKind::terminate()),
        (SignalEvent::User1, SignalKind::user_defined1()),
        (SignalEvent::User2, SignalKind::user_defined2()),
        (SignalEvent::Hangup, SignalKind::hangup()),
    ];

    let mut tasks = Vec::with_capacity(kinds.len());
    for (event, kind) in kinds {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Signal {} not supported: {}", event, e);
                continue;
            }
        };

        let events = events.clone();
        tasks.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if events.send(event).is_err() {
                    break;
                }
            }
        }));
    }
    tasks
}

/// Only Ctrl-C is forwarded here
#[cfg(not(unix))]
pub fn install(events: UnboundedSender<SignalEvent>) -> Vec<JoinHandle<()>> {
    vec![tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if events.send(SignalEvent::Interrupt).is_err() {
                break;
            }
        }
    })]
}
