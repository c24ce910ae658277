use log::info;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartReason {
    ConfigSaved,
    FactoryReset,
    Requested,
    Provisioned,
}

/// Restart requests from any context, the first one wins
#[derive(Clone)]
pub struct RestartHandle {
    sender: Arc<watch::Sender<Option<RestartReason>>>,
}

impl RestartHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        return RestartHandle { sender: Arc::new(sender) };
    }

    pub fn request(&self, reason: RestartReason) {
        let accepted = self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if accepted {
            info!("Restart requested: {reason:?}");
        }
    }

    pub fn requested(&self) -> Option<RestartReason> {
        *self.sender.borrow()
    }

    pub async fn wait(&self) -> RestartReason {
        let mut receiver = self.sender.subscribe();
        let reason = match receiver.wait_for(|r| r.is_some()).await {
            Ok(r) => *r,
            Err(_) => None,
        };
        return reason.unwrap_or(RestartReason::Requested);
    }
}

impl Default for RestartHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces the running process with a fresh copy of itself.
/// Only returns on failure.
#[cfg(unix)]
pub fn restart_process() -> io::Error {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(e) => e,
        Err(e) => return e,
    };
    std::process::Command::new(exe).args(std::env::args_os().skip(1)).exec()
}

#[cfg(not(unix))]
pub fn restart_process() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "re-exec is not available, exit and let the supervisor restart")
}
