use crate::config::{jittered, SessionConfig};
use crate::connection::{CommandSender, Connection, TaskGuard};
use crate::device::{DeviceInner, DeviceState};
use crate::error::Result;
use crate::protocol::{Command, FrameDecoder, Message, FIRST_UPDATE_KEY};
use crate::types::{DeviceEvent, SessionState};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Running session task of one device
pub(crate) struct SessionHandle {
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

pub(crate) fn spawn(inner: Arc<DeviceInner>, epoch: u64) -> SessionHandle {
    SessionHandle {
        task: tokio::spawn(run(inner, epoch)),
    }
}

/// Live connection together with its periodic refresh
struct Live {
    connection: Connection,
    _refresh: TaskGuard,
    /// The device has sent at least one well-formed record on this connection
    healthy: bool,
    /// A transport error was already counted for this connection
    failed: bool,
}

/// Apply `f` to the device state unless the session has been superseded
fn with_state<R>(inner: &DeviceInner, epoch: u64, f: impl FnOnce(&mut DeviceState) -> R) -> Option<R> {
    let mut state = inner.lock();
    if state.epoch != epoch {
        return None;
    }
    Some(f(&mut state))
}

async fn run(inner: Arc<DeviceInner>, epoch: u64) {
    let name = inner.name.clone();
    let config = inner.config.clone();
    let mut decoder = FrameDecoder::new();
    let mut live: Option<Live> = None;

    loop {
        let Some(errors) = with_state(&inner, epoch, |state| state.error_count) else {
            return;
        };
        if errors > config.max_errors {
            tracing::error!("{}: Too many errors, stopping session", name);
            drop(live.take());
            give_up(&inner, epoch);
            break;
        }

        if live.is_none() {
            if with_state(&inner, epoch, |state| state.session = SessionState::Connecting).is_none() {
                return;
            }
            match Connection::connect(&name, inner.socket_addr()).await {
                Ok(connection) => {
                    decoder.clear();
                    let sender = connection.sender();
                    if !connected(&inner, epoch, sender.clone()) {
                        return;
                    }
                    tracing::info!("{}: Connected to {}", name, inner.socket_addr());
                    live = Some(Live {
                        connection,
                        _refresh: spawn_refresh(name.clone(), sender, config.clone()),
                        healthy: false,
                        failed: false,
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        "{}: Connect failed, retrying in {:?}: {}",
                        name,
                        config.reconnect_delay,
                        e
                    );
                    if with_state(&inner, epoch, |state| state.session = SessionState::Disconnected)
                        .is_none()
                    {
                        return;
                    }
                    sleep(config.reconnect_delay).await;
                    continue;
                }
            }
        }

        let Some(current) = live.as_mut() else {
            continue;
        };
        match current.connection.recv().await {
            Some(Ok(chunk)) => {
                for frame in decoder.decode(&chunk) {
                    if handle_frame(&inner, epoch, &frame) && !current.healthy {
                        current.healthy = true;
                        with_state(&inner, epoch, |state| state.error_count = 0);
                    }
                }
            }
            Some(Err(e)) => {
                tracing::debug!("{}: Receive error: {}", name, e);
                current.failed = true;
                with_state(&inner, epoch, |state| state.error_count += 1);
                sleep(config.error_pause).await;
            }
            None => {
                tracing::warn!("{}: Connection lost", name);
                if !current.healthy && !current.failed {
                    // closed before the device ever answered
                    with_state(&inner, epoch, |state| state.error_count += 1);
                }
                live = None;
                disconnected(&inner, epoch);
                sleep(config.disconnect_pause).await;
            }
        }
    }
}

fn connected(inner: &DeviceInner, epoch: u64, sender: CommandSender) -> bool {
    let current = with_state(inner, epoch, |state| {
        state.sender = Some(sender);
        state.session = SessionState::Connected;
    });
    if current.is_some() {
        inner.subscribers.notify(DeviceEvent::Connected);
    }
    current.is_some()
}

fn disconnected(inner: &DeviceInner, epoch: u64) {
    let was_connected = with_state(inner, epoch, |state| {
        state.sender = None;
        let was_connected = state.session == SessionState::Connected;
        state.session = SessionState::Disconnected;
        was_connected
    });
    if was_connected == Some(true) {
        inner.subscribers.notify(DeviceEvent::Disconnected);
    }
}

fn give_up(inner: &DeviceInner, epoch: u64) {
    let was_connected = with_state(inner, epoch, |state| {
        state.sender = None;
        let was_connected = state.session == SessionState::Connected;
        state.session = SessionState::Stopped;
        was_connected
    });
    if was_connected == Some(true) {
        inner.subscribers.notify(DeviceEvent::Disconnected);
    }
}

/// Apply one record to the device; returns `false` if it was malformed
pub(crate) fn handle_frame(inner: &DeviceInner, epoch: u64, frame: &str) -> bool {
    let (key, value) = match Message::parse(frame) {
        Ok(Message::Param { key, value }) => (key, value),
        Ok(Message::Error(detail)) => {
            tracing::error!("{}: Device reported error: {}", inner.name, detail);
            return true;
        }
        Err(e) => {
            tracing::warn!("{}: {}", inner.name, e);
            return false;
        }
    };

    let changed = with_state(inner, epoch, |state| {
        let changed = state.params.apply(&key, &value).is_changed();
        if changed {
            state.info.mirror(&key, &value);
        }
        changed
    });
    if changed != Some(true) {
        return true;
    }

    tracing::debug!("{}: Param updated: [{}]='{}'", inner.name, key, value);
    if key == FIRST_UPDATE_KEY {
        inner.first_update.send_if_modified(|done| !std::mem::replace(done, true));
    }
    inner
        .subscribers
        .notify(DeviceEvent::Changed { key, value });
    true
}

fn request_status(name: &str, sender: &CommandSender) -> Result<()> {
    sender.send(&Command::bare(name, "GETALL"))?;
    sender.send(&Command::get(name, "SNSROCC;STATUS"))
}

fn spawn_refresh(name: String, sender: CommandSender, config: SessionConfig) -> TaskGuard {
    TaskGuard::spawn(async move {
        loop {
            if sender.is_closed() {
                break;
            }
            tracing::debug!("{}: Requesting full status", name);
            if let Err(e) = request_status(&name, &sender) {
                tracing::debug!("{}: Status request failed: {}", name, e);
            }
            sleep(jittered(config.refresh_interval, config.refresh_jitter)).await;
        }
    })
}
