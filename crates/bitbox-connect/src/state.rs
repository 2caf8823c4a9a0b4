use bbp_crypto::PairingCode;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::DeviceError;
use crate::types::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Disconnected,
    /// Connected, no secure channel yet.
    Unpaired,
    Locked,
    Unlocked,
    /// A signing call is executing.
    Busy,
}

/// What a command needs from the device before it may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    /// Paired channel only.
    Query,
    /// Paired and unlocked.
    Keys,
    /// Paired and unlocked.
    Signing,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    StateChanged {
        from: DeviceState,
        to: DeviceState,
    },
    PairingCode(PairingCode),
    ChannelResumed,
    Progress {
        call_id: u32,
        progress: Progress,
    },
    Disconnected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid device state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: DeviceState,
    pub to: DeviceState,
}

pub fn is_allowed(from: DeviceState, to: DeviceState) -> bool {
    use DeviceState::*;
    matches!(
        (from, to),
        (_, Disconnected)
            | (Unpaired, Locked | Unlocked)
            | (Locked, Unlocked)
            | (Unlocked, Locked | Busy)
            | (Busy, Unlocked | Locked)
            | (Locked | Unlocked | Busy, Unpaired)
    )
}

#[derive(Debug)]
pub struct DeviceStateMachine {
    state: DeviceState,
}

impl Default for DeviceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateMachine {
    /// A freshly connected device.
    pub fn new() -> Self {
        Self {
            state: DeviceState::Unpaired,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Moves to `to`. Returns the previous state, or `None` if already there.
    pub fn transition(&mut self, to: DeviceState) -> Result<Option<DeviceState>, InvalidTransition> {
        let from = self.state;
        if from == to {
            return Ok(None);
        }
        if !is_allowed(from, to) {
            return Err(InvalidTransition { from, to });
        }
        self.state = to;
        Ok(Some(from))
    }

    /// Gate applied before a command touches the wire.
    pub fn check(&self, category: CommandCategory) -> Result<(), DeviceError> {
        match (self.state, category) {
            (DeviceState::Disconnected, _) => Err(DeviceError::Disconnected),
            (DeviceState::Unpaired, _) => Err(DeviceError::NotPaired),
            (DeviceState::Busy, _) => Err(DeviceError::DeviceBusy),
            (DeviceState::Locked, CommandCategory::Query) => Ok(()),
            (DeviceState::Locked, _) => Err(DeviceError::DeviceLocked),
            (DeviceState::Unlocked, _) => Ok(()),
        }
    }
}

/// State machine plus the event stream observers subscribe to.
#[derive(Debug)]
pub struct StateCell {
    machine: Mutex<DeviceStateMachine>,
    events: broadcast::Sender<DeviceEvent>,
}

impl StateCell {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            machine: Mutex::new(DeviceStateMachine::new()),
            events,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.machine.lock().state()
    }

    pub fn check(&self, category: CommandCategory) -> Result<(), DeviceError> {
        self.machine.lock().check(category)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: DeviceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Applies a transition and publishes it. Invalid transitions are logged and ignored.
    pub fn transition(&self, to: DeviceState) -> bool {
        let result = self.machine.lock().transition(to);
        match result {
            Ok(Some(from)) => {
                debug!("device state {from:?} -> {to:?}");
                self.publish(DeviceEvent::StateChanged { from, to });
                if to == DeviceState::Disconnected {
                    self.publish(DeviceEvent::Disconnected);
                }
                true
            }
            Ok(None) => true,
            Err(err) => {
                warn!("{err}");
                false
            }
        }
    }
}
