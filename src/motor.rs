//! Motor facade: state tracking over the motor channels plus the usual
//! movement operations.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use tokio::sync::watch;

use crate::channel::{Registration, READ_TIMEOUT};
use crate::command::SpecCommand;
use crate::connection::SpecConnection;
use crate::data::SpecData;
use crate::dispatcher::{DispatchMode, Slot};
use crate::error::SpecError;
use crate::manager;
use crate::wait;

/// Limit-switch bits, as published by the server.
pub const LOW_LIMIT_HIT: u8 = 2;
pub const HIGH_LIMIT_HIT: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    NotInitialized,
    Unusable,
    Ready,
    MoveStarted,
    Moving,
    OnLimit,
}

pub type PositionHook = Box<dyn Fn(f64) + Send + Sync>;
pub type StateHook = Box<dyn Fn(MotorState) + Send + Sync>;
pub type LimitsHook = Box<dyn Fn() + Send + Sync>;
/// Answers the controller/server step discrepancy question; return
/// `"1"` to accept the server's count, `"0"` to keep the controller's.
pub type SyncCheckHook = Box<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

struct MotorShared {
    state: Mutex<MotorState>,
    limit: Mutex<u8>,
    old_position: Mutex<Option<f64>>,
    ready: watch::Sender<bool>,
    on_position: Mutex<Option<PositionHook>>,
    on_state: Mutex<Option<StateHook>>,
    on_limits: Mutex<Option<LimitsHook>>,
    on_sync_check: Mutex<Option<SyncCheckHook>>,
}

impl MotorShared {
    fn change_state(&self, state: MotorState) {
        *self.state.lock().unwrap() = state;
        self.ready.send_replace(matches!(
            state,
            MotorState::Unusable | MotorState::Ready | MotorState::OnLimit
        ));
        if let Some(hook) = self.on_state.lock().unwrap().as_ref() {
            hook(state);
        }
    }

    fn limits_changed(&self) {
        if let Some(hook) = self.on_limits.lock().unwrap().as_ref() {
            hook();
        }
    }
}

pub struct SpecMotor {
    name: String,
    connection: SpecConnection,
    timeout: Option<Duration>,
    shared: Arc<MotorShared>,
    // Slots live here; the dispatcher only keeps weak references.
    _slots: Vec<Arc<Slot>>,
}

impl SpecMotor {
    pub fn new(name: &str, connection: &SpecConnection) -> SpecMotor {
        let shared = Arc::new(MotorShared {
            state: Mutex::new(MotorState::NotInitialized),
            limit: Mutex::new(0),
            old_position: Mutex::new(None),
            ready: watch::channel(false).0,
            on_position: Mutex::new(None),
            on_state: Mutex::new(None),
            on_limits: Mutex::new(None),
            on_sync_check: Mutex::new(None),
        });
        let mut motor = SpecMotor {
            name: name.to_string(),
            connection: connection.clone(),
            timeout: None,
            shared,
            _slots: Vec::new(),
        };
        motor.wire_up();
        motor
    }

    /// Bind to a motor on a server by address, waiting for the
    /// connection.
    pub async fn connect(
        name: &str,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<SpecMotor, SpecError> {
        let connection = manager::connect_to(address)?;
        connection.wait_connection(timeout).await?;
        let mut motor = SpecMotor::new(name, &connection);
        motor.timeout = timeout;
        Ok(motor)
    }

    fn chan(&self, field: &str) -> String {
        format!("motor/{}/{}", self.name, field)
    }

    fn wire_up(&mut self) {
        let shared = &self.shared;

        let limits_slot: Arc<Slot> = {
            let shared = shared.clone();
            Arc::new(move |_| shared.limits_changed())
        };

        let position_slot: Arc<Slot> = {
            let shared = shared.clone();
            Arc::new(move |args| {
                let Some(position) = args.first().and_then(SpecData::as_f64) else {
                    return;
                };
                let mut old = shared.old_position.lock().unwrap();
                if let Some(previous) = *old {
                    if (position - previous).abs() <= 1e-6 {
                        return;
                    }
                }
                *old = Some(position);
                drop(old);
                if let Some(hook) = shared.on_position.lock().unwrap().as_ref() {
                    hook(position);
                }
            })
        };

        let move_done_slot: Arc<Slot> = {
            let shared = shared.clone();
            Arc::new(move |args| {
                let moving = args.first().map(SpecData::truthy).unwrap_or(false);
                apply_move_done(&shared, moving);
            })
        };

        let lim_hit_slot: Arc<Slot> = {
            let shared = shared.clone();
            Arc::new(move |args| {
                let hit = args.first().map(SpecData::truthy).unwrap_or(false);
                let Some(SpecData::Str(chan_name)) = args.get(1) else { return };
                if hit {
                    let mut limit = shared.limit.lock().unwrap();
                    if chan_name.ends_with("low_lim_hit") {
                        *limit |= LOW_LIMIT_HIT;
                    } else {
                        *limit |= HIGH_LIMIT_HIT;
                    }
                    drop(limit);
                    shared.change_state(MotorState::OnLimit);
                }
            })
        };

        let unusable_slot: Arc<Slot> = {
            let shared = shared.clone();
            Arc::new(move |args| {
                if args.first().map(SpecData::truthy).unwrap_or(false) {
                    shared.change_state(MotorState::Unusable);
                } else {
                    shared.change_state(MotorState::Ready);
                }
            })
        };

        let sync_check_slot: Arc<Slot> = {
            let shared = shared.clone();
            let connection = self.connection.clone();
            let chan_name = self.chan("sync_check");
            Arc::new(move |args| {
                let Some(SpecData::Str(question)) = args.first() else { return };
                let mut steps = question.split_whitespace();
                let (Some(server_steps), Some(controller_steps)) = (steps.next(), steps.next())
                else {
                    return;
                };
                let answer = shared
                    .on_sync_check
                    .lock()
                    .unwrap()
                    .as_ref()
                    .and_then(|hook| hook(server_steps, controller_steps));
                if let Some(answer) = answer {
                    let chan = connection.get_channel(&chan_name);
                    if let Err(e) = chan.write_nowait(SpecData::Str(answer)) {
                        warn!("sync_check answer failed: {e}");
                    }
                }
            })
        };

        // Registration of the motor channels, repeated on every
        // reconnection.
        let registrations: Vec<(String, Arc<Slot>, DispatchMode)> = vec![
            (self.chan("low_limit"), limits_slot.clone(), DispatchMode::UpdateValue),
            (self.chan("high_limit"), limits_slot.clone(), DispatchMode::UpdateValue),
            (self.chan("position"), position_slot.clone(), DispatchMode::FireEvent),
            (self.chan("move_done"), move_done_slot.clone(), DispatchMode::FireEvent),
            (self.chan("high_lim_hit"), lim_hit_slot.clone(), DispatchMode::UpdateValue),
            (self.chan("low_lim_hit"), lim_hit_slot.clone(), DispatchMode::UpdateValue),
            (self.chan("sync_check"), sync_check_slot.clone(), DispatchMode::UpdateValue),
            (self.chan("unusable"), unusable_slot.clone(), DispatchMode::UpdateValue),
            (self.chan("offset"), limits_slot.clone(), DispatchMode::UpdateValue),
            (self.chan("sign"), limits_slot.clone(), DispatchMode::UpdateValue),
        ];

        let connected_slot: Arc<Slot> = {
            let connection = self.connection.clone();
            let registrations = registrations.clone();
            Arc::new(move |_| {
                for (chan_name, slot, mode) in &registrations {
                    connection.register_channel(chan_name, slot, Registration::DoReg, *mode);
                }
            })
        };

        let disconnected_slot: Arc<Slot> = {
            let shared = shared.clone();
            Arc::new(move |_| shared.change_state(MotorState::NotInitialized))
        };

        self.connection
            .subscribe("connected", &connected_slot, DispatchMode::FireEvent);
        self.connection
            .subscribe("disconnected", &disconnected_slot, DispatchMode::FireEvent);
        if self.connection.is_connected() {
            (*connected_slot)(&[]);
        }

        self._slots = vec![
            limits_slot,
            position_slot,
            move_done_slot,
            lim_hit_slot,
            unusable_slot,
            sync_check_slot,
            connected_slot,
            disconnected_slot,
        ];
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &SpecConnection {
        &self.connection
    }

    async fn read_field(&self, field: &str) -> Result<SpecData, SpecError> {
        let chan = self.connection.get_channel(&self.chan(field));
        chan.read(self.timeout.or(Some(READ_TIMEOUT)), false).await
    }

    pub async fn position(&self) -> Result<f64, SpecError> {
        number(self.read_field("position").await?)
    }

    pub async fn dial_position(&self) -> Result<f64, SpecError> {
        number(self.read_field("dial_position").await?)
    }

    pub async fn sign(&self) -> Result<f64, SpecError> {
        number(self.read_field("sign").await?)
    }

    pub async fn offset(&self) -> Result<f64, SpecError> {
        number(self.read_field("offset").await?)
    }

    pub async fn set_offset(&self, offset: f64) -> Result<(), SpecError> {
        let chan = self.connection.get_channel(&self.chan("offset"));
        chan.write(SpecData::Double(offset), true).await
    }

    /// Limits in user units, low before high whatever the sign.
    pub async fn limits(&self) -> Result<(f64, f64), SpecError> {
        let sign = self.sign().await?;
        let offset = self.offset().await?;
        let low = number(self.read_field("low_limit").await?)? * sign + offset;
        let high = number(self.read_field("high_limit").await?)? * sign + offset;
        Ok((low.min(high), low.max(high)))
    }

    /// Start a move to an absolute position; with `wait`, block until
    /// the motor settles.
    pub async fn move_to(&self, position: f64, wait: bool) -> Result<(), SpecError> {
        self.shared.change_state(MotorState::MoveStarted);
        let chan = self.connection.get_channel(&self.chan("start_one"));
        chan.write(SpecData::Double(position), false).await?;
        if wait {
            self.wait_move(self.timeout).await?;
        }
        Ok(())
    }

    pub async fn move_relative(&self, delta: f64, wait: bool) -> Result<(), SpecError> {
        let position = self.position().await?;
        self.move_to(position + delta, wait).await
    }

    /// Wait until the motor reports ready again.
    pub async fn wait_move(&self, timeout: Option<Duration>) -> Result<(), SpecError> {
        let mut ready = self.shared.ready.subscribe();
        wait::with_timeout(timeout, async move {
            loop {
                if *ready.borrow_and_update() {
                    return Ok(());
                }
                if ready.changed().await.is_err() {
                    return Err(SpecError::Disconnected);
                }
            }
        })
        .await
    }

    /// Drive continuously towards the high (`true`) or low (`false`)
    /// limit. Does nothing while the interpreter is busy.
    pub async fn move_to_limit(&self, high: bool) -> Result<(), SpecError> {
        let command = SpecCommand::new("_mvc", &self.connection);
        if !command.is_ready().await {
            return Ok(());
        }
        let direction = if high { 1 } else { -1 };
        match self.connection.server_version() {
            Some(v) if v >= 3 => self
                .connection
                .send_function("_mvc", &[SpecData::Int(direction)]),
            Some(_) => self.connection.send_command(&format!("_mvc {direction}")),
            None => Err(SpecError::NotConnected),
        }
    }

    pub fn stop_move_to_limit(&self) -> Result<(), SpecError> {
        self.connection
            .write_channel_nowait("var/_MVC_CONTINUE_MOVING", SpecData::Int(0))
    }

    /// Stop the motor: aborts the server and waits until the frame is
    /// on the wire.
    pub async fn stop(&self) -> Result<(), SpecError> {
        self.connection.abort_wait().await
    }

    pub async fn get_parameter(&self, parameter: &str) -> Result<SpecData, SpecError> {
        self.read_field(parameter).await
    }

    pub async fn set_parameter(&self, parameter: &str, value: SpecData) -> Result<(), SpecError> {
        let chan = self.connection.get_channel(&self.chan(parameter));
        chan.write(value, true).await
    }

    /// State as tracked from the registered channels.
    pub fn state(&self) -> MotorState {
        *self.shared.state.lock().unwrap()
    }

    /// Force a `move_done` read and fold it into the state.
    pub async fn read_state(&self) -> Result<MotorState, SpecError> {
        let chan = self.connection.get_channel(&self.chan("move_done"));
        let value = chan.read(self.timeout.or(Some(READ_TIMEOUT)), true).await?;
        apply_move_done(&self.shared, value.truthy());
        Ok(self.state())
    }

    /// Limit-switch bits accumulated since the last move.
    pub fn limit_hit(&self) -> u8 {
        *self.shared.limit.lock().unwrap()
    }

    pub fn on_position_changed(&self, hook: PositionHook) {
        *self.shared.on_position.lock().unwrap() = Some(hook);
    }

    pub fn on_state_changed(&self, hook: StateHook) {
        *self.shared.on_state.lock().unwrap() = Some(hook);
    }

    pub fn on_limits_changed(&self, hook: LimitsHook) {
        *self.shared.on_limits.lock().unwrap() = Some(hook);
    }

    pub fn set_sync_check_handler(&self, hook: SyncCheckHook) {
        *self.shared.on_sync_check.lock().unwrap() = Some(hook);
    }
}

fn apply_move_done(shared: &MotorShared, moving: bool) {
    if moving {
        shared.change_state(MotorState::Moving);
        return;
    }
    let state = *shared.state.lock().unwrap();
    if matches!(
        state,
        MotorState::Moving | MotorState::MoveStarted | MotorState::NotInitialized
    ) {
        shared.change_state(MotorState::Ready);
    }
}

fn number(value: SpecData) -> Result<f64, SpecError> {
    value.as_f64().ok_or_else(|| SpecError::Protocol {
        code: 0,
        message: format!("expected a number, got {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<MotorShared> {
        Arc::new(MotorShared {
            state: Mutex::new(MotorState::NotInitialized),
            limit: Mutex::new(0),
            old_position: Mutex::new(None),
            ready: watch::channel(false).0,
            on_position: Mutex::new(None),
            on_state: Mutex::new(None),
            on_limits: Mutex::new(None),
            on_sync_check: Mutex::new(None),
        })
    }

    #[test]
    fn move_done_edges_drive_the_state_machine() {
        let s = shared();
        apply_move_done(&s, true);
        assert_eq!(*s.state.lock().unwrap(), MotorState::Moving);
        assert!(!*s.ready.subscribe().borrow());
        apply_move_done(&s, false);
        assert_eq!(*s.state.lock().unwrap(), MotorState::Ready);
        assert!(*s.ready.subscribe().borrow());
    }

    #[test]
    fn move_done_low_leaves_limit_state_alone() {
        let s = shared();
        s.change_state(MotorState::OnLimit);
        apply_move_done(&s, false);
        assert_eq!(*s.state.lock().unwrap(), MotorState::OnLimit);
    }
}
