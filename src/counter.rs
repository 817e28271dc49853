//! Counter facade: acquisition control through the global count channel
//! and per-counter value tracking.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{Registration, READ_TIMEOUT};
use crate::command::SpecCommand;
use crate::connection::SpecConnection;
use crate::data::SpecData;
use crate::dispatcher::{DispatchMode, Slot};
use crate::error::SpecError;
use crate::manager;
use crate::wait;

/// The channel steering every counter at once.
pub const ALL_COUNT: &str = "scaler/.all./count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    NotInitialized,
    NotCounting,
    Counting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterType {
    Unknown,
    Scaler,
    Timer,
    Monitor,
}

pub type ValueHook = Box<dyn Fn(f64) + Send + Sync>;
pub type CounterStateHook = Box<dyn Fn(CounterState) + Send + Sync>;

struct CounterShared {
    state: Mutex<CounterState>,
    ctype: Mutex<CounterType>,
    old_value: Mutex<Option<f64>>,
    on_value: Mutex<Option<ValueHook>>,
    on_state: Mutex<Option<CounterStateHook>>,
}

impl CounterShared {
    fn change_state(&self, state: CounterState) {
        *self.state.lock().unwrap() = state;
        if let Some(hook) = self.on_state.lock().unwrap().as_ref() {
            hook(state);
        }
    }

    fn apply_count_channel(&self, value: &SpecData) {
        if value.truthy() {
            self.change_state(CounterState::Counting);
        } else {
            self.change_state(CounterState::NotCounting);
        }
    }
}

pub struct SpecCounter {
    name: String,
    connection: SpecConnection,
    timeout: Option<Duration>,
    shared: Arc<CounterShared>,
    // Slots live here; the dispatcher only keeps weak references.
    _slots: Vec<Arc<Slot>>,
}

impl SpecCounter {
    pub fn new(name: &str, connection: &SpecConnection) -> SpecCounter {
        let shared = Arc::new(CounterShared {
            state: Mutex::new(CounterState::NotInitialized),
            ctype: Mutex::new(CounterType::Unknown),
            old_value: Mutex::new(None),
            on_value: Mutex::new(None),
            on_state: Mutex::new(None),
        });
        let mut counter = SpecCounter {
            name: name.to_string(),
            connection: connection.clone(),
            timeout: None,
            shared,
            _slots: Vec::new(),
        };
        counter.wire_up();
        counter
    }

    /// Bind to a counter on a server by address, waiting for the
    /// connection.
    pub async fn connect(
        name: &str,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<SpecCounter, SpecError> {
        let connection = manager::connect_to(address)?;
        connection.wait_connection(timeout).await?;
        let mut counter = SpecCounter::new(name, &connection);
        counter.timeout = timeout;
        Ok(counter)
    }

    fn value_channel(&self) -> String {
        format!("scaler/{}/value", self.name)
    }

    fn wire_up(&mut self) {
        let value_slot: Arc<Slot> = {
            let shared = self.shared.clone();
            Arc::new(move |args| {
                let Some(value) = args.first().and_then(SpecData::as_f64) else {
                    return;
                };
                let mut old = shared.old_value.lock().unwrap();
                if let Some(previous) = *old {
                    if (value - previous).abs() <= 1e-6 {
                        return;
                    }
                }
                *old = Some(value);
                drop(old);
                if let Some(hook) = shared.on_value.lock().unwrap().as_ref() {
                    hook(value);
                }
            })
        };

        let count_slot: Arc<Slot> = {
            let shared = self.shared.clone();
            Arc::new(move |args| {
                if let Some(value) = args.first() {
                    shared.apply_count_channel(value);
                }
            })
        };

        let connected_slot: Arc<Slot> = {
            let connection = self.connection.clone();
            let value_channel = self.value_channel();
            let value_slot = value_slot.clone();
            let count_slot = count_slot.clone();
            Arc::new(move |_| {
                connection.register_channel(
                    &value_channel,
                    &value_slot,
                    Registration::DoReg,
                    DispatchMode::UpdateValue,
                );
                connection.register_channel(
                    ALL_COUNT,
                    &count_slot,
                    Registration::DoReg,
                    DispatchMode::UpdateValue,
                );
            })
        };

        let disconnected_slot: Arc<Slot> = {
            let shared = self.shared.clone();
            Arc::new(move |_| shared.change_state(CounterState::NotInitialized))
        };

        self.connection
            .subscribe("connected", &connected_slot, DispatchMode::FireEvent);
        self.connection
            .subscribe("disconnected", &disconnected_slot, DispatchMode::FireEvent);
        if self.connection.is_connected() {
            (*connected_slot)(&[]);
        }

        self._slots = vec![value_slot, count_slot, connected_slot, disconnected_slot];
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &SpecConnection {
        &self.connection
    }

    /// The counter's role, looked up once and cached: index 0 is the
    /// timer, 1 the monitor, everything else a plain scaler.
    pub async fn counter_type(&self) -> Result<CounterType, SpecError> {
        {
            let ctype = self.shared.ctype.lock().unwrap();
            if *ctype != CounterType::Unknown {
                return Ok(*ctype);
            }
        }
        let chan = self.connection.get_channel(&format!("var/{}", self.name));
        let index = chan
            .read(self.timeout.or(Some(READ_TIMEOUT)), false)
            .await?
            .as_i32();
        let ctype = match index {
            Some(0) => CounterType::Timer,
            Some(1) => CounterType::Monitor,
            _ => CounterType::Scaler,
        };
        *self.shared.ctype.lock().unwrap() = ctype;
        Ok(ctype)
    }

    /// Start an acquisition: count for `time` seconds, or up to `time`
    /// monitor counts for monitor counters. With `wait`, block until
    /// counting finishes and return the counter's value.
    pub async fn count(&self, time: f64, wait: bool) -> Result<Option<f64>, SpecError> {
        let preset = if self.counter_type().await? == CounterType::Monitor {
            -time
        } else {
            time
        };
        let chan = self.connection.get_channel(ALL_COUNT);
        chan.write(SpecData::Double(preset), false).await?;
        if wait {
            return Ok(Some(self.wait_count(self.timeout).await?));
        }
        Ok(None)
    }

    /// Wait for the running acquisition to finish, then return the
    /// counter's value.
    pub async fn wait_count(&self, timeout: Option<Duration>) -> Result<f64, SpecError> {
        wait::wait_channel_update(&self.connection, ALL_COUNT, Some(&SpecData::Int(0)), timeout)
            .await?;
        self.value().await
    }

    /// Stop a running acquisition.
    pub async fn stop(&self) -> Result<(), SpecError> {
        let chan = self.connection.get_channel(ALL_COUNT);
        chan.write(SpecData::Int(0), false).await
    }

    pub async fn value(&self) -> Result<f64, SpecError> {
        let chan = self.connection.get_channel(&self.value_channel());
        let value = chan.read(self.timeout.or(Some(READ_TIMEOUT)), false).await?;
        value.as_f64().ok_or_else(|| SpecError::Protocol {
            code: 0,
            message: format!("expected a number, got {value:?}"),
        })
    }

    /// State as tracked from the global count channel.
    pub fn state(&self) -> CounterState {
        *self.shared.state.lock().unwrap()
    }

    /// Force a read of the global count channel and fold it into the
    /// state.
    pub async fn read_state(&self) -> Result<CounterState, SpecError> {
        let chan = self.connection.get_channel(ALL_COUNT);
        let value = chan.read(self.timeout.or(Some(READ_TIMEOUT)), true).await?;
        self.shared.apply_count_channel(&value);
        Ok(self.state())
    }

    /// Enable or disable the counter through `counter_par`.
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), SpecError> {
        let disable = if enabled { 0 } else { 1 };
        SpecCommand::new("counter_par", &self.connection)
            .run_as_function(&[
                SpecData::Str(self.name.clone()),
                SpecData::Str("disable".to_string()),
                SpecData::Int(disable),
            ])
            .await?;
        Ok(())
    }

    pub async fn is_enabled(&self) -> Result<bool, SpecError> {
        let disabled = SpecCommand::new("counter_par", &self.connection)
            .run_as_function(&[
                SpecData::Str(self.name.clone()),
                SpecData::Str("disable".to_string()),
            ])
            .await?;
        Ok(!disabled.truthy())
    }

    pub fn on_value_changed(&self, hook: ValueHook) {
        *self.shared.on_value.lock().unwrap() = Some(hook);
    }

    pub fn on_state_changed(&self, hook: CounterStateHook) {
        *self.shared.on_state.lock().unwrap() = Some(hook);
    }
}
