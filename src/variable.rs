//! Thin wrapper around a channel, for watching and poking one server
//! variable.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Registration, SpecChannel, READ_TIMEOUT};
use crate::connection::SpecConnection;
use crate::data::SpecData;
use crate::dispatcher::{DispatchMode, Slot};
use crate::error::SpecError;
use crate::manager;
use crate::wait;

pub struct SpecVariable {
    channel_name: String,
    connection: SpecConnection,
    timeout: Option<Duration>,
}

impl SpecVariable {
    /// A variable named `NAME`, watched through channel `var/NAME`.
    pub fn new(name: &str, connection: &SpecConnection) -> SpecVariable {
        SpecVariable {
            channel_name: format!("var/{name}"),
            connection: connection.clone(),
            timeout: None,
        }
    }

    /// Watch an arbitrary channel name (`status/ready` and friends).
    pub fn from_channel(channel_name: &str, connection: &SpecConnection) -> SpecVariable {
        SpecVariable {
            channel_name: channel_name.to_string(),
            connection: connection.clone(),
            timeout: None,
        }
    }

    /// Bind to a server by address, waiting for the connection.
    pub async fn connect(
        name: &str,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<SpecVariable, SpecError> {
        let connection = manager::connect_to(address)?;
        connection.wait_connection(timeout).await?;
        let mut var = SpecVariable::new(name, &connection);
        var.timeout = timeout;
        Ok(var)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> SpecVariable {
        self.timeout = Some(timeout);
        self
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Subscribe `slot` to updates, registering the channel. The
    /// returned channel keeps the subscription's cache reachable.
    pub fn watch(&self, slot: &Arc<Slot>, mode: DispatchMode) -> Arc<SpecChannel> {
        self.connection
            .register_channel(&self.channel_name, slot, Registration::DoReg, mode)
    }

    /// Current value, fetched from the server.
    pub async fn value(&self) -> Result<SpecData, SpecError> {
        let chan = self.connection.get_channel(&self.channel_name);
        chan.read(self.timeout.or(Some(READ_TIMEOUT)), true).await
    }

    /// Cached value when the variable is watched and a value has
    /// arrived, otherwise a server round-trip.
    pub async fn cached_value(&self) -> Result<SpecData, SpecError> {
        let chan = self.connection.get_channel(&self.channel_name);
        chan.read(self.timeout.or(Some(READ_TIMEOUT)), false).await
    }

    /// Set the variable and return once the write has left the client.
    pub async fn set_value(&self, value: SpecData) -> Result<(), SpecError> {
        let chan = self.connection.get_channel(&self.channel_name);
        chan.write(value, true).await
    }

    /// Wait for the next update, or for a particular value.
    pub async fn wait_update(
        &self,
        expected: Option<&SpecData>,
        timeout: Option<Duration>,
    ) -> Result<SpecData, SpecError> {
        wait::wait_channel_update(&self.connection, &self.channel_name, expected, timeout).await
    }
}
