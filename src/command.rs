//! Command objects: one server macro or function bound to a connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use crate::channel::READ_TIMEOUT;
use crate::connection::{CommandForm, SpecConnection};
use crate::data::SpecData;
use crate::error::SpecError;
use crate::manager;
use crate::reply::{ReplyCallback, ReplyFuture};

pub type ReplyHook = Box<dyn FnOnce(&SpecData) + Send>;
pub type ErrorHook = Box<dyn FnOnce(&SpecError) + Send>;

/// A named command on the server.
///
/// On peers of protocol generation 3 and later the call travels as a
/// typed `[name, args…]` list; older peers get a formatted text command
/// with every argument rendered as a literal.
pub struct SpecCommand {
    name: String,
    connection: SpecConnection,
    timeout: Option<Duration>,
}

impl SpecCommand {
    pub fn new(name: &str, connection: &SpecConnection) -> SpecCommand {
        SpecCommand {
            name: name.to_string(),
            connection: connection.clone(),
            timeout: None,
        }
    }

    /// Bind to a server by address, waiting for the connection.
    pub async fn connect(
        name: &str,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<SpecCommand, SpecError> {
        let connection = manager::connect_to(address)?;
        connection.wait_connection(timeout).await?;
        Ok(SpecCommand::new(name, &connection))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> SpecCommand {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Whether the server is idle and ready to take commands.
    pub async fn is_ready(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let status = self.connection.get_channel("status/ready");
        match status.read(self.timeout.or(Some(READ_TIMEOUT)), false).await {
            Ok(value) => value.truthy(),
            Err(_) => false,
        }
    }

    fn form(&self, args: &[SpecData], function: bool) -> Result<CommandForm, SpecError> {
        match self.connection.server_version() {
            None => Err(SpecError::NotConnected),
            Some(v) if v < 3 => {
                let rendered: Vec<String> = args.iter().map(|a| a.repr()).collect();
                let text = if function {
                    format!("{}({})", self.name, rendered.join(","))
                } else if rendered.is_empty() {
                    self.name.clone()
                } else {
                    format!("{} {}", self.name, rendered.join(" "))
                };
                Ok(CommandForm::Text(text))
            }
            Some(_) => {
                let mut call = Vec::with_capacity(args.len() + 1);
                call.push(SpecData::Str(self.name.clone()));
                call.extend_from_slice(args);
                Ok(CommandForm::Call(call))
            }
        }
    }

    /// Execute and wait for the result. A server-side failure raises
    /// [`SpecError::Protocol`]; no abort is issued on failure or
    /// timeout.
    pub async fn run(&self, args: &[SpecData]) -> Result<SpecData, SpecError> {
        let form = self.form(args, false)?;
        let reply = self.connection.command_with_reply(form, None)?;
        reply.wait(self.timeout).await
    }

    /// Like [`run`](Self::run) but rendered in macro-function form
    /// (`name(a,b)`) on old peers.
    pub async fn run_as_function(&self, args: &[SpecData]) -> Result<SpecData, SpecError> {
        let form = self.form(args, true)?;
        let reply = self.connection.command_with_reply(form, None)?;
        reply.wait(self.timeout).await
    }

    /// Execute without waiting. The returned handle resolves with the
    /// reply; dropping or cancelling it while the command is still
    /// running aborts the server.
    pub fn start(&self, args: &[SpecData]) -> Result<CommandHandle, SpecError> {
        self.start_with(args, None, None)
    }

    /// [`start`](Self::start) with completion hooks: `on_reply` runs on
    /// success, `on_error` on a server-reported failure.
    pub fn start_with(
        &self,
        args: &[SpecData],
        on_reply: Option<ReplyHook>,
        on_error: Option<ErrorHook>,
    ) -> Result<CommandHandle, SpecError> {
        let form = self.form(args, false)?;
        let done = Arc::new(AtomicBool::new(false));
        let seen = done.clone();
        let name = self.name.clone();
        let callback: ReplyCallback = Box::new(move |result| {
            seen.store(true, Ordering::SeqCst);
            match result {
                Ok(data) => {
                    if let Some(hook) = on_reply {
                        hook(data);
                    }
                }
                Err(err) => {
                    error!("command '{name}' failed: {err}");
                    if let Some(hook) = on_error {
                        hook(err);
                    }
                }
            }
        });
        let reply = self.connection.command_with_reply(form, Some(callback))?;
        Ok(CommandHandle {
            name: self.name.clone(),
            reply: Some(reply),
            connection: self.connection.clone(),
            done,
        })
    }
}

/// A command in flight.
pub struct CommandHandle {
    name: String,
    reply: Option<ReplyFuture>,
    connection: SpecConnection,
    done: Arc<AtomicBool>,
}

impl CommandHandle {
    /// Serial number of the underlying request.
    pub fn sn(&self) -> u32 {
        self.reply.as_ref().map(|r| r.sn()).unwrap_or(0)
    }

    /// Wait for the result. On timeout the handle is gone and the
    /// abandoned command is aborted.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<SpecData, SpecError> {
        let reply = self.reply.take().ok_or(SpecError::Disconnected)?;
        reply.wait(timeout).await
    }

    /// Abandon the command, aborting it on the server if it has not
    /// completed yet.
    pub fn cancel(self) {}
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        if !self.done.load(Ordering::SeqCst) && self.connection.is_connected() {
            info!("aborting abandoned command '{}'", self.name);
            if let Err(e) = self.connection.abort() {
                error!("abort for '{}' failed: {e}", self.name);
            }
        }
    }
}
