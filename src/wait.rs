//! One-shot waiters bound to a connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::channel::Registration;
use crate::connection::{ConnState, SpecConnection};
use crate::data::SpecData;
use crate::dispatcher::{self, DispatchMode, Slot};
use crate::error::SpecError;
use crate::reply::ReplyFuture;

pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T, SpecError>>,
) -> Result<T, SpecError> {
    match timeout {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| SpecError::Timeout)?,
        None => fut.await,
    }
}

/// Wait until the connection reaches the CONNECTED state.
pub async fn wait_connection(
    conn: &SpecConnection,
    timeout: Option<Duration>,
) -> Result<(), SpecError> {
    let mut states = conn.state_watch();
    with_timeout(timeout, async move {
        loop {
            if *states.borrow_and_update() == ConnState::Connected {
                return Ok(());
            }
            if states.changed().await.is_err() {
                return Err(SpecError::Disconnected);
            }
        }
    })
    .await
}

/// Issue a request once the connection is up, then wait for its reply.
///
/// `request` must return a [`ReplyFuture`]; a server-side error reply
/// surfaces as [`SpecError::Protocol`].
pub async fn wait_reply<F>(
    conn: &SpecConnection,
    request: F,
    timeout: Option<Duration>,
) -> Result<SpecData, SpecError>
where
    F: FnOnce(&SpecConnection) -> Result<ReplyFuture, SpecError>,
{
    with_timeout(timeout, async move {
        wait_connection(conn, None).await?;
        let reply = request(conn)?;
        reply.wait(None).await
    })
    .await
}

/// Wait for the next update of a channel, or for it to take a
/// particular value.
///
/// The channel is registered transparently when it is not already; in
/// that case the first update is the server's replay of the current
/// value on subscribe and is discarded, and the registration is
/// withdrawn again on every exit path, timeout included.
pub async fn wait_channel_update(
    conn: &SpecConnection,
    name: &str,
    expected: Option<&SpecData>,
    timeout: Option<Duration>,
) -> Result<SpecData, SpecError> {
    wait_connection(conn, timeout).await?;

    let was_unregistered = !conn.get_channel(name).is_registered();
    let (tx, mut rx) = mpsc::unbounded_channel::<SpecData>();
    let discard_first = AtomicBool::new(was_unregistered);
    let slot: Arc<Slot> = Arc::new(move |args| {
        if discard_first.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(value) = args.first() {
            let _ = tx.send(value.clone());
        }
    });

    // The binding keeps transient channels (and their subscription)
    // alive for the duration of the wait.
    let _channel = if was_unregistered {
        conn.register_channel(name, &slot, Registration::DoReg, DispatchMode::FireEvent)
    } else {
        let channel = conn.get_channel(name);
        dispatcher::connect(channel.sender_id(), "valueChanged", &slot, DispatchMode::FireEvent);
        channel
    };

    let result = with_timeout(timeout, async {
        loop {
            let value = rx.recv().await.ok_or(SpecError::Disconnected)?;
            match expected {
                None => return Ok(value),
                Some(wanted) if *wanted == value => return Ok(value),
                Some(_) => continue,
            }
        }
    })
    .await;

    if was_unregistered {
        conn.unregister_channel(name);
    }
    result
}
