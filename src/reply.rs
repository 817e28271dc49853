use std::time::Duration;

use tokio::sync::oneshot;

use crate::data::SpecData;
use crate::error::SpecError;

/// Completion hook run by the reader task when the reply lands.
pub(crate) type ReplyCallback = Box<dyn FnOnce(&Result<SpecData, SpecError>) + Send>;

/// One-shot future for the answer to a request frame.
///
/// The owning connection keeps the sending half in its pending-reply
/// table under the request's serial number until the reply arrives or
/// the link drops.
pub struct ReplyFuture {
    sn: u32,
    rx: oneshot::Receiver<Result<SpecData, SpecError>>,
}

impl ReplyFuture {
    pub(crate) fn new(sn: u32, rx: oneshot::Receiver<Result<SpecData, SpecError>>) -> ReplyFuture {
        ReplyFuture { sn, rx }
    }

    /// Serial number of the request this future answers.
    pub fn sn(&self) -> u32 {
        self.sn
    }

    /// Wait for the reply. Server errors surface as
    /// [`SpecError::Protocol`], a dropped link as
    /// [`SpecError::Disconnected`], expiry as [`SpecError::Timeout`].
    pub async fn wait(self, timeout: Option<Duration>) -> Result<SpecData, SpecError> {
        let fut = async { self.rx.await.map_err(|_| SpecError::Disconnected)? };
        match timeout {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| SpecError::Timeout)?,
            None => fut.await,
        }
    }
}

/// Table entry for an outstanding request.
pub(crate) struct PendingReply {
    tx: oneshot::Sender<Result<SpecData, SpecError>>,
    callback: Option<ReplyCallback>,
}

impl PendingReply {
    pub(crate) fn new(
        tx: oneshot::Sender<Result<SpecData, SpecError>>,
        callback: Option<ReplyCallback>,
    ) -> PendingReply {
        PendingReply { tx, callback }
    }

    /// Resolve the future exactly once, running the callback first.
    pub(crate) fn complete(self, result: Result<SpecData, SpecError>) {
        if let Some(cb) = self.callback {
            cb(&result);
        }
        let _ = self.tx.send(result);
    }
}
