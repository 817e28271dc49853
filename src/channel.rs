use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::warn;

use crate::connection::ConnectionInner;
use crate::data::{SpecData, SCALAR_KEY};
use crate::dispatcher::{self, DispatchMode, SenderId, Slot, Subscription};
use crate::error::SpecError;

/// Default patience for facade-level channel reads.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// How a channel relates to the server-side subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Register with the server as soon as the link allows it.
    DoReg,
    /// Transient read/write handle, never registered.
    DontReg,
    /// Hold off until the link has gone down and come back once.
    WaitReg,
}

/// A subscription to one (sub-)key of a server channel.
///
/// Caches the most recent value, folds incremental updates into it and
/// emits `valueChanged(value, name)` through the dispatcher.
pub struct SpecChannel {
    conn: Weak<ConnectionInner>,
    name: String,
    spec_chan_name: String,
    access1: Option<String>,
    access2: Option<String>,
    registration: Mutex<Registration>,
    registered: AtomicBool,
    isdisconnected: AtomicBool,
    value: Mutex<Option<SpecData>>,
    sender: SenderId,
    // Keeps the parent-to-leaf forwarding slot alive for leaf channels.
    forward: Mutex<Option<Arc<Slot>>>,
}

impl SpecChannel {
    pub(crate) fn new(
        conn: Weak<ConnectionInner>,
        name: &str,
        registration: Registration,
    ) -> SpecChannel {
        // Only `var/` names carry an access path into the published value;
        // motor/scaler/status names are server-visible in full.
        let parts: Vec<&str> = name.split('/').collect();
        let (spec_chan_name, access1, access2) = if parts.len() > 2 && parts[0] == "var" {
            (
                format!("{}/{}", parts[0], parts[1]),
                Some(parts[2].to_string()),
                parts.get(3).map(|s| s.to_string()),
            )
        } else {
            (name.to_string(), None, None)
        };
        SpecChannel {
            conn,
            name: name.to_string(),
            spec_chan_name,
            access1,
            access2,
            registration: Mutex::new(registration),
            registered: AtomicBool::new(false),
            isdisconnected: AtomicBool::new(true),
            value: Mutex::new(None),
            sender: dispatcher::next_sender_id(),
            forward: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name the server knows this subscription by.
    pub fn server_name(&self) -> &str {
        &self.spec_chan_name
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn value(&self) -> Option<SpecData> {
        self.value.lock().unwrap().clone()
    }

    pub(crate) fn sender_id(&self) -> SenderId {
        self.sender
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.spec_chan_name != self.name
    }

    pub(crate) fn set_forward_slot(&self, slot: Arc<Slot>) {
        *self.forward.lock().unwrap() = Some(slot);
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Subscribe a slot to this channel's `valueChanged(value, name)`.
    pub fn subscribe(&self, slot: &Arc<Slot>, mode: DispatchMode) -> Subscription {
        dispatcher::connect(self.sender, "valueChanged", slot, mode)
    }

    /// (Re-)registration when the link comes up: WaitReg promotes to
    /// DoReg after an actual outage, DoReg registers, DontReg sits still.
    pub(crate) fn on_connected(&self) {
        self.apply_connected(true);
    }

    /// Creation on an already-established link: no outage has happened,
    /// so WaitReg stays parked.
    pub(crate) fn attach_live(&self) {
        self.apply_connected(false);
    }

    fn apply_connected(&self, allow_promote: bool) {
        {
            let mut flag = self.registration.lock().unwrap();
            if allow_promote
                && *flag == Registration::WaitReg
                && self.isdisconnected.load(Ordering::SeqCst)
            {
                *flag = Registration::DoReg;
            }
        }
        self.isdisconnected.store(false, Ordering::SeqCst);
        if *self.registration.lock().unwrap() == Registration::DoReg && !self.is_registered() {
            self.register();
        }
    }

    pub(crate) fn on_disconnected(&self) {
        *self.value.lock().unwrap() = None;
        self.isdisconnected.store(true, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);
    }

    /// Ask the server for update events. Leaf channels piggyback on the
    /// registration of their server-visible parent and never register
    /// themselves.
    pub(crate) fn register(&self) {
        if self.is_leaf() {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            if let Err(e) = conn.send_register_frame(&self.spec_chan_name) {
                warn!("could not register {}: {e}", self.spec_chan_name);
                return;
            }
            self.registered.store(true, Ordering::SeqCst);
        }
    }

    /// Withdraw the server-side registration and forget the cached value.
    pub fn unregister(&self) {
        if let Some(conn) = self.conn.upgrade() {
            if let Err(e) = conn.send_unregister_frame(&self.spec_chan_name) {
                warn!("could not unregister {}: {e}", self.spec_chan_name);
            }
            self.registered.store(false, Ordering::SeqCst);
            *self.value.lock().unwrap() = None;
        }
    }

    /// Fold an incoming value into the cache and emit `valueChanged`.
    pub fn update(&self, channel_value: SpecData, deleted: bool, force: bool) {
        if let (SpecData::Assoc(map), Some(k1)) = (&channel_value, &self.access1) {
            let Some(v1) = map.get(k1) else { return };
            if deleted {
                self.emit_value(SpecData::Null);
                return;
            }
            match &self.access2 {
                None => {
                    let new = match v1 {
                        SpecData::Assoc(inner) => SpecData::Assoc(inner.clone()),
                        leaf => leaf.coerced(),
                    };
                    self.store_and_emit(new, force);
                }
                Some(k2) => {
                    let SpecData::Assoc(inner) = v1 else { return };
                    let Some(v2) = inner.get(k2) else { return };
                    self.store_and_emit(v2.coerced(), force);
                }
            }
            return;
        }

        let to_emit = {
            let mut value = self.value.lock().unwrap();
            match (&mut *value, channel_value) {
                (Some(SpecData::Assoc(current)), SpecData::Assoc(incoming)) => {
                    if deleted {
                        merge_deleted(current, &incoming);
                    } else {
                        merge_update(current, incoming);
                    }
                    SpecData::Assoc(current.clone())
                }
                (slot, incoming) => {
                    if deleted {
                        *slot = None;
                        SpecData::Null
                    } else {
                        *slot = Some(incoming.clone());
                        incoming
                    }
                }
            }
        };
        self.emit_value(to_emit);
    }

    fn store_and_emit(&self, new: SpecData, force: bool) {
        let changed = {
            let mut value = self.value.lock().unwrap();
            if force || value.as_ref() != Some(&new) {
                *value = Some(new.clone());
                true
            } else {
                false
            }
        };
        if changed {
            self.emit_value(new);
        }
    }

    fn emit_value(&self, value: SpecData) {
        dispatcher::emit(
            self.sender,
            "valueChanged",
            &[value, SpecData::Str(self.name.clone())],
        );
    }

    /// Current value: the cache when registered and filled, otherwise a
    /// CHAN_READ round-trip (always when `force`).
    pub async fn read(&self, timeout: Option<Duration>, force: bool) -> Result<SpecData, SpecError> {
        if !force && self.is_registered() {
            // The registered flag may be up before the first value lands.
            if let Some(v) = self.value() {
                return Ok(v);
            }
        }
        let conn = self.conn.upgrade().ok_or(SpecError::NotConnected)?;
        let reply = conn.send_chan_read(&self.spec_chan_name)?;
        let value = reply.wait(timeout).await?;
        self.update(value, false, false);
        Ok(self.value().unwrap_or(SpecData::Null))
    }

    /// Write through the access path: a leaf write is wrapped into the
    /// nested mapping the server expects.
    pub async fn write(&self, value: SpecData, wait: bool) -> Result<(), SpecError> {
        let conn = self.conn.upgrade().ok_or(SpecError::NotConnected)?;
        conn.send_chan_send(&self.spec_chan_name, self.wrap(value), wait)
            .await
    }

    /// Fire-and-forget variant of [`write`], callable from signal slots.
    pub fn write_nowait(&self, value: SpecData) -> Result<(), SpecError> {
        let conn = self.conn.upgrade().ok_or(SpecError::NotConnected)?;
        conn.send_chan_send_nowait(&self.spec_chan_name, self.wrap(value))
    }

    fn wrap(&self, value: SpecData) -> SpecData {
        match (&self.access1, &self.access2) {
            (Some(k1), None) => {
                SpecData::Assoc([(k1.clone(), value)].into_iter().collect())
            }
            (Some(k1), Some(k2)) => {
                let inner = SpecData::Assoc([(k2.clone(), value)].into_iter().collect());
                SpecData::Assoc([(k1.clone(), inner)].into_iter().collect())
            }
            _ => value,
        }
    }
}

impl Drop for SpecChannel {
    fn drop(&mut self) {
        dispatcher::remove_sender(self.sender);
    }
}

/// DELETED merge: incoming mappings list inner keys to drop, incoming
/// scalars drop the whole entry. An inner mapping left with only the
/// synthetic scalar key collapses back to that leaf.
fn merge_deleted(
    current: &mut std::collections::BTreeMap<String, SpecData>,
    incoming: &std::collections::BTreeMap<String, SpecData>,
) {
    for (key, val) in incoming {
        match val {
            SpecData::Assoc(inner_deleted) => match current.remove(key) {
                Some(SpecData::Assoc(mut inner)) => {
                    for k in inner_deleted.keys() {
                        inner.remove(k);
                    }
                    let collapsed = if inner.len() == 1 && inner.contains_key(SCALAR_KEY) {
                        inner.into_iter().next().map(|(_, v)| v).unwrap_or(SpecData::Null)
                    } else {
                        SpecData::Assoc(inner)
                    };
                    current.insert(key.clone(), collapsed);
                }
                Some(other) => {
                    current.insert(key.clone(), other);
                }
                None => {}
            },
            _ => {
                current.remove(key);
            }
        }
    }
}

/// Plain merge: mappings extend mappings, scalars overwrite, and a
/// scalar meeting a structured update is parked under the synthetic key.
fn merge_update(
    current: &mut std::collections::BTreeMap<String, SpecData>,
    incoming: std::collections::BTreeMap<String, SpecData>,
) {
    for (key, val) in incoming {
        match val {
            SpecData::Assoc(new_inner) => {
                let merged = match current.remove(&key) {
                    Some(SpecData::Assoc(mut inner)) => {
                        inner.extend(new_inner);
                        SpecData::Assoc(inner)
                    }
                    Some(existing) => {
                        let mut inner: std::collections::BTreeMap<String, SpecData> =
                            [(SCALAR_KEY.to_string(), existing)].into_iter().collect();
                        inner.extend(new_inner);
                        SpecData::Assoc(inner)
                    }
                    None => SpecData::Assoc(new_inner),
                };
                current.insert(key, merged);
            }
            scalar => {
                let merged = match current.remove(&key) {
                    Some(SpecData::Assoc(mut inner)) => {
                        inner.insert(SCALAR_KEY.to_string(), scalar);
                        SpecData::Assoc(inner)
                    }
                    _ => scalar,
                };
                current.insert(key, merged);
            }
        }
    }
}
