//! Process-wide signal registry connecting value producers (connections,
//! channels) to weakly-held receiver slots.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::error;

use crate::data::SpecData;
use crate::error::SpecError;

/// A receiver callable. Slots take the emission's argument list and read
/// the prefix they care about; `valueChanged` carries `[value, name]`.
pub type Slot = dyn Fn(&[SpecData]) + Send + Sync;

/// How emissions reach a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Deliveries may be skipped when the arguments equal the last ones
    /// this receiver saw (motor positions and the like).
    UpdateValue,
    /// Every emission is delivered, identical re-emissions included
    /// (edge events such as `move_done`).
    FireEvent,
}

/// Identity of a signal-emitting object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(u64);

static NEXT_SENDER: AtomicU64 = AtomicU64::new(1);
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

pub fn next_sender_id() -> SenderId {
    SenderId(NEXT_SENDER.fetch_add(1, Ordering::Relaxed))
}

/// Token returned by [`connect`]; hand it to [`disconnect`] to revoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    sender: SenderId,
    signal: String,
    serial: u64,
}

struct Receiver {
    slot: Weak<Slot>,
    mode: DispatchMode,
    serial: u64,
    last: Arc<Mutex<Option<Vec<SpecData>>>>,
}

type Registry = HashMap<SenderId, HashMap<String, Vec<Receiver>>>;

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Subscribe `slot` to `(sender, signal)`.
///
/// Only a weak reference is kept: dropping the subscriber's `Arc`
/// unsubscribes. Connecting the same slot twice updates the dispatch
/// mode instead of adding a second entry.
pub fn connect(sender: SenderId, signal: &str, slot: &Arc<Slot>, mode: DispatchMode) -> Subscription {
    let weak = Arc::downgrade(slot);
    let mut reg = registry().lock().unwrap();
    let receivers = reg
        .entry(sender)
        .or_default()
        .entry(signal.to_string())
        .or_default();
    for r in receivers.iter_mut() {
        if r.slot.ptr_eq(&weak) {
            r.mode = mode;
            return Subscription {
                sender,
                signal: signal.to_string(),
                serial: r.serial,
            };
        }
    }
    let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
    receivers.push(Receiver {
        slot: weak,
        mode,
        serial,
        last: Arc::new(Mutex::new(None)),
    });
    Subscription {
        sender,
        signal: signal.to_string(),
        serial,
    }
}

/// Revoke a subscription. Revoking one that is already gone is a misuse
/// of the signal layer.
pub fn disconnect(sub: &Subscription) -> Result<(), SpecError> {
    let mut reg = registry().lock().unwrap();
    let found = match reg.get_mut(&sub.sender).and_then(|s| s.get_mut(&sub.signal)) {
        Some(receivers) => {
            let before = receivers.len();
            receivers.retain(|r| r.serial != sub.serial);
            receivers.len() != before
        }
        None => false,
    };
    cleanup(&mut reg, sub.sender, &sub.signal);
    if found {
        Ok(())
    } else {
        Err(SpecError::Dispatcher(format!(
            "no such subscription to signal '{}'",
            sub.signal
        )))
    }
}

/// Fire `signal` from `sender`, invoking receivers in insertion order.
///
/// A panicking receiver is logged and does not stop the remaining ones.
/// Receivers whose slot has been dropped are pruned.
pub fn emit(sender: SenderId, signal: &str, args: &[SpecData]) {
    let snapshot: Vec<(Weak<Slot>, DispatchMode, Arc<Mutex<Option<Vec<SpecData>>>>)> = {
        let reg = registry().lock().unwrap();
        match reg.get(&sender).and_then(|s| s.get(signal)) {
            Some(receivers) => receivers
                .iter()
                .map(|r| (r.slot.clone(), r.mode, r.last.clone()))
                .collect(),
            None => return,
        }
    };

    let mut saw_dead = false;
    for (weak, mode, last) in snapshot {
        let Some(slot) = weak.upgrade() else {
            saw_dead = true;
            continue;
        };
        if mode == DispatchMode::UpdateValue {
            let mut last = last.lock().unwrap();
            if last.as_deref() == Some(args) {
                continue;
            }
            *last = Some(args.to_vec());
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| slot(args))) {
            error!("receiver for signal '{signal}' panicked: {panic:?}");
        }
    }

    if saw_dead {
        let mut reg = registry().lock().unwrap();
        if let Some(receivers) = reg.get_mut(&sender).and_then(|s| s.get_mut(signal)) {
            receivers.retain(|r| r.slot.strong_count() > 0);
        }
        cleanup(&mut reg, sender, signal);
    }
}

/// Drop everything registered under `sender`. Called when an emitting
/// object goes away.
pub fn remove_sender(sender: SenderId) {
    registry().lock().unwrap().remove(&sender);
}

fn cleanup(reg: &mut Registry, sender: SenderId, signal: &str) {
    if let Some(signals) = reg.get_mut(&sender) {
        if signals.get(signal).map_or(false, Vec::is_empty) {
            signals.remove(signal);
        }
        if signals.is_empty() {
            reg.remove(&sender);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_slot(hits: &Arc<AtomicUsize>) -> Arc<Slot> {
        let hits = hits.clone();
        Arc::new(move |_args: &[SpecData]| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn receivers_fire_in_insertion_order() {
        let sender = next_sender_id();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mk = |tag: &'static str| -> Arc<Slot> {
            let order = order.clone();
            Arc::new(move |_| order.lock().unwrap().push(tag))
        };
        let a = mk("a");
        let b = mk("b");
        let c = mk("c");
        connect(sender, "sig", &a, DispatchMode::FireEvent);
        connect(sender, "sig", &b, DispatchMode::FireEvent);
        connect(sender, "sig", &c, DispatchMode::FireEvent);
        emit(sender, "sig", &[]);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn reconnect_overwrites_mode_without_duplicating() {
        let sender = next_sender_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = counting_slot(&hits);
        let s1 = connect(sender, "sig", &slot, DispatchMode::UpdateValue);
        let s2 = connect(sender, "sig", &slot, DispatchMode::FireEvent);
        assert_eq!(s1, s2);
        emit(sender, "sig", &[SpecData::Int(1)]);
        emit(sender, "sig", &[SpecData::Int(1)]);
        // FireEvent won: the identical re-emission is delivered too.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn coalescing_skips_identical_arguments() {
        let sender = next_sender_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = counting_slot(&hits);
        connect(sender, "sig", &slot, DispatchMode::UpdateValue);
        emit(sender, "sig", &[SpecData::Int(7)]);
        emit(sender, "sig", &[SpecData::Int(7)]);
        emit(sender, "sig", &[SpecData::Int(8)]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_receivers_stop_firing() {
        let sender = next_sender_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = counting_slot(&hits);
        connect(sender, "sig", &slot, DispatchMode::FireEvent);
        emit(sender, "sig", &[]);
        drop(slot);
        emit(sender, "sig", &[]);
        emit(sender, "sig", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_receiver_does_not_stop_the_rest() {
        let sender = next_sender_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let bad: Arc<Slot> = Arc::new(|_| panic!("boom"));
        let good = counting_slot(&hits);
        connect(sender, "sig", &bad, DispatchMode::FireEvent);
        connect(sender, "sig", &good, DispatchMode::FireEvent);
        emit(sender, "sig", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnect_revokes_and_rejects_double_revoke() {
        let sender = next_sender_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = counting_slot(&hits);
        let sub = connect(sender, "sig", &slot, DispatchMode::FireEvent);
        disconnect(&sub).unwrap();
        emit(sender, "sig", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(matches!(disconnect(&sub), Err(SpecError::Dispatcher(_))));
    }

    #[test]
    fn remove_sender_drops_the_bucket() {
        let sender = next_sender_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = counting_slot(&hits);
        connect(sender, "sig", &slot, DispatchMode::FireEvent);
        remove_sender(sender);
        emit(sender, "sig", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
