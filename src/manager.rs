//! Process-wide deduplication of connections by address.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, Weak};

use crate::connection::SpecConnection;
use crate::error::SpecError;

type Registry = HashMap<String, WeakConnection>;

// The registry holds weak handles only: a connection lives exactly as
// long as handles outside the registry do.
struct WeakConnection(Weak<crate::connection::ConnectionInner>);

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Obtain the connection for `address` (`host:port`, or `host:name` to
/// discover the port by scanning), creating and dialling it on first
/// request. Repeated requests for the same address share one connection
/// while any handle survives.
///
/// Must be called from within a tokio runtime; the dial task is spawned
/// here.
pub fn connect_to(address: &str) -> Result<SpecConnection, SpecError> {
    let mut reg = registry().lock().unwrap();
    reg.retain(|_, weak| weak.0.strong_count() > 0);
    if let Some(existing) = reg.get(address).and_then(|w| w.0.upgrade()) {
        return Ok(SpecConnection::from_inner(existing));
    }
    let conn = SpecConnection::create(address);
    reg.insert(address.to_string(), WeakConnection(conn.downgrade()));
    conn.spawn_link();
    Ok(conn)
}

/// Forget the registry entry for `address`. Live handles keep working;
/// the next [`connect_to`] builds a fresh connection.
pub fn close_connection(address: &str) {
    registry().lock().unwrap().remove(address);
}

/// Forget every registry entry.
pub fn close_connections() {
    registry().lock().unwrap().clear();
}
