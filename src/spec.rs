//! Remote interpreter facade: identity, enumeration and command
//! factories for one server.

use std::time::Duration;

use crate::channel::READ_TIMEOUT;
use crate::command::SpecCommand;
use crate::connection::SpecConnection;
use crate::counter::SpecCounter;
use crate::data::SpecData;
use crate::error::SpecError;
use crate::manager;
use crate::motor::SpecMotor;
use crate::variable::SpecVariable;

// Interpreter one-liners used to enumerate devices; always sent as
// plain commands, whatever the protocol generation.
const MOTOR_ENUM: &str =
    "local md[]; for (i=0; i<MOTORS; i++) { md[i][motor_mne(i)]=motor_name(i) }; return md";
const COUNTER_ENUM: &str =
    "local ca[]; for (i=0; i<COUNTERS; i++) { ca[i][cnt_mne(i)]=cnt_name(i) }; return ca";

pub struct Spec {
    connection: SpecConnection,
    timeout: Option<Duration>,
}

impl Spec {
    /// Connect to `address` and wait for the session to come up.
    pub async fn connect(address: &str, timeout: Option<Duration>) -> Result<Spec, SpecError> {
        let connection = manager::connect_to(address)?;
        connection.wait_connection(timeout).await?;
        Ok(Spec {
            connection,
            timeout,
        })
    }

    pub fn from_connection(connection: &SpecConnection) -> Spec {
        Spec {
            connection: connection.clone(),
            timeout: None,
        }
    }

    pub fn connection(&self) -> &SpecConnection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// A command object for the named macro or function.
    pub fn command(&self, name: &str) -> SpecCommand {
        SpecCommand::new(name, &self.connection)
    }

    pub fn motor(&self, name: &str) -> SpecMotor {
        SpecMotor::new(name, &self.connection)
    }

    pub fn counter(&self, name: &str) -> SpecCounter {
        SpecCounter::new(name, &self.connection)
    }

    pub fn variable(&self, name: &str) -> SpecVariable {
        SpecVariable::new(name, &self.connection)
    }

    /// The server's own name (the `SPEC` variable).
    pub async fn name(&self) -> Result<String, SpecError> {
        let chan = self.connection.get_channel("var/SPEC");
        Ok(chan
            .read(self.timeout.or(Some(READ_TIMEOUT)), false)
            .await?
            .as_text())
    }

    /// The interpreter release (the `VERSION` variable).
    pub async fn version(&self) -> Result<SpecData, SpecError> {
        let chan = self.connection.get_channel("var/VERSION");
        chan.read(self.timeout.or(Some(READ_TIMEOUT)), false).await
    }

    /// Motor mnemonics and display names, in controller order.
    pub async fn motors(&self) -> Result<Vec<(String, String)>, SpecError> {
        let reply = self.connection.send_command_with_reply(MOTOR_ENUM)?;
        Ok(parse_enumeration(&reply.wait(self.timeout).await?))
    }

    pub async fn motor_mnemonics(&self) -> Result<Vec<String>, SpecError> {
        Ok(self.motors().await?.into_iter().map(|(mne, _)| mne).collect())
    }

    pub async fn motor_names(&self) -> Result<Vec<String>, SpecError> {
        Ok(self.motors().await?.into_iter().map(|(_, name)| name).collect())
    }

    /// Counter mnemonics and display names, in controller order.
    pub async fn counters(&self) -> Result<Vec<(String, String)>, SpecError> {
        let reply = self.connection.send_command_with_reply(COUNTER_ENUM)?;
        Ok(parse_enumeration(&reply.wait(self.timeout).await?))
    }

    pub async fn counter_mnemonics(&self) -> Result<Vec<String>, SpecError> {
        Ok(self.counters().await?.into_iter().map(|(mne, _)| mne).collect())
    }

    pub async fn counter_names(&self) -> Result<Vec<String>, SpecError> {
        Ok(self.counters().await?.into_iter().map(|(_, name)| name).collect())
    }
}

/// The enumeration replies map index strings to one-entry mappings of
/// mnemonic to name.
fn parse_enumeration(data: &SpecData) -> Vec<(String, String)> {
    let Some(map) = data.as_assoc() else {
        return Vec::new();
    };
    let mut indexed: Vec<(usize, String, String)> = Vec::new();
    for (index, entry) in map {
        let Ok(i) = index.parse::<usize>() else { continue };
        if let Some(inner) = entry.as_assoc() {
            if let Some((mne, name)) = inner.iter().next() {
                indexed.push((i, mne.clone(), name.as_text()));
            }
        }
    }
    indexed.sort_by_key(|(i, _, _)| *i);
    indexed.into_iter().map(|(_, mne, name)| (mne, name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn enumeration_orders_by_index() {
        let mut outer = BTreeMap::new();
        for (i, (mne, name)) in [("10", ("chi", "Chi")), ("2", ("th", "Theta")), ("0", ("tth", "TwoTheta"))]
        {
            let inner: BTreeMap<String, SpecData> =
                [(mne.to_string(), SpecData::Str(name.to_string()))]
                    .into_iter()
                    .collect();
            outer.insert(i.to_string(), SpecData::Assoc(inner));
        }
        let parsed = parse_enumeration(&SpecData::Assoc(outer));
        assert_eq!(
            parsed,
            vec![
                ("tth".to_string(), "TwoTheta".to_string()),
                ("th".to_string(), "Theta".to_string()),
                ("chi".to_string(), "Chi".to_string()),
            ]
        );
    }
}
