mod channel;
mod command;
mod connection;
mod counter;
mod data;
mod error;
mod manager;
mod motor;
mod reply;
mod spec;
mod variable;

pub mod dispatcher;
pub mod message;
pub mod wait;

pub use channel::{Registration, SpecChannel};
pub use command::{CommandHandle, ErrorHook, ReplyHook, SpecCommand};
pub use connection::{ConnState, SpecConnection, MAX_SCAN_PORT, MIN_SCAN_PORT};
pub use counter::{CounterState, CounterType, SpecCounter, ALL_COUNT};
pub use data::{SpecData, SCALAR_KEY};
pub use dispatcher::{DispatchMode, Slot, Subscription};
pub use error::SpecError;
pub use manager::{close_connection, close_connections, connect_to};
pub use message::{DataType, Message, Opcode};
pub use motor::{MotorState, SpecMotor, HIGH_LIMIT_HIT, LOW_LIMIT_HIT};
pub use reply::ReplyFuture;
pub use spec::Spec;
pub use variable::SpecVariable;
