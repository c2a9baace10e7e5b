//! Domain model: ids, messages, dispositions, errors.

pub mod disposition;
pub mod errors;
pub mod ids;
pub mod message;

pub use self::disposition::Disposition;
pub use self::errors::{BrokerError, ConsumerError, ErrorKind, LeaseOperation, SettlementError};
pub use self::ids::{ConsumerId, MessageId};
pub use self::message::{Message, Subject};
