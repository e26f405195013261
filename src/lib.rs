#![doc = include_str!("../README.md")]

pub mod config;
pub mod connection;
pub mod correlator;
pub mod envelope;
pub mod instance;
pub mod payload;
pub mod recovery;
pub mod registry;
pub mod transport;

#[doc(inline)]
pub use config::{Config, ConfigError};

#[doc(inline)]
pub use connection::{ConnectionError, ConnectionManager, Publisher, ReconnectPolicy};

#[doc(inline)]
pub use correlator::{Correlator, CorrelatorOptions, ReplyError, ReplyErrorKind};

#[doc(inline)]
pub use envelope::{Death, DeathReason, DeliveryHeaders, Envelope};

#[doc(inline)]
pub use instance::{InstanceError, instance, set_instance};

#[doc(inline)]
pub use payload::{Command, Document, Payload};

#[doc(inline)]
pub use recovery::DeadLetterRecovery;

#[doc(inline)]
pub use registry::{ConsumerRegistry, Handler, HandlerError, HandlerOutcome, Message, handler_fn};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};
