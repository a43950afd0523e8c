#![doc = include_str!("../README.md")]

pub mod broker;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod listener;
pub mod order;
pub mod provisioner;
pub mod publisher;
pub mod telemetry;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, Headers};

#[doc(inline)]
pub use codec::{MalformedPayload, Payload};

#[doc(inline)]
pub use order::{Order, OrderId, PublishRequest};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use publisher::{PublishError, PublishErrorKind, TopicPublisher};

#[doc(inline)]
pub use provisioner::{Provisioned, ProvisioningError, ensure_subscription};

#[doc(inline)]
pub use listener::{
    DefaultListenerHook, Handler, Listener, ListenerFault, ListenerHook, ListenerState,
};
