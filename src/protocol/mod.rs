//! The archiver protocol: states, the transition table and the driver task.
//!
//! - [`state`]: protocol states and the capability map
//! - [`machine`]: sans-IO state machine that owns the buffer
//! - [`driver`]: Tokio task that feeds the machine and executes its actions
//! - [`events`]: notifications to the orchestration layer
//! - [`timer`]: flush timer
//! - [`parameter`]: `get`/`set` parameters
//! - [`messages`]: commands accepted by the driver task

pub mod driver;
pub mod events;
pub mod machine;
pub mod messages;
pub mod parameter;
pub mod state;
pub mod timer;

pub use driver::{DriverHandle, ProtocolDriver};
pub use events::{
    ChannelEventSink, DriverEvent, ErrorEvent, ErrorKind, EventSink, SampleEvent,
    TracingEventSink,
};
pub use machine::{DriverStatus, ProtocolStateMachine};
pub use parameter::{Parameter, ParameterValue};
pub use state::{capabilities, Capability, DiscoverHint, ProtocolState};
