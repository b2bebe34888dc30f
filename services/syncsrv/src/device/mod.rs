//! Device communication: REST client, wire format, session and retry policy

mod client;
mod endpoint;
mod protocol;
mod retry;
mod session;

pub use client::{device_local_time, DeviceClient, DeviceClientOptions};
pub use endpoint::EndpointIndex;
pub use protocol::{
    enumeration_query, extract_value, BatchRequest, BatchResult, ObjectRef, OpFailure, ReadOp,
    WriteOp,
};
pub use retry::RetryPolicy;
pub use session::Session;
