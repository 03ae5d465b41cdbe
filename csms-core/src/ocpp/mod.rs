//! OCPP 1.6 protocol layer
//!
//! - `types`: OCPP message types and data structures
//! - `messages`: JSON framing (CALL, CALLRESULT, CALLERROR)

pub mod types;
pub mod messages;

pub use types::*;
pub use messages::*;
