//! Domain types shared by the governance layer and its collaborators

pub mod device;
pub mod outcome;
pub mod session;

pub use device::{DeviceCommand, DeviceDetails, DeviceId, DeviceInfo, DeviceKind};
pub use outcome::CallOutcome;
pub use session::Session;
