mod control;
mod data;
mod dataplane;
pub mod userplane;

pub use control::{ControlTables, PccRuleDef};
pub use data::*;
pub use dataplane::Dataplane;
pub use userplane::{Batch, PacketBuf, PktMask};
