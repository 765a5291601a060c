//! WebSocket support: upgrade negotiation and framing.

pub mod frame;
pub mod upgrade;

pub use frame::{Frame, FrameParser, Opcode};
pub use upgrade::{Role, Upgrade, UpgradeError, negotiate};
