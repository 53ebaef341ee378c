mod broadcast;
mod coordinator;
mod identity;
pub mod message;
mod websocket;

pub use broadcast::BroadcastQueue;
pub use coordinator::{CoordRecv, Recv, RelayCoordinator, RelayLimits, RelayReq};
pub use identity::{RelayUrl, ReqStatus, SubId, WireId};
pub use message::{CommandResult, RelayEvent, RelayMessage};
pub use websocket::{ConnCounters, RelayStatus, WebsocketConn};
