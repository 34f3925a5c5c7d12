//! Study-runner client
//!
//! Everything a component page needs to take part in a study run: the
//! session lifecycle, the ordered background delivery of result data, the
//! run heartbeat, and the batch and group channels with their shared
//! session data.

pub mod callback;
pub mod channel;
pub mod config;
pub mod delivery;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod patch;
pub mod session;
pub mod store;
pub mod ux;

pub use channel::{ChannelEvent, ChannelHandle, ChannelStatus, GroupBusy, GroupMembership};
pub use config::{ChannelConfig, ClientConfig, HttpConfig};
pub use delivery::{DeliveryError, DeliveryQueue, DeliveryRequest, DeliveryTicket};
pub use error::{StudyError, StudyResult};
pub use heartbeat::{HeartbeatEmitter, HeartbeatStart};
pub use http::{HttpSend, ReqwestSender};
pub use identity::RunUrls;
pub use session::{ComponentTarget, ResultData, SessionDeps, StudySession};
pub use store::{SessionView, SharedSession};
pub use ux::{LogUx, RecordingUx, Ux, UxSignal};
