mod command;
mod hub;
mod normalize;
mod roster;
mod sender;

pub use command::CommandRouter;
pub use hub::{DispatchReport, HandleOutcome, HubDependencies, MessageHub, WatchOutcome};
pub use normalize::{Normalized, Normalizer};
pub use roster::RosterReconciler;
pub use sender::{OutboundSender, SenderDependencies, BASE64_PREFIX, RESOURCE_PREFIX};
