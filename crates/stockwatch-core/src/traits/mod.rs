//! Collaborator interfaces consumed by the notification core.

pub mod clock;
pub mod prober;
pub mod store;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use prober::Prober;
pub use store::ProductStore;
pub use transport::{ButtonAction, InlineButton, ParseMode, SendOptions, SentMessage, Transport};
