pub mod bus;
pub mod channel;
pub mod channel_handle;
pub mod wait_queue;

pub use bus::Bus;
pub use channel::Channel;
pub use channel_handle::ChannelHandle;
pub use wait_queue::{Parcel, Parked, WaitQueue};
