#![warn(
    rust_2018_idioms,
    unreachable_pub,
    // missing_docs
    // missing_debug_implementations
)]

mod event_count;
mod wait_queue;

pub use self::{
    event_count::{EventCount, EventCountToken},
    wait_queue::{GlobalWaitQueue, WaitQueue, WaitState},
};
