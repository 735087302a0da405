#![deny(unsafe_code)]

mod event_loop;
mod handle;
mod source;

pub use self::{
    event_loop::{EventLoop, LoopCx},
    handle::{LoopCallback, LoopHandle, PostError},
    source::{EventSource, Ready, Status},
};
