//! Wire format shared by every cronkeeper transport.
//!
//! A caller sends a [`frames::ReqFrame`] naming one of the [`methods`] and
//! receives exactly one [`frames::ResFrame`] carrying the same `id`.

pub mod frames;
pub mod methods;

pub use frames::{ErrorShape, FrameError, InboundFrame, ReqFrame, ResFrame};
