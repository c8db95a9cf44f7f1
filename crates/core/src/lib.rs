#![doc = include_str!("../README.md")]

pub mod format;
pub mod frame;
pub mod metrics;
pub mod queue;

pub mod prelude {
    pub use crate::{
        format::{ColorSpace, FourCc, MediaFormat, Resolution},
        frame::{
            Frame, FrameMeta, FramePool, FramePoolCounters, Plane, PlaneLayout, PlaneMut,
            PoolLease, plane_layout_from_dims, plane_layout_with_stride,
        },
        metrics::Counters,
        queue::{BoundedRx, BoundedTx, CompletionQueue, RecvOutcome, SendOutcome, bounded},
    };
}
