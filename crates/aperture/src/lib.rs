#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatch;
pub mod filter;
pub mod ledger;
pub mod registry;
pub mod session;
pub mod sink;
pub mod stats;
pub mod tunables;

pub mod prelude {
    pub use crate::{
        config::{
            AdjustedField, Adjustment, ConfigError, ConfigReport, ConfigStatus, StreamOutcome,
            StreamSpec,
        },
        dispatch::{DispatchOutcome, FilterDispatcher, FilterReport},
        filter::{
            Detection, DetectionSet, FilterChain, Mask, MeanLevelFilter, Rect, Rgba, VideoFilter,
        },
        ledger::{LedgerError, RequestLedger, RequestState},
        registry::{DeviceBusy, DeviceRegistry},
        session::{CaptureSession, StartError},
        sink::{CollectRawSink, CollectSink, DeliveredFrame, FrameRecord, FrameSink, NullSink, RawSink},
        stats::SessionStats,
        tunables::SessionTunables,
    };
    pub use aperture_core::prelude::*;
    pub use aperture_device::prelude::*;
}
