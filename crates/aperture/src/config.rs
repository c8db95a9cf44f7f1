use aperture_core::prelude::{ColorSpace, FourCc, MediaFormat, Resolution};
use aperture_device::{DeviceDescriptor, StreamId, StreamLayout, StreamRole, bytes_per_pixel};

/// What the caller wants from one stream.
///
/// Leaving `format` or `resolution` unset lets the device pick: the first
/// advertised format and its largest size.
///
/// # Example
/// ```rust
/// use aperture::prelude::StreamSpec;
///
/// let spec = StreamSpec::viewfinder()
///     .with_format(*b"YUYV")
///     .with_resolution("640x480".parse().unwrap());
/// assert!(spec.format.is_some());
/// ```
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Role to match against the device descriptor.
    pub role: StreamRole,
    /// Requested pixel format, if any.
    pub format: Option<FourCc>,
    /// Requested frame size, if any.
    pub resolution: Option<Resolution>,
}

impl StreamSpec {
    /// Spec for a stream with the given role and no constraints.
    pub fn for_role(role: StreamRole) -> Self {
        Self {
            role,
            format: None,
            resolution: None,
        }
    }

    /// Unconstrained viewfinder stream.
    pub fn viewfinder() -> Self {
        Self::for_role(StreamRole::Viewfinder)
    }

    /// Unconstrained raw stream.
    pub fn raw() -> Self {
        Self::for_role(StreamRole::Raw)
    }

    /// Request a specific pixel format.
    pub fn with_format(mut self, code: [u8; 4]) -> Self {
        self.format = Some(FourCc::new(code));
        self
    }

    /// Request a specific frame size.
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }
}

/// Which requested field the device could not honor exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustedField {
    Format,
    Resolution,
}

/// One field the negotiation moved away from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub role: StreamRole,
    pub field: AdjustedField,
}

/// Overall result of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigStatus {
    /// Every requested field was honored as given.
    Exact,
    /// The configuration is usable but differs from the request.
    Adjusted(Vec<Adjustment>),
}

/// Accepted layout for one stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// Role the stream serves.
    pub role: StreamRole,
    /// Negotiated geometry, ready to hand to the device.
    pub layout: StreamLayout,
    /// Fields that were moved to reach a valid layout.
    pub adjusted: Vec<AdjustedField>,
}

/// Full negotiation result the session holds between configure and start.
#[derive(Debug, Clone)]
pub struct ConfigReport {
    outcomes: Vec<StreamOutcome>,
}

impl ConfigReport {
    /// Per-stream outcomes, in spec order. The first entry is the primary
    /// stream that drives the consumer loop.
    pub fn outcomes(&self) -> &[StreamOutcome] {
        &self.outcomes
    }

    /// Whether the request survived unchanged.
    pub fn status(&self) -> ConfigStatus {
        let adjustments: Vec<Adjustment> = self
            .outcomes
            .iter()
            .flat_map(|o| {
                o.adjusted
                    .iter()
                    .map(|&field| Adjustment { role: o.role, field })
            })
            .collect();
        if adjustments.is_empty() {
            ConfigStatus::Exact
        } else {
            ConfigStatus::Adjusted(adjustments)
        }
    }

    /// Layouts in spec order, for `CameraDevice::apply`.
    pub fn layouts(&self) -> Vec<StreamLayout> {
        self.outcomes.iter().map(|o| o.layout.clone()).collect()
    }

    /// Layout for a given role, if one was negotiated.
    pub fn layout_for_role(&self, role: StreamRole) -> Option<&StreamLayout> {
        self.outcomes
            .iter()
            .find(|o| o.role == role)
            .map(|o| &o.layout)
    }
}

/// Configuration requests the device cannot satisfy at all.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no streams requested")]
    Empty,
    #[error("device has no {0} stream")]
    RoleUnavailable(StreamRole),
    #[error("{0} requested twice")]
    DuplicateRole(StreamRole),
    #[error("{0} advertises no usable formats")]
    NoFormats(StreamId),
    #[error("session must be stopped before reconfiguring")]
    SessionRunning,
}

/// Validate stream specs against a descriptor, adjusting requested fields to
/// the nearest supported values where needed.
///
/// Unsatisfiable requests (missing role, empty format list) fail outright;
/// everything else succeeds, possibly with adjustments the caller can
/// inspect before starting.
pub fn negotiate(
    descriptor: &DeviceDescriptor,
    specs: &[StreamSpec],
) -> Result<ConfigReport, ConfigError> {
    if specs.is_empty() {
        return Err(ConfigError::Empty);
    }
    let mut outcomes: Vec<StreamOutcome> = Vec::with_capacity(specs.len());
    for spec in specs {
        if outcomes.iter().any(|o| o.role == spec.role) {
            return Err(ConfigError::DuplicateRole(spec.role));
        }
        let stream = descriptor
            .stream_for_role(spec.role)
            .ok_or(ConfigError::RoleUnavailable(spec.role))?;
        let mut adjusted = Vec::new();

        let range = match spec.format {
            Some(code) => match stream.formats.iter().find(|r| r.code == code) {
                Some(range) => range,
                None => {
                    adjusted.push(AdjustedField::Format);
                    stream
                        .formats
                        .first()
                        .ok_or(ConfigError::NoFormats(stream.id))?
                }
            },
            None => stream
                .formats
                .first()
                .ok_or(ConfigError::NoFormats(stream.id))?,
        };

        let resolution = match spec.resolution {
            Some(want) if range.sizes.contains(&want) => want,
            Some(want) => {
                adjusted.push(AdjustedField::Resolution);
                nearest_size(&range.sizes, want).ok_or(ConfigError::NoFormats(stream.id))?
            }
            None => *range
                .sizes
                .last()
                .ok_or(ConfigError::NoFormats(stream.id))?,
        };

        let format = MediaFormat::new(range.code, resolution, ColorSpace::Srgb);
        let stride = resolution.width.get() as usize * bytes_per_pixel(range.code);
        outcomes.push(StreamOutcome {
            role: spec.role,
            layout: StreamLayout {
                stream: stream.id,
                format,
                stride,
            },
            adjusted,
        });
    }
    Ok(ConfigReport { outcomes })
}

fn nearest_size(sizes: &[Resolution], want: Resolution) -> Option<Resolution> {
    sizes
        .iter()
        .min_by_key(|size| size.area().abs_diff(want.area()))
        .copied()
}
