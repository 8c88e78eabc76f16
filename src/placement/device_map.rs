use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use candle_core::Device;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::partition::{block, is_valid_layer, PipelinePartition};

#[derive(Debug, Snafu)]
pub enum DeviceMapError {
    #[snafu(display("Device {device} was not opened"))]
    NotOpened { device: DeviceId },

    #[snafu(display("Cannot parse device map entry `{entry}`, expected `<device>:<n_layers>`"))]
    InvalidEntry { entry: String },

    #[snafu(display("Cannot parse device `{device}`"))]
    InvalidDevice {
        device: String,
        source: ParseIntError,
    },

    #[snafu(display("Cannot parse layer count of device map entry `{entry}`"))]
    InvalidCount {
        entry: String,
        source: ParseIntError,
    },

    #[snafu(display("Device map places {n_mapped} layers, but rank {rank} runs {n_layers} layers"))]
    LayerCountMismatch {
        n_mapped: usize,
        n_layers: usize,
        rank: usize,
    },

    #[snafu(display("Rank has no local devices"))]
    NoLocalDevices,

    #[snafu(display("Cannot open device {device}"))]
    OpenDevice {
        device: DeviceId,
        source: candle_core::Error,
    },
}

/// Identifier of a local device.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DeviceId {
    Cpu,
    Cuda(usize),
}

impl DeviceId {
    pub fn is_cuda(self) -> bool {
        matches!(self, DeviceId::Cuda(_))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Cpu => write!(f, "cpu"),
            DeviceId::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = DeviceMapError;

    /// Parse `cpu`, a CUDA ordinal such as `1` or `cuda:1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(DeviceId::Cpu);
        }
        let ordinal = s.strip_prefix("cuda:").unwrap_or(s);
        Ok(DeviceId::Cuda(
            ordinal.parse().context(InvalidDeviceSnafu { device: s })?,
        ))
    }
}

/// Devices that are available to a rank.
///
/// * `force_cpu` - Only use the CPU.
/// * `configured` - CUDA ordinals from the process configuration.
/// * `local_rank` - Rank within the node, used as the CUDA ordinal when
///   no ordinals are configured.
pub fn local_devices(
    force_cpu: bool,
    configured: Option<&[usize]>,
    local_rank: usize,
) -> Vec<DeviceId> {
    if force_cpu {
        return vec![DeviceId::Cpu];
    }
    match configured {
        Some(ordinals) if !ordinals.is_empty() => {
            ordinals.iter().copied().map(DeviceId::Cuda).collect()
        }
        _ if candle_core::utils::cuda_is_available() => vec![DeviceId::Cuda(local_rank)],
        _ => vec![DeviceId::Cpu],
    }
}

/// How the layers of a rank are placed on its devices.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum DeviceMapSpec {
    /// Spread the layers evenly over the local devices.
    #[default]
    Auto,

    /// Place everything on the CPU.
    Cpu,

    /// Consecutive layer counts per device.
    Explicit(Vec<(DeviceId, usize)>),
}

impl FromStr for DeviceMapSpec {
    type Err = DeviceMapError;

    /// Parse `auto`, `cpu` or a list such as `0:16,1:16`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(DeviceMapSpec::Auto),
            "cpu" => Ok(DeviceMapSpec::Cpu),
            entries => entries
                .split(',')
                .map(|entry| -> Result<(DeviceId, usize), DeviceMapError> {
                    let (device, count) = entry
                        .rsplit_once(':')
                        .context(InvalidEntrySnafu { entry })?;
                    Ok((
                        device.parse()?,
                        count.trim().parse().context(InvalidCountSnafu { entry })?,
                    ))
                })
                .collect::<Result<_, DeviceMapError>>()
                .map(DeviceMapSpec::Explicit),
        }
    }
}

/// Placement of the modules of a rank on local devices.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceMap {
    embeddings: Option<DeviceId>,
    layers: BTreeMap<usize, DeviceId>,
    head: Option<DeviceId>,
}

impl DeviceMap {
    /// Build the device map of `rank`.
    ///
    /// The embeddings are only placed on the first rank, the final norm and
    /// output projection only on the last rank.
    pub fn build(
        spec: &DeviceMapSpec,
        partition: &PipelinePartition,
        rank: usize,
        local_devices: &[DeviceId],
    ) -> Result<DeviceMap, DeviceMapError> {
        let n_layers = partition.n_layers();
        let world_size = partition.world_size();
        let rank_layers: Vec<usize> = (0..n_layers)
            .filter(|&layer| is_valid_layer(rank, world_size, layer, n_layers))
            .collect();

        let layer_devices: Vec<DeviceId> = match spec {
            DeviceMapSpec::Cpu => vec![DeviceId::Cpu; rank_layers.len()],
            DeviceMapSpec::Auto => {
                ensure!(!local_devices.is_empty(), NoLocalDevicesSnafu);
                let n_used = local_devices.len().min(rank_layers.len()).max(1);
                local_devices[..n_used]
                    .iter()
                    .enumerate()
                    .flat_map(|(index, &device)| {
                        let (_, len) = block(rank_layers.len(), n_used, index);
                        std::iter::repeat(device).take(len)
                    })
                    .collect()
            }
            DeviceMapSpec::Explicit(counts) => {
                let n_mapped: usize = counts.iter().map(|(_, count)| count).sum();
                ensure!(
                    n_mapped == rank_layers.len(),
                    LayerCountMismatchSnafu {
                        n_mapped,
                        n_layers: rank_layers.len(),
                        rank
                    }
                );
                counts
                    .iter()
                    .flat_map(|&(device, count)| std::iter::repeat(device).take(count))
                    .collect()
            }
        };

        let layers: BTreeMap<usize, DeviceId> =
            rank_layers.into_iter().zip(layer_devices).collect();
        let first = first_device(spec, &layers, local_devices);
        let last = layers.values().next_back().copied().unwrap_or(first);

        Ok(DeviceMap {
            embeddings: partition.is_first(rank).then_some(first),
            layers,
            head: partition.is_last(rank).then_some(last),
        })
    }

    /// Device of the piece embeddings, `None` if not run by this rank.
    pub fn embeddings(&self) -> Option<DeviceId> {
        self.embeddings
    }

    /// Device of the final norm and output projection, `None` if not run
    /// by this rank.
    pub fn head(&self) -> Option<DeviceId> {
        self.head
    }

    /// Layers of this rank and their devices, ordered by layer.
    pub fn layers(&self) -> impl Iterator<Item = (usize, DeviceId)> + '_ {
        self.layers.iter().map(|(&layer, &device)| (layer, device))
    }

    /// Module names with their devices.
    pub fn modules(&self) -> Vec<(String, DeviceId)> {
        let mut modules = Vec::with_capacity(self.layers.len() + 3);
        if let Some(device) = self.embeddings {
            modules.push(("tok_embeddings".to_string(), device));
        }
        modules.extend(
            self.layers()
                .map(|(layer, device)| (format!("layers.{layer}"), device)),
        );
        if let Some(device) = self.head {
            modules.push(("norm".to_string(), device));
            modules.push(("output".to_string(), device));
        }
        modules
    }

    /// All devices that are used by this rank.
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.embeddings
            .into_iter()
            .chain(self.layers.values().copied())
            .chain(self.head)
            .collect()
    }

    /// Open the devices that are used by this rank.
    pub fn open_devices(&self) -> Result<Devices, DeviceMapError> {
        Devices::open(self.devices())
    }
}

fn first_device(
    spec: &DeviceMapSpec,
    layers: &BTreeMap<usize, DeviceId>,
    local_devices: &[DeviceId],
) -> DeviceId {
    match spec {
        DeviceMapSpec::Cpu => DeviceId::Cpu,
        _ => layers
            .values()
            .next()
            .or(local_devices.first())
            .copied()
            .unwrap_or(DeviceId::Cpu),
    }
}

/// Opened devices.
///
/// Every device is opened once, so that all modules on a device share the
/// same device handle.
#[derive(Clone, Debug)]
pub struct Devices {
    devices: HashMap<DeviceId, Device>,
}

impl Devices {
    pub fn open(ids: impl IntoIterator<Item = DeviceId>) -> Result<Self, DeviceMapError> {
        let devices = ids
            .into_iter()
            .map(|id| {
                let device = match id {
                    DeviceId::Cpu => Device::Cpu,
                    DeviceId::Cuda(ordinal) => {
                        Device::new_cuda(ordinal).context(OpenDeviceSnafu { device: id })?
                    }
                };
                Ok((id, device))
            })
            .collect::<Result<_, DeviceMapError>>()?;
        Ok(Devices { devices })
    }

    pub fn get(&self, id: DeviceId) -> Result<&Device, DeviceMapError> {
        self.devices.get(&id).context(NotOpenedSnafu { device: id })
    }
}
