use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use snafu::{ensure, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ProcessGroupConfigError {
    #[snafu(display("Cannot parse {name}={value}"))]
    ParseVar {
        source: ParseIntError,
        name: String,
        value: String,
    },

    #[snafu(display("WORLD_RANK or RANK must be set when WORLD_SIZE is larger than one"))]
    MissingRank,

    #[snafu(display("Rank {rank} is not valid for world size {world_size}"))]
    RankOutOfRange { rank: usize, world_size: usize },

    #[snafu(display("World size must be larger than zero"))]
    ZeroWorldSize,
}

/// Process group configuration.
///
/// The configuration is usually read from the same environment variables
/// as used by `torchrun`, see [ProcessGroupConfig::from_env].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessGroupConfig {
    pub world_size: usize,
    pub rank: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub timeout: Duration,
    pub local_rank: usize,
    pub local_devices: Option<Vec<usize>>,
}

impl ProcessGroupConfig {
    /// Number of processes.
    ///
    /// Default: `1`
    pub fn world_size(mut self, world_size: usize) -> Self {
        self.world_size = world_size;
        self
    }

    /// Rank of this process.
    ///
    /// Default: `0`
    pub fn rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    /// Address of the rendezvous store, which is run by rank 0.
    ///
    /// Default: `127.0.0.1`
    pub fn master_addr(mut self, master_addr: impl Into<String>) -> Self {
        self.master_addr = master_addr.into();
        self
    }

    /// Port of the rendezvous store.
    ///
    /// Default: `29500`
    pub fn master_port(mut self, master_port: u16) -> Self {
        self.master_port = master_port;
        self
    }

    /// Timeout for joining the group and for receiving messages.
    ///
    /// Default: 1800 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rank of this process on the local node.
    ///
    /// Default: `0`
    pub fn local_rank(mut self, local_rank: usize) -> Self {
        self.local_rank = local_rank;
        self
    }

    /// CUDA ordinals that this process uses.
    ///
    /// Default: `None`, use the device with the local rank as its ordinal.
    pub fn local_devices(mut self, local_devices: Option<Vec<usize>>) -> Self {
        self.local_devices = local_devices;
        self
    }

    /// Read the configuration from environment variables.
    ///
    /// * `WORLD_SIZE` - number of processes (absent: single process).
    /// * `WORLD_RANK`, or `RANK` - rank of this process.
    /// * `MASTER_ADDR`, `MASTER_PORT` - address of the rendezvous store.
    /// * `DISPATCH_TIMEOUT_SECS` - timeout in seconds.
    /// * `LOCAL_RANK` - rank on this node.
    /// * `LOCAL_DEVICES` - comma-separated CUDA ordinals.
    pub fn from_env() -> Result<Self, ProcessGroupConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProcessGroupConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ProcessGroupConfig::default();

        if let Some(world_size) = parse_var(&lookup, "WORLD_SIZE")? {
            config.world_size = world_size;
        }

        let rank = match parse_var(&lookup, "WORLD_RANK")? {
            Some(rank) => Some(rank),
            None => parse_var(&lookup, "RANK")?,
        };
        config.rank = match rank {
            Some(rank) => rank,
            None if config.world_size > 1 => return MissingRankSnafu.fail(),
            None => 0,
        };

        if let Some(master_addr) = lookup("MASTER_ADDR") {
            config.master_addr = master_addr;
        }
        if let Some(master_port) = parse_var(&lookup, "MASTER_PORT")? {
            config.master_port = master_port;
        }
        if let Some(timeout) = parse_var(&lookup, "DISPATCH_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(timeout);
        }
        if let Some(local_rank) = parse_var(&lookup, "LOCAL_RANK")? {
            config.local_rank = local_rank;
        }
        if let Some(local_devices) = lookup("LOCAL_DEVICES") {
            config.local_devices = Some(
                local_devices
                    .split(',')
                    .map(str::trim)
                    .filter(|ordinal| !ordinal.is_empty())
                    .map(|ordinal| {
                        ordinal.parse().context(ParseVarSnafu {
                            name: "LOCAL_DEVICES",
                            value: &local_devices,
                        })
                    })
                    .collect::<Result<_, _>>()?,
            );
        }

        config.validate()?;

        Ok(config)
    }

    /// Check that the rank is valid for the world size.
    pub fn validate(&self) -> Result<(), ProcessGroupConfigError> {
        ensure!(self.world_size > 0, ZeroWorldSizeSnafu);
        ensure!(
            self.rank < self.world_size,
            RankOutOfRangeSnafu {
                rank: self.rank,
                world_size: self.world_size
            }
        );
        Ok(())
    }

    /// Address of the rendezvous store.
    pub fn store_addr(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

impl Default for ProcessGroupConfig {
    fn default() -> Self {
        ProcessGroupConfig {
            world_size: 1,
            rank: 0,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            timeout: Duration::from_secs(1800),
            local_rank: 0,
            local_devices: None,
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ProcessGroupConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr<Err = ParseIntError>,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .context(ParseVarSnafu { name, value: &value })
        })
        .transpose()
}
