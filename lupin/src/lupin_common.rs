pub use log::{debug, info, warn};

pub use candle_util::{candle_core, candle_nn};

pub use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self, device_no: usize) -> anyhow::Result<candle_core::Device> {
        Ok(match self {
            ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
            _ => candle_core::Device::Cpu,
        })
    }
}

/// name of missing labels in label files
pub const MISSING_LABEL: &str = "NA";
