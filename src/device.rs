//! Accelerator discovery and device selection.
//!
//! The probe runs once per process; with the `tch-backend` feature it asks
//! libtorch for CUDA devices, otherwise the service is CPU-only.

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::info;

/// What the host offers, independent of configuration.
#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorProbe {
    pub cuda_available: bool,
    pub gpu_count: usize,
    pub gpu_name: Option<String>,
}

static PROBE: OnceCell<AcceleratorProbe> = OnceCell::new();

impl AcceleratorProbe {
    pub fn detect() -> &'static AcceleratorProbe {
        PROBE.get_or_init(|| {
            let probe = probe_host();
            info!(
                cuda_available = probe.cuda_available,
                gpu_count = probe.gpu_count,
                "accelerator probe complete"
            );
            probe
        })
    }

    pub fn cpu_only() -> Self {
        Self {
            cuda_available: false,
            gpu_count: 0,
            gpu_name: None,
        }
    }
}

#[cfg(feature = "tch-backend")]
fn probe_host() -> AcceleratorProbe {
    let cuda_available = tch::Cuda::is_available();
    let gpu_count = if cuda_available {
        tch::Cuda::device_count().max(0) as usize
    } else {
        0
    };
    AcceleratorProbe {
        cuda_available,
        gpu_count,
        gpu_name: None,
    }
}

#[cfg(not(feature = "tch-backend"))]
fn probe_host() -> AcceleratorProbe {
    AcceleratorProbe::cpu_only()
}

/// The device the model runs on, after weighing the GPU flag against the probe.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSelection {
    pub descriptor: String,
    pub ordinal: Option<usize>,
    pub gpu_enabled: bool,
    pub gpu_available: bool,
    pub gpu_count: usize,
    pub gpu_name: Option<String>,
}

impl DeviceSelection {
    pub fn probe(gpu_enabled: bool) -> Self {
        Self::select(gpu_enabled, AcceleratorProbe::detect())
    }

    pub fn select(gpu_enabled: bool, probe: &AcceleratorProbe) -> Self {
        let gpu_available = probe.cuda_available && probe.gpu_count > 0;
        let ordinal = (gpu_enabled && gpu_available).then_some(0);
        let descriptor = match ordinal {
            Some(idx) => format!("cuda:{idx}"),
            None => "cpu".to_string(),
        };
        Self {
            descriptor,
            ordinal,
            gpu_enabled,
            gpu_available,
            gpu_count: probe.gpu_count,
            gpu_name: probe.gpu_name.clone(),
        }
    }

    pub fn cpu() -> Self {
        Self::select(false, &AcceleratorProbe::cpu_only())
    }
}
