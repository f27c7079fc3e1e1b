//! Resource kinds tracked at every level of the tenant tree.

use serde::{Deserialize, Serialize};

/// One integer-valued resource.
///
/// The allocator and the cascade are generic over a single integer, so adding
/// a kind here is the only change needed to track a new resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// CPU in millicores.
    CpuMillicores,
    /// Memory in MB.
    RamMb,
    /// Disk in MB.
    StorageMb,
    /// Number of host ports.
    Ports,
    /// Network bandwidth in Mbps.
    BandwidthMbps,
    /// Process count.
    Pids,
}

impl ResourceKind {
    /// Every kind, in storage column order.
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::CpuMillicores,
        ResourceKind::RamMb,
        ResourceKind::StorageMb,
        ResourceKind::Ports,
        ResourceKind::BandwidthMbps,
        ResourceKind::Pids,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuMillicores => "cpu_millicores",
            Self::RamMb => "ram_mb",
            Self::StorageMb => "storage_mb",
            Self::Ports => "ports",
            Self::BandwidthMbps => "bandwidth_mbps",
            Self::Pids => "pids",
        }
    }

    /// Name of the column holding this kind's configured value.
    pub fn column(&self) -> &'static str {
        match self {
            Self::CpuMillicores => "cpu_millicores_limit",
            Self::RamMb => "ram_mb_limit",
            Self::StorageMb => "storage_mb_limit",
            Self::Ports => "ports_limit",
            Self::BandwidthMbps => "bandwidth_mbps_limit",
            Self::Pids => "pids_limit",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}
