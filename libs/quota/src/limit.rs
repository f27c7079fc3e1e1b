//! Configured and effective limit values.

use serde::{Deserialize, Serialize};

use crate::{QuotaError, ResourceKind, AUTO};

/// A limit as configured at one level of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Configured {
    /// Take an even share of what the fixed siblings leave over.
    #[default]
    Auto,
    /// Reserve exactly this much, regardless of siblings.
    Fixed(u64),
}

impl Configured {
    /// Converts a stored integer. Only `-1` may be negative.
    pub fn from_raw(raw: i64) -> Result<Self, QuotaError> {
        match raw {
            AUTO => Ok(Self::Auto),
            n if n < 0 => Err(QuotaError::NegativeValue(n)),
            n => Ok(Self::Fixed(n as u64)),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Self::Auto => AUTO,
            Self::Fixed(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    pub fn fixed(&self) -> Option<u64> {
        match self {
            Self::Auto => None,
            Self::Fixed(n) => Some(*n),
        }
    }
}

impl TryFrom<i64> for Configured {
    type Error = QuotaError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<Configured> for i64 {
    fn from(value: Configured) -> Self {
        value.to_raw()
    }
}

/// A limit as it actually applies after allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Effective {
    #[default]
    Unbounded,
    Limited(u64),
}

impl Effective {
    pub fn from_raw(raw: i64) -> Result<Self, QuotaError> {
        match raw {
            AUTO => Ok(Self::Unbounded),
            n if n < 0 => Err(QuotaError::NegativeValue(n)),
            n => Ok(Self::Limited(n as u64)),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Self::Unbounded => AUTO,
            Self::Limited(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Self::Unbounded)
    }

    pub fn amount(&self) -> Option<u64> {
        match self {
            Self::Unbounded => None,
            Self::Limited(n) => Some(*n),
        }
    }
}

impl TryFrom<i64> for Effective {
    type Error = QuotaError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<Effective> for i64 {
    fn from(value: Effective) -> Self {
        value.to_raw()
    }
}

/// One value per [`ResourceKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Limits<T> {
    pub cpu_millicores: T,
    pub ram_mb: T,
    pub storage_mb: T,
    pub ports: T,
    pub bandwidth_mbps: T,
    pub pids: T,
}

/// Limits as configured on one entity.
pub type ConfiguredLimits = Limits<Configured>;

/// Limits as they apply to one entity.
pub type EffectiveLimits = Limits<Effective>;

impl<T: Copy> Limits<T> {
    /// Same value for every kind.
    pub fn uniform(value: T) -> Self {
        Self {
            cpu_millicores: value,
            ram_mb: value,
            storage_mb: value,
            ports: value,
            bandwidth_mbps: value,
            pids: value,
        }
    }

    pub fn get(&self, kind: ResourceKind) -> T {
        match kind {
            ResourceKind::CpuMillicores => self.cpu_millicores,
            ResourceKind::RamMb => self.ram_mb,
            ResourceKind::StorageMb => self.storage_mb,
            ResourceKind::Ports => self.ports,
            ResourceKind::BandwidthMbps => self.bandwidth_mbps,
            ResourceKind::Pids => self.pids,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: T) {
        let slot = match kind {
            ResourceKind::CpuMillicores => &mut self.cpu_millicores,
            ResourceKind::RamMb => &mut self.ram_mb,
            ResourceKind::StorageMb => &mut self.storage_mb,
            ResourceKind::Ports => &mut self.ports,
            ResourceKind::BandwidthMbps => &mut self.bandwidth_mbps,
            ResourceKind::Pids => &mut self.pids,
        };
        *slot = value;
    }

    /// Returns a copy with one kind replaced.
    pub fn with(mut self, kind: ResourceKind, value: T) -> Self {
        self.set(kind, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, T)> + '_ {
        ResourceKind::ALL.into_iter().map(|kind| (kind, self.get(kind)))
    }

    pub fn map<U: Copy>(&self, mut f: impl FnMut(ResourceKind, T) -> U) -> Limits<U> {
        let mut out = Limits::uniform(f(ResourceKind::CpuMillicores, self.cpu_millicores));
        for kind in ResourceKind::ALL.into_iter().skip(1) {
            out.set(kind, f(kind, self.get(kind)));
        }
        out
    }
}

impl Limits<Configured> {
    /// Parses six stored integers in [`ResourceKind::ALL`] order.
    pub fn from_raw(raw: [i64; 6]) -> Result<Self, QuotaError> {
        let mut out = Self::default();
        for (kind, value) in ResourceKind::ALL.into_iter().zip(raw) {
            out.set(kind, Configured::from_raw(value)?);
        }
        Ok(out)
    }

    pub fn to_raw(&self) -> [i64; 6] {
        ResourceKind::ALL.map(|kind| self.get(kind).to_raw())
    }
}

impl Limits<Effective> {
    pub fn from_raw(raw: [i64; 6]) -> Result<Self, QuotaError> {
        let mut out = Self::default();
        for (kind, value) in ResourceKind::ALL.into_iter().zip(raw) {
            out.set(kind, Effective::from_raw(value)?);
        }
        Ok(out)
    }

    pub fn to_raw(&self) -> [i64; 6] {
        ResourceKind::ALL.map(|kind| self.get(kind).to_raw())
    }
}
