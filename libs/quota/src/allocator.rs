//! Fixed/auto split of one resource among the children of one parent.

use std::collections::BTreeMap;

use crate::{Configured, Effective, QuotaError, ResourceKind};

/// Result of splitting one parent's budget for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation<K: Ord> {
    /// Effective value per child.
    pub effective: BTreeMap<K, Effective>,
    /// Sum of the fixed children's configured values.
    pub fixed_sum: u64,
    /// Number of children configured as auto.
    pub auto_count: usize,
    /// Fixed children asked for more than a bounded parent has. Every child
    /// was then given an even share, which is what the cascade will persist.
    pub overcommitted: bool,
}

impl<K: Ord> Allocation<K> {
    pub fn get(&self, key: &K) -> Option<Effective> {
        self.effective.get(key).copied()
    }

    /// Sum of all effective values, or `None` if any child is unbounded.
    pub fn total(&self) -> Option<u64> {
        self.effective
            .values()
            .try_fold(0u64, |acc, value| value.amount().map(|n| acc.saturating_add(n)))
    }
}

/// Splits `parent` among `children`.
///
/// With an unbounded parent, fixed children get exactly their configured
/// value and auto children stay unbounded. With a bounded parent, the amount
/// left after fixed children is divided evenly among auto children; the
/// remainder goes one unit each to the auto children with the lowest keys.
pub fn allocate<K: Ord + Clone>(
    parent: Effective,
    children: &BTreeMap<K, Configured>,
) -> Allocation<K> {
    let fixed_sum = fixed_sum(children.values().copied());
    let auto_count = children.values().filter(|c| c.is_auto()).count();

    let total = match parent {
        Effective::Unbounded => {
            let effective = children
                .iter()
                .map(|(key, configured)| {
                    let value = match configured {
                        Configured::Auto => Effective::Unbounded,
                        Configured::Fixed(n) => Effective::Limited(*n),
                    };
                    (key.clone(), value)
                })
                .collect();
            return Allocation {
                effective,
                fixed_sum,
                auto_count,
                overcommitted: false,
            };
        }
        Effective::Limited(total) => total,
    };

    if fixed_sum > total {
        let all: Vec<&K> = children.keys().collect();
        let effective = even_split(total, &all);
        return Allocation {
            effective,
            fixed_sum,
            auto_count,
            overcommitted: true,
        };
    }

    let remaining = total - fixed_sum;
    let autos: Vec<&K> = children
        .iter()
        .filter(|(_, c)| c.is_auto())
        .map(|(k, _)| k)
        .collect();

    let mut effective = even_split(remaining, &autos);
    for (key, configured) in children {
        if let Configured::Fixed(n) = configured {
            effective.insert(key.clone(), Effective::Limited(*n));
        }
    }

    Allocation {
        effective,
        fixed_sum,
        auto_count,
        overcommitted: false,
    }
}

/// `keys` must be in ascending order.
fn even_split<K: Ord + Clone>(amount: u64, keys: &[&K]) -> BTreeMap<K, Effective> {
    let mut out = BTreeMap::new();
    if keys.is_empty() {
        return out;
    }
    let count = keys.len() as u64;
    let base = amount / count;
    let remainder = amount % count;
    for (i, key) in keys.iter().enumerate() {
        let extra = u64::from((i as u64) < remainder);
        out.insert((*key).clone(), Effective::Limited(base + extra));
    }
    out
}

fn fixed_sum(values: impl IntoIterator<Item = Configured>) -> u64 {
    values
        .into_iter()
        .filter_map(|c| c.fixed())
        .fold(0u64, u64::saturating_add)
}

/// Returns true if the fixed children fit inside `parent`.
///
/// Cheap pre-write check: it does not compute the split.
pub fn validate_allocation(parent: Effective, children: impl IntoIterator<Item = Configured>) -> bool {
    match parent {
        Effective::Unbounded => true,
        Effective::Limited(total) => fixed_sum(children) <= total,
    }
}

/// Like [`validate_allocation`] but reports what was violated.
pub fn check_allocation(
    kind: ResourceKind,
    parent: Effective,
    children: impl IntoIterator<Item = Configured>,
) -> Result<(), QuotaError> {
    let Effective::Limited(available) = parent else {
        return Ok(());
    };
    let requested = fixed_sum(children);
    if requested > available {
        return Err(QuotaError::Overallocated {
            kind,
            requested,
            available,
        });
    }
    Ok(())
}
