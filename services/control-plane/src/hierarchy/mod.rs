//! Effective limits across the tenant tree.
//!
//! `user → team → project → environment → application`. A user's ceilings are
//! absolute; every other level gets its share of its parent's effective
//! limits from the quota allocator, one resource kind at a time.
//!
//! Nothing is cached between calls: each lookup re-reads the configured
//! values along the path. [`Hierarchy::scoped`] memoizes for the lifetime of
//! one request only.

mod entity;

pub use entity::{EntityRef, Level};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use berth_quota::{
    allocate, check_allocation, Configured, ConfiguredLimits, EffectiveLimits, QuotaError,
    ResourceKind,
};
use thiserror::Error;
use tracing::instrument;

use crate::db::DbError;
use crate::error::ErrorKind;
use crate::model::Application;
use crate::store::{HierarchyStore, LimitNode};

#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("{level} {0} not found", level = .0.level())]
    NotFound(EntityRef),

    #[error("users have ceilings, not configured limits")]
    UserHasNoConfiguredLimits,

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl HierarchyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::UserHasNoConfiguredLimits | Self::Quota(_) => ErrorKind::Configuration,
            Self::Db(_) => ErrorKind::Internal,
        }
    }
}

/// Splits `parent` among `children`, every kind independently.
pub fn split_level(
    parent: &EffectiveLimits,
    children: &[LimitNode],
) -> BTreeMap<EntityRef, EffectiveLimits> {
    let mut out: BTreeMap<EntityRef, EffectiveLimits> = children
        .iter()
        .map(|child| (child.entity, EffectiveLimits::default()))
        .collect();

    for kind in ResourceKind::ALL {
        let configured: BTreeMap<EntityRef, Configured> = children
            .iter()
            .map(|child| (child.entity, child.limits.get(kind)))
            .collect();
        let allocation = allocate(parent.get(kind), &configured);
        for (entity, value) in allocation.effective {
            if let Some(limits) = out.get_mut(&entity) {
                limits.set(kind, value);
            }
        }
    }
    out
}

/// Read access to the tenant tree's limits.
#[derive(Clone)]
pub struct Hierarchy {
    store: Arc<dyn HierarchyStore>,
}

impl Hierarchy {
    pub fn new(store: Arc<dyn HierarchyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn HierarchyStore> {
        &self.store
    }

    /// Effective limits of any entity, derived from current persisted state.
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn effective_limits(
        &self,
        entity: &EntityRef,
    ) -> Result<EffectiveLimits, HierarchyError> {
        self.scoped().effective_limits(entity).await
    }

    /// A resolver that memoizes results. Drop it when the request ends.
    pub fn scoped(&self) -> ScopedHierarchy<'_> {
        ScopedHierarchy {
            hierarchy: self,
            cache: HashMap::new(),
        }
    }

    /// Configured limits of a non-user entity.
    pub async fn configured_limits(
        &self,
        entity: &EntityRef,
    ) -> Result<ConfiguredLimits, HierarchyError> {
        if entity.as_user().is_some() {
            return Err(HierarchyError::UserHasNoConfiguredLimits);
        }
        self.store
            .limit_node(entity)
            .await?
            .map(|node| node.limits)
            .ok_or(HierarchyError::NotFound(*entity))
    }

    /// Checks that `proposed` would fit among the entity's siblings under
    /// its parent's current effective limits, and returns the parent.
    /// Nothing is written.
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn validate_limits(
        &self,
        entity: &EntityRef,
        proposed: &ConfiguredLimits,
    ) -> Result<EntityRef, HierarchyError> {
        if entity.as_user().is_some() {
            return Err(HierarchyError::UserHasNoConfiguredLimits);
        }
        let node = self
            .store
            .limit_node(entity)
            .await?
            .ok_or(HierarchyError::NotFound(*entity))?;

        let parent_limits = self.effective_limits(&node.parent).await?;
        let siblings = self.store.children(&node.parent).await?;

        for kind in ResourceKind::ALL {
            let configured = siblings
                .iter()
                .filter(|sibling| sibling.entity != *entity)
                .map(|sibling| sibling.limits.get(kind))
                .chain(std::iter::once(proposed.get(kind)));
            check_allocation(kind, parent_limits.get(kind), configured)?;
        }
        Ok(node.parent)
    }

    /// Validates and persists a new application under its environment.
    ///
    /// Resource strings are normalized and the configured limits must fit
    /// beside the environment's other applications. Nothing is written on
    /// error.
    #[instrument(skip_all, fields(app_id = %application.id, environment_id = %application.environment_id))]
    pub async fn create_application(
        &self,
        mut application: Application,
    ) -> Result<Application, HierarchyError> {
        application.normalize_resources()?;

        let environment = EntityRef::Environment(application.environment_id);
        if self.store.limit_node(&environment).await?.is_none() {
            return Err(HierarchyError::NotFound(environment));
        }
        let parent_limits = self.effective_limits(&environment).await?;
        let siblings = self.store.children(&environment).await?;
        for kind in ResourceKind::ALL {
            let configured = siblings
                .iter()
                .map(|sibling| sibling.limits.get(kind))
                .chain(std::iter::once(application.limits.get(kind)));
            check_allocation(kind, parent_limits.get(kind), configured)?;
        }

        self.store.insert_application(&application).await?;
        Ok(application)
    }
}

/// Request-scoped resolver over a [`Hierarchy`].
pub struct ScopedHierarchy<'a> {
    hierarchy: &'a Hierarchy,
    cache: HashMap<EntityRef, EffectiveLimits>,
}

impl ScopedHierarchy<'_> {
    pub async fn effective_limits(
        &mut self,
        entity: &EntityRef,
    ) -> Result<EffectiveLimits, HierarchyError> {
        if let Some(hit) = self.cache.get(entity) {
            return Ok(*hit);
        }

        let hierarchy = self.hierarchy;
        let store = &hierarchy.store;

        // Climb until a user or a cached ancestor; `path` is leaf first.
        let mut path: Vec<LimitNode> = Vec::new();
        let mut cursor = *entity;
        let mut parent_limits = loop {
            if let Some(hit) = self.cache.get(&cursor) {
                break *hit;
            }
            if let EntityRef::User(user) = cursor {
                let ceilings = store
                    .user_ceilings(&user)
                    .await?
                    .ok_or(HierarchyError::NotFound(cursor))?;
                self.cache.insert(cursor, ceilings);
                break ceilings;
            }
            let node = store
                .limit_node(&cursor)
                .await?
                .ok_or(HierarchyError::NotFound(cursor))?;
            cursor = node.parent;
            path.push(node);
        };

        for node in path.iter().rev() {
            let mut siblings = store.children(&node.parent).await?;
            if !siblings.iter().any(|s| s.entity == node.entity) {
                siblings.push(node.clone());
            }
            let level = split_level(&parent_limits, &siblings);
            self.cache.extend(level.iter().map(|(e, l)| (*e, *l)));
            parent_limits = level
                .get(&node.entity)
                .copied()
                .ok_or(HierarchyError::NotFound(node.entity))?;
        }

        Ok(parent_limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_id::EnvId;
    use berth_quota::Effective;

    fn env_node(limits: ConfiguredLimits) -> LimitNode {
        LimitNode {
            entity: EnvId::new().into(),
            parent: berth_id::ProjectId::new().into(),
            limits,
        }
    }

    #[test]
    fn test_split_level_per_kind() {
        let parent = EffectiveLimits::uniform(Effective::Unbounded)
            .with(ResourceKind::RamMb, Effective::Limited(1024))
            .with(ResourceKind::CpuMillicores, Effective::Limited(2000));
        let a = env_node(ConfiguredLimits::default().with(ResourceKind::CpuMillicores, Configured::Fixed(1500)));
        let b = env_node(ConfiguredLimits::default());

        let level = split_level(&parent, &[a.clone(), b.clone()]);
        let a_limits = level[&a.entity];
        let b_limits = level[&b.entity];

        assert_eq!(a_limits.ram_mb, Effective::Limited(512));
        assert_eq!(b_limits.ram_mb, Effective::Limited(512));
        assert_eq!(a_limits.cpu_millicores, Effective::Limited(1500));
        assert_eq!(b_limits.cpu_millicores, Effective::Limited(500));
        assert_eq!(a_limits.pids, Effective::Unbounded);
    }
}
