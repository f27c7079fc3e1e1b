//! Limit cascade enforcement.
//!
//! When a parent's budget shrinks, fixed children may no longer fit. The
//! enforcer walks the subtree top-down and, at any level whose fixed
//! children exceed the parent's effective total for a kind, rewrites every
//! fixed child of that kind to auto. No child is partially reduced. Each
//! level is re-split with the rewritten values and the walk continues with
//! the children's new effective limits.
//!
//! Each rewrite is committed on its own. A failure partway leaves the levels
//! already visited valid (possibly more conservative than needed), never
//! over quota. Running the enforcer again with no intervening writes
//! rewrites nothing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use berth_id::AppId;
use berth_quota::{validate_allocation, Configured, ConfiguredLimits, EffectiveLimits, ResourceKind};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::context::Context;
use crate::db::DbError;
use crate::error::ErrorKind;
use crate::hierarchy::{split_level, EntityRef, Hierarchy, HierarchyError, Level};
use crate::store::DeploymentStore;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl CascadeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Hierarchy(e) => e.kind(),
            Self::Db(_) => ErrorKind::Internal,
        }
    }
}

/// Fixed children of one parent that were rewritten to auto for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelRewrite {
    pub level: Level,
    pub parent: EntityRef,
    pub kind: ResourceKind,
    pub entities: Vec<EntityRef>,
}

/// Outcome of one enforcement pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    pub root: EntityRef,
    pub rewrites: Vec<LevelRewrite>,
    /// Applications whose effective limits differ from the limits of their
    /// last deploy payload.
    pub changed_applications: Vec<AppId>,
}

impl CascadeReport {
    fn new(root: EntityRef) -> Self {
        Self {
            root,
            rewrites: Vec::new(),
            changed_applications: Vec::new(),
        }
    }

    /// Number of distinct entities rewritten at each level.
    pub fn updated_counts_by_level(&self) -> BTreeMap<Level, usize> {
        let mut seen: BTreeMap<Level, BTreeSet<EntityRef>> = BTreeMap::new();
        for rewrite in &self.rewrites {
            seen.entry(rewrite.level)
                .or_default()
                .extend(rewrite.entities.iter().copied());
        }
        seen.into_iter().map(|(level, set)| (level, set.len())).collect()
    }

    pub fn total_updated(&self) -> usize {
        self.updated_counts_by_level().values().sum()
    }
}

/// Re-enforces limits below a changed entity and applies limit writes.
#[derive(Clone)]
pub struct LimitCascade {
    hierarchy: Hierarchy,
    applications: Arc<dyn DeploymentStore>,
}

impl LimitCascade {
    pub fn new(hierarchy: Hierarchy, applications: Arc<dyn DeploymentStore>) -> Self {
        Self {
            hierarchy,
            applications,
        }
    }

    /// Walks the subtree under `root`, rewriting over-committed fixed
    /// children to auto.
    #[instrument(skip_all, fields(root = %root, request_id = %ctx.request_id))]
    pub async fn enforce(
        &self,
        root: &EntityRef,
        ctx: &Context,
    ) -> Result<CascadeReport, CascadeError> {
        let store = self.hierarchy.store();
        let root_limits = self.hierarchy.effective_limits(root).await?;
        let mut report = CascadeReport::new(*root);

        if let Some(app) = root.as_application() {
            self.note_application(app, root_limits, &mut report).await?;
        }

        let mut queue = VecDeque::from([(*root, root_limits)]);
        while let Some((parent, parent_limits)) = queue.pop_front() {
            let Some(level) = parent.level().child() else {
                continue;
            };
            let mut children = store.children(&parent).await?;
            if children.is_empty() {
                continue;
            }

            for kind in ResourceKind::ALL {
                let fits = validate_allocation(
                    parent_limits.get(kind),
                    children.iter().map(|c| c.limits.get(kind)),
                );
                if fits {
                    continue;
                }

                let fixed: Vec<EntityRef> = children
                    .iter()
                    .filter(|c| !c.limits.get(kind).is_auto())
                    .map(|c| c.entity)
                    .collect();
                let rewritten = store.reset_to_auto(kind, &fixed).await?;
                for child in &mut children {
                    child.limits.set(kind, Configured::Auto);
                }

                info!(
                    parent = %parent,
                    level = %level,
                    kind = %kind,
                    rewritten,
                    actor_id = %ctx.actor_id,
                    "Fixed limits exceed parent budget, reset to auto"
                );
                report.rewrites.push(LevelRewrite {
                    level,
                    parent,
                    kind,
                    entities: fixed,
                });
            }

            let split = split_level(&parent_limits, &children);
            for child in &children {
                let Some(limits) = split.get(&child.entity).copied() else {
                    continue;
                };
                match child.entity.as_application() {
                    Some(app) => self.note_application(app, limits, &mut report).await?,
                    None => queue.push_back((child.entity, limits)),
                }
            }
        }

        if !report.rewrites.is_empty() {
            info!(
                updated = report.total_updated(),
                changed_applications = report.changed_applications.len(),
                "Cascade enforcement complete"
            );
        }
        Ok(report)
    }

    /// Validates and persists new configured limits, then re-enforces the
    /// parent's subtree so auto siblings whose share shrank are covered too.
    #[instrument(skip_all, fields(entity = %entity, request_id = %ctx.request_id))]
    pub async fn update_limits(
        &self,
        entity: &EntityRef,
        limits: &ConfiguredLimits,
        ctx: &Context,
    ) -> Result<CascadeReport, CascadeError> {
        let parent = self.hierarchy.validate_limits(entity, limits).await?;
        if !self.hierarchy.store().set_limits(entity, limits).await? {
            return Err(HierarchyError::NotFound(*entity).into());
        }
        info!(actor_id = %ctx.actor_id, "Configured limits updated");
        self.enforce(&parent, ctx).await
    }

    /// Replaces a user's ceilings and re-enforces everything the user owns.
    #[instrument(skip_all, fields(user = %user, request_id = %ctx.request_id))]
    pub async fn update_user_ceilings(
        &self,
        user: &berth_id::UserId,
        ceilings: &EffectiveLimits,
        ctx: &Context,
    ) -> Result<CascadeReport, CascadeError> {
        let store = self.hierarchy.store();
        if !store.set_user_ceilings(user, ceilings).await? {
            return Err(HierarchyError::NotFound((*user).into()).into());
        }
        info!(actor_id = %ctx.actor_id, "User ceilings updated");
        self.enforce(&(*user).into(), ctx).await
    }

    async fn note_application(
        &self,
        app: AppId,
        limits: EffectiveLimits,
        report: &mut CascadeReport,
    ) -> Result<(), CascadeError> {
        let Some(application) = self.applications.get_application(&app).await? else {
            return Ok(());
        };
        if application.applied_limits.is_some_and(|applied| applied != limits) {
            report.changed_applications.push(app);
        }
        Ok(())
    }
}
