//! References to nodes of the tenant tree.

use std::fmt;
use std::str::FromStr;

use berth_id::{prefix_of, AppId, EnvId, IdError, ProjectId, TeamId, UserId};
use serde::{Deserialize, Serialize};

/// Depth in the tenant tree, root first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    User,
    Team,
    Project,
    Environment,
    Application,
}

impl Level {
    pub fn child(&self) -> Option<Level> {
        match self {
            Self::User => Some(Self::Team),
            Self::Team => Some(Self::Project),
            Self::Project => Some(Self::Environment),
            Self::Environment => Some(Self::Application),
            Self::Application => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
            Self::Project => "project",
            Self::Environment => "environment",
            Self::Application => "application",
        }
    }

    /// Table holding this level's rows.
    pub fn table(&self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Team => "teams",
            Self::Project => "projects",
            Self::Environment => "environments",
            Self::Application => "applications",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any quota-bearing entity, identified by its typed ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityRef {
    User(UserId),
    Team(TeamId),
    Project(ProjectId),
    Environment(EnvId),
    Application(AppId),
}

impl EntityRef {
    pub fn level(&self) -> Level {
        match self {
            Self::User(_) => Level::User,
            Self::Team(_) => Level::Team,
            Self::Project(_) => Level::Project,
            Self::Environment(_) => Level::Environment,
            Self::Application(_) => Level::Application,
        }
    }

    pub fn as_user(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_application(&self) -> Option<AppId> {
        match self {
            Self::Application(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => fmt::Display::fmt(id, f),
            Self::Team(id) => fmt::Display::fmt(id, f),
            Self::Project(id) => fmt::Display::fmt(id, f),
            Self::Environment(id) => fmt::Display::fmt(id, f),
            Self::Application(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl FromStr for EntityRef {
    type Err = IdError;

    /// Dispatches on the ID prefix: `usr_`, `team_`, `prj_`, `env_` or `app_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match prefix_of(s)? {
            UserId::PREFIX => Ok(Self::User(s.parse()?)),
            TeamId::PREFIX => Ok(Self::Team(s.parse()?)),
            ProjectId::PREFIX => Ok(Self::Project(s.parse()?)),
            EnvId::PREFIX => Ok(Self::Environment(s.parse()?)),
            AppId::PREFIX => Ok(Self::Application(s.parse()?)),
            other => Err(IdError::UnknownPrefix(other.to_string())),
        }
    }
}

impl From<UserId> for EntityRef {
    fn from(id: UserId) -> Self {
        Self::User(id)
    }
}

impl From<TeamId> for EntityRef {
    fn from(id: TeamId) -> Self {
        Self::Team(id)
    }
}

impl From<ProjectId> for EntityRef {
    fn from(id: ProjectId) -> Self {
        Self::Project(id)
    }
}

impl From<EnvId> for EntityRef {
    fn from(id: EnvId) -> Self {
        Self::Environment(id)
    }
}

impl From<AppId> for EntityRef {
    fn from(id: AppId) -> Self {
        Self::Application(id)
    }
}

impl Serialize for EntityRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_by_prefix() {
        let env = EnvId::new();
        let parsed: EntityRef = env.to_string().parse().unwrap();
        assert_eq!(parsed, EntityRef::Environment(env));
        assert_eq!(parsed.level(), Level::Environment);
        assert_eq!(parsed.to_string(), env.to_string());

        assert!("node_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<EntityRef>().is_err());
        assert!("garbage".parse::<EntityRef>().is_err());
    }

    #[test]
    fn test_level_chain() {
        let mut level = Level::User;
        let mut depth = 1;
        while let Some(child) = level.child() {
            assert!(child > level);
            level = child;
            depth += 1;
        }
        assert_eq!(depth, 5);
        assert_eq!(level, Level::Application);
    }
}
