//! The `define_id!` macro.

/// Defines a ULID-backed identifier with a fixed string prefix.
///
/// The generated type is `Copy`, totally ordered by its ULID, displays as
/// `{prefix}_{ulid}` and (de)serializes as that string.
///
/// ```ignore
/// define_id!(TeamId, "team");
///
/// let id = TeamId::new();
/// let parsed: TeamId = id.to_string().parse()?;
/// assert_eq!(id, parsed);
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[doc = concat!("Identifier with the `", $prefix, "_` prefix.")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// String prefix carried by every rendered ID of this type.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Parses `{prefix}_{ulid}`, rejecting any other prefix.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let ulid = $crate::split_prefixed(s, Self::PREFIX)?;
                Ok(Self(ulid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
