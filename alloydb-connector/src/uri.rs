//! Fully-qualified AlloyDB instance URIs.

use std::{fmt, str::FromStr};

use crate::error::Error;

/// Identifies one AlloyDB instance:
/// `projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>`
///
/// The project segment may be domain-scoped and contain a `:`, e.g.
/// `example.com:my-project`. Two URIs are equal iff all four components match
/// case-sensitively.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstanceUri {
    project: String,
    location: String,
    cluster: String,
    instance: String,
}

impl InstanceUri {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The full instance resource path, identical to the [`fmt::Display`]
    /// form. Used by `connectionInfo` calls.
    pub fn instance_path(&self) -> String {
        self.to_string()
    }

    /// The parent cluster resource path,
    /// `projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>`.
    /// Client certificates are signed at the cluster level.
    pub fn cluster_path(&self) -> String {
        let Self {
            project,
            location,
            cluster,
            instance: _,
        } = self;
        format!("projects/{project}/locations/{location}/clusters/{cluster}")
    }
}

impl FromStr for InstanceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            Error::Config(format!(
                "invalid instance URI '{s}'; expected \
                 projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>\
                 /instances/<INSTANCE>"
            ))
        };

        let segments = s.split('/').collect::<Vec<_>>();
        let [
            "projects",
            project,
            "locations",
            location,
            "clusters",
            cluster,
            "instances",
            instance,
        ] = segments.as_slice()
        else {
            return Err(malformed());
        };

        if project.is_empty()
            || location.is_empty()
            || cluster.is_empty()
            || instance.is_empty()
        {
            return Err(malformed());
        }

        // Only the (possibly domain-scoped) project segment may contain ':'.
        if [location, cluster, instance].iter().any(|s| s.contains(':')) {
            return Err(malformed());
        }

        Ok(Self {
            project: (*project).to_owned(),
            location: (*location).to_owned(),
            cluster: (*cluster).to_owned(),
            instance: (*instance).to_owned(),
        })
    }
}

impl fmt::Display for InstanceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            project,
            location,
            cluster,
            instance,
        } = self;
        write!(
            f,
            "projects/{project}/locations/{location}/clusters/{cluster}\
             /instances/{instance}"
        )
    }
}

#[cfg(test)]
mod test {
    use proptest::{
        prelude::any, prop_assert_eq, proptest, string::string_regex,
    };

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parse_simple() {
        let uri = InstanceUri::from_str(
            "projects/my-project/locations/us-central1/clusters/my-cluster\
             /instances/my-instance",
        )
        .unwrap();
        assert_eq!(uri.project(), "my-project");
        assert_eq!(uri.location(), "us-central1");
        assert_eq!(uri.cluster(), "my-cluster");
        assert_eq!(uri.instance(), "my-instance");
        assert_eq!(
            uri.cluster_path(),
            "projects/my-project/locations/us-central1/clusters/my-cluster",
        );
    }

    #[test]
    fn parse_domain_scoped_project() {
        let uri = InstanceUri::from_str(
            "projects/example.com:my-project/locations/eu-west1/clusters/c\
             /instances/i",
        )
        .unwrap();
        assert_eq!(uri.project(), "example.com:my-project");
    }

    #[test]
    fn reject_malformed() {
        let cases = [
            "",
            "projects/p",
            "projects/p/locations/l/clusters/c",
            "projects/p/locations/l/clusters/c/instances/",
            "projects//locations/l/clusters/c/instances/i",
            "project/p/locations/l/clusters/c/instances/i",
            "projects/p/locations/l/clusters/c/instances/i/extra",
            "/projects/p/locations/l/clusters/c/instances/i",
            // ':' is only allowed in the project segment
            "projects/p/locations/l:l/clusters/c/instances/i",
            "projects/p/locations/l/clusters/c/instances/i:i",
        ];
        for case in cases {
            let err = InstanceUri::from_str(case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "case: '{case}'");
        }
    }

    proptest! {
        /// Every well-formed URI parses into four components and
        /// re-serializes identically.
        #[test]
        fn parse_display_roundtrip(
            project in string_regex(
                "[a-z][a-z0-9-]{0,12}(:[a-z0-9.-]{1,12})?"
            ).unwrap(),
            location in string_regex("[a-z][a-z0-9-]{0,12}").unwrap(),
            cluster in string_regex("[a-z][a-z0-9-]{0,12}").unwrap(),
            instance in string_regex("[a-z][a-z0-9-]{0,12}").unwrap(),
        ) {
            let s = format!(
                "projects/{project}/locations/{location}\
                 /clusters/{cluster}/instances/{instance}"
            );
            let uri = InstanceUri::from_str(&s).unwrap();
            prop_assert_eq!(uri.project(), project.as_str());
            prop_assert_eq!(uri.to_string(), s);
        }

        /// Arbitrary strings never panic the parser.
        #[test]
        fn parse_never_panics(s in any::<String>()) {
            let _ = InstanceUri::from_str(&s);
        }
    }
}
