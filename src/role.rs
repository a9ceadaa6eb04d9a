use serde::Deserialize;

/// The cluster-level function a machine performs, for roles that are part of
/// a coordinated cluster at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterRole {
    Leader,
    Worker,
}

/// Everything that used to vary per box subclass, flattened into data.
///
/// The role name is an explicit field, never derived from a type name at
/// runtime. Capabilities that the provisioning layer needs (which user to
/// ssh in as, which image to boot, what instance shape to ask for) are plain
/// fields with explicit defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleDescriptor {
    /// Kebab-case role name, e.g. "cluster-leader". Combined with the
    /// environment namespace to form the absolute name used for tagging.
    pub name: String,
    /// Username for remote sessions on instances of this role.
    pub ssh_user: String,
    /// Image to boot new instances from.
    pub image_id: String,
    /// Provider instance shape.
    pub instance_type: String,
    /// Cluster membership, if any.
    #[serde(default)]
    pub cluster: Option<ClusterRole>,
    /// Boot-time user data handed to the provider verbatim.
    #[serde(default)]
    pub user_data: Option<String>,
}

impl RoleDescriptor {
    pub fn new(name: &str, ssh_user: &str, image_id: &str, instance_type: &str) -> Self {
        Self {
            name: name.to_string(),
            ssh_user: ssh_user.to_string(),
            image_id: image_id.to_string(),
            instance_type: instance_type.to_string(),
            cluster: None,
            user_data: None,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterRole) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_user_data(mut self, user_data: &str) -> Self {
        self.user_data = Some(user_data.to_string());
        self
    }
}

/// Convert a PascalCase label to the kebab-case convention role names use.
/// For callers that derive role names from type labels.
pub fn kebab_case(label: &str) -> String {
    let mut out = String::with_capacity(label.len() + 4);
    for (i, c) in label.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_case_splits_on_uppercase() {
        assert_eq!(kebab_case("ClusterLeader"), "cluster-leader");
        assert_eq!(kebab_case("GenericUbuntuBox"), "generic-ubuntu-box");
        assert_eq!(kebab_case("Worker"), "worker");
        assert_eq!(kebab_case("already-kebab"), "already-kebab");
    }

    #[test]
    fn descriptor_builders() {
        let role = RoleDescriptor::new("cluster-worker", "admin", "img-base", "m1.small")
            .with_cluster(ClusterRole::Worker)
            .with_user_data("#!/bin/sh\n");
        assert_eq!(role.name, "cluster-worker");
        assert_eq!(role.cluster, Some(ClusterRole::Worker));
        assert!(role.user_data.unwrap().starts_with("#!"));
    }

    #[test]
    fn descriptor_deserializes_from_yaml() {
        let yaml = "
name: cluster-leader
ssh_user: admin
image_id: img-0abc
instance_type: m1.large
cluster: leader
";
        let role: RoleDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(role.cluster, Some(ClusterRole::Leader));
        assert!(role.user_data.is_none());
    }
}
