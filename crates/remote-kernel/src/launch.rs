//! Launch requests and the cluster offerings they are built from.
//!
//! The control plane decides which resource keys exist for a cluster; the
//! client only ever edits their values. [`ResourceMap`] enforces that and
//! keeps keys in the order the server sent them, which is the order users
//! see them in the launch form.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::kernelspec::KernelSpecFile;

/// Errors raised while building or validating a launch request locally.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LaunchRequestError {
    #[error("No cluster selected")]
    EmptyCluster,

    #[error("Cluster `{0}` is not offered for this user")]
    UnknownCluster(String),

    #[error("Unknown resource `{0}`")]
    UnknownResource(String),

    #[error("Resource keys for cluster `{cluster}` do not match the offered template")]
    ResourceKeysChanged { cluster: String },
}

// ── Resource map ─────────────────────────────────────────────────────

/// Ordered resource-key → value map with a fixed key set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResourceMap(Map<String, Value>);

impl ResourceMap {
    /// Build a map from key/value pairs, keeping their order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert(k.into(), Value::String(v.into()));
        }
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Replace the value of an existing key. Keys are never added.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), LaunchRequestError> {
        match self.0.get_mut(key) {
            Some(slot) => {
                *slot = Value::String(value.into());
                Ok(())
            }
            None => Err(LaunchRequestError::UnknownResource(key.to_string())),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str().unwrap_or_default()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether both maps carry exactly the same keys, ignoring order.
    pub fn same_keys(&self, other: &ResourceMap) -> bool {
        self.len() == other.len() && self.keys().all(|k| other.0.contains_key(k))
    }
}

impl<'de> Deserialize<'de> for ResourceMap {
    /// Accepts scalar values of any JSON type and stores their string form,
    /// since the server is loose about `"cpus": 4` vs `"cpus": "4"`.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut map = Map::new();
        for (key, value) in raw {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(D::Error::custom(format!(
                        "resource `{key}` must be a scalar value"
                    )))
                }
            };
            map.insert(key, Value::String(value));
        }
        Ok(Self(map))
    }
}

// ── Launch request ───────────────────────────────────────────────────

/// User-supplied parameters for a new remote kernel spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub cluster: String,
    /// Working directory on the cluster; may be relative.
    pub workdir: String,
    /// Empty means "use the cluster default".
    #[serde(default)]
    pub exec_path: String,
    /// Empty means no user scripts.
    #[serde(default)]
    pub user_scripts: String,
    #[serde(default)]
    pub resources: ResourceMap,
}

impl LaunchRequest {
    /// Pre-populate a request from a cluster's template.
    pub fn from_template(cluster: &str, template: &KernelSpecFile) -> Self {
        let config = template.provisioner_config().cloned().unwrap_or_default();
        Self {
            cluster: cluster.to_string(),
            workdir: config.workdir,
            exec_path: config.exec_path.unwrap_or_default(),
            user_scripts: config.user_scripts.unwrap_or_default(),
            resources: config.spec,
        }
    }

    pub fn set_resource(
        &mut self,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), LaunchRequestError> {
        self.resources.set(key, value)
    }

    /// Check the request against the offerings it was built from.
    pub fn validate(&self, offerings: &Offerings) -> Result<(), LaunchRequestError> {
        if self.cluster.trim().is_empty() {
            return Err(LaunchRequestError::EmptyCluster);
        }
        let offering = offerings
            .get(&self.cluster)
            .ok_or_else(|| LaunchRequestError::UnknownCluster(self.cluster.clone()))?;
        let template = LaunchRequest::from_template(&offering.cluster, &offering.template);
        if !self.resources.same_keys(&template.resources) {
            return Err(LaunchRequestError::ResourceKeysChanged {
                cluster: self.cluster.clone(),
            });
        }
        Ok(())
    }
}

// ── Offerings ────────────────────────────────────────────────────────

/// One cluster the user may launch on, with its default template.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOffering {
    pub cluster: String,
    pub template: KernelSpecFile,
}

/// Snapshot of cluster templates, in the order the server listed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Offerings {
    entries: Vec<ClusterOffering>,
}

impl Offerings {
    pub fn new(entries: Vec<ClusterOffering>) -> Self {
        Self { entries }
    }

    /// Parse a `{ <cluster>: <kernelspec template> }` listing.
    ///
    /// Every entry must be an object carrying
    /// `metadata.kernel_provisioner.config` with a `spec` object and a
    /// `workdir` string; anything else is reported as a description of the
    /// first malformed entry.
    pub fn from_listing(listing: Map<String, Value>) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(listing.len());
        for (cluster, value) in listing {
            let Some(config) = value
                .pointer("/metadata/kernel_provisioner/config")
                .and_then(Value::as_object)
            else {
                return Err(format!(
                    "cluster `{cluster}` is missing metadata.kernel_provisioner.config"
                ));
            };
            if !config.get("spec").is_some_and(Value::is_object) {
                return Err(format!(
                    "cluster `{cluster}` has no resource spec in its provisioner config"
                ));
            }
            if !config.get("workdir").is_some_and(Value::is_string) {
                return Err(format!(
                    "cluster `{cluster}` has no workdir in its provisioner config"
                ));
            }
            let template = KernelSpecFile::from_value(value)
                .map_err(|e| format!("cluster `{cluster}`: {e}"))?;
            entries.push(ClusterOffering { cluster, template });
        }
        Ok(Self { entries })
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.cluster.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterOffering> {
        self.entries.iter()
    }

    pub fn get(&self, cluster: &str) -> Option<&ClusterOffering> {
        self.entries.iter().find(|e| e.cluster == cluster)
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.get(cluster).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The preferred cluster if it is offered, otherwise the first one.
    pub fn preferred_cluster(&self, preferred: &str) -> Option<&str> {
        self.get(preferred)
            .map(|o| o.cluster.as_str())
            .or_else(|| self.clusters().next())
    }

    /// The default launch request for a cluster.
    pub fn default_request(&self, cluster: &str) -> Option<LaunchRequest> {
        self.get(cluster)
            .map(|o| LaunchRequest::from_template(&o.cluster, &o.template))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("listing must be an object"),
        }
    }

    fn sample_offerings() -> Offerings {
        Offerings::from_listing(listing(json!({
            "gkeyll": {"metadata": {"kernel_provisioner": {"config": {
                "spec": {"cpus": "4"}, "workdir": "/home/yasith"
            }}}},
            "anvil": {"metadata": {"kernel_provisioner": {"config": {
                "spec": {"partition": "shared", "time": "01:00:00", "mem": "8G"},
                "workdir": "scratch",
                "exec_path": "/opt/python/bin/python",
                "user_scripts": "module load python"
            }}}}
        })))
        .unwrap()
    }

    #[test]
    fn test_default_request_from_listing() {
        let offerings = sample_offerings();
        let request = offerings.default_request("gkeyll").unwrap();
        assert_eq!(
            request,
            LaunchRequest {
                cluster: "gkeyll".to_string(),
                workdir: "/home/yasith".to_string(),
                exec_path: String::new(),
                user_scripts: String::new(),
                resources: ResourceMap::from_pairs([("cpus", "4")]),
            }
        );
    }

    #[test]
    fn test_offerings_keep_server_order() {
        let offerings = sample_offerings();
        let clusters: Vec<_> = offerings.clusters().collect();
        assert_eq!(clusters, vec!["gkeyll", "anvil"]);
        assert_eq!(offerings.preferred_cluster("anvil"), Some("anvil"));
        assert_eq!(offerings.preferred_cluster("missing"), Some("gkeyll"));
        // The returned name outlives the argument it was looked up with
        let chosen = {
            let wanted = String::from("anvil");
            offerings.preferred_cluster(&wanted)
        };
        assert_eq!(chosen, Some("anvil"));
        assert_eq!(Offerings::default().preferred_cluster("gkeyll"), None);
    }

    #[test]
    fn test_optional_fields_are_carried() {
        let request = sample_offerings().default_request("anvil").unwrap();
        assert_eq!(request.exec_path, "/opt/python/bin/python");
        assert_eq!(request.user_scripts, "module load python");
        let keys: Vec<_> = request.resources.keys().collect();
        assert_eq!(keys, vec!["partition", "time", "mem"]);
    }

    #[test]
    fn test_malformed_listing_is_rejected() {
        let err = Offerings::from_listing(listing(json!({
            "gkeyll": {"metadata": {}}
        })))
        .unwrap_err();
        assert!(err.contains("gkeyll"));

        let err = Offerings::from_listing(listing(json!({"gkeyll": "nope"}))).unwrap_err();
        assert!(err.contains("kernel_provisioner"));

        let err = Offerings::from_listing(listing(json!({
            "gkeyll": {"metadata": {"kernel_provisioner": {"config": {"workdir": "/home"}}}}
        })))
        .unwrap_err();
        assert!(err.contains("resource spec"), "{err}");

        let err = Offerings::from_listing(listing(json!({
            "gkeyll": {"metadata": {"kernel_provisioner": {"config": {"spec": {"cpus": "4"}}}}}
        })))
        .unwrap_err();
        assert!(err.contains("workdir"), "{err}");
    }

    #[test]
    fn test_numeric_resources_become_strings() {
        let map: ResourceMap =
            serde_json::from_value(json!({"cpus-per-task": 1, "gpu": false, "time": "01:00:00"}))
                .unwrap();
        assert_eq!(map.get("cpus-per-task"), Some("1"));
        assert_eq!(map.get("gpu"), Some("false"));
        assert!(serde_json::from_value::<ResourceMap>(json!({"nodes": [1, 2]})).is_err());
    }

    #[test]
    fn test_single_edit_touches_only_that_key() {
        let original = sample_offerings().default_request("anvil").unwrap();
        let mut edited = original.clone();
        edited.set_resource("time", "02:00:00").unwrap();

        let before: Vec<_> = original.resources.iter().collect();
        let after: Vec<_> = edited.resources.iter().collect();
        assert_eq!(before.len(), after.len());
        for ((bk, bv), (ak, av)) in before.iter().zip(after.iter()) {
            assert_eq!(bk, ak);
            if *bk == "time" {
                assert_eq!(*av, "02:00:00");
            } else {
                assert_eq!(bv, av);
            }
        }
    }

    #[test]
    fn test_unknown_resource_cannot_be_added() {
        let mut request = sample_offerings().default_request("gkeyll").unwrap();
        let err = request.set_resource("gpus", "1").unwrap_err();
        assert_eq!(err, LaunchRequestError::UnknownResource("gpus".to_string()));
        assert_eq!(request.resources.len(), 1);
    }

    #[test]
    fn test_validate() {
        let offerings = sample_offerings();
        let request = offerings.default_request("gkeyll").unwrap();
        assert!(request.validate(&offerings).is_ok());

        let mut empty = request.clone();
        empty.cluster = "  ".to_string();
        assert_eq!(empty.validate(&offerings), Err(LaunchRequestError::EmptyCluster));

        let mut unknown = request.clone();
        unknown.cluster = "frontier".to_string();
        assert_eq!(
            unknown.validate(&offerings),
            Err(LaunchRequestError::UnknownCluster("frontier".to_string()))
        );

        // gkeyll resources submitted against anvil
        let mut swapped = request;
        swapped.cluster = "anvil".to_string();
        assert_eq!(
            swapped.validate(&offerings),
            Err(LaunchRequestError::ResourceKeysChanged {
                cluster: "anvil".to_string()
            })
        );
    }
}
