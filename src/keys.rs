use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;

/// namespace/name of an object. Cluster-scoped objects have an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct Object {
    pub namespace: String,
    pub name: String,
}
impl Object {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// key of any object, namespaced or not.
    pub fn of(metadata: &meta::ObjectMeta) -> Option<Self> {
        Some(Self {
            namespace: metadata.namespace.clone().unwrap_or_default(),
            name: metadata.name.clone()?,
        })
    }
}
impl TryFrom<&meta::ObjectMeta> for Object {
    type Error = &'static str;
    fn try_from(metadata: &meta::ObjectMeta) -> Result<Self, Self::Error> {
        Ok(Self {
            namespace: metadata.namespace.clone().ok_or("no namespace")?,
            name: metadata.name.clone().ok_or("no name")?,
        })
    }
}
impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A named port of a service. Unnamed ports have an empty port name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct ServicePortName {
    pub service: Object,
    pub port: String,
}
impl ServicePortName {
    pub fn new(service: Object, port: impl Into<String>) -> Self {
        Self {
            service,
            port: port.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.service.namespace
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }
}
impl std::fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}:{}", self.service, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_of_cluster_scoped() {
        let meta = meta::ObjectMeta {
            name: Some("ns1".into()),
            ..Default::default()
        };
        assert_eq!(Object::of(&meta), Some(Object::new("", "ns1")));
        assert!(Object::try_from(&meta).is_err());
    }

    #[test]
    fn test_service_port_name_display() {
        let name = ServicePortName::new(Object::new("ns1", "web"), "http");
        assert_eq!(name.to_string(), "ns1/web:http");
    }
}
