use deskchat_protocol::ServiceCapability;

/// Describes a registered service type (not a per-connection instance).
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Namespace prefix (e.g. "messages").
    pub namespace: String,
    pub version: String,
}

/// Registry of service types advertised in the handshake.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, namespace: impl Into<String>, version: impl Into<String>) {
        self.entries.push(ServiceEntry {
            namespace: namespace.into(),
            version: version.into(),
        });
    }

    /// Return capabilities for the handshake `ServerHello`.
    pub fn capabilities(&self) -> Vec<ServiceCapability> {
        self.entries
            .iter()
            .map(|e| ServiceCapability {
                service: e.namespace.clone(),
                version: e.version.clone(),
            })
            .collect()
    }
}
