use serde::{Deserialize, Serialize};

/// Information about a capturable network interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Device system name (used for capture operations)
    pub name: String,

    /// Interface description, when the driver provides one
    pub description: String,

    /// Addresses bound to the interface
    pub addresses: Vec<String>,

    /// MAC address (if available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    /// Whether this is a loopback interface
    pub is_loopback: bool,

    /// Whether this interface is up/active
    pub is_up: bool,
}

impl InterfaceInfo {
    /// Create a new interface info with just the device name
    pub fn new(name: String) -> Self {
        Self {
            name,
            description: String::new(),
            addresses: Vec::new(),
            mac_address: None,
            is_loopback: false,
            is_up: true,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.unwrap_or_default();
        self
    }

    /// Set the bound addresses
    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }
}
