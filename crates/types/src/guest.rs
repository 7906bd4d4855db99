//! Guest descriptor records persisted by the provision step.
//!
//! A record carries everything needed to reattach to a guest in a later
//! process invocation without re-provisioning: the transport parameters, the
//! multihost role, and the capability flags the engine consults before
//! issuing reboots or elevated commands.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Connection parameters for an SSH-reachable machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SshDescriptor {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Private key passed to the OpenSSH client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

impl SshDescriptor {
    /// The `user@host` target handed to the OpenSSH client.
    pub fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Transport selected for a guest. The engine never references a concrete
/// transport type; it only works through the guest capability contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "how", rename_all = "kebab-case")]
pub enum TransportDescriptor {
    /// Commands run directly on the orchestrating host.
    Local,
    /// Commands run on an already-provisioned machine over OpenSSH.
    Ssh(SshDescriptor),
}

impl TransportDescriptor {
    /// Whether guests on this transport can survive a reboot request.
    pub fn reboot_capable(&self) -> bool {
        match self {
            TransportDescriptor::Local => false,
            TransportDescriptor::Ssh(_) => true,
        }
    }
}

/// Capability flags; unset values fall back to the transport defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GuestCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot: Option<bool>,
    /// Elevated execution through sudo.
    #[serde(default, rename = "become", skip_serializing_if = "std::ops::Not::not")]
    pub elevated: bool,
}

/// One provisioned guest as persisted in `provision/guests.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub transport: TransportDescriptor,
    #[serde(default, skip_serializing_if = "is_default_capabilities")]
    pub capabilities: GuestCapabilities,
    /// Watchdog budget for one reboot, e.g. "10m"; engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_timeout: Option<String>,
}

fn is_default_capabilities(value: &GuestCapabilities) -> bool {
    *value == GuestCapabilities::default()
}

impl GuestRecord {
    /// Whether the engine may issue a reboot to this guest.
    pub fn supports_reboot(&self) -> bool {
        self.capabilities.reboot.unwrap_or_else(|| self.transport.reboot_capable())
    }

    /// Whether commands may be elevated on this guest.
    pub fn supports_elevation(&self) -> bool {
        self.capabilities.elevated
    }

    /// Role used by the multihost topology; guests without an explicit role
    /// fall back to their own name.
    pub fn role_or_name(&self) -> &str {
        self.role.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_record_round_trip() {
        let yaml = "name: default\nhow: local\n";
        let record: GuestRecord = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(record.transport, TransportDescriptor::Local);
        assert!(!record.supports_reboot());
        let back = serde_yaml::to_string(&record).unwrap();
        assert!(back.contains("how: local"), "yaml: {back}");
    }

    #[test]
    fn ssh_record_round_trip() {
        let yaml = "name: server\nrole: server\nhow: ssh\nhost: test.example.com\nuser: root\nport: 2222\n";
        let record: GuestRecord = serde_yaml::from_str(yaml).unwrap();
        let TransportDescriptor::Ssh(ssh) = &record.transport else {
            panic!("expected ssh transport");
        };
        assert_eq!(ssh.target(), "root@test.example.com");
        assert_eq!(ssh.port, Some(2222));
        assert!(record.supports_reboot());
        assert_eq!(record.role_or_name(), "server");
    }

    #[test]
    fn capability_overrides_win() {
        let yaml = "name: fixed\nhow: ssh\nhost: a\ncapabilities:\n  reboot: false\n  become: true\n";
        let record: GuestRecord = serde_yaml::from_str(yaml).unwrap();
        assert!(!record.supports_reboot());
        assert!(record.supports_elevation());
    }

    #[test]
    fn role_falls_back_to_name() {
        let record: GuestRecord = serde_yaml::from_str("name: default\nhow: local\n").unwrap();
        assert_eq!(record.role_or_name(), "default");
    }
}
