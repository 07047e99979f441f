//! Ansible host inventory built from system records and lab logins.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{LabLogin, SystemRecord};

/// Connection variables for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostVars {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ansible_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ansible_ssh_pass: Option<String>,
    pub ansible_become: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ansible_become_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ansible_become_user: Option<String>,
}

impl HostVars {
    fn for_login(login: Option<&LabLogin>) -> Self {
        Self {
            ansible_user: login.map(|l| l.username.clone()),
            ansible_ssh_pass: login.map(|l| l.password.clone()),
            ansible_become: true,
            ansible_become_pass: login.map(|l| l.password.clone()),
            ansible_become_user: login.map(|l| l.username.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostGroup {
    pub hosts: BTreeMap<String, HostVars>,
}

/// Inventory document with a single `all` group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub all: HostGroup,
}

impl Inventory {
    /// Join systems with the login of their lab.
    ///
    /// Systems without an address are skipped and the first system seen for
    /// an address wins. A lab without a login still yields a host entry, just
    /// without user or password.
    pub fn build(systems: &[SystemRecord], logins: &[LabLogin]) -> Self {
        let mut inventory = Inventory::default();
        for system in systems {
            if system.address.is_empty() || inventory.all.hosts.contains_key(&system.address) {
                continue;
            }
            let login = logins.iter().find(|l| l.lab == system.lab);
            inventory
                .all
                .hosts
                .insert(system.address.clone(), HostVars::for_login(login));
        }
        inventory
    }

    pub fn host(&self, address: &str) -> Option<&HostVars> {
        self.all.hosts.get(address)
    }

    pub fn len(&self) -> usize {
        self.all.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.hosts.is_empty()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
