//! The manager's authoritative state: users, disks, and DSS records. Pure
//! bookkeeping with no sockets, so every lifecycle rule is unit-testable.
//! Failure displays double as the `FAILURE: <reason>` reply text.

use std::net::IpAddr;

use indexmap::IndexMap;
use snafu::Snafu;

use crate::raid;

/// Names on the control plane are short identifiers.
pub const MAX_NAME_LEN: usize = 15;

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("name {name:?} is longer than {MAX_NAME_LEN} characters"))]
    NameTooLong { name: String },

    #[snafu(display("{name:?} is already registered"))]
    DuplicateName { name: String },

    #[snafu(display("port {port} is already in use"))]
    PortInUse { port: u16 },

    #[snafu(display("no such user {name:?}"))]
    UnknownUser { name: String },

    #[snafu(display("no such disk {name:?}"))]
    UnknownDisk { name: String },

    #[snafu(display("disk {name:?} belongs to a DSS"))]
    DiskInDss { name: String },

    #[snafu(display("a DSS needs at least {} drives", raid::MIN_DRIVES))]
    TooFewDrives { drives: usize },

    #[snafu(display("striping unit {unit} is not one of 128, 256, 512, 1024"))]
    BadStripingUnit { unit: usize },

    #[snafu(display("only {free} free disks, {needed} needed"))]
    NotEnoughFreeDisks { needed: usize, free: usize },

    #[snafu(display("DSS {name:?} already exists"))]
    DuplicateDss { name: String },

    #[snafu(display("no such DSS {name:?}"))]
    UnknownDss { name: String },

    #[snafu(display("no DSS is configured"))]
    NoDss,

    #[snafu(display("file {file:?} is already stored"))]
    DuplicateFile { file: String },

    #[snafu(display("no DSS holds {file:?}"))]
    UnknownFile { file: String },

    #[snafu(display("no pending copy to commit"))]
    NoPendingCopy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub mport: u16,
    pub cport: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Free,
    InDss,
}

#[derive(Debug, Clone)]
pub struct DiskRecord {
    pub endpoint: Endpoint,
    pub state: DiskState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub owner: String,
}

#[derive(Debug, Clone)]
pub struct DssRecord {
    /// Drive order. Position in this list is the drive index the striping
    /// engine sees.
    pub disks: Vec<String>,
    pub unit: usize,
    pub files: Vec<FileRecord>,
    /// Staged by `copy` phase 1, committed by `copy-complete`.
    pub pending_copy: Option<FileRecord>,
}

/// All three registries, insertion-ordered so that `ls` output and Free-disk
/// selection follow registration order.
#[derive(Debug, Default)]
pub struct Registry {
    users: IndexMap<String, Endpoint>,
    disks: IndexMap<String, DiskRecord>,
    dsses: IndexMap<String, DssRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_user(&mut self, name: &str, endpoint: Endpoint) -> Result<(), RegistryError> {
        self.check_name(name)?;
        if self.users.contains_key(name) {
            return Err(RegistryError::DuplicateName { name: name.into() });
        }
        self.check_ports(&endpoint)?;
        self.users.insert(name.to_string(), endpoint);
        Ok(())
    }

    pub fn register_disk(&mut self, name: &str, endpoint: Endpoint) -> Result<(), RegistryError> {
        self.check_name(name)?;
        if self.disks.contains_key(name) {
            return Err(RegistryError::DuplicateName { name: name.into() });
        }
        self.check_ports(&endpoint)?;
        self.disks.insert(
            name.to_string(),
            DiskRecord {
                endpoint,
                state: DiskState::Free,
            },
        );
        Ok(())
    }

    pub fn deregister_user(&mut self, name: &str) -> Result<(), RegistryError> {
        self.users
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::UnknownUser { name: name.into() })
    }

    pub fn deregister_disk(&mut self, name: &str) -> Result<(), RegistryError> {
        let disk = self
            .disks
            .get(name)
            .ok_or_else(|| RegistryError::UnknownDisk { name: name.into() })?;
        if disk.state == DiskState::InDss {
            return Err(RegistryError::DiskInDss { name: name.into() });
        }
        self.disks.shift_remove(name);
        Ok(())
    }

    /// Allocate a DSS over the first `drives` Free disks in registration
    /// order, marking each InDSS.
    pub fn configure_dss(
        &mut self,
        name: &str,
        drives: usize,
        unit: usize,
    ) -> Result<&DssRecord, RegistryError> {
        if drives < raid::MIN_DRIVES {
            return Err(RegistryError::TooFewDrives { drives });
        }
        if !raid::valid_striping_unit(unit) {
            return Err(RegistryError::BadStripingUnit { unit });
        }
        if self.dsses.contains_key(name) {
            return Err(RegistryError::DuplicateDss { name: name.into() });
        }

        let free: Vec<String> = self
            .disks
            .iter()
            .filter(|(_, disk)| disk.state == DiskState::Free)
            .map(|(name, _)| name.clone())
            .take(drives)
            .collect();
        if free.len() < drives {
            let total_free = self
                .disks
                .values()
                .filter(|disk| disk.state == DiskState::Free)
                .count();
            return Err(RegistryError::NotEnoughFreeDisks {
                needed: drives,
                free: total_free,
            });
        }

        for disk in &free {
            self.disks
                .get_mut(disk)
                .expect("selected disks are registered")
                .state = DiskState::InDss;
        }
        let record = DssRecord {
            disks: free,
            unit,
            files: Vec::new(),
            pending_copy: None,
        };
        self.dsses.insert(name.to_string(), record);
        Ok(self.dsses.get(name).expect("just inserted"))
    }

    pub fn dss(&self, name: &str) -> Result<&DssRecord, RegistryError> {
        self.dsses
            .get(name)
            .ok_or_else(|| RegistryError::UnknownDss { name: name.into() })
    }

    pub fn disk(&self, name: &str) -> Option<&DiskRecord> {
        self.disks.get(name)
    }

    pub fn dss_names(&self) -> Vec<&str> {
        self.dsses.keys().map(String::as_str).collect()
    }

    pub fn dsses(&self) -> impl Iterator<Item = (&str, &DssRecord)> {
        self.dsses.iter().map(|(name, dss)| (name.as_str(), dss))
    }

    pub fn has_dss(&self) -> bool {
        !self.dsses.is_empty()
    }

    /// Stage a copy on the named DSS. Filenames are unique across the whole
    /// deployment so that `read <user> <file>` stays unambiguous.
    pub fn stage_copy(&mut self, dss: &str, file: FileRecord) -> Result<(), RegistryError> {
        if self.locate_file(&file.name).is_some() {
            return Err(RegistryError::DuplicateFile { file: file.name });
        }
        let record = self
            .dsses
            .get_mut(dss)
            .ok_or_else(|| RegistryError::UnknownDss { name: dss.into() })?;
        record.pending_copy = Some(file);
        Ok(())
    }

    pub fn commit_copy(&mut self, dss: &str) -> Result<FileRecord, RegistryError> {
        let record = self
            .dsses
            .get_mut(dss)
            .ok_or_else(|| RegistryError::UnknownDss { name: dss.into() })?;
        let file = record
            .pending_copy
            .take()
            .ok_or(RegistryError::NoPendingCopy)?;
        record.files.push(file.clone());
        Ok(file)
    }

    pub fn abandon_copy(&mut self, dss: &str) {
        if let Some(record) = self.dsses.get_mut(dss) {
            record.pending_copy = None;
        }
    }

    pub fn locate_file(&self, file: &str) -> Option<(&str, &DssRecord, &FileRecord)> {
        self.dsses.iter().find_map(|(name, dss)| {
            let committed = dss.files.iter().find(|record| record.name == file);
            let pending = dss
                .pending_copy
                .as_ref()
                .filter(|record| record.name == file);
            committed
                .or(pending)
                .map(|record| (name.as_str(), dss, record))
        })
    }

    /// Tear down a DSS, returning every member disk to Free.
    pub fn decommission(&mut self, name: &str) -> Result<(), RegistryError> {
        let record = self
            .dsses
            .shift_remove(name)
            .ok_or_else(|| RegistryError::UnknownDss { name: name.into() })?;
        for disk in record.disks {
            if let Some(disk) = self.disks.get_mut(&disk) {
                disk.state = DiskState::Free;
            }
        }
        Ok(())
    }

    pub fn free_disk_count(&self) -> usize {
        self.disks
            .values()
            .filter(|disk| disk.state == DiskState::Free)
            .count()
    }

    pub fn in_dss_disk_count(&self) -> usize {
        self.disks
            .values()
            .filter(|disk| disk.state == DiskState::InDss)
            .count()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }

    fn check_name(&self, name: &str) -> Result<(), RegistryError> {
        if name.len() > MAX_NAME_LEN {
            return Err(RegistryError::NameTooLong { name: name.into() });
        }
        Ok(())
    }

    fn check_ports(&self, endpoint: &Endpoint) -> Result<(), RegistryError> {
        if endpoint.mport == endpoint.cport {
            return Err(RegistryError::PortInUse {
                port: endpoint.cport,
            });
        }
        for port in [endpoint.mport, endpoint.cport] {
            if self.port_in_use(port) {
                return Err(RegistryError::PortInUse { port });
            }
        }
        Ok(())
    }

    fn port_in_use(&self, port: u16) -> bool {
        let users = self.users.values();
        let disks = self.disks.values().map(|disk| &disk.endpoint);
        users
            .chain(disks)
            .any(|endpoint| endpoint.mport == port || endpoint.cport == port)
    }
}
