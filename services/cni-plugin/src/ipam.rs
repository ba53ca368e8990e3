//! Host-local address ledger.
//!
//! Reserved pod addresses are kept one per line (`10.244.3.2/24`) in a plain
//! file. Every read-modify-write holds an exclusive `flock` on a sibling
//! `.lock` file, so concurrent plugin invocations on the same node serialize.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info};
use vxnet_networking::{NetworkError, PodCidr};

/// Default ledger location.
pub const DEFAULT_LEDGER_PATH: &str = "/var/lib/vxnet/reserved_ips";

/// Address handed to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Pod address with the pod prefix.
    pub address: Ipv4Network,
    /// Bridge gateway.
    pub gateway: Ipv4Addr,
}

/// File-backed set of reserved addresses.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the reserved addresses.
    pub fn reserved(&self) -> Result<Vec<Ipv4Network>, NetworkError> {
        let _lock = self.lock()?;
        self.read()
    }

    /// Reserve the lowest free usable address in `cidr`.
    ///
    /// The gateway is never handed out, nor are the network and broadcast
    /// addresses.
    pub fn allocate(&self, cidr: &PodCidr) -> Result<Allocation, NetworkError> {
        let _lock = self.lock()?;
        let mut reserved = self.read()?;

        let gateway = cidr.gateway();
        let free = cidr
            .usable_hosts()
            .filter(|ip| *ip != gateway)
            .find(|ip| !reserved.iter().any(|r| r.ip() == *ip))
            .ok_or_else(|| {
                NetworkError::Allocation(format!("no free addresses left in {}", cidr))
            })?;

        let address = cidr.host_cidr(free);
        reserved.push(address);
        self.write(&reserved)?;

        info!(address = %address, ledger = %self.path.display(), "Reserved pod address");

        Ok(Allocation { address, gateway })
    }

    /// Return an address to the pool.
    pub fn release(&self, address: Ipv4Addr) -> Result<(), NetworkError> {
        let _lock = self.lock()?;
        let mut reserved = self.read()?;

        let before = reserved.len();
        reserved.retain(|r| r.ip() != address);
        if reserved.len() == before {
            return Err(NetworkError::NotReserved(address.to_string()));
        }

        self.write(&reserved)?;

        info!(address = %address, ledger = %self.path.display(), "Released pod address");
        Ok(())
    }

    fn lock(&self) -> Result<Flock<File>, NetworkError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;

        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            NetworkError::Io(io::Error::from_raw_os_error(errno as i32))
        })
    }

    fn read(&self) -> Result<Vec<Ipv4Network>, NetworkError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(ledger = %self.path.display(), "Ledger missing, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                Ipv4Network::from_str(line).map_err(|e| {
                    NetworkError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("corrupt ledger entry {:?}: {}", line, e),
                    ))
                })
            })
            .collect()
    }

    fn write(&self, entries: &[Ipv4Network]) -> Result<(), NetworkError> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp_path)?;
            for entry in entries {
                writeln!(file, "{}", entry)?;
            }
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
