//! Lab transport for the recovery engine: commands over the system `ssh`
//! client, reachability through `ping`, servod through `dut-control` and a
//! YAML inventory file.

pub mod access;
pub mod error;
pub mod inventory;
pub mod ping;
pub mod process;
pub mod servod;
pub mod ssh;

pub use access::LabAccess;
pub use error::SshError;
pub use inventory::FileInventory;
pub use ssh::SshOptions;
