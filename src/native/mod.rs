/// Native module contains the sandbox implementation built directly on
/// process groups, namespaces, cgroups and rlimits, without Docker or Runc.
pub mod capture;
pub mod cgroup;
pub mod jail;
pub mod limits;
pub mod memory;
pub mod sandbox;
pub mod scratch;
pub mod toolchain;
pub mod uids;
