//! User-program support: address spaces.

pub mod addrspace;
