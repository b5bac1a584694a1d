//! Shared protocol definitions for the `Polychat` broker wire format.

pub mod broker;
pub mod offset;

pub use offset::OffsetPolicy;
