//! Hardware resources that can be attached to an [`IoBus`](crate::io_bus::IoBus).

pub mod register_bank;
