//! Kernel subsystem: bus abstraction, child-process bus, and the
//! demultiplexing client.

pub mod bus;
pub mod client;
pub mod fragment;
pub mod process;

pub use bus::{Envelope, KernelBus, StreamChannel};
pub use client::KernelClient;
pub use fragment::Fragment;
pub use process::ProcessBus;
